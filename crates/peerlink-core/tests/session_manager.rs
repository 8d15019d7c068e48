//! Session manager integration tests
//!
//! ## What These Tests Verify
//!
//! - Home and guest connection registry
//! - Pairing workflow: request, receive, accept, cancel
//! - Profile lookup through the store, search and profile updates

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{endpoint, eventually, key, ScriptedFactory};
use parking_lot::Mutex;
use peerlink_core::{
    Envelope, LinkConfig, LinkError, PairStatus, PairingEvent, PairingMsg, PairingRequest,
    Profile, ProfileConnection, ProfileQueryInfo, ProfileUpdate, SearchQuery, SessionManager,
};

async fn connected(name: &str, local: u8, host: &str) -> (SessionManager, Arc<ScriptedFactory>, Arc<ProfileConnection>) {
    let factory = ScriptedFactory::new();
    let manager = SessionManager::in_memory(factory.clone(), LinkConfig::default()).unwrap();
    let connection = manager
        .connect_profile(Profile::new(key(local), name, "person"), endpoint(host), Vec::new())
        .await
        .unwrap();
    (manager, factory, connection)
}

#[tokio::test]
async fn test_connect_twice_is_refused() {
    let (manager, _, _) = connected("ana", 1, "ps.a").await;

    let again = manager
        .connect_profile(Profile::new(key(1), "ana", "person"), endpoint("ps.a"), Vec::new())
        .await;

    assert!(matches!(again, Err(LinkError::AlreadyConnected(_))));
    assert_eq!(manager.connected_profiles(), vec![key(1)]);
}

#[tokio::test]
async fn test_guest_connection_created_once() {
    let (manager, factory, home) = connected("ana", 1, "ps.a").await;

    let first = manager
        .get_or_establish_connection("ps.a", &key(1), "ps.b")
        .await
        .unwrap();
    let second = manager
        .get_or_establish_connection("ps.a", &key(1), "ps.b")
        .await
        .unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert!(!Arc::ptr_eq(&first, &home));
    assert_eq!(factory.created(), 2);
    assert!(first.is_ready());
    assert_eq!(first.profile().key, key(1));

    assert!(matches!(
        manager.get_or_establish_connection("ps.a", &key(9), "ps.c").await,
        Err(LinkError::ProfileNotConnected(_))
    ));
}

#[tokio::test]
async fn test_request_pairing_sends_notification() {
    let (manager, factory, connection) = connected("ana", 1, "ps.a").await;
    let transport = factory.transport("ps.a").unwrap();

    let request = PairingRequest::outgoing(key(1), "ana", "ps.a", key(2), "ps.a");
    let id = manager.request_pairing(request).await.unwrap();

    let sent = transport.sent();
    let notification = &sent.last().unwrap().envelope;
    assert_eq!(notification.kind, "pairing_request");
    let msg: PairingMsg = notification.message().unwrap();
    assert_eq!(msg, PairingMsg::new("ana", "ps.a"));

    let stored = manager.pairing_store().get(&id).unwrap().unwrap();
    assert_eq!(stored.status, PairStatus::WaitingForResponse);
    assert_eq!(
        manager.known_profile(&key(1), &key(2)).unwrap().unwrap().pair_status,
        PairStatus::WaitingForResponse
    );
    assert!(connection.find_call("pairing", &key(2)).is_some());

    // The remote accepts on the same call.
    let mut events = manager.subscribe_pairing_events();
    let token = connection.find_call("pairing", &key(2)).unwrap().token().unwrap();
    let accept = Envelope::from_message("pair_accept", &PairingMsg::new("bob", "ps.a")).unwrap();
    transport.deliver_message(40, token.as_bytes(), &accept);

    assert_eq!(
        events.try_recv().unwrap(),
        PairingEvent::Accepted {
            local: key(1),
            remote: key(2)
        }
    );
    assert_eq!(
        manager.pairing_store().get(&id).unwrap().unwrap().status,
        PairStatus::Paired
    );
    let bob = manager.known_profile(&key(1), &key(2)).unwrap().unwrap();
    assert_eq!(bob.pair_status, PairStatus::Paired);
}

#[tokio::test]
async fn test_pairing_request_received_and_accepted() {
    let (manager, factory, connection) = connected("bob", 2, "ps.a").await;
    let transport = factory.transport("ps.a").unwrap();
    let mut events = manager.subscribe_pairing_events();

    transport.deliver_call(11, key(1), "pairing", &[4, 2]);
    assert!(eventually(|| connection.call_by_token("0402").is_some_and(|c| c.is_established())).await);
    let request = Envelope::from_message("pairing_request", &PairingMsg::new("ana", "ps.a")).unwrap();
    transport.deliver_message(12, &[4, 2], &request);

    let received = match events.try_recv().unwrap() {
        PairingEvent::RequestReceived(request) => request,
        other => panic!("unexpected event {:?}", other),
    };
    assert_eq!(received.sender_key, key(1));
    assert_eq!(received.remote_key, key(2));
    assert_eq!(received.status, PairStatus::WaitingForMyResponse);
    assert_eq!(manager.pairing_requests(&key(2)).unwrap().len(), 1);
    let ana = manager.known_profile(&key(2), &key(1)).unwrap().unwrap();
    assert_eq!(ana.name, "ana");
    assert_eq!(ana.pair_status, PairStatus::WaitingForMyResponse);

    manager.accept_pairing(&received).await.unwrap();

    // The open pairing call carried the answer and was closed afterwards.
    assert_eq!(transport.sent_kinds(), vec!["pair_accept".to_string()]);
    assert_eq!(transport.closed().len(), 1);
    assert!(connection.call_by_token("0402").is_none());
    assert_eq!(
        manager.known_profile(&key(2), &key(1)).unwrap().unwrap().pair_status,
        PairStatus::Paired
    );
    assert_eq!(
        manager.pairing_requests(&key(2)).unwrap()[0].status,
        PairStatus::Paired
    );
}

#[tokio::test]
async fn test_accept_without_open_call_opens_one() {
    let (manager, factory, _connection) = connected("bob", 2, "ps.a").await;
    let transport = factory.transport("ps.a").unwrap();

    let request = PairingRequest::incoming(key(1), "ana", "ps.a", key(2), "ps.a");
    manager.pairing_store().save(&request).unwrap();

    manager.accept_pairing(&request).await.unwrap();

    // Trusted call: no profile lookup, one call request, disposed after sending.
    assert_eq!(transport.profile_info_requests.load(Ordering::SeqCst), 0);
    assert_eq!(transport.call_requests.load(Ordering::SeqCst), 1);
    assert_eq!(transport.sent_kinds(), vec!["pair_accept".to_string()]);
    assert_eq!(transport.closed().len(), 1);
}

#[tokio::test]
async fn test_cancel_pairing_is_local() {
    let (manager, factory, _) = connected("ana", 1, "ps.a").await;
    let transport = factory.transport("ps.a").unwrap();

    let request = PairingRequest::outgoing(key(1), "ana", "ps.a", key(2), "ps.a");
    let id = manager.pairing_store().save(&request).unwrap();
    let before = transport.sent().len();

    assert!(manager.cancel_pairing(&id).unwrap());
    assert!(!manager.cancel_pairing(&id).unwrap());
    assert!(manager.pairing_requests(&key(1)).unwrap().is_empty());
    assert_eq!(transport.sent().len(), before);
}

#[tokio::test]
async fn test_search_and_get_profile_reads_through_store() {
    let (manager, factory, _) = connected("ana", 1, "ps.a").await;
    let transport = factory.transport("ps.a").unwrap();

    let fetched = manager.search_and_get_profile(&key(1), &key(2)).await.unwrap();
    assert!(fetched.updated_at > 0);
    assert!(fetched.supports("chat"));

    let cached = manager.search_and_get_profile(&key(1), &key(2)).await.unwrap();
    assert_eq!(cached, fetched);
    assert_eq!(transport.profile_info_requests.load(Ordering::SeqCst), 1);
    assert_eq!(manager.known_profiles(&key(1)).unwrap().len(), 1);
}

#[tokio::test]
async fn test_paginated_search_fills_query_cache() {
    let (_manager, factory, connection) = connected("ana", 1, "ps.a").await;
    let transport = factory.transport("ps.a").unwrap();
    let hits: Vec<ProfileQueryInfo> = (10..20u8)
        .map(|b| ProfileQueryInfo::new(key(b), format!("p{}", b)))
        .collect();
    transport.set_search_hits(hits.clone());

    let query = Arc::new(Mutex::new(SearchQuery::by_name("p*").with_page_size(4)));
    let pages = connection.search_subsequent_profiles(query.clone()).unwrap();

    let timeout = Duration::from_secs(1);
    assert_eq!(pages.next_page(timeout).unwrap().len(), 4);
    assert_eq!(pages.next_page(timeout).unwrap().len(), 4);
    assert_eq!(pages.next_page(timeout).unwrap().len(), 2);
    assert!(pages.next_page(timeout).is_err());

    let query = query.lock();
    assert_eq!(query.cached_results(), hits);
    assert_eq!(query.next_record_index(), 10);
}

#[tokio::test]
async fn test_single_shot_and_name_search() {
    let (_manager, factory, connection) = connected("ana", 1, "ps.a").await;
    let transport = factory.transport("ps.a").unwrap();
    transport.set_search_hits(vec![
        ProfileQueryInfo::new(key(3), "carla"),
        ProfileQueryInfo::new(key(4), "dan"),
    ]);

    let query = Arc::new(Mutex::new(SearchQuery::default()));
    let hits = connection
        .search_profiles(query.clone())
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(query.lock().cached_results().len(), 2);

    let dan = connection
        .search_profile_by_name("dan")
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(dan.len(), 1);
    assert_eq!(dan[0].key, key(4));
}

#[tokio::test]
async fn test_update_profile_applies_locally() {
    let (manager, _, connection) = connected("ana", 1, "ps.a").await;

    manager
        .update_profile(
            &key(1),
            ProfileUpdate {
                name: Some("ana maria".to_string()),
                extra_data: Some("likes:sailing".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let profile = connection.profile();
    assert_eq!(profile.name, "ana maria");
    assert_eq!(profile.extra_data, "likes:sailing");
}

#[tokio::test]
async fn test_disconnect_stops_home_and_guests() {
    let (manager, factory, home) = connected("ana", 1, "ps.a").await;
    let guest = manager
        .get_or_establish_connection("ps.a", &key(1), "ps.b")
        .await
        .unwrap();

    manager.disconnect_profile(&key(1)).unwrap();

    assert!(home.is_stopped());
    assert!(guest.is_stopped());
    assert!(factory.transport("ps.a").unwrap().is_stopped());
    assert!(factory.transport("ps.b").unwrap().is_stopped());
    assert!(matches!(
        manager.profile_connection(&key(1)),
        Err(LinkError::ProfileNotConnected(_))
    ));
}
