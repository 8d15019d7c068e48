//! Shared fixtures for the integration tests
//!
//! `ScriptedTransport` answers every request immediately from a small script
//! (remote online or not, advertised services, which step fails) and records
//! what the engine sent. Inbound traffic is injected through the handler the
//! engine registered on `start`.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use peerlink_core::{
    AppService, AppServiceCall, CallGrant, CallId, CallToken, Envelope, InboundAppMessage,
    InboundHandler, IncomingCall, LinkConfig, LinkError, LinkResult, MsgFuture, PageFuture,
    Profile, ProfileInfo, ProfileInfoRequest, ProfileKey, ProfileQueryInfo, ProfileUpdate,
    SearchQuery, ServerEndpoint, Transport, TransportFactory,
};

pub fn key(b: u8) -> ProfileKey {
    ProfileKey::from_bytes([b; 32])
}

pub fn endpoint(host: &str) -> ServerEndpoint {
    ServerEndpoint::from_host(host, &LinkConfig::default())
}

/// Request that can be scripted to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    ProfileInfo,
    CallService,
    SendMessage,
}

#[derive(Debug, Clone)]
pub struct Sent {
    pub call_id: CallId,
    pub token: CallToken,
    pub envelope: Envelope,
}

pub struct ScriptedTransport {
    pub host: String,
    next_id: AtomicU32,
    online: AtomicBool,
    services: Mutex<BTreeSet<String>>,
    failing: Mutex<Option<Step>>,
    inbound: Mutex<Option<Arc<dyn InboundHandler>>>,
    pub profile_info_requests: AtomicUsize,
    pub call_requests: AtomicUsize,
    sent: Mutex<Vec<Sent>>,
    accepted: Mutex<Vec<u32>>,
    acked: Mutex<Vec<u32>>,
    closed: Mutex<Vec<CallId>>,
    search_hits: Mutex<Vec<ProfileQueryInfo>>,
    stopped: AtomicBool,
}

impl ScriptedTransport {
    pub fn new(host: &str) -> Arc<Self> {
        Arc::new(Self {
            host: host.to_string(),
            next_id: AtomicU32::new(0),
            online: AtomicBool::new(true),
            services: Mutex::new(["chat", "pairing"].iter().map(|s| s.to_string()).collect()),
            failing: Mutex::new(None),
            inbound: Mutex::new(None),
            profile_info_requests: AtomicUsize::new(0),
            call_requests: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            accepted: Mutex::new(Vec::new()),
            acked: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
            search_hits: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn set_remote_services(&self, services: &[&str]) {
        *self.services.lock() = services.iter().map(|s| s.to_string()).collect();
    }

    pub fn fail_at(&self, step: Step) {
        *self.failing.lock() = Some(step);
    }

    pub fn set_search_hits(&self, hits: Vec<ProfileQueryInfo>) {
        *self.search_hits.lock() = hits;
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }

    /// Sent envelopes other than init messages.
    pub fn sent_kinds(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter(|s| !s.envelope.is_init())
            .map(|s| s.envelope.kind.clone())
            .collect()
    }

    pub fn accepted(&self) -> Vec<u32> {
        self.accepted.lock().clone()
    }

    pub fn acked(&self) -> Vec<u32> {
        self.acked.lock().clone()
    }

    pub fn closed(&self) -> Vec<CallId> {
        self.closed.lock().clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Announce an incoming call as the server would.
    pub fn deliver_call(&self, message_id: u32, caller: ProfileKey, service: &str, token: &[u8]) {
        let handler = self.inbound.lock().clone().expect("transport not started");
        handler.incoming_call(
            message_id,
            IncomingCall {
                caller_key: caller,
                service_name: service.to_string(),
                callee_token: CallToken::new(token.to_vec()),
            },
        );
    }

    /// Push an application message for the call holding `token`.
    pub fn deliver_message(&self, message_id: u32, token: &[u8], envelope: &Envelope) {
        let handler = self.inbound.lock().clone().expect("transport not started");
        handler.incoming_message(
            message_id,
            InboundAppMessage {
                call_token: CallToken::new(token.to_vec()),
                payload: envelope.encode().unwrap(),
            },
        );
    }

    fn id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn fails(&self, step: Step) -> bool {
        *self.failing.lock() == Some(step)
    }
}

impl Transport for ScriptedTransport {
    fn start(&self, inbound: Arc<dyn InboundHandler>, future: MsgFuture<()>) -> LinkResult<()> {
        *self.inbound.lock() = Some(inbound);
        future.fulfill(self.id(), ());
        Ok(())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn add_app_service(&self, _name: &str, future: MsgFuture<()>) -> LinkResult<()> {
        future.fulfill(self.id(), ());
        Ok(())
    }

    fn get_profile_information(
        &self,
        key: &ProfileKey,
        _request: ProfileInfoRequest,
        future: MsgFuture<ProfileInfo>,
    ) -> LinkResult<()> {
        self.profile_info_requests.fetch_add(1, Ordering::SeqCst);
        let id = self.id();
        if self.fails(Step::ProfileInfo) {
            future.fail(id, 404, "profile not found");
            return Ok(());
        }
        let mut info = ProfileInfo::from_key(*key).with_name(format!("remote-{}", key.short()));
        info.is_online = self.online.load(Ordering::SeqCst);
        info.app_services = self.services.lock().clone();
        future.fulfill(id, info);
        Ok(())
    }

    fn call_profile_app_service(
        &self,
        _remote: &ProfileKey,
        _service: &str,
        future: MsgFuture<CallGrant>,
    ) -> LinkResult<()> {
        self.call_requests.fetch_add(1, Ordering::SeqCst);
        let id = self.id();
        if self.fails(Step::CallService) {
            future.fail(id, 500, "call refused");
            return Ok(());
        }
        future.fulfill(
            id,
            CallGrant {
                caller_token: CallToken::new(id.to_be_bytes().to_vec()),
            },
        );
        Ok(())
    }

    fn send_app_service_msg(
        &self,
        call_id: CallId,
        token: &CallToken,
        payload: Vec<u8>,
        _enqueue_if_offline: bool,
        future: MsgFuture<()>,
    ) -> LinkResult<()> {
        let id = self.id();
        if self.fails(Step::SendMessage) {
            future.fail(id, 500, "send failed");
            return Ok(());
        }
        let envelope = Envelope::decode(&payload)
            .map_err(|e| LinkError::TransportSend(e.to_string()))?;
        self.sent.lock().push(Sent {
            call_id,
            token: token.clone(),
            envelope,
        });
        future.fulfill(id, ());
        Ok(())
    }

    fn accept_call(&self, message_id: u32) -> LinkResult<()> {
        self.accepted.lock().push(message_id);
        Ok(())
    }

    fn respond_app_service_receive_msg(
        &self,
        _call_id: CallId,
        _token: &CallToken,
        message_id: u32,
    ) -> LinkResult<()> {
        self.acked.lock().push(message_id);
        Ok(())
    }

    fn ping_app_service(&self, _call_id: CallId, _token_hex: &str, future: MsgFuture<()>) -> LinkResult<()> {
        future.fulfill(self.id(), ());
        Ok(())
    }

    fn close_channel(&self, call_id: CallId) -> LinkResult<()> {
        self.closed.lock().push(call_id);
        Ok(())
    }

    fn search_profiles(
        &self,
        _query: &SearchQuery,
        future: MsgFuture<Vec<ProfileQueryInfo>>,
    ) -> LinkResult<()> {
        future.fulfill(self.id(), self.search_hits.lock().clone());
        Ok(())
    }

    fn search_subsequent_profiles(&self, query: &SearchQuery, future: PageFuture) -> LinkResult<()> {
        let hits = self.search_hits.lock().clone();
        let start = query.next_record_index() as usize;
        let page_size = query.max_response_records as usize;
        let mut index = start;
        while index < hits.len() {
            let end = (index + page_size).min(hits.len());
            future.on_page(self.id(), hits[index..end].to_vec(), index as u32, (end - index) as u32);
            index = end;
        }
        future.fail(self.id(), 404, "no more results");
        Ok(())
    }

    fn search_profile_by_name(
        &self,
        name: &str,
        future: MsgFuture<Vec<ProfileQueryInfo>>,
    ) -> LinkResult<()> {
        let hits = self
            .search_hits
            .lock()
            .iter()
            .filter(|h| h.name == name)
            .cloned()
            .collect();
        future.fulfill(self.id(), hits);
        Ok(())
    }

    fn update_profile(&self, _update: &ProfileUpdate, future: MsgFuture<()>) -> LinkResult<()> {
        future.fulfill(self.id(), ());
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.inbound.lock().is_some() && !self.is_stopped()
    }

    fn is_connecting(&self) -> bool {
        false
    }

    fn has_failed(&self) -> bool {
        false
    }
}

/// Hands out one scripted transport per server host
#[derive(Default)]
pub struct ScriptedFactory {
    transports: Mutex<Vec<Arc<ScriptedTransport>>>,
}

impl ScriptedFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Most recent transport created for `host`.
    pub fn transport(&self, host: &str) -> Option<Arc<ScriptedTransport>> {
        self.transports
            .lock()
            .iter()
            .rev()
            .find(|t| t.host == host)
            .cloned()
    }

    pub fn created(&self) -> usize {
        self.transports.lock().len()
    }
}

impl TransportFactory for ScriptedFactory {
    fn create(&self, endpoint: &ServerEndpoint, _profile: &Profile) -> LinkResult<Arc<dyn Transport>> {
        let transport = ScriptedTransport::new(&endpoint.host);
        self.transports.lock().push(Arc::clone(&transport));
        Ok(transport as Arc<dyn Transport>)
    }
}

/// Service recording what reaches it
#[derive(Default)]
pub struct ChatService {
    pub reject: AtomicBool,
    pub connected: Mutex<Vec<(ProfileKey, ProfileKey, bool)>>,
    pub received: Arc<Mutex<Vec<Envelope>>>,
    pub removed: AtomicUsize,
}

impl ChatService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl AppService for ChatService {
    fn name(&self) -> &str {
        "chat"
    }

    fn message_types(&self) -> &[&'static str] {
        &["chat"]
    }

    fn wrap_call(&self, call: &Arc<AppServiceCall>) {
        let received = Arc::clone(&self.received);
        call.set_message_listener(move |_, envelope| received.lock().push(envelope));
    }

    fn on_pre_call(&self, _call: &Arc<AppServiceCall>) -> bool {
        !self.reject.load(Ordering::SeqCst)
    }

    fn on_call_connected(&self, local: &Profile, remote: &ProfileInfo, is_creator: bool) {
        self.connected.lock().push((local.key, remote.key, is_creator));
    }

    fn remove_call(&self, _call: &AppServiceCall, _reason: &str) {
        self.removed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
