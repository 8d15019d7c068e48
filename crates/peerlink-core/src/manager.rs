//! Multi-profile session manager
//!
//! The [`SessionManager`] owns one home [`ProfileConnection`] per local
//! identity and, lazily, guest connections to other profile servers keyed by
//! (identity, remote host). It also drives the sending side of pairing.
//!
//! ## Example
//!
//! ```ignore
//! let manager = SessionManager::in_memory(factory, LinkConfig::default())?;
//! manager.connect_profile(profile, endpoint, vec![chat]).await?;
//!
//! let request = PairingRequest::outgoing(me, "ana", "ps.a", friend, "ps.b");
//! let id = manager.request_pairing(request).await?;
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use parking_lot::RwLock;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::app_service::{AppService, AppServiceRegistry};
use crate::call::AppServiceCall;
use crate::config::LinkConfig;
use crate::connection::{CallRequest, CallRouter, Collaborators, ProfileConnection, Routing};
use crate::crypto::DerivedKeyProvider;
use crate::error::{LinkError, LinkResult};
use crate::pairing::{PairingEvent, PairingMsg, PairingService, PAIRING_REQUEST_TYPE, PAIRING_SERVICE, PAIR_ACCEPT_TYPE};
use crate::storage::{MemoryMessageQueue, MemoryPairingStore, MemoryProfileStore, PairingStore};
use crate::transport::{ProfileInfoRequest, TransportFactory};
use crate::types::{
    now_millis, PairStatus, PairingRequest, PairingRequestId, Profile, ProfileInfo, ProfileKey,
    ProfileUpdate, ServerEndpoint,
};

/// Identifies a guest connection: a local identity visiting another server
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GuestKey {
    pub local: ProfileKey,
    pub host: String,
}

impl GuestKey {
    pub fn new(local: ProfileKey, host: impl Into<String>) -> Self {
        Self {
            local,
            host: host.into(),
        }
    }
}

/// Home and guest connections, shared with home connections as their router
struct SessionRegistry {
    homes: RwLock<HashMap<ProfileKey, Arc<ProfileConnection>>>,
    guests: RwLock<HashMap<GuestKey, Arc<ProfileConnection>>>,
    /// Serializes guest creation so two callers never build the same guest
    guest_lock: Mutex<()>,
    factory: Arc<dyn TransportFactory>,
    collaborators: Collaborators,
    config: LinkConfig,
}

impl SessionRegistry {
    fn open_connection(
        &self,
        profile: Profile,
        endpoint: ServerEndpoint,
        services: Arc<AppServiceRegistry>,
    ) -> LinkResult<Arc<ProfileConnection>> {
        let transport = self.factory.create(&endpoint, &profile)?;
        ProfileConnection::new(
            profile,
            endpoint,
            transport,
            services,
            self.collaborators.clone(),
            self.config.clone(),
        )
    }

    fn home(&self, key: &ProfileKey) -> LinkResult<Arc<ProfileConnection>> {
        self.homes
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| LinkError::ProfileNotConnected(key.short()))
    }

    fn guest(&self, key: &GuestKey) -> Option<Arc<ProfileConnection>> {
        self.guests.read().get(key).cloned()
    }

    async fn get_or_establish(
        &self,
        local_host: &str,
        local_key: &ProfileKey,
        remote_host: &str,
    ) -> LinkResult<Arc<ProfileConnection>> {
        if local_host == remote_host {
            return self.home(local_key);
        }

        let guest_key = GuestKey::new(*local_key, remote_host);
        if let Some(connection) = self.guest(&guest_key) {
            return Ok(connection);
        }

        let _creating = self.guest_lock.lock().await;
        if let Some(connection) = self.guest(&guest_key) {
            return Ok(connection);
        }

        let home = self.home(local_key)?;
        let endpoint = ServerEndpoint::from_host(remote_host, &self.config);
        let connection = self.open_connection(home.profile(), endpoint, Arc::clone(home.services()))?;
        connection.set_routing(Routing::Guest);
        if let Err(e) = connection.init().await {
            connection.stop();
            return Err(e);
        }
        debug!(profile = %local_key.short(), host = remote_host, "Guest connection started");
        self.guests.write().insert(guest_key, Arc::clone(&connection));
        Ok(connection)
    }
}

impl CallRouter for SessionRegistry {
    fn connection_for<'a>(
        &'a self,
        local: &'a ProfileConnection,
        remote_host: &'a str,
    ) -> BoxFuture<'a, LinkResult<Arc<ProfileConnection>>> {
        Box::pin(async move {
            let key = local.key();
            self.get_or_establish(&local.endpoint().host, &key, remote_host)
                .await
        })
    }
}

/// Registry of profile connections and entry point of the pairing workflow
pub struct SessionManager {
    registry: Arc<SessionRegistry>,
    collaborators: Collaborators,
    pairing_store: Arc<dyn PairingStore>,
    config: LinkConfig,
    pairing_tx: broadcast::Sender<PairingEvent>,
}

impl SessionManager {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        collaborators: Collaborators,
        pairing_store: Arc<dyn PairingStore>,
        config: LinkConfig,
    ) -> LinkResult<Self> {
        config.validate()?;
        let (pairing_tx, _) = broadcast::channel(config.event_channel_capacity);
        let registry = Arc::new(SessionRegistry {
            homes: RwLock::new(HashMap::new()),
            guests: RwLock::new(HashMap::new()),
            guest_lock: Mutex::new(()),
            factory,
            collaborators: collaborators.clone(),
            config: config.clone(),
        });
        Ok(Self {
            registry,
            collaborators,
            pairing_store,
            config,
            pairing_tx,
        })
    }

    /// Manager backed by the in-memory stores and the default crypto provider.
    pub fn in_memory(factory: Arc<dyn TransportFactory>, config: LinkConfig) -> LinkResult<Self> {
        let collaborators = Collaborators {
            profile_store: Arc::new(MemoryProfileStore::new()),
            message_queue: Arc::new(MemoryMessageQueue::default()),
            crypto: Arc::new(DerivedKeyProvider::new()),
        };
        Self::new(factory, collaborators, Arc::new(MemoryPairingStore::new()), config)
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub fn pairing_store(&self) -> &Arc<dyn PairingStore> {
        &self.pairing_store
    }

    pub fn subscribe_pairing_events(&self) -> broadcast::Receiver<PairingEvent> {
        self.pairing_tx.subscribe()
    }

    /// Open the home connection of `profile` and register its services.
    ///
    /// The pairing service is added when pairing is enabled and the caller
    /// did not provide one.
    pub async fn connect_profile(
        &self,
        profile: Profile,
        endpoint: ServerEndpoint,
        services: Vec<Arc<dyn AppService>>,
    ) -> LinkResult<Arc<ProfileConnection>> {
        let key = profile.key;
        let homes = &self.registry.homes;
        if homes.read().contains_key(&key) {
            return Err(LinkError::AlreadyConnected(key.short()));
        }

        let service_registry = Arc::new(AppServiceRegistry::new());
        for service in services {
            service_registry.register(service);
        }
        if self.config.pairing_enabled && !service_registry.contains(PAIRING_SERVICE) {
            service_registry.register(Arc::new(PairingService::new(
                endpoint.host.clone(),
                Arc::clone(&self.pairing_store),
                Arc::clone(&self.collaborators.profile_store),
                self.pairing_tx.clone(),
            )));
        }

        let connection = self.registry.open_connection(profile, endpoint, service_registry)?;
        let router: Weak<SessionRegistry> = Arc::downgrade(&self.registry);
        connection.set_routing(Routing::Home(router));
        {
            let mut homes = homes.write();
            if homes.contains_key(&key) {
                return Err(LinkError::AlreadyConnected(key.short()));
            }
            homes.insert(key, Arc::clone(&connection));
        }

        if let Err(e) = connection.init().await {
            warn!(profile = %key.short(), error = %e, "Profile connection failed to start");
            homes.write().remove(&key);
            connection.stop();
            return Err(e);
        }
        info!(profile = %key.short(), server = %connection.endpoint(), "Profile connected");
        Ok(connection)
    }

    /// The home connection of `key`.
    pub fn profile_connection(&self, key: &ProfileKey) -> LinkResult<Arc<ProfileConnection>> {
        self.registry.home(key)
    }

    pub fn guest_connection(&self, key: &GuestKey) -> Option<Arc<ProfileConnection>> {
        self.registry.guest(key)
    }

    /// Identities with a home connection.
    pub fn connected_profiles(&self) -> Vec<ProfileKey> {
        let mut keys: Vec<ProfileKey> = self.registry.homes.read().keys().copied().collect();
        keys.sort();
        keys
    }

    /// Connection to use for reaching `remote_host` as `local_key`.
    ///
    /// The home connection when both hosts match; otherwise a guest
    /// connection, created and started on first use.
    pub async fn get_or_establish_connection(
        &self,
        local_host: &str,
        local_key: &ProfileKey,
        remote_host: &str,
    ) -> LinkResult<Arc<ProfileConnection>> {
        self.registry
            .get_or_establish(local_host, local_key, remote_host)
            .await
    }

    /// Update the local profile on its home server.
    pub async fn update_profile(&self, key: &ProfileKey, update: ProfileUpdate) -> LinkResult<()> {
        self.profile_connection(key)?.update_profile(update).await
    }

    /// Known profile of `key` for `owner`, fetched from the server and saved if unknown.
    pub async fn search_and_get_profile(&self, owner: &ProfileKey, key: &ProfileKey) -> LinkResult<ProfileInfo> {
        let connection = self.profile_connection(owner)?;
        if let Some(info) = self.collaborators.profile_store.get(owner, key)? {
            return Ok(info);
        }

        let mut info = connection
            .get_profile_information(key, ProfileInfoRequest::full())
            .await?;
        info.updated_at = now_millis();
        self.collaborators.profile_store.save(owner, &info)?;
        debug!(owner = %owner.short(), profile = %key.short(), "Profile fetched and saved");
        Ok(info)
    }

    pub fn known_profiles(&self, owner: &ProfileKey) -> LinkResult<Vec<ProfileInfo>> {
        self.collaborators.profile_store.list(owner)
    }

    pub fn known_profile(&self, owner: &ProfileKey, key: &ProfileKey) -> LinkResult<Option<ProfileInfo>> {
        self.collaborators.profile_store.get(owner, key)
    }

    /// Open a call from `local` to `remote` over `service`.
    ///
    /// Goes through a guest connection when the remote lives on another server.
    pub async fn call_service(
        &self,
        local: &ProfileKey,
        remote: ProfileInfo,
        service: &str,
        encrypt: bool,
    ) -> LinkResult<Arc<AppServiceCall>> {
        let home = self.profile_connection(local)?;
        let connection = match remote.home_host.clone() {
            Some(host) => {
                self.get_or_establish_connection(&home.endpoint().host, local, &host)
                    .await?
            }
            None => home,
        };
        let mut request = CallRequest::new(remote, service);
        request.encrypt = encrypt;
        connection.call_profile_app_service(request).await
    }

    /// Persist an outgoing pairing request and notify the remote identity.
    pub async fn request_pairing(&self, request: PairingRequest) -> LinkResult<PairingRequestId> {
        let id = self.pairing_store.save(&request)?;
        let store = &self.collaborators.profile_store;
        store.update_paired(&request.sender_key, &request.remote_key, PairStatus::WaitingForResponse)?;

        let connection = self
            .get_or_establish_connection(&request.sender_host, &request.sender_key, &request.remote_host)
            .await?;
        let remote = store
            .get(&request.sender_key, &request.remote_key)?
            .unwrap_or_else(|| ProfileInfo::from_key(request.remote_key));

        let call = connection
            .call_profile_app_service(CallRequest::new(remote, PAIRING_SERVICE))
            .await?;
        call.send_message(
            PAIRING_REQUEST_TYPE,
            &PairingMsg::new(&request.sender_name, &request.sender_host),
        )
        .await?;

        info!(
            request = %id,
            sender = %request.sender_key.short(),
            remote = %request.remote_key.short(),
            "Pairing request sent"
        );
        Ok(id)
    }

    /// Accept a pairing request received by a local identity.
    ///
    /// Local state is updated first. The acceptance is then sent over the
    /// open pairing call (or a new one), which is disposed afterwards
    /// whatever the outcome.
    pub async fn accept_pairing(&self, request: &PairingRequest) -> LinkResult<()> {
        let local = request.remote_key;
        let sender = request.sender_key;
        self.collaborators
            .profile_store
            .update_paired(&local, &sender, PairStatus::Paired)?;
        self.pairing_store
            .update_status(&sender, &local, PairStatus::Paired)?;

        let connection = self
            .get_or_establish_connection(&request.remote_host, &local, &request.sender_host)
            .await?;
        let call = match connection.find_call(PAIRING_SERVICE, &sender) {
            Some(call) if call.is_established() => call,
            _ => {
                let remote = self
                    .collaborators
                    .profile_store
                    .get(&local, &sender)?
                    .unwrap_or_else(|| ProfileInfo::from_key(sender));
                connection
                    .call_profile_app_service(CallRequest::new(remote, PAIRING_SERVICE).without_info_lookup())
                    .await?
            }
        };

        let profile = connection.profile();
        let result = call
            .send_message(
                PAIR_ACCEPT_TYPE,
                &PairingMsg::new(profile.name, connection.endpoint().host.clone()),
            )
            .await;
        call.dispose("pairing accepted");

        match &result {
            Ok(()) => info!(local = %local.short(), sender = %sender.short(), "Pairing accepted"),
            Err(e) => warn!(local = %local.short(), sender = %sender.short(), error = %e, "Failed to notify pairing acceptance"),
        }
        result
    }

    /// Forget a pairing request; returns whether it existed.
    pub fn cancel_pairing(&self, id: &PairingRequestId) -> LinkResult<bool> {
        let removed = self.pairing_store.delete(id)?;
        debug!(request = %id, removed, "Pairing request cancelled");
        Ok(removed)
    }

    pub fn pairing_requests(&self, key: &ProfileKey) -> LinkResult<Vec<PairingRequest>> {
        self.pairing_store.list(key)
    }

    /// Stop the home connection of `key` and every guest connection of it.
    pub fn disconnect_profile(&self, key: &ProfileKey) -> LinkResult<()> {
        let home = self
            .registry
            .homes
            .write()
            .remove(key)
            .ok_or_else(|| LinkError::ProfileNotConnected(key.short()))?;

        let guests: Vec<Arc<ProfileConnection>> = {
            let mut guests = self.registry.guests.write();
            let keys: Vec<GuestKey> = guests.keys().filter(|g| &g.local == key).cloned().collect();
            keys.iter().filter_map(|k| guests.remove(k)).collect()
        };
        for guest in guests {
            guest.stop();
        }
        home.stop();
        info!(profile = %key.short(), "Profile disconnected");
        Ok(())
    }

    /// Stop every connection.
    pub fn stop(&self) {
        let guests: Vec<_> = self.registry.guests.write().drain().map(|(_, c)| c).collect();
        let homes: Vec<_> = self.registry.homes.write().drain().map(|(_, c)| c).collect();
        for connection in guests.into_iter().chain(homes) {
            connection.stop();
        }
        info!("Session manager stopped");
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("homes", &self.registry.homes.read().len())
            .field("guests", &self.registry.guests.read().len())
            .finish()
    }
}
