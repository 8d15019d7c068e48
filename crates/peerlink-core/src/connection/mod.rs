//! Profile connection
//!
//! A [`ProfileConnection`] owns the session of one local identity with one
//! profile server. It keeps the table of open calls, drives call handshakes
//! (see `handshake.rs`) and runs a periodic maintenance task (see
//! `maintenance.rs`) that redelivers queued messages and closes idle calls.
//!
//! ## Open-call table
//!
//! Calls are keyed by the hex form of their server token. At most one open
//! call exists per (service, remote identity): a handshake reserves the pair
//! before asking the server for a channel, and the reservation becomes a
//! registration under the same lock once the token is known.

mod handshake;
mod maintenance;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::app_service::{AppService, AppServiceRegistry};
use crate::call::AppServiceCall;
use crate::config::LinkConfig;
use crate::crypto::CryptoProvider;
use crate::error::{LinkError, LinkResult};
use crate::futures::{MsgFuture, PageFuture};
use crate::storage::{MessageQueue, ProfileStore};
use crate::transport::{
    IncomingCall, InboundAppMessage, InboundHandler, ProfileInfoRequest, Transport,
};
use crate::types::{
    Profile, ProfileInfo, ProfileKey, ProfileQueryInfo, ProfileUpdate, SearchQuery,
    ServerEndpoint,
};

pub use handshake::CallRequest;
pub use maintenance::{MaintenanceReport, RetryReport};

/// External collaborators shared by every connection of a session manager
#[derive(Clone)]
pub struct Collaborators {
    pub profile_store: Arc<dyn ProfileStore>,
    pub message_queue: Arc<dyn MessageQueue>,
    pub crypto: Arc<dyn CryptoProvider>,
}

/// Finds the connection through which a local identity reaches another server
pub trait CallRouter: Send + Sync {
    /// Connection of `local`'s identity to `remote_host`, started if needed.
    fn connection_for<'a>(
        &'a self,
        local: &'a ProfileConnection,
        remote_host: &'a str,
    ) -> BoxFuture<'a, LinkResult<Arc<ProfileConnection>>>;
}

/// Role of a connection in retry-queue redelivery
#[derive(Clone, Default)]
pub enum Routing {
    /// Resend every queued message through this connection
    #[default]
    Direct,
    /// Home connection; remotes hosted elsewhere are reached through the router
    Home(Weak<dyn CallRouter>),
    /// Guest connection; the home connection owns the queue
    Guest,
}

impl std::fmt::Debug for Routing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Routing::Direct => write!(f, "Direct"),
            Routing::Home(_) => write!(f, "Home"),
            Routing::Guest => write!(f, "Guest"),
        }
    }
}

#[derive(Default)]
pub(crate) struct CallTable {
    by_token: HashMap<String, Arc<AppServiceCall>>,
    reserved: HashSet<(String, ProfileKey)>,
}

impl CallTable {
    fn has_open(&self, service: &str, remote: &ProfileKey) -> bool {
        self.reserved.contains(&(service.to_string(), *remote))
            || self
                .by_token
                .values()
                .any(|call| call.service_name() == service && &call.remote_key() == remote)
    }

    fn find(&self, service: &str, remote: &ProfileKey) -> Option<Arc<AppServiceCall>> {
        self.by_token
            .values()
            .find(|call| call.service_name() == service && &call.remote_key() == remote)
            .cloned()
    }
}

/// Claim on a (service, remote) pair for a call that has no token yet
///
/// Released on drop unless converted into a registration.
pub(crate) struct Reservation {
    table: Arc<Mutex<CallTable>>,
    key: (String, ProfileKey),
    committed: bool,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.committed {
            self.table.lock().reserved.remove(&self.key);
        }
    }
}

/// Session of one local identity with one profile server
pub struct ProfileConnection {
    profile: RwLock<Profile>,
    endpoint: ServerEndpoint,
    transport: Arc<dyn Transport>,
    services: Arc<AppServiceRegistry>,
    calls: Arc<Mutex<CallTable>>,
    collaborators: Collaborators,
    config: LinkConfig,
    routing: RwLock<Routing>,
    runtime: Handle,
    maintenance: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl ProfileConnection {
    /// Create a connection; must be called from within a tokio runtime.
    pub fn new(
        profile: Profile,
        endpoint: ServerEndpoint,
        transport: Arc<dyn Transport>,
        services: Arc<AppServiceRegistry>,
        collaborators: Collaborators,
        config: LinkConfig,
    ) -> LinkResult<Arc<Self>> {
        let runtime = Handle::try_current()
            .map_err(|e| LinkError::InvalidState(format!("No tokio runtime: {}", e)))?;
        Ok(Arc::new(Self {
            profile: RwLock::new(profile),
            endpoint,
            transport,
            services,
            calls: Arc::new(Mutex::new(CallTable::default())),
            collaborators,
            config,
            routing: RwLock::new(Routing::Direct),
            runtime,
            maintenance: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }))
    }

    /// Snapshot of the local profile.
    pub fn profile(&self) -> Profile {
        self.profile.read().clone()
    }

    pub fn key(&self) -> ProfileKey {
        self.profile.read().key
    }

    pub fn endpoint(&self) -> &ServerEndpoint {
        &self.endpoint
    }

    pub fn services(&self) -> &Arc<AppServiceRegistry> {
        &self.services
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn routing(&self) -> Routing {
        self.routing.read().clone()
    }

    /// Set before `init`; the maintenance loop reads it on every tick.
    pub fn set_routing(&self, routing: Routing) {
        *self.routing.write() = routing;
    }

    pub fn is_ready(&self) -> bool {
        self.transport.is_ready()
    }

    pub fn is_connecting(&self) -> bool {
        self.transport.is_connecting()
    }

    pub fn has_failed(&self) -> bool {
        self.transport.has_failed()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Open the session, announce the registered services and start maintenance.
    pub async fn init(self: &Arc<Self>) -> LinkResult<()> {
        let inbound: Arc<dyn InboundHandler> = Arc::new(InboundRouter {
            connection: Arc::downgrade(self),
        });
        let started = MsgFuture::new();
        self.transport.start(inbound, started.clone())?;
        started.wait_timeout(self.config.request_timeout()).await?;
        info!(
            profile = %self.key().short(),
            server = %self.endpoint,
            "Profile connection started"
        );

        for name in self.services.names() {
            self.announce_service(&name).await?;
        }

        self.start_maintenance();
        Ok(())
    }

    /// Register another service on a running connection.
    pub async fn add_app_service(&self, service: Arc<dyn AppService>) -> LinkResult<()> {
        let name = service.name().to_string();
        self.services.register(service);
        self.announce_service(&name).await
    }

    async fn announce_service(&self, name: &str) -> LinkResult<()> {
        self.profile.write().app_services.insert(name.to_string());
        let future = MsgFuture::new();
        self.transport.add_app_service(name, future.clone())?;
        future.wait_timeout(self.config.request_timeout()).await?;
        debug!(profile = %self.key().short(), service = name, "Application service registered");
        Ok(())
    }

    /// Fetch what the server knows about `key`.
    pub async fn get_profile_information(
        &self,
        key: &ProfileKey,
        request: ProfileInfoRequest,
    ) -> LinkResult<ProfileInfo> {
        let future = MsgFuture::new();
        self.transport
            .get_profile_information(key, request, future.clone())?;
        future.wait_timeout(self.config.request_timeout()).await
    }

    /// Single-shot search; hits are also cached in `query`.
    pub fn search_profiles(
        &self,
        query: Arc<Mutex<SearchQuery>>,
    ) -> LinkResult<MsgFuture<Vec<ProfileQueryInfo>>> {
        let future: MsgFuture<Vec<ProfileQueryInfo>> = MsgFuture::new();
        let cursor = Arc::clone(&query);
        future.on_complete(move |_, outcome| {
            if let Ok(hits) = outcome {
                cursor.lock().record_page(0, hits.len() as u32, &hits);
            }
        });
        let snapshot = query.lock().clone();
        self.transport.search_profiles(&snapshot, future.clone())?;
        Ok(future)
    }

    /// Continue a search from the cursor stored in `query`.
    pub fn search_subsequent_profiles(&self, query: Arc<Mutex<SearchQuery>>) -> LinkResult<PageFuture> {
        let snapshot = query.lock().clone();
        let future = PageFuture::new(query);
        self.transport
            .search_subsequent_profiles(&snapshot, future.clone())?;
        Ok(future)
    }

    pub fn search_profile_by_name(&self, name: &str) -> LinkResult<MsgFuture<Vec<ProfileQueryInfo>>> {
        let future = MsgFuture::new();
        self.transport.search_profile_by_name(name, future.clone())?;
        Ok(future)
    }

    /// Apply `update` locally and publish it to the server.
    pub async fn update_profile(&self, update: ProfileUpdate) -> LinkResult<()> {
        self.profile.write().apply(&update);
        let future = MsgFuture::new();
        self.transport.update_profile(&update, future.clone())?;
        future.wait_timeout(self.config.request_timeout()).await
    }

    /// Any open call with `remote`, preferring established ones.
    pub fn get_active_call(&self, remote: &ProfileKey) -> Option<Arc<AppServiceCall>> {
        let table = self.calls.lock();
        let mut candidates = table
            .by_token
            .values()
            .filter(|call| &call.remote_key() == remote);
        let first = candidates.next()?;
        if first.is_established() {
            return Some(Arc::clone(first));
        }
        candidates
            .find(|call| call.is_established())
            .cloned()
            .or_else(|| Some(Arc::clone(first)))
    }

    /// The open call for (service, remote), if any.
    pub fn find_call(&self, service: &str, remote: &ProfileKey) -> Option<Arc<AppServiceCall>> {
        self.calls.lock().find(service, remote)
    }

    pub fn call_by_token(&self, token_hex: &str) -> Option<Arc<AppServiceCall>> {
        self.calls.lock().by_token.get(token_hex).cloned()
    }

    pub fn open_calls(&self) -> Vec<Arc<AppServiceCall>> {
        self.calls.lock().by_token.values().cloned().collect()
    }

    pub fn open_call_count(&self) -> usize {
        self.calls.lock().by_token.len()
    }

    /// Route an inbound application message to its call.
    ///
    /// Messages for unknown tokens are dropped with a warning. Decode
    /// failures are logged; the server is acknowledged either way.
    pub fn incoming_message(&self, message_id: u32, message: InboundAppMessage) {
        let token_hex = message.call_token.to_hex();
        let Some(call) = self.call_by_token(&token_hex) else {
            warn!(
                profile = %self.key().short(),
                token = %token_hex,
                "Message for unknown call, dropping"
            );
            return;
        };

        if let Err(e) = call.on_message_received(&message.payload) {
            warn!(call_id = %call.id(), error = %e, "Failed to handle inbound message");
        }
        if let Err(e) =
            self.transport
                .respond_app_service_receive_msg(call.id(), &message.call_token, message_id)
        {
            warn!(call_id = %call.id(), message_id, error = %e, "Failed to acknowledge message");
        }
    }

    /// Shut down: halt maintenance, dispose every call, clear the table, close the transport.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_maintenance();

        for call in self.open_calls() {
            call.dispose("local profile close connection");
        }
        {
            let mut table = self.calls.lock();
            table.by_token.clear();
            table.reserved.clear();
        }

        self.transport.stop();
        info!(profile = %self.key().short(), server = %self.endpoint, "Profile connection stopped");
    }

    fn reserve(&self, service: &str, remote: &ProfileKey) -> LinkResult<Reservation> {
        let mut table = self.calls.lock();
        if table.has_open(service, remote) {
            return Err(LinkError::DuplicateCall);
        }
        let key = (service.to_string(), *remote);
        table.reserved.insert(key.clone());
        Ok(Reservation {
            table: Arc::clone(&self.calls),
            key,
            committed: false,
        })
    }

    /// Turn a reservation into a registration under the call's token.
    fn register_call(&self, call: &Arc<AppServiceCall>, mut reservation: Reservation) -> LinkResult<()> {
        let token_hex = call
            .token_hex()
            .ok_or_else(|| LinkError::InvalidState("Call has no channel token".to_string()))?;
        {
            let mut table = self.calls.lock();
            table.reserved.remove(&reservation.key);
            table.by_token.insert(token_hex.clone(), Arc::clone(call));
            reservation.committed = true;
        }

        let table = Arc::downgrade(&self.calls);
        let registered = token_hex.clone();
        call.add_state_listener(move |finished| {
            if let Some(table) = table.upgrade() {
                let mut table = table.lock();
                let same = table
                    .by_token
                    .get(&registered)
                    .is_some_and(|open| open.id() == finished.id());
                if same {
                    table.by_token.remove(&registered);
                }
            }
        });
        info!(call_id = %call.id(), token = %token_hex, service = %call.service_name(), "Call registered");
        Ok(())
    }
}

impl std::fmt::Debug for ProfileConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileConnection")
            .field("profile", &self.key().short())
            .field("server", &self.endpoint.host)
            .field("routing", &*self.routing.read())
            .field("open_calls", &self.open_call_count())
            .finish()
    }
}

/// Forwards transport callbacks to the connection without keeping it alive
struct InboundRouter {
    connection: Weak<ProfileConnection>,
}

impl InboundHandler for InboundRouter {
    fn incoming_call(&self, message_id: u32, call: IncomingCall) {
        match self.connection.upgrade() {
            Some(connection) => connection.incoming_call(message_id, call),
            None => debug!(message_id, "Incoming call after connection dropped"),
        }
    }

    fn incoming_message(&self, message_id: u32, message: InboundAppMessage) {
        match self.connection.upgrade() {
            Some(connection) => connection.incoming_message(message_id, message),
            None => debug!(message_id, "Inbound message after connection dropped"),
        }
    }
}
