//! Application services
//!
//! An application service is the named protocol spoken over a call ("chat",
//! "pairing", ...). Each local identity keeps an [`AppServiceRegistry`]; the
//! connection looks services up by name when calls are originated or arrive.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::call::AppServiceCall;
use crate::types::{Profile, ProfileInfo};

/// Capability implemented once per service type
///
/// Callbacks run on transport or runtime threads and must not block.
pub trait AppService: Send + Sync {
    /// Service name announced to the server
    fn name(&self) -> &str;

    /// Envelope types this service understands (besides the reserved ones).
    ///
    /// Inbound envelopes with any other type are rejected as decode errors.
    fn message_types(&self) -> &[&'static str] {
        &[]
    }

    /// Attach service state (usually a message listener) to a new call.
    fn wrap_call(&self, call: &Arc<AppServiceCall>) {
        let _ = call;
    }

    /// Authorize an incoming call. Returning false rejects it.
    fn on_pre_call(&self, call: &Arc<AppServiceCall>) -> bool {
        let _ = call;
        true
    }

    /// An incoming call finished its setup.
    fn on_call_connected(&self, local: &Profile, remote: &ProfileInfo, is_creator: bool) {
        let _ = (local, remote, is_creator);
    }

    /// The call is going away; drop any reference to it.
    fn remove_call(&self, call: &AppServiceCall, reason: &str) {
        let _ = (call, reason);
    }
}

/// Name-keyed table of the services a local identity offers
#[derive(Default)]
pub struct AppServiceRegistry {
    services: RwLock<HashMap<String, Arc<dyn AppService>>>,
}

impl AppServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service, replacing any service with the same name.
    pub fn register(&self, service: Arc<dyn AppService>) -> Option<Arc<dyn AppService>> {
        let name = service.name().to_string();
        self.services.write().insert(name, service)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AppService>> {
        self.services.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.read().contains_key(name)
    }

    pub fn remove(&self, name: &str) -> Option<Arc<dyn AppService>> {
        self.services.write().remove(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.services.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.read().is_empty()
    }
}

impl std::fmt::Debug for AppServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppServiceRegistry")
            .field("services", &self.names())
            .finish()
    }
}
