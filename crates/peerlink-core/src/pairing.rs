//! Pairing application service
//!
//! Two identities pair by exchanging a `pairing_request` and a `pair_accept`
//! envelope over a call to the `pairing` service. The sending side of the
//! workflow lives in [`SessionManager`](crate::manager::SessionManager); this
//! module handles the receiving side and publishes [`PairingEvent`]s.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::app_service::AppService;
use crate::call::AppServiceCall;
use crate::envelope::Envelope;
use crate::error::LinkResult;
use crate::storage::{PairingStore, ProfileStore};
use crate::types::{PairStatus, PairingRequest, ProfileInfo, ProfileKey};

pub const PAIRING_SERVICE: &str = "pairing";
pub const PAIRING_REQUEST_TYPE: &str = "pairing_request";
pub const PAIR_ACCEPT_TYPE: &str = "pair_accept";

/// Payload of both pairing envelopes: who is talking and where they live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingMsg {
    pub name: String,
    pub host: String,
}

impl PairingMsg {
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
        }
    }
}

/// Events emitted by the pairing workflow
#[derive(Debug, Clone, PartialEq)]
pub enum PairingEvent {
    /// A remote identity asked to pair with a local one
    RequestReceived(PairingRequest),
    /// A pairing request we sent was accepted
    Accepted { local: ProfileKey, remote: ProfileKey },
}

/// Handles inbound pairing envelopes for one local identity
#[derive(Clone)]
pub struct PairingService {
    local_host: String,
    pairing_store: Arc<dyn PairingStore>,
    profile_store: Arc<dyn ProfileStore>,
    event_tx: broadcast::Sender<PairingEvent>,
}

impl PairingService {
    pub fn new(
        local_host: impl Into<String>,
        pairing_store: Arc<dyn PairingStore>,
        profile_store: Arc<dyn ProfileStore>,
        event_tx: broadcast::Sender<PairingEvent>,
    ) -> Self {
        Self {
            local_host: local_host.into(),
            pairing_store,
            profile_store,
            event_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PairingEvent> {
        self.event_tx.subscribe()
    }

    fn handle_envelope(&self, call: &AppServiceCall, envelope: Envelope) -> LinkResult<()> {
        let local = call.local().key;
        let remote = call.remote_key();
        let msg: PairingMsg = envelope.message()?;

        match envelope.kind.as_str() {
            PAIRING_REQUEST_TYPE => {
                let request = PairingRequest::incoming(remote, &msg.name, &msg.host, local, &self.local_host)
                    .with_remote_name(call.local().name.clone());
                self.pairing_store.save(&request)?;
                self.remember_profile(&local, remote, &msg, PairStatus::WaitingForMyResponse)?;
                info!(
                    local = %local.short(),
                    sender = %remote.short(),
                    name = %msg.name,
                    "Pairing request received"
                );
                let _ = self.event_tx.send(PairingEvent::RequestReceived(request));
            }
            PAIR_ACCEPT_TYPE => {
                self.remember_profile(&local, remote, &msg, PairStatus::Paired)?;
                self.pairing_store
                    .update_status(&local, &remote, PairStatus::Paired)?;
                info!(local = %local.short(), remote = %remote.short(), "Pairing accepted");
                let _ = self.event_tx.send(PairingEvent::Accepted { local, remote });
            }
            other => debug!(kind = other, "Ignoring pairing envelope"),
        }
        Ok(())
    }

    fn remember_profile(
        &self,
        owner: &ProfileKey,
        remote: ProfileKey,
        msg: &PairingMsg,
        status: PairStatus,
    ) -> LinkResult<()> {
        let mut info = self
            .profile_store
            .get(owner, &remote)?
            .unwrap_or_else(|| ProfileInfo::from_key(remote));
        if info.name.is_empty() {
            info.name = msg.name.clone();
        }
        info.home_host = Some(msg.host.clone());
        info.pair_status = status;
        self.profile_store.save(owner, &info)
    }
}

impl AppService for PairingService {
    fn name(&self) -> &str {
        PAIRING_SERVICE
    }

    fn message_types(&self) -> &[&'static str] {
        &[PAIRING_REQUEST_TYPE, PAIR_ACCEPT_TYPE]
    }

    fn wrap_call(&self, call: &Arc<AppServiceCall>) {
        let service = self.clone();
        call.set_message_listener(move |call, envelope| {
            if let Err(e) = service.handle_envelope(call, envelope) {
                warn!(call_id = %call.id(), error = %e, "Failed to handle pairing message");
            }
        });
    }
}
