//! Periodic maintenance: retry-queue redelivery and idle-call sweep

use std::sync::Arc;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{ProfileConnection, Routing};
use crate::error::{LinkError, LinkResult};
use crate::storage::QueuedMessage;
use crate::types::{now_millis, ProfileInfo};

/// Outcome of one pass over the retry queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryReport {
    pub attempted: usize,
    /// Messages reported back to the queue as failed to resend
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub retry: RetryReport,
    pub idle_closed: usize,
}

impl ProfileConnection {
    /// Spawn the maintenance loop; the first tick fires one period from now.
    pub(crate) fn start_maintenance(self: &Arc<Self>) {
        let mut slot = self.maintenance.lock();
        if slot.is_some() {
            return;
        }
        let period = self.config.maintenance_interval();
        let weak = Arc::downgrade(self);
        *slot = Some(self.runtime.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(connection) = weak.upgrade() else {
                    break;
                };
                if connection.is_stopped() {
                    break;
                }
                let report = connection.run_maintenance_tick().await;
                debug!(
                    attempted = report.retry.attempted,
                    failed = report.retry.failed,
                    idle_closed = report.idle_closed,
                    "Maintenance tick"
                );
            }
        }));
        debug!(profile = %self.key().short(), period_secs = period.as_secs(), "Maintenance started");
    }

    pub(crate) fn stop_maintenance(&self) {
        if let Some(handle) = self.maintenance.lock().take() {
            handle.abort();
        }
    }

    /// One maintenance pass: redeliver queued messages, then close idle calls.
    pub async fn run_maintenance_tick(&self) -> MaintenanceReport {
        let retry = self.drain_retry_queue().await;
        let idle_closed = self.sweep_idle_calls_at(now_millis());
        MaintenanceReport { retry, idle_closed }
    }

    /// Try to resend every queued message of the local profile.
    ///
    /// Delivery outcomes flow back to the queue through its completion
    /// listener; anything that fails before the send is reported with
    /// `failed_to_resend`. Guest connections leave the queue to the home
    /// connection, which sends each message through the server hosting
    /// its remote.
    pub async fn drain_retry_queue(&self) -> RetryReport {
        let routing = self.routing();
        let mut report = RetryReport::default();
        if matches!(routing, Routing::Guest) {
            return report;
        }
        let queue = Arc::clone(&self.collaborators.message_queue);

        for message in queue.pending_messages(&self.key()) {
            report.attempted += 1;
            if let Err(e) = self.resend(&message, &routing).await {
                warn!(
                    message_id = %message.id,
                    service = %message.service,
                    remote = %message.remote_key.short(),
                    error = %e,
                    "Failed to resend queued message"
                );
                queue.failed_to_resend(&message);
                report.failed += 1;
            }
        }
        report
    }

    async fn resend(&self, message: &QueuedMessage, routing: &Routing) -> LinkResult<()> {
        let remote = self
            .collaborators
            .profile_store
            .get(&message.local_key, &message.remote_key)?
            .ok_or_else(|| {
                LinkError::Storage(format!("Unknown profile {}", message.remote_key.short()))
            })?;

        let guest = self.route_to(&remote, routing).await?;
        let connection = guest.as_deref().unwrap_or(self);
        let call = connection
            .get_or_open_call(
                &message.service,
                remote,
                !message.try_update_remote_services,
                false,
            )
            .await?;
        call.send(
            message.envelope(),
            false,
            self.collaborators.message_queue.completion_listener(message),
        )
    }

    /// Guest connection reaching `remote`, or `None` to use this one.
    async fn route_to(
        &self,
        remote: &ProfileInfo,
        routing: &Routing,
    ) -> LinkResult<Option<Arc<ProfileConnection>>> {
        let Routing::Home(router) = routing else {
            return Ok(None);
        };
        let host = match remote.home_host.as_deref() {
            Some(host) if host != self.endpoint.host => host,
            _ => return Ok(None),
        };
        let router = router
            .upgrade()
            .ok_or_else(|| LinkError::InvalidState("Session manager is gone".to_string()))?;
        let connection = router.connection_for(self, host).await?;
        debug!(remote = %remote.key.short(), host, "Resending through guest connection");
        Ok(Some(connection))
    }

    /// Dispose every call idle at `now_ms`; returns how many were closed.
    pub fn sweep_idle_calls_at(&self, now_ms: i64) -> usize {
        let idle: Vec<_> = self
            .open_calls()
            .into_iter()
            .filter(|call| call.is_idle_at(now_ms))
            .collect();
        for call in &idle {
            info!(
                call_id = %call.id(),
                service = %call.service_name(),
                remote = %call.remote_key().short(),
                "Closing idle call"
            );
            call.dispose("idle call");
        }
        idle.len()
    }
}
