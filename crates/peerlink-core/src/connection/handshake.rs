//! Call setup for both sides of a channel

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::ProfileConnection;
use crate::call::{AppServiceCall, CallSetup, CallStatus};
use crate::envelope::Envelope;
use crate::error::{LinkError, LinkResult};
use crate::futures::MsgFuture;
use crate::transport::{IncomingCall, ProfileInfoRequest};
use crate::types::{CallId, ProfileInfo};

/// Parameters of an outgoing call
#[derive(Debug, Clone)]
pub struct CallRequest {
    pub remote: ProfileInfo,
    pub service: String,
    /// Skip the profile information lookup and trust `remote` as given
    pub try_without_info: bool,
    pub encrypt: bool,
}

impl CallRequest {
    pub fn new(remote: ProfileInfo, service: impl Into<String>) -> Self {
        Self {
            remote,
            service: service.into(),
            try_without_info: false,
            encrypt: false,
        }
    }

    pub fn without_info_lookup(mut self) -> Self {
        self.try_without_info = true;
        self
    }

    pub fn encrypted(mut self) -> Self {
        self.encrypt = true;
        self
    }
}

impl ProfileConnection {
    /// Build an outgoing call in `NoInformation` and let its service wrap it.
    pub fn new_outgoing_call(&self, request: &CallRequest) -> LinkResult<Arc<AppServiceCall>> {
        let service = self
            .services
            .get(&request.service)
            .ok_or_else(|| LinkError::UnknownService(request.service.clone()))?;
        let call = AppServiceCall::new(CallSetup {
            id: CallId::new(),
            service: Arc::clone(&service),
            local: self.profile(),
            remote: request.remote.clone(),
            is_creator: true,
            encrypted: request.encrypt,
            transport: Arc::clone(&self.transport),
            crypto: Arc::clone(&self.collaborators.crypto),
            idle_timeout: self.config.call_idle_timeout(),
            request_timeout: self.config.request_timeout(),
        });
        service.wrap_call(&call);
        Ok(call)
    }

    /// Run the creator handshake for `call`.
    ///
    /// Any failure ends the call in `CallFail` with the error detail, disposes
    /// it and is returned to the caller.
    pub async fn establish(&self, call: &Arc<AppServiceCall>, try_without_info: bool) -> LinkResult<()> {
        match self.run_creator_handshake(call, try_without_info).await {
            Ok(()) => {
                info!(
                    call_id = %call.id(),
                    service = %call.service_name(),
                    remote = %call.remote_key().short(),
                    encrypted = call.is_encrypted(),
                    "Call established"
                );
                Ok(())
            }
            Err(e) => {
                warn!(call_id = %call.id(), service = %call.service_name(), error = %e, "Call setup failed");
                self.fail_call(call, &e);
                Err(e)
            }
        }
    }

    /// Open a call to a remote identity and wait until it is established.
    pub async fn call_profile_app_service(&self, request: CallRequest) -> LinkResult<Arc<AppServiceCall>> {
        debug!(
            service = %request.service,
            remote = %request.remote.key.short(),
            try_without_info = request.try_without_info,
            "Opening call"
        );
        let call = self.new_outgoing_call(&request)?;
        self.establish(&call, request.try_without_info).await?;
        Ok(call)
    }

    /// Open a call in the background; the outcome is delivered to the returned correlator.
    pub fn start_call(self: &Arc<Self>, request: CallRequest) -> MsgFuture<Arc<AppServiceCall>> {
        let future = MsgFuture::new();
        let connection = Arc::clone(self);
        let outcome = future.clone();
        self.runtime.spawn(async move {
            match connection.call_profile_app_service(request).await {
                Ok(call) => {
                    outcome.fulfill(0, call);
                }
                Err(e) => {
                    outcome.fail_with(&e);
                }
            }
        });
        future
    }

    /// Reuse the open call for (service, remote) or open a new one.
    pub async fn get_or_open_call(
        &self,
        service: &str,
        remote: ProfileInfo,
        try_without_info: bool,
        encrypt: bool,
    ) -> LinkResult<Arc<AppServiceCall>> {
        if let Some(call) = self.find_call(service, &remote.key) {
            if call.is_established() {
                return Ok(call);
            }
        }
        let mut request = CallRequest::new(remote, service);
        request.try_without_info = try_without_info;
        request.encrypt = encrypt;
        self.call_profile_app_service(request).await
    }

    async fn run_creator_handshake(&self, call: &Arc<AppServiceCall>, try_without_info: bool) -> LinkResult<()> {
        let service = call.service_name().to_string();
        let remote_key = call.remote_key();

        if !try_without_info {
            call.set_status(CallStatus::PendingAsInfo);
            let info = self
                .get_profile_information(&remote_key, ProfileInfoRequest::app_services())
                .await?;
            call.set_status(CallStatus::AsInfo);
            if !info.is_online {
                return Err(LinkError::RemoteOffline);
            }
            if !info.supports(&service) {
                return Err(LinkError::ServiceNotSupported(service));
            }
            call.update_remote(|remote| remote.merge_remote(&info));
        }

        let reservation = self.reserve(&service, &remote_key)?;

        call.set_status(CallStatus::PendingCallAs);
        let grant = MsgFuture::new();
        self.transport
            .call_profile_app_service(&remote_key, &service, grant.clone())?;
        let grant = grant.wait_timeout(self.config.request_timeout()).await?;
        call.set_token(grant.caller_token);
        self.register_call(call, reservation)?;

        self.send_init_message(call, true).await
    }

    /// Send the setup message; the requester then proposes encryption if asked.
    async fn send_init_message(&self, call: &Arc<AppServiceCall>, is_requester: bool) -> LinkResult<()> {
        call.set_status(CallStatus::PendingInitMessage);
        let token = call
            .token()
            .ok_or_else(|| LinkError::InvalidState("Call has no channel token".to_string()))?;

        let ack = MsgFuture::new();
        self.transport.send_app_service_msg(
            call.id(),
            &token,
            Envelope::init().encode()?,
            false,
            ack.clone(),
        )?;
        ack.wait_timeout(self.config.request_timeout()).await?;
        call.set_status(CallStatus::CallAsEstablish);

        if call.is_encrypted() && is_requester {
            self.negotiate_encryption(call).await?;
        }
        Ok(())
    }

    async fn negotiate_encryption(&self, call: &Arc<AppServiceCall>) -> LinkResult<()> {
        let crypto = &self.collaborators.crypto;
        let algo = crypto.default_algo().to_string();
        let cipher = crypto
            .negotiate(&algo, &call.local().key, &call.remote_key())
            .ok_or_else(|| LinkError::Crypto(format!("Unsupported algorithm {}", algo)))?;

        // Installed first so the call never looks established without a
        // cipher; the negotiation envelope itself is sent in clear.
        call.install_cipher(cipher);
        call.send_envelope(Envelope::crypto(algo.as_str())?, false)
            .await?;
        info!(call_id = %call.id(), algo = %algo, "Call encryption enabled");
        Ok(())
    }

    /// Receiver side: authorize, register and accept a call the server announced.
    ///
    /// A second incoming call for an already open (service, caller) pair is
    /// dropped without answering.
    pub(crate) fn incoming_call(self: &Arc<Self>, message_id: u32, incoming: IncomingCall) {
        let Some(service) = self.services.get(&incoming.service_name) else {
            warn!(
                service = %incoming.service_name,
                caller = %incoming.caller_key.short(),
                "Incoming call for unregistered service"
            );
            return;
        };

        let reservation = match self.reserve(&incoming.service_name, &incoming.caller_key) {
            Ok(reservation) => reservation,
            Err(_) => {
                debug!(
                    service = %incoming.service_name,
                    caller = %incoming.caller_key.short(),
                    "Duplicate incoming call ignored"
                );
                return;
            }
        };

        let local = self.profile();
        let remote = self
            .collaborators
            .profile_store
            .get(&local.key, &incoming.caller_key)
            .ok()
            .flatten()
            .unwrap_or_else(|| ProfileInfo::from_key(incoming.caller_key));

        let call = AppServiceCall::new(CallSetup {
            id: CallId::new(),
            service: Arc::clone(&service),
            local,
            remote,
            is_creator: false,
            encrypted: false,
            transport: Arc::clone(&self.transport),
            crypto: Arc::clone(&self.collaborators.crypto),
            idle_timeout: self.config.call_idle_timeout(),
            request_timeout: self.config.request_timeout(),
        });
        call.set_token(incoming.callee_token);

        if !service.on_pre_call(&call) {
            info!(
                call_id = %call.id(),
                service = %incoming.service_name,
                caller = %incoming.caller_key.short(),
                "Incoming call rejected by service"
            );
            drop(reservation);
            call.dispose("call rejected");
            return;
        }

        // Attach the service before registering so no message can outrun the listener.
        service.wrap_call(&call);
        if let Err(e) = self.register_call(&call, reservation) {
            self.fail_call(&call, &e);
            return;
        }
        if let Err(e) = self.transport.accept_call(message_id) {
            warn!(call_id = %call.id(), error = %e, "Failed to accept incoming call");
            self.fail_call(&call, &e);
            return;
        }
        call.set_status(CallStatus::IncomingCallAccepted);

        let connection = Arc::clone(self);
        self.runtime.spawn(async move {
            match connection.send_init_message(&call, false).await {
                Ok(()) => {
                    service.on_call_connected(call.local(), &call.remote(), false);
                    info!(
                        call_id = %call.id(),
                        service = %call.service_name(),
                        caller = %call.remote_key().short(),
                        "Incoming call established"
                    );
                }
                Err(e) => {
                    warn!(call_id = %call.id(), error = %e, "Incoming call setup failed");
                    connection.fail_call(&call, &e);
                }
            }
        });
    }

    /// End `call` in `CallFail` with the error detail and dispose it.
    pub(crate) fn fail_call(&self, call: &AppServiceCall, error: &LinkError) {
        if call.is_disposed() {
            return;
        }
        call.fail(error.detail());
        call.dispose("call setup failed");
    }
}
