//! Application-service calls
//!
//! An [`AppServiceCall`] is one bidirectional channel between a local and a
//! remote identity over a named service. The handshake that moves it through
//! [`CallStatus`] is driven by the owning
//! [`ProfileConnection`](crate::connection::ProfileConnection); the call
//! itself handles messaging, encryption and disposal.
//!
//! ## Status flow
//!
//! ```text
//! creator:  NoInformation -> PendingAsInfo -> AsInfo -> PendingCallAs ─┐
//! receiver: PendingIncomingCall -> IncomingCallAccepted ───────────────┤
//!                                                                      v
//!                             PendingInitMessage -> CallAsEstablish -> CallFinished
//! any non-terminal state -> CallFail
//! ```

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::app_service::AppService;
use crate::crypto::{CallCipher, CryptoProvider};
use crate::envelope::{CryptoMsg, Envelope};
use crate::error::{LinkError, LinkResult, STATUS_BAD_REQUEST};
use crate::futures::MsgFuture;
use crate::transport::Transport;
use crate::types::{now_millis, CallId, CallToken, Profile, ProfileInfo, ProfileKey};

/// Position of a call in its handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallStatus {
    NoInformation,
    /// Waiting for the remote profile information
    PendingAsInfo,
    /// Remote profile information received
    AsInfo,
    /// Waiting for the server to open the channel
    PendingCallAs,
    PendingIncomingCall,
    IncomingCallAccepted,
    /// Waiting for the setup message to be acknowledged
    PendingInitMessage,
    /// Established; messages can flow
    CallAsEstablish,
    CallFail,
    CallFinished,
}

impl CallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallStatus::CallFail | CallStatus::CallFinished)
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CallStatus::NoInformation => "NO_INFORMATION",
            CallStatus::PendingAsInfo => "PENDING_AS_INFO",
            CallStatus::AsInfo => "AS_INFO",
            CallStatus::PendingCallAs => "PENDING_CALL_AS",
            CallStatus::PendingIncomingCall => "PENDING_INCOMING_CALL",
            CallStatus::IncomingCallAccepted => "INCOMING_CALL_ACCEPTED",
            CallStatus::PendingInitMessage => "PENDING_INIT_MESSAGE",
            CallStatus::CallAsEstablish => "CALL_AS_ESTABLISH",
            CallStatus::CallFail => "CALL_FAIL",
            CallStatus::CallFinished => "CALL_FINISHED",
        };
        f.write_str(name)
    }
}

type StateListener = Box<dyn FnOnce(&AppServiceCall) + Send>;
type MessageListener = Arc<dyn Fn(&AppServiceCall, Envelope) + Send + Sync>;

struct CallState {
    status: CallStatus,
    error: Option<String>,
    token: Option<CallToken>,
    cipher: Option<Arc<dyn CallCipher>>,
    encrypted: bool,
}

/// Everything needed to build a call
pub(crate) struct CallSetup {
    pub id: CallId,
    pub service: Arc<dyn AppService>,
    pub local: Profile,
    pub remote: ProfileInfo,
    pub is_creator: bool,
    pub encrypted: bool,
    pub transport: Arc<dyn Transport>,
    pub crypto: Arc<dyn CryptoProvider>,
    pub idle_timeout: Duration,
    pub request_timeout: Duration,
}

/// A call between a local and a remote identity over one service
pub struct AppServiceCall {
    id: CallId,
    service_name: String,
    local: Profile,
    remote_key: ProfileKey,
    remote: RwLock<ProfileInfo>,
    is_creator: bool,
    state: Mutex<CallState>,
    created_at: i64,
    /// Unix ms; 0 until the first application message
    last_sent: AtomicI64,
    last_received: AtomicI64,
    idle_timeout_ms: AtomicI64,
    request_timeout: Duration,
    disposed: AtomicBool,
    state_listeners: Mutex<Vec<StateListener>>,
    message_listener: RwLock<Option<MessageListener>>,
    transport: Arc<dyn Transport>,
    service: Arc<dyn AppService>,
    crypto: Arc<dyn CryptoProvider>,
}

impl AppServiceCall {
    pub(crate) fn new(setup: CallSetup) -> Arc<Self> {
        let status = if setup.is_creator {
            CallStatus::NoInformation
        } else {
            CallStatus::PendingIncomingCall
        };
        Arc::new(Self {
            id: setup.id,
            service_name: setup.service.name().to_string(),
            local: setup.local,
            remote_key: setup.remote.key,
            remote: RwLock::new(setup.remote),
            is_creator: setup.is_creator,
            state: Mutex::new(CallState {
                status,
                error: None,
                token: None,
                cipher: None,
                encrypted: setup.encrypted,
            }),
            created_at: now_millis(),
            last_sent: AtomicI64::new(0),
            last_received: AtomicI64::new(0),
            idle_timeout_ms: AtomicI64::new(setup.idle_timeout.as_millis() as i64),
            request_timeout: setup.request_timeout,
            disposed: AtomicBool::new(false),
            state_listeners: Mutex::new(Vec::new()),
            message_listener: RwLock::new(None),
            transport: setup.transport,
            service: setup.service,
            crypto: setup.crypto,
        })
    }

    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn local(&self) -> &Profile {
        &self.local
    }

    pub fn remote_key(&self) -> ProfileKey {
        self.remote_key
    }

    /// Snapshot of the remote profile descriptor.
    pub fn remote(&self) -> ProfileInfo {
        self.remote.read().clone()
    }

    pub fn is_creator(&self) -> bool {
        self.is_creator
    }

    pub fn status(&self) -> CallStatus {
        self.state.lock().status
    }

    /// Failure detail, set when the call ends in `CallFail`.
    pub fn error(&self) -> Option<String> {
        self.state.lock().error.clone()
    }

    pub fn token(&self) -> Option<CallToken> {
        self.state.lock().token.clone()
    }

    pub fn token_hex(&self) -> Option<String> {
        self.state.lock().token.as_ref().map(CallToken::to_hex)
    }

    pub fn is_encrypted(&self) -> bool {
        self.state.lock().encrypted
    }

    /// Name of the installed cipher, once negotiated.
    pub fn cipher_name(&self) -> Option<String> {
        self.state
            .lock()
            .cipher
            .as_ref()
            .map(|cipher| cipher.name().to_string())
    }

    pub fn is_established(&self) -> bool {
        self.status() == CallStatus::CallAsEstablish
    }

    pub fn is_done(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn last_sent(&self) -> i64 {
        self.last_sent.load(Ordering::SeqCst)
    }

    pub fn last_received(&self) -> i64 {
        self.last_received.load(Ordering::SeqCst)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms.load(Ordering::SeqCst).max(0) as u64)
    }

    pub fn set_idle_timeout(&self, timeout: Duration) {
        self.idle_timeout_ms
            .store(timeout.as_millis() as i64, Ordering::SeqCst);
    }

    /// True when created, last sent and last received are all older than
    /// the idle timeout at `now_ms`.
    pub fn is_idle_at(&self, now_ms: i64) -> bool {
        let idle = self.idle_timeout_ms.load(Ordering::SeqCst);
        self.created_at + idle < now_ms
            && self.last_received() + idle < now_ms
            && self.last_sent() + idle < now_ms
    }

    pub(crate) fn mark_sent_at(&self, ms: i64) {
        self.last_sent.store(ms, Ordering::SeqCst);
    }

    pub(crate) fn mark_received_at(&self, ms: i64) {
        self.last_received.store(ms, Ordering::SeqCst);
    }

    pub(crate) fn set_status(&self, status: CallStatus) {
        let mut state = self.state.lock();
        debug!(call_id = %self.id, from = %state.status, to = %status, "Call status");
        state.status = status;
    }

    pub(crate) fn set_token(&self, token: CallToken) {
        self.state.lock().token = Some(token);
    }

    /// Mark the call failed with `detail`.
    pub(crate) fn fail(&self, detail: impl Into<String>) {
        let mut state = self.state.lock();
        state.status = CallStatus::CallFail;
        state.error = Some(detail.into());
    }

    pub(crate) fn update_remote(&self, f: impl FnOnce(&mut ProfileInfo)) {
        f(&mut *self.remote.write());
    }

    pub(crate) fn install_cipher(&self, cipher: Arc<dyn CallCipher>) {
        let mut state = self.state.lock();
        state.cipher = Some(cipher);
        state.encrypted = true;
    }

    /// Replace the listener receiving inbound application envelopes.
    pub fn set_message_listener<F>(&self, listener: F)
    where
        F: Fn(&AppServiceCall, Envelope) + Send + Sync + 'static,
    {
        *self.message_listener.write() = Some(Arc::new(listener));
    }

    /// Register a listener run once when the call is disposed.
    ///
    /// Runs immediately if the call is already disposed.
    pub fn add_state_listener<F>(&self, listener: F)
    where
        F: FnOnce(&AppServiceCall) + Send + 'static,
    {
        let mut listeners = self.state_listeners.lock();
        if self.is_disposed() {
            drop(listeners);
            listener(self);
        } else {
            listeners.push(Box::new(listener));
        }
    }

    /// Send an envelope; the send outcome is delivered to `future`.
    ///
    /// Fails with `InvalidState` unless the call is established. If the
    /// server no longer knows the channel, `future` fails with status 400
    /// and the call is disposed.
    pub fn send(
        &self,
        envelope: Envelope,
        enqueue_if_offline: bool,
        future: MsgFuture<()>,
    ) -> LinkResult<()> {
        let (token, cipher, encrypted) = {
            let state = self.state.lock();
            if state.status != CallStatus::CallAsEstablish {
                return Err(LinkError::InvalidState(
                    "Call is not ready to send messages".to_string(),
                ));
            }
            (state.token.clone(), state.cipher.clone(), state.encrypted)
        };
        let token = token
            .ok_or_else(|| LinkError::InvalidState("Call has no channel token".to_string()))?;

        let envelope = if encrypted && !envelope.is_crypto() {
            let cipher = cipher.ok_or_else(|| {
                LinkError::Crypto("Call is encrypted but no cipher is installed".to_string())
            })?;
            Envelope {
                payload: cipher.seal(&envelope.payload)?,
                sealed: true,
                ..envelope
            }
        } else {
            envelope
        };
        let bytes = envelope.encode()?;

        match self.transport.send_app_service_msg(
            self.id,
            &token,
            bytes,
            enqueue_if_offline,
            future.clone(),
        ) {
            Ok(()) => {
                self.mark_sent_at(now_millis());
                debug!(call_id = %self.id, kind = %envelope.kind, "Message handed to transport");
                Ok(())
            }
            Err(LinkError::CallUnavailable) => {
                future.fail(
                    0,
                    STATUS_BAD_REQUEST,
                    LinkError::CallUnavailable.to_string(),
                );
                self.dispose("Connection is not longer available");
                Err(LinkError::CallUnavailable)
            }
            Err(e) => Err(e),
        }
    }

    /// Send an envelope and wait for the server acknowledgement.
    pub async fn send_envelope(&self, envelope: Envelope, enqueue_if_offline: bool) -> LinkResult<()> {
        let future = MsgFuture::new();
        self.send(envelope, enqueue_if_offline, future.clone())?;
        future.wait_timeout(self.request_timeout).await
    }

    /// Serialize `message` under type `kind`, send it and wait for the acknowledgement.
    pub async fn send_message<M: Serialize>(&self, kind: &str, message: &M) -> LinkResult<()> {
        self.send_envelope(Envelope::from_message(kind, message)?, false)
            .await
    }

    /// Probe the channel; a failed ping disposes the call.
    pub fn ping(self: &Arc<Self>) -> LinkResult<MsgFuture<()>> {
        if !self.is_established() {
            return Err(LinkError::InvalidState(
                "Call is not ready to send messages".to_string(),
            ));
        }
        let token_hex = self
            .token_hex()
            .ok_or_else(|| LinkError::InvalidState("Call has no channel token".to_string()))?;

        let future = MsgFuture::new();
        let call = Arc::clone(self);
        future.on_complete(move |_, outcome| match outcome {
            Ok(()) => debug!(call_id = %call.id, "Ping ok"),
            Err(failure) => {
                info!(call_id = %call.id, detail = %failure.detail, "Ping failed");
                call.dispose("ping failed");
            }
        });
        self.transport
            .ping_app_service(self.id, &token_hex, future.clone())?;
        Ok(future)
    }

    /// Handle an inbound payload addressed to this call.
    pub(crate) fn on_message_received(&self, bytes: &[u8]) -> LinkResult<()> {
        self.mark_received_at(now_millis());
        if bytes.is_empty() {
            debug!(call_id = %self.id, "Empty init message received");
            return Ok(());
        }

        let mut envelope = Envelope::decode_known(bytes, self.service.message_types())?;
        if envelope.sealed {
            let cipher = self.state.lock().cipher.clone().ok_or_else(|| {
                LinkError::Crypto("Sealed message on a call without cipher".to_string())
            })?;
            envelope.payload = cipher.open(&envelope.payload)?;
            envelope.sealed = false;
        }

        if envelope.is_init() {
            debug!(call_id = %self.id, "Init message received");
            return Ok(());
        }
        if envelope.is_crypto() {
            return self.handle_crypto(&envelope);
        }

        let listener = self.message_listener.read().clone();
        match listener {
            Some(listener) => listener(self, envelope),
            None => warn!(
                call_id = %self.id,
                kind = %envelope.kind,
                "Message received but no message listener attached"
            ),
        }
        Ok(())
    }

    fn handle_crypto(&self, envelope: &Envelope) -> LinkResult<()> {
        let msg: CryptoMsg = envelope.message()?;
        match self
            .crypto
            .negotiate(&msg.algo, &self.local.key, &self.remote_key)
        {
            Some(cipher) => {
                info!(call_id = %self.id, algo = %msg.algo, "Call encryption enabled");
                self.install_cipher(cipher);
            }
            None => info!(
                call_id = %self.id,
                algo = %msg.algo,
                "Crypto message with an unknown algorithm, ignoring"
            ),
        }
        Ok(())
    }

    /// Tear the call down. Idempotent; secondary failures are logged.
    ///
    /// A failed call keeps `CallFail`; any other call ends in `CallFinished`.
    pub fn dispose(&self, reason: &str) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            debug!(call_id = %self.id, "Call already disposed");
            return;
        }
        info!(
            call_id = %self.id,
            service = %self.service_name,
            remote = %self.remote_key.short(),
            reason,
            "Disposing call"
        );

        if self.token().is_some() {
            if let Err(e) = self.transport.close_channel(self.id) {
                warn!(call_id = %self.id, error = %e, "Failed to close call channel");
            }
        }
        self.service.remove_call(self, reason);

        {
            let mut state = self.state.lock();
            if state.status != CallStatus::CallFail {
                state.status = CallStatus::CallFinished;
            }
        }

        let listeners = std::mem::take(&mut *self.state_listeners.lock());
        for listener in listeners {
            listener(self);
        }
    }
}

impl std::fmt::Debug for AppServiceCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppServiceCall")
            .field("id", &self.id)
            .field("service", &self.service_name)
            .field("remote", &self.remote_key.short())
            .field("status", &self.status())
            .field("is_creator", &self.is_creator)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{DerivedKeyProvider, BOX_ALGO};
    use crate::testing::{LoopbackTransport, RecordingService};
    use std::sync::atomic::AtomicUsize;

    fn key(b: u8) -> ProfileKey {
        ProfileKey::from_bytes([b; 32])
    }

    fn call_with(transport: Arc<LoopbackTransport>, service: Arc<RecordingService>) -> Arc<AppServiceCall> {
        AppServiceCall::new(CallSetup {
            id: CallId::new(),
            service,
            local: Profile::new(key(1), "local", "person"),
            remote: ProfileInfo::from_key(key(2)),
            is_creator: true,
            encrypted: false,
            transport,
            crypto: Arc::new(DerivedKeyProvider::new()),
            idle_timeout: Duration::from_millis(1000),
            request_timeout: Duration::from_secs(5),
        })
    }

    fn established(transport: Arc<LoopbackTransport>, service: Arc<RecordingService>) -> Arc<AppServiceCall> {
        let call = call_with(transport, service);
        call.set_token(CallToken::new(vec![0xaa, 0xbb]));
        call.set_status(CallStatus::CallAsEstablish);
        call
    }

    #[test]
    fn test_send_requires_established_call() {
        let call = call_with(Arc::new(LoopbackTransport::new()), Arc::new(RecordingService::new("chat")));
        let result = call.send(Envelope::new("chat", vec![1]), false, MsgFuture::new());
        assert!(matches!(result, Err(LinkError::InvalidState(_))));
        assert_eq!(call.last_sent(), 0);
    }

    #[test]
    fn test_send_records_last_sent() {
        let transport = Arc::new(LoopbackTransport::new());
        let call = established(transport.clone(), Arc::new(RecordingService::new("chat")));

        let future = MsgFuture::new();
        call.send(Envelope::new("chat", vec![1, 2]), true, future.clone())
            .unwrap();

        assert!(call.last_sent() > 0);
        assert_eq!(future.outcome(), Some(Ok(())));
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].enqueue_if_offline);
        assert_eq!(Envelope::decode(&sent[0].payload).unwrap().kind, "chat");
    }

    #[test]
    fn test_unavailable_channel_fails_and_disposes() {
        let transport = Arc::new(LoopbackTransport::new());
        transport.set_channel_unavailable(true);
        let service = Arc::new(RecordingService::new("chat"));
        let call = established(transport, service.clone());

        let future = MsgFuture::new();
        let result = call.send(Envelope::new("chat", vec![]), false, future.clone());

        assert!(matches!(result, Err(LinkError::CallUnavailable)));
        let failure = future.outcome().unwrap().unwrap_err();
        assert_eq!(failure.status, 400);
        assert_eq!(failure.detail, "Call is not longer available");
        assert!(call.is_disposed());
        assert_eq!(service.removed(), 1);
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let transport = Arc::new(LoopbackTransport::new());
        let service = Arc::new(RecordingService::new("chat"));
        let call = established(transport.clone(), service.clone());

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        call.add_state_listener(move |c| {
            assert_eq!(c.status(), CallStatus::CallFinished);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        call.dispose("test");
        call.dispose("test again");

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(service.removed(), 1);
        assert_eq!(transport.closed().len(), 1);

        // Late listeners still run exactly once.
        let late = Arc::new(AtomicUsize::new(0));
        let counter = late.clone();
        call.add_state_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(late.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_call_keeps_fail_status() {
        let call = call_with(Arc::new(LoopbackTransport::new()), Arc::new(RecordingService::new("chat")));
        call.fail("Remote profile not online");
        call.dispose("handshake failed");
        assert_eq!(call.status(), CallStatus::CallFail);
        assert_eq!(call.error().as_deref(), Some("Remote profile not online"));
        assert!(call.is_done());
    }

    #[test]
    fn test_idle_requires_all_timestamps_old() {
        let call = call_with(Arc::new(LoopbackTransport::new()), Arc::new(RecordingService::new("chat")));
        let idle = 1000;
        let later = call.created_at() + idle + 1;

        assert!(call.is_idle_at(later));

        call.mark_received_at(later - 10);
        assert!(!call.is_idle_at(later));

        call.mark_received_at(0);
        call.mark_sent_at(later);
        assert!(!call.is_idle_at(later));

        call.mark_sent_at(0);
        assert!(!call.is_idle_at(call.created_at() + idle));
    }

    #[test]
    fn test_inbound_messages_reach_listener() {
        let service = Arc::new(RecordingService::new("chat").with_types(&["chat"]));
        let call = established(Arc::new(LoopbackTransport::new()), service);

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        call.set_message_listener(move |_, envelope| sink.lock().push(envelope));

        call.on_message_received(&[]).unwrap();
        call.on_message_received(&Envelope::init().encode().unwrap())
            .unwrap();
        let chat = Envelope::new("chat", b"hello".to_vec());
        call.on_message_received(&chat.encode().unwrap()).unwrap();

        let unknown = Envelope::new("other", vec![]).encode().unwrap();
        assert!(matches!(
            call.on_message_received(&unknown),
            Err(LinkError::EnvelopeDecode(_))
        ));

        assert_eq!(*received.lock(), vec![chat]);
        assert!(call.last_received() > 0);
    }

    #[test]
    fn test_crypto_message_installs_cipher() {
        let service = Arc::new(RecordingService::new("chat").with_types(&["chat"]));
        let call = established(Arc::new(LoopbackTransport::new()), service);

        let unknown = Envelope::crypto("rsa").unwrap().encode().unwrap();
        call.on_message_received(&unknown).unwrap();
        assert!(!call.is_encrypted());

        let boxed = Envelope::crypto(BOX_ALGO).unwrap().encode().unwrap();
        call.on_message_received(&boxed).unwrap();
        assert!(call.is_encrypted());
        assert_eq!(call.cipher_name().as_deref(), Some(BOX_ALGO));

        // The peer derives the same key, so a sealed envelope from it opens here.
        let peer = DerivedKeyProvider::new()
            .negotiate(BOX_ALGO, &key(2), &key(1))
            .unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        call.set_message_listener(move |_, envelope| sink.lock().push(envelope.payload));

        let sealed = Envelope {
            kind: "chat".to_string(),
            payload: peer.seal(b"secret").unwrap(),
            sealed: true,
        };
        call.on_message_received(&sealed.encode().unwrap()).unwrap();
        assert_eq!(*received.lock(), vec![b"secret".to_vec()]);
    }

    #[test]
    fn test_ping_failure_disposes() {
        let transport = Arc::new(LoopbackTransport::new());
        transport.set_ping_fails(true);
        let call = established(transport, Arc::new(RecordingService::new("chat")));

        let future = call.ping().unwrap();
        assert!(future.outcome().unwrap().is_err());
        assert!(call.is_disposed());
        assert_eq!(call.status(), CallStatus::CallFinished);
    }
}
