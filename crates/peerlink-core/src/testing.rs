//! In-crate test doubles

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::app_service::AppService;
use crate::call::AppServiceCall;
use crate::envelope::Envelope;
use crate::error::{LinkError, LinkResult};
use crate::futures::{MsgFuture, PageFuture};
use crate::transport::{CallGrant, InboundHandler, ProfileInfoRequest, Transport};
use crate::types::{
    CallId, CallToken, Profile, ProfileInfo, ProfileKey, ProfileQueryInfo, ProfileUpdate,
    SearchQuery,
};

#[derive(Debug, Clone)]
pub(crate) struct SentMsg {
    pub call_id: CallId,
    pub token: CallToken,
    pub payload: Vec<u8>,
    pub enqueue_if_offline: bool,
}

/// Transport that answers every request successfully and immediately.
#[derive(Default)]
pub(crate) struct LoopbackTransport {
    next_id: AtomicU32,
    sent: Mutex<Vec<SentMsg>>,
    closed: Mutex<Vec<CallId>>,
    channel_unavailable: AtomicBool,
    ping_fails: AtomicBool,
    hold_crypto: AtomicBool,
    held: Mutex<Vec<MsgFuture<()>>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_channel_unavailable(&self, value: bool) {
        self.channel_unavailable.store(value, Ordering::SeqCst);
    }

    pub fn set_ping_fails(&self, value: bool) {
        self.ping_fails.store(value, Ordering::SeqCst);
    }

    /// Leave crypto envelopes unacknowledged until `release_held`.
    pub fn set_hold_crypto(&self, value: bool) {
        self.hold_crypto.store(value, Ordering::SeqCst);
    }

    pub fn release_held(&self) {
        let held: Vec<_> = self.held.lock().drain(..).collect();
        for future in held {
            future.fulfill(self.id(), ());
        }
    }

    pub fn sent(&self) -> Vec<SentMsg> {
        self.sent.lock().clone()
    }

    pub fn closed(&self) -> Vec<CallId> {
        self.closed.lock().clone()
    }

    fn id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl Transport for LoopbackTransport {
    fn start(&self, _inbound: Arc<dyn InboundHandler>, future: MsgFuture<()>) -> LinkResult<()> {
        future.fulfill(self.id(), ());
        Ok(())
    }

    fn stop(&self) {}

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
        let mut info = ProfileInfo::from_key(*key);
        info.is_online = true;
        future.fulfill(self.id(), info);
        Ok(())
    }

    fn call_profile_app_service(
        &self,
        _remote: &ProfileKey,
        _service: &str,
        future: MsgFuture<CallGrant>,
    ) -> LinkResult<()> {
        let id = self.id();
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
        enqueue_if_offline: bool,
        future: MsgFuture<()>,
    ) -> LinkResult<()> {
        if self.channel_unavailable.load(Ordering::SeqCst) {
            return Err(LinkError::CallUnavailable);
        }
        let is_crypto = Envelope::decode(&payload).map(|e| e.is_crypto()).unwrap_or(false);
        self.sent.lock().push(SentMsg {
            call_id,
            token: token.clone(),
            payload,
            enqueue_if_offline,
        });
        if is_crypto && self.hold_crypto.load(Ordering::SeqCst) {
            self.held.lock().push(future);
        } else {
            future.fulfill(self.id(), ());
        }
        Ok(())
    }

    fn accept_call(&self, _message_id: u32) -> LinkResult<()> {
        Ok(())
    }

    fn respond_app_service_receive_msg(
        &self,
        _call_id: CallId,
        _token: &CallToken,
        _message_id: u32,
    ) -> LinkResult<()> {
        Ok(())
    }

    fn ping_app_service(&self, _call_id: CallId, _token_hex: &str, future: MsgFuture<()>) -> LinkResult<()> {
        let id = self.id();
        if self.ping_fails.load(Ordering::SeqCst) {
            future.fail(id, 404, "channel not found");
        } else {
            future.fulfill(id, ());
        }
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
        future.fulfill(self.id(), Vec::new());
        Ok(())
    }

    fn search_subsequent_profiles(&self, _query: &SearchQuery, future: PageFuture) -> LinkResult<()> {
        future.on_page(self.id(), Vec::new(), 0, 0);
        Ok(())
    }

    fn search_profile_by_name(
        &self,
        _name: &str,
        future: MsgFuture<Vec<ProfileQueryInfo>>,
    ) -> LinkResult<()> {
        future.fulfill(self.id(), Vec::new());
        Ok(())
    }

    fn update_profile(&self, _update: &ProfileUpdate, future: MsgFuture<()>) -> LinkResult<()> {
        future.fulfill(self.id(), ());
        Ok(())
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn is_connecting(&self) -> bool {
        false
    }

    fn has_failed(&self) -> bool {
        false
    }
}

/// Service that accepts every call and counts callbacks.
pub(crate) struct RecordingService {
    name: &'static str,
    types: Vec<&'static str>,
    accept: AtomicBool,
    removed: AtomicUsize,
    connected: Mutex<Vec<(ProfileKey, ProfileKey, bool)>>,
}

impl RecordingService {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            types: Vec::new(),
            accept: AtomicBool::new(true),
            removed: AtomicUsize::new(0),
            connected: Mutex::new(Vec::new()),
        }
    }

    pub fn with_types(mut self, types: &[&'static str]) -> Self {
        self.types = types.to_vec();
        self
    }

    pub fn set_accept(&self, accept: bool) {
        self.accept.store(accept, Ordering::SeqCst);
    }

    pub fn removed(&self) -> usize {
        self.removed.load(Ordering::SeqCst)
    }

    pub fn connected(&self) -> Vec<(ProfileKey, ProfileKey, bool)> {
        self.connected.lock().clone()
    }
}

impl AppService for RecordingService {
    fn name(&self) -> &str {
        self.name
    }

    fn message_types(&self) -> &[&'static str] {
        &self.types
    }

    fn on_pre_call(&self, _call: &Arc<AppServiceCall>) -> bool {
        self.accept.load(Ordering::SeqCst)
    }

    fn on_call_connected(&self, local: &Profile, remote: &ProfileInfo, is_creator: bool) {
        self.connected.lock().push((local.key, remote.key, is_creator));
    }

    fn remove_call(&self, _call: &AppServiceCall, _reason: &str) {
        self.removed.fetch_add(1, Ordering::SeqCst);
    }
}
