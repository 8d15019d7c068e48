//! Profile server transport interface
//!
//! The transport owns the session to one profile server for one local
//! identity: socket framing, TLS and RPC encoding live behind this trait.
//! Every request method returns immediately. A synchronous `Err` means the
//! request never left (not connected, channel gone); otherwise the outcome is
//! delivered later through the correlator, possibly on another thread.
//!
//! Server-initiated traffic (incoming calls, application messages) is pushed
//! into the [`InboundHandler`] given to [`Transport::start`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::LinkResult;
use crate::futures::{MsgFuture, PageFuture};
use crate::types::{
    CallId, CallToken, Profile, ProfileInfo, ProfileKey, ProfileQueryInfo, ProfileUpdate,
    SearchQuery, ServerEndpoint,
};

/// What to include in a profile information response
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileInfoRequest {
    pub include_image: bool,
    pub include_thumbnail: bool,
    pub include_app_services: bool,
}

impl ProfileInfoRequest {
    /// Only the application-service list (what the call handshake needs).
    pub fn app_services() -> Self {
        Self {
            include_app_services: true,
            ..Default::default()
        }
    }

    /// Image and application services.
    pub fn full() -> Self {
        Self {
            include_image: true,
            include_thumbnail: false,
            include_app_services: true,
        }
    }
}

/// Server answer to a call request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallGrant {
    /// Token identifying the caller's side of the channel
    pub caller_token: CallToken,
}

/// Server notification that a remote identity is calling us
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingCall {
    pub caller_key: ProfileKey,
    pub service_name: String,
    /// Token identifying our side of the channel
    pub callee_token: CallToken,
}

/// Application message delivered by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundAppMessage {
    pub call_token: CallToken,
    /// Encoded [`Envelope`](crate::envelope::Envelope)
    pub payload: Vec<u8>,
}

/// Receives server-initiated traffic
pub trait InboundHandler: Send + Sync {
    /// An identity wants to open a call; `message_id` is what
    /// [`Transport::accept_call`] answers.
    fn incoming_call(&self, message_id: u32, call: IncomingCall);

    /// An application message arrived on some call channel.
    fn incoming_message(&self, message_id: u32, message: InboundAppMessage);
}

/// Asynchronous request primitives against one profile server
pub trait Transport: Send + Sync {
    /// Open the session and register the identity; completes when usable.
    fn start(&self, inbound: Arc<dyn InboundHandler>, future: MsgFuture<()>) -> LinkResult<()>;

    fn stop(&self);

    /// Announce an application service the local identity answers calls for.
    fn add_app_service(&self, name: &str, future: MsgFuture<()>) -> LinkResult<()>;

    fn get_profile_information(
        &self,
        key: &ProfileKey,
        request: ProfileInfoRequest,
        future: MsgFuture<ProfileInfo>,
    ) -> LinkResult<()>;

    fn call_profile_app_service(
        &self,
        remote: &ProfileKey,
        service: &str,
        future: MsgFuture<CallGrant>,
    ) -> LinkResult<()>;

    /// Send a payload over a call channel.
    ///
    /// Fails with [`LinkError::CallUnavailable`](crate::error::LinkError::CallUnavailable)
    /// when the server no longer knows the channel.
    fn send_app_service_msg(
        &self,
        call_id: CallId,
        token: &CallToken,
        payload: Vec<u8>,
        enqueue_if_offline: bool,
        future: MsgFuture<()>,
    ) -> LinkResult<()>;

    /// Accept the incoming call notified under `message_id`.
    fn accept_call(&self, message_id: u32) -> LinkResult<()>;

    /// Acknowledge an inbound application message.
    fn respond_app_service_receive_msg(
        &self,
        call_id: CallId,
        token: &CallToken,
        message_id: u32,
    ) -> LinkResult<()>;

    fn ping_app_service(
        &self,
        call_id: CallId,
        token_hex: &str,
        future: MsgFuture<()>,
    ) -> LinkResult<()>;

    /// Release the channel of a call.
    fn close_channel(&self, call_id: CallId) -> LinkResult<()>;

    fn search_profiles(
        &self,
        query: &SearchQuery,
        future: MsgFuture<Vec<ProfileQueryInfo>>,
    ) -> LinkResult<()>;

    /// Request the records after the query's cursor; each page goes to `future`.
    fn search_subsequent_profiles(&self, query: &SearchQuery, future: PageFuture)
        -> LinkResult<()>;

    fn search_profile_by_name(
        &self,
        name: &str,
        future: MsgFuture<Vec<ProfileQueryInfo>>,
    ) -> LinkResult<()>;

    fn update_profile(&self, update: &ProfileUpdate, future: MsgFuture<()>) -> LinkResult<()>;

    fn is_ready(&self) -> bool;

    fn is_connecting(&self) -> bool;

    fn has_failed(&self) -> bool;
}

/// Builds transports for (server, identity) pairs
pub trait TransportFactory: Send + Sync {
    fn create(&self, endpoint: &ServerEndpoint, profile: &Profile) -> LinkResult<Arc<dyn Transport>>;
}
