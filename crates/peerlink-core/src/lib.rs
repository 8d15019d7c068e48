//! Peerlink Core Library
//!
//! Client-side engine for identities hosted on profile servers: sessions,
//! application-service calls between identities, pairing and profile search.
//!
//! ## Overview
//!
//! Every local identity keeps a session with its home profile server. Over
//! that session it can look other identities up, search the server
//! directory, and open *calls*: bidirectional channels to a named
//! application service ("chat", "pairing", ...) of a remote identity,
//! optionally end-to-end encrypted.
//!
//! - [`SessionManager`] maps identities to their [`ProfileConnection`]s and
//!   drives the pairing workflow
//! - [`ProfileConnection`] owns the open-call table, runs call handshakes
//!   and a periodic maintenance task
//! - [`AppServiceCall`] is one channel with its status machine
//! - [`MsgFuture`] correlates asynchronous server responses
//!
//! Socket framing and the server wire protocol live behind the
//! [`Transport`] trait; storage lives behind the traits in [`storage`].
//!
//! ## Quick Start
//!
//! ```ignore
//! use peerlink_core::{LinkConfig, Profile, ServerEndpoint, SessionManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = LinkConfig::default();
//!     let manager = SessionManager::in_memory(my_transport_factory(), config.clone())?;
//!
//!     let endpoint = ServerEndpoint::from_host("ps.example.org", &config);
//!     let me = manager
//!         .connect_profile(Profile::new(my_key, "ana", "person"), endpoint, vec![chat_service()])
//!         .await?;
//!
//!     let call = manager.call_service(&my_key, friend_info, "chat", true).await?;
//!     call.send_message("chat", &"hello").await?;
//!     Ok(())
//! }
//! ```

pub mod app_service;
pub mod call;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod futures;
pub mod logging;
pub mod manager;
pub mod pairing;
pub mod storage;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

// Re-exports
pub use app_service::{AppService, AppServiceRegistry};
pub use call::{AppServiceCall, CallStatus};
pub use config::LinkConfig;
pub use connection::{
    CallRequest, CallRouter, Collaborators, MaintenanceReport, ProfileConnection, RetryReport,
    Routing,
};
pub use crypto::{BoxCipher, CallCipher, CryptoProvider, DerivedKeyProvider, BOX_ALGO};
pub use envelope::{CryptoMsg, Envelope, CRYPTO_MSG_TYPE, INIT_MSG_TYPE};
pub use error::{LinkError, LinkResult, MsgFailure};
pub use self::futures::{MsgFuture, PageFuture};
pub use logging::LoggingBuilder;
pub use manager::{GuestKey, SessionManager};
pub use pairing::{PairingEvent, PairingMsg, PairingService, PAIRING_SERVICE};
pub use storage::{
    MemoryMessageQueue, MemoryPairingStore, MemoryProfileStore, MessageQueue, PairingStore,
    ProfileStore, QueuedMessage,
};
pub use transport::{
    CallGrant, IncomingCall, InboundAppMessage, InboundHandler, ProfileInfoRequest, Transport,
    TransportFactory,
};
pub use types::*;
