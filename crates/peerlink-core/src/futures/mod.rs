//! Result correlators
//!
//! Every request handed to a [`Transport`](crate::transport::Transport)
//! carries a correlator that the transport completes later, possibly from
//! another thread. [`MsgFuture`] carries a single outcome; [`PageFuture`]
//! carries the pages of a paginated search.

mod msg_future;
mod page_future;

pub use msg_future::MsgFuture;
pub use page_future::PageFuture;
