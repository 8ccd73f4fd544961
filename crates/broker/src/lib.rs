//! Topic-ownership request/reply messaging.
//!
//! Every topic is owned by at most one [`Receiver`] at a time through a renewable lease in a
//! [`CoordinationAdapter`](wire_coordination::CoordinationAdapter). A [`Sender`] finds (or
//! claims) the owner, publishes a request on the owner's subject of a
//! [`Transport`](wire_transport::Transport) and waits for the reply, honouring timeout
//! extensions and retrying with the same message id. [`ConduitReceiver`] adds per-topic setup,
//! teardown and a voluntary TTL on top of a receiver.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod cache;
mod conduit;
mod config;
mod deadline;
mod error;
mod handler;
mod message;
mod ownership;
mod receiver;
mod retry;
mod sender;
pub mod subject;
mod teardown;

pub use cache::MessageCache;
pub use conduit::{ConduitReceiver, TopicContext, TopicSetup};
pub use config::{ConduitConfig, ReceiverConfig, SenderConfig};
pub use deadline::{DeadlineMonitor, DueExtension};
pub use error::{BoxError, Error};
pub use handler::{HandlerError, MessageHandler};
pub use message::{Reply, RequestEnvelope, Response, TimeoutExtension, TopicResponseBroadcast};
pub use ownership::OwnershipManager;
pub use receiver::{Receiver, ReceiverState};
pub use retry::{RetryManager, RetryPolicy};
pub use sender::Sender;
pub use teardown::TeardownQueue;
