//! Publisher and consumer on top of a [`Transport`](crate::transport::Transport)

pub mod consumer;
pub mod publisher;

pub use consumer::{classify, Consumer, ConsumerError, Disposition, HandlerError, MessageHandler};
pub use publisher::{BatchSummary, PublishError, Publisher};
