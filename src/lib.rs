//! Draft pipeline
//!
//! Asynchronous LinkedIn draft generation over a message queue.
//!
//! # Overview
//!
//! - [`transport`]: broker connection behind the [`Transport`] trait, with an
//!   MQTT v5 implementation
//! - [`messaging`]: [`Publisher`] and [`Consumer`] with ack/nack and dead-lettering
//! - [`worker`]: [`DraftWorker`], the job state machine and bounded retry loop
//! - [`usecase`] and [`llm`]: draft generation through an OpenAI-compatible API
//! - [`jobs`]: job records and repository interfaces
//!
//! # Quick Start
//!
//! ```rust
//! use draft_pipeline::messaging::{Consumer, Publisher};
//! use draft_pipeline::protocol::DraftJobMessage;
//! use draft_pipeline::testing::{MockTransport, MockUseCase};
//! use draft_pipeline::transport::Transport;
//! use draft_pipeline::worker::DraftWorker;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = Arc::new(MockTransport::new());
//! transport.connect(Duration::from_secs(1)).await?;
//!
//! let consumer = Arc::new(Consumer::new(transport.clone(), "jobs/draft-generation", 3)?);
//! let worker = Arc::new(
//!     DraftWorker::builder()
//!         .use_case(Arc::new(MockUseCase::succeeding(&["Hello LinkedIn"])))
//!         .consumer(consumer)
//!         .build()?,
//! );
//! worker.start().await?;
//!
//! let publisher = Publisher::new(transport.clone(), "jobs/draft-generation")?;
//! publisher.publish(&DraftJobMessage::new("job-1", "user-1", "idea-1")).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod jobs;
pub mod llm;
pub mod messaging;
pub mod observability;
pub mod protocol;
pub mod testing;
pub mod transport;
pub mod usecase;
pub mod worker;

pub use config::{ConfigError, WorkerConfig};
pub use error::{WorkerError, WorkerResult};
pub use messaging::{Consumer, Publisher};
pub use transport::Transport;
pub use worker::DraftWorker;
