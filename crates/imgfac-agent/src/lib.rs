//! Management-bus agent for the image factory.
//!
//! The agent publishes an image factory on a broker-based management bus and
//! answers remote method calls against it. Factory methods that start builds
//! return build adaptors, which the agent publishes in turn and keeps until
//! the build finishes.
//!
//! # Architecture
//!
//! - `AgentDispatcher`: routes calls to the factory or a registered adaptor
//!   and shapes their results into bus responses
//! - `BusSession`: the bus connection (`BrokerSession` over TCP,
//!   `MemorySession` in process)
//! - `ManagedObject`: per-class method tables and schemas
//! - `BuildLauncher`: starts builds and reports their progress
//!
//! # Example
//!
//! ```no_run
//! use imgfac_agent::{
//!     notice_channel, run_agent, AgentConfig, AgentDispatcher, BrokerSession,
//!     CommandLauncher, ImageFactory,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = AgentConfig::load(None)?;
//! let session = BrokerSession::new(config.target()?, config.connection_options());
//!
//! let (notices_tx, notices_rx) = notice_channel();
//! let launcher = Arc::new(CommandLauncher::new(config.builder.clone()));
//! let factory = ImageFactory::new(launcher, notices_tx);
//!
//! let mut dispatcher = AgentDispatcher::initialize(session, factory).await?;
//! let clean = run_agent(&mut dispatcher, notices_rx, async {
//!     let _ = tokio::signal::ctrl_c().await;
//! })
//! .await;
//! # let _ = clean;
//! # Ok(())
//! # }
//! ```

pub mod build_adaptor;
pub mod config;
pub mod dispatcher;
pub mod factory;
pub mod launcher;
pub mod lifecycle;
pub mod object;
pub mod registry;
pub mod schema;
pub mod session;
pub mod transport;
pub mod types;

// Re-exports for convenient access
pub use build_adaptor::{BuildAdaptor, BuildStatus};
pub use config::{AgentConfig, BuilderConfig};
pub use dispatcher::AgentDispatcher;
pub use factory::{FactoryOutcome, ImageFactory};
pub use launcher::{
    notice_channel, BuildJob, BuildLauncher, BuildNotice, BuildOperation, BuildTicket,
    CommandLauncher, NoticeKind, NoticeReceiver, NoticeSender,
};
pub use lifecycle::run_agent;
pub use object::{ManagedObject, MethodOutcome};
pub use registry::{ManagedObjects, ManagedRef};
pub use schema::Schema;
pub use session::{BrokerSession, BusSession, CallSender, MemorySession, PublishedData, Response};
pub use transport::{ConnectionOptions, ConnectionTarget, RetryPolicy};
pub use types::{AgentError, AgentEvent, Args, DataAddr, DataObject, MethodCall, MethodHandle};
