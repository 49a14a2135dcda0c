//! Execution engine: dispatch queue, handler registry, per-job execution
//! units and the retry coordinator.

pub mod config;
pub mod coordinator;
pub mod executor;
pub mod handler;
pub mod metrics;
pub mod queue;
pub mod registry;

pub use config::EngineConfig;
pub use coordinator::{Coordinator, ExecutionOutcome, Resolution, CANCELLED_REASON};
pub use executor::Executor;
pub use handler::{handler_fn, AlwaysFail, AlwaysSucceed, DummyHandler, HandlerResult, JobHandler};
pub use metrics::EngineMetrics;
pub use queue::{DispatchQueue, DispatchReceiver, QueueClosed};
pub use registry::{HandlerRegistry, RegistryError};
