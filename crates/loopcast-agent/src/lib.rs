pub mod config;
pub mod encoder;
pub mod error;
pub mod logs;
pub mod reconciler;
pub mod registry;
pub mod shutdown;

pub use config::AgentConfig;
pub use encoder::{ProcessController, TerminateOutcome};
pub use error::SessionError;
pub use reconciler::Reconciler;
pub use registry::{SessionRegistry, StartRequest};
pub use shutdown::{ShutdownReport, ShutdownSupervisor};
