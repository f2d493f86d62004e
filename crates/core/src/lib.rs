//! Shared types, error taxonomy, and shutdown coordination used by every
//! crate in the virtualization management agent.

pub mod error;
pub mod shutdown;
pub mod vm;

pub use error::{AgentError, AgentResult};
pub use shutdown::{
    Shutdown, ShutdownCoordinator, ShutdownError, ShutdownEvent, ShutdownStage, SignalHandler,
};
pub use vm::{unix_millis, ChannelState, ManagedVm, VmStatus};
