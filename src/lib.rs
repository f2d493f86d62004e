//! Virtualization management agent: RPC plane, execution plane, and
//! guest-agent poller, re-exported as one library for callers that want
//! the whole stack without depending on each `vda-*` crate individually.
//! The composition root (`node`) is the only consumer that assembles these
//! into a running agent; this crate just re-exports the pieces it wires.

pub use vda_bus as bus;
pub use vda_config as config;
pub use vda_core as core;
pub use vda_executor as executor;
pub use vda_guest_agent as guest_agent;
pub use vda_http_image as http_image;
pub use vda_ops as ops;
pub use vda_protocol as protocol;
pub use vda_recovery as recovery;
pub use vda_rpc as rpc;
pub use vda_scheduler as scheduler;
pub use vda_virt as virt;

pub use vda_config::AgentConfig;
pub use vda_core::error::{AgentError, AgentResult};
pub use vda_core::vm::{ChannelState, ManagedVm, VmStatus};
