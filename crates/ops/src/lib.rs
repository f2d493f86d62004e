//! Periodic Operation engine (§4.I): layered on the scheduler (G) and the
//! executor (H), with a VM-fan-out helper used by the guest-agent poller.

mod operation;
mod vm_dispatcher;

pub use operation::Operation;
pub use vm_dispatcher::{VmDispatcher, VmTask};
