//! Built-in [`ModelProvider`](rotor_kernel::ModelProvider) implementations.

pub mod hardware;
pub mod in_process;
pub mod local_daemon;

#[cfg(feature = "mock")]
pub mod mock;

pub use hardware::{ComputeBackend, HardwareInfo};
pub use in_process::{InProcessModel, InProcessProvider};
pub use local_daemon::LocalDaemonProvider;

#[cfg(feature = "mock")]
pub use mock::MockProvider;
