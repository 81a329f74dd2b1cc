// Process module - Instance supervision, restart policy and memory watchdog

pub mod events;
pub mod handle;
pub mod instance;
pub mod monitor;
pub mod restart;
pub mod supervisor;
pub mod types;

pub use events::{EventBus, EventStream};
pub use handle::ProcessHandle;
pub use instance::InstanceSupervisor;
pub use monitor::{MemoryBreach, MemoryProbe, MemoryWatchdog, SystemProbe};
pub use restart::{ExitCause, RestartAction, RestartDecision, RestartPolicy};
pub use supervisor::AppSupervisor;
pub use types::{EventKind, ExitInfo, InstanceState, InstanceStatus, LifecycleEvent};
