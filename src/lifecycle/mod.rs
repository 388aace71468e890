//! Managed database instances: state machine, allocation, runtime and health.

pub mod allocator;
pub mod health;
pub mod manager;
pub mod probe;
pub mod runtime;
pub mod state;

pub use allocator::ResourceAllocator;
pub use health::spawn_monitor;
pub use manager::{HealthReport, LifecycleManager};
pub use probe::{ReadinessProbe, SqlProbe};
pub use runtime::{ContainerRuntime, ContainerSpec, DockerCli, RuntimeError};
pub use state::{LifecycleCommand, LifecycleState};
