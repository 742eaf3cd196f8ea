//! Registry core: identifier allocation, entity registries, capacity
//! accounting, lifecycle state, and heartbeat monitoring.

pub mod heartbeat;
pub mod id_allocator;
pub mod registry;
pub mod slots;
pub mod state;

pub use heartbeat::HeartbeatMonitor;
pub use id_allocator::IdAllocator;
pub use registry::{ProxyRegistry, ServerRegistry};
pub use slots::{CapacityChange, SlotManager};
pub use state::RegistrationStateMachine;
