//! Coffer server: control channel, scheduler, dispatcher, agent registry,
//! and event bus.
//!
//! The pieces cooperate around one state machine: the scheduler creates
//! jobs, the dispatcher pushes them through the registry to connected
//! agents, the control channel carries execution reports back, and the
//! store linearizes every state change. The control channel reaches the
//! scheduler only through the narrow [`control::PendingDispatcher`] seam;
//! concrete wiring happens in the binary.

pub mod control;
pub mod dispatch;
pub mod events;
pub mod registry;
pub mod scheduler;
pub mod sweeper;

pub use control::{ControlConfig, ControlServer, PendingDispatcher};
pub use dispatch::{build_backup_payload, DispatchError, Dispatcher};
pub use events::{Event, EventBus};
pub use registry::{Registry, RegistryError};
pub use scheduler::Scheduler;
