//! `erpbridge-events`: typed notifications published by the orchestrator.
//!
//! Consumers (dashboards, schedulers, tests) subscribe to a bus instead of polling.

pub mod bus;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use event::{BridgeEvent, ConnectionSyncResult, Event, SyncScope};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
