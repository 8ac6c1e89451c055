//! `erpbridge-connectors`: the connector contract, the registry that owns live
//! connector instances, and an in-memory reference adapter.

pub mod connector;
pub mod error;
pub mod memory;
pub mod registry;

pub use connector::{Connector, ConnectorEventHub, ConnectorFactory, DEFAULT_EVENT_CAPACITY};
pub use error::RegistryError;
pub use memory::InMemoryConnector;
pub use registry::ConnectorRegistry;
