use thiserror::Error;

use erpbridge_core::{ConnectionId, ConnectorError, ErpType};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RegistryError {
    #[error("a connector factory is already registered for ERP type: {0}")]
    AlreadyRegistered(ErpType),

    #[error("No connector registered for ERP type: {0}")]
    NotRegistered(ErpType),

    #[error("connection already active: {0}")]
    AlreadyActive(ConnectionId),

    #[error("connection not found: {0}")]
    NotFound(ConnectionId),

    #[error(transparent)]
    Connector(#[from] ConnectorError),
}
