use thiserror::Error;

use erpbridge_connectors::RegistryError;
use erpbridge_core::{ConflictId, ConnectionId, ConnectorError};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResolveError {
    #[error("conflict {0} is not pending")]
    NotPending(ConflictId),

    #[error("conflict {conflict_id} has no source from connection {connection_id}")]
    UnknownSource {
        conflict_id: ConflictId,
        connection_id: ConnectionId,
    },

    #[error("cannot merge conflict {conflict_id}: data from {connection_id} is not an object")]
    NotMergeable {
        conflict_id: ConflictId,
        connection_id: ConnectionId,
    },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SyncError {
    #[error("Sync already in progress")]
    AlreadyInProgress,

    #[error("connection not found: {0}")]
    UnknownConnection(ConnectionId),

    #[error("connection {0} is inactive; call remove_erp before adding it again")]
    ConnectionInactive(ConnectionId),

    #[error("connection {0} is disabled")]
    ConnectionDisabled(ConnectionId),

    #[error("connection test failed for {connection_id}: {source}")]
    ConnectionTest {
        connection_id: ConnectionId,
        #[source]
        source: ConnectorError,
    },

    #[error("conflict not found: {0}")]
    ConflictNotFound(ConflictId),

    #[error("invalid sync strategy for {connection_id}: {reason}")]
    InvalidStrategy {
        connection_id: ConnectionId,
        reason: String,
    },

    #[error("orchestrator has been shut down")]
    ShutDown,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),
}
