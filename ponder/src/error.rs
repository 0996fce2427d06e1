// Copyright (c) Ponder, Inc.
// SPDX-License-Identifier: Apache-2.0

use ponder_db::DbError;

/// Engine-wide error taxonomy.
///
/// The request queue absorbs `TransientRpc` until its retry budget is
/// exhausted; the sync layer absorbs `ReorgDetected`; everything else is
/// surfaced to the engine, which decides between a reload and a fatal exit
/// (see [`crate::engine`]).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PonderError {
    // Retryable RPC failure (5xx, 429, timeout, limit exceeded)
    #[error("transient rpc error: {0}")]
    TransientRpc(String),
    // Non-retryable RPC failure (invalid params, reverted call)
    #[error("permanent rpc error: {0}")]
    PermanentRpc(String),
    // Node returned data that violates chain invariants
    #[error("invalid chain response: {0}")]
    InvalidChainResponse(String),
    #[error("block {block} not found on chain {chain_id}")]
    BlockNotFound { chain_id: u64, block: String },
    #[error("receipt for transaction {hash} not found on chain {chain_id}")]
    TransactionReceiptNotFound { chain_id: u64, hash: String },
    // Recovered internally by prune + replay
    #[error("reorg detected on chain {chain_id}, common ancestor {ancestor}")]
    ReorgDetected { chain_id: u64, ancestor: u64 },
    // Invalid schema, or a write that violates it
    #[error("schema violation: {0}")]
    SchemaViolation(String),
    #[error("row not found: {table}.{id}")]
    NotFound { table: String, id: String },
    #[error("unique constraint violated: {table}.{id}")]
    UniqueViolation { table: String, id: String },
    #[error("namespace '{namespace}' is locked by another instance ({ms_until_expiry}ms until lease expiry)")]
    NamespaceLocked {
        namespace: String,
        ms_until_expiry: i64,
    },
    #[error("build id conflict: {0}")]
    BuildIdConflict(String),
    // Malformed config surfaced during the initial build
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    // Any error thrown by a user handler
    #[error("handler '{handler}' failed: {message}")]
    UserHandler { handler: String, message: String },
    #[error("database error: {0}")]
    Database(String),
    #[error("shutdown requested")]
    Killed,
}

impl PonderError {
    /// Short stable identifier for metrics labels.
    pub fn error_type(&self) -> &'static str {
        match self {
            PonderError::TransientRpc(_) => "transient_rpc",
            PonderError::PermanentRpc(_) => "permanent_rpc",
            PonderError::InvalidChainResponse(_) => "invalid_chain_response",
            PonderError::BlockNotFound { .. } => "block_not_found",
            PonderError::TransactionReceiptNotFound { .. } => "receipt_not_found",
            PonderError::ReorgDetected { .. } => "reorg_detected",
            PonderError::SchemaViolation(_) => "schema_violation",
            PonderError::NotFound { .. } => "not_found",
            PonderError::UniqueViolation { .. } => "unique_violation",
            PonderError::NamespaceLocked { .. } => "namespace_locked",
            PonderError::BuildIdConflict(_) => "build_id_conflict",
            PonderError::InvalidConfig(_) => "invalid_config",
            PonderError::UserHandler { .. } => "user_handler",
            PonderError::Database(_) => "database",
            PonderError::Killed => "killed",
        }
    }

    /// Errors that always terminate the process, regardless of phase.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PonderError::SchemaViolation(_)
                | PonderError::NamespaceLocked { .. }
                | PonderError::BuildIdConflict(_)
                | PonderError::InvalidConfig(_)
                | PonderError::Database(_)
        )
    }
}

impl From<DbError> for PonderError {
    fn from(e: DbError) -> Self {
        PonderError::Database(e.to_string())
    }
}

pub type PonderResult<T> = Result<T, PonderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_type_valid_prometheus_labels() {
        let errors = vec![
            PonderError::TransientRpc("x".to_string()),
            PonderError::PermanentRpc("x".to_string()),
            PonderError::InvalidChainResponse("x".to_string()),
            PonderError::BlockNotFound {
                chain_id: 1,
                block: "0x1".to_string(),
            },
            PonderError::ReorgDetected {
                chain_id: 1,
                ancestor: 7,
            },
            PonderError::SchemaViolation("x".to_string()),
            PonderError::NamespaceLocked {
                namespace: "public".to_string(),
                ms_until_expiry: 100,
            },
            PonderError::UserHandler {
                handler: "Pet:Created".to_string(),
                message: "boom".to_string(),
            },
            PonderError::Database("x".to_string()),
            PonderError::Killed,
        ];
        for error in errors {
            let label = error.error_type();
            assert!(!label.is_empty());
            assert!(label.chars().all(|c| c.is_ascii_lowercase() || c == '_'));
            assert!(!label.starts_with('_') && !label.ends_with('_'));
        }
    }

    #[test]
    fn test_fatal_classification() {
        assert!(PonderError::SchemaViolation("bad".to_string()).is_fatal());
        assert!(PonderError::Database("down".to_string()).is_fatal());
        assert!(!PonderError::TransientRpc("429".to_string()).is_fatal());
        assert!(!PonderError::UserHandler {
            handler: "h".to_string(),
            message: "m".to_string()
        }
        .is_fatal());
    }
}
