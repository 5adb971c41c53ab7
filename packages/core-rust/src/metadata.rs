//! Typed metadata and response messages carried by administrative operations.

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::types::TypedMessage;

/// Progress of a long-running administrative operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationProgress {
    pub progress_percent: i32,
    pub start_time: Option<Timestamp>,
    pub end_time: Option<Timestamp>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Database {
    pub name: String,
    /// Zero when the server did not report it.
    pub create_time: Timestamp,
}

impl TypedMessage for Database {
    const TYPE_URL: &'static str = "type.spanrpc.dev/admin.Database";
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backup {
    pub name: String,
    pub database: String,
    pub expire_time: Option<Timestamp>,
}

impl TypedMessage for Backup {
    const TYPE_URL: &'static str = "type.spanrpc.dev/admin.Backup";
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateDatabaseMetadata {
    pub database: String,
}

impl TypedMessage for CreateDatabaseMetadata {
    const TYPE_URL: &'static str = "type.spanrpc.dev/admin.CreateDatabaseMetadata";
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateBackupMetadata {
    pub name: String,
    pub database: String,
    pub progress: OperationProgress,
}

impl TypedMessage for CreateBackupMetadata {
    const TYPE_URL: &'static str = "type.spanrpc.dev/admin.CreateBackupMetadata";
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreDatabaseMetadata {
    pub name: String,
    pub backup: String,
    pub progress: OperationProgress,
}

impl TypedMessage for RestoreDatabaseMetadata {
    const TYPE_URL: &'static str = "type.spanrpc.dev/admin.RestoreDatabaseMetadata";
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateDatabaseDdlMetadata {
    pub database: String,
    pub statements: Vec<String>,
    pub commit_timestamps: Vec<Timestamp>,
}

impl TypedMessage for UpdateDatabaseDdlMetadata {
    const TYPE_URL: &'static str = "type.spanrpc.dev/admin.UpdateDatabaseDdlMetadata";
}

/// Empty response of operations that produce no value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

impl TypedMessage for Empty {
    const TYPE_URL: &'static str = "type.spanrpc.dev/Empty";
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Payload;

    #[test]
    fn backup_metadata_carries_start_time() {
        let meta = CreateBackupMetadata {
            name: "projects/p/instances/i/backups/b".to_string(),
            database: "projects/p/instances/i/databases/d".to_string(),
            progress: OperationProgress {
                progress_percent: 40,
                start_time: Some(Timestamp::new(1_700_000_000, 0)),
                end_time: None,
            },
        };
        let payload = Payload::pack(&meta).unwrap();
        let decoded: CreateBackupMetadata = payload.unpack().unwrap();
        assert_eq!(decoded.progress.start_time, Some(Timestamp::new(1_700_000_000, 0)));
        assert!(payload.unpack::<RestoreDatabaseMetadata>().is_err());
    }
}
