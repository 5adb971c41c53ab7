//! Transport seams consumed by the resilience layer.
//!
//! Wire encoding and channel management live behind these traits. The
//! transport reports failures as [`Status`] values; everything above it works
//! in terms of [`RpcError`].

use async_trait::async_trait;
use spanrpc_core::{Operation, OperationPage, Status};

use crate::context::InvocationContext;
use crate::error::RpcError;

/// Issues the mutating call that starts a long-running operation.
#[async_trait]
pub trait OperationStarter<Req>: Send + Sync {
    async fn start(&self, request: &Req, ctx: InvocationContext) -> Result<Operation, Status>;
}

/// Generic operations endpoint used to resume and poll operations by name.
#[async_trait]
pub trait OperationsClient: Send + Sync {
    async fn get_operation(&self, name: &str, ctx: InvocationContext) -> Result<Operation, Status>;
}

/// Paginated listing of recent operations matching a fixed filter.
#[async_trait]
pub trait OperationLister: Send + Sync {
    /// Fetches one page; `None` requests the first page.
    async fn list_operations(&self, page_token: Option<&str>) -> Result<OperationPage, RpcError>;
}

/// Flow-controlled server stream as seen by its consumer.
pub trait StreamingCall: Send + Sync {
    /// Asks the server for `n` more messages.
    fn request(&self, n: usize);

    /// Aborts the call; the consumer observes a `CANCELLED` status.
    fn cancel(&self, message: &str);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateDatabaseRequest {
    /// `projects/{p}/instances/{i}`
    pub parent: String,
    pub create_statement: String,
    pub extra_statements: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateBackupRequest {
    pub parent: String,
    pub backup_id: String,
    /// Full name of the source database.
    pub database: String,
    pub expire_time: Option<spanrpc_core::Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreDatabaseRequest {
    pub parent: String,
    pub database_id: String,
    /// Full name of the source backup.
    pub backup: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateDatabaseDdlRequest {
    pub database: String,
    pub statements: Vec<String>,
    /// Caller-chosen id; a retry with the same id collides with `ALREADY_EXISTS`.
    pub operation_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOperationsRequest {
    /// `projects/{p}/instances/{i}`
    pub parent: String,
    pub filter: String,
    /// Zero lets the server choose.
    pub page_size: i32,
    pub page_token: Option<String>,
}

/// Database administration endpoint.
#[async_trait]
pub trait DatabaseAdminTransport: OperationsClient + 'static {
    async fn create_database(
        &self,
        request: &CreateDatabaseRequest,
        ctx: InvocationContext,
    ) -> Result<Operation, Status>;

    async fn create_backup(
        &self,
        request: &CreateBackupRequest,
        ctx: InvocationContext,
    ) -> Result<Operation, Status>;

    async fn restore_database(
        &self,
        request: &RestoreDatabaseRequest,
        ctx: InvocationContext,
    ) -> Result<Operation, Status>;

    async fn update_database_ddl(
        &self,
        request: &UpdateDatabaseDdlRequest,
        ctx: InvocationContext,
    ) -> Result<Operation, Status>;

    async fn list_database_operations(
        &self,
        request: &ListOperationsRequest,
        ctx: InvocationContext,
    ) -> Result<OperationPage, Status>;

    async fn list_backup_operations(
        &self,
        request: &ListOperationsRequest,
        ctx: InvocationContext,
    ) -> Result<OperationPage, Status>;
}

#[async_trait]
impl<T: DatabaseAdminTransport> OperationStarter<CreateDatabaseRequest> for T {
    async fn start(
        &self,
        request: &CreateDatabaseRequest,
        ctx: InvocationContext,
    ) -> Result<Operation, Status> {
        self.create_database(request, ctx).await
    }
}

#[async_trait]
impl<T: DatabaseAdminTransport> OperationStarter<CreateBackupRequest> for T {
    async fn start(
        &self,
        request: &CreateBackupRequest,
        ctx: InvocationContext,
    ) -> Result<Operation, Status> {
        self.create_backup(request, ctx).await
    }
}

#[async_trait]
impl<T: DatabaseAdminTransport> OperationStarter<RestoreDatabaseRequest> for T {
    async fn start(
        &self,
        request: &RestoreDatabaseRequest,
        ctx: InvocationContext,
    ) -> Result<Operation, Status> {
        self.restore_database(request, ctx).await
    }
}
