//! Database administration client.
//!
//! Every administrative call is throttled per project. Creating a database,
//! creating a backup and restoring a database are resumable: a retry first
//! looks for the operation an earlier attempt may have started and resumes it
//! instead of issuing the request again.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use spanrpc_core::metadata::{
    CreateBackupMetadata, CreateDatabaseMetadata, Database, RestoreDatabaseMetadata,
};
use spanrpc_core::{
    resource, ClockSource, Code, Operation, OperationPage, Status, SystemClock, Timestamp,
    TypedMessage,
};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use crate::config::RpcConfig;
use crate::context::{CallContextBuilder, CallCredentialsProvider, InvocationContext};
use crate::error::RpcError;
use crate::lifecycle::ResourceLifecycleManager;
use crate::lro::{OperationCoordinator, OperationHandle, ResumableCall};
use crate::middleware::{build_admin_pipeline, AdminCall};
use crate::ratelimit::{AdministrativeRateLimiter, RateLimiterRegistry};
use crate::retry::RetrySettings;
use crate::transport::{
    CreateBackupRequest, CreateDatabaseRequest, DatabaseAdminTransport, ListOperationsRequest,
    OperationLister, OperationsClient, RestoreDatabaseRequest, UpdateDatabaseDdlRequest,
};

// ---------------------------------------------------------------------------
// Operation filters and start times
// ---------------------------------------------------------------------------

/// Filter matching create-database operations for `{instance}/databases/{id}`.
#[must_use]
pub fn create_database_filter(instance: &str, database_id: &str) -> String {
    format!(
        "(metadata.@type:{}) AND (name:{}/operations/)",
        CreateDatabaseMetadata::TYPE_URL,
        resource::database_name(instance, database_id)
    )
}

/// Filter matching create-backup operations for `{instance}/backups/{id}`.
#[must_use]
pub fn create_backup_filter(instance: &str, backup_id: &str) -> String {
    format!(
        "(metadata.@type:{}) AND (metadata.name:{})",
        CreateBackupMetadata::TYPE_URL,
        resource::backup_name(instance, backup_id)
    )
}

/// Filter matching restore operations targeting `{instance}/databases/{id}`.
#[must_use]
pub fn restore_database_filter(instance: &str, database_id: &str) -> String {
    format!(
        "(metadata.@type:{}) AND (metadata.name:{})",
        RestoreDatabaseMetadata::TYPE_URL,
        resource::database_name(instance, database_id)
    )
}

/// Create-database operations only report a start time once done, through
/// the created database's `create_time`.
#[must_use]
pub fn create_database_start_time(op: &Operation) -> Option<Timestamp> {
    if !op.done {
        return None;
    }
    op.response_as::<Database>()?.create_time.non_default()
}

#[must_use]
pub fn create_backup_start_time(op: &Operation) -> Option<Timestamp> {
    op.metadata_as::<CreateBackupMetadata>()?
        .progress
        .start_time
        .and_then(Timestamp::non_default)
}

#[must_use]
pub fn restore_database_start_time(op: &Operation) -> Option<Timestamp> {
    op.metadata_as::<RestoreDatabaseMetadata>()?
        .progress
        .start_time
        .and_then(Timestamp::non_default)
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OperationKind {
    Database,
    Backup,
}

/// Scans one filtered operation listing through the throttled pipeline.
struct AdminOperationLister<'a, T> {
    client: &'a AdminClient<T>,
    kind: OperationKind,
    parent: &'a str,
    filter: String,
}

#[async_trait]
impl<T: DatabaseAdminTransport> OperationLister for AdminOperationLister<'_, T> {
    async fn list_operations(&self, page_token: Option<&str>) -> Result<OperationPage, RpcError> {
        let request = ListOperationsRequest {
            parent: self.parent.to_string(),
            filter: self.filter.clone(),
            page_size: 0,
            page_token: page_token.map(str::to_string),
        };
        self.client.list_operations(self.kind, request).await
    }
}

// ---------------------------------------------------------------------------
// AdminClient
// ---------------------------------------------------------------------------

/// Administrative client over a [`DatabaseAdminTransport`].
///
/// After [`shutdown`](Self::shutdown) every method fails with
/// [`RpcError::Closed`].
pub struct AdminClient<T> {
    transport: Arc<T>,
    limiter: AdministrativeRateLimiter,
    contexts: Arc<CallContextBuilder>,
    clock: Arc<dyn ClockSource>,
    coordinator: OperationCoordinator,
    lifecycle: Arc<ResourceLifecycleManager>,
    retry: RetrySettings,
    project_name: String,
}

impl<T: DatabaseAdminTransport> AdminClient<T> {
    /// Creates a client that owns its own executor pools and watchdog.
    ///
    /// `registry` must be shared by every client of the process for the
    /// throttle to hold process-wide.
    ///
    /// # Errors
    ///
    /// Fails if the lifecycle manager cannot start its watchdog.
    pub fn new(
        config: &RpcConfig,
        registry: Arc<RateLimiterRegistry>,
        transport: Arc<T>,
    ) -> Result<Self, RpcError> {
        let lifecycle = Arc::new(ResourceLifecycleManager::new(config)?);
        Ok(Self::with_lifecycle(config, registry, transport, lifecycle))
    }

    /// Creates a client sharing an existing lifecycle manager.
    #[must_use]
    pub fn with_lifecycle(
        config: &RpcConfig,
        registry: Arc<RateLimiterRegistry>,
        transport: Arc<T>,
        lifecycle: Arc<ResourceLifecycleManager>,
    ) -> Self {
        let limiter = AdministrativeRateLimiter::new(registry, config.throttle.enabled);
        let contexts = Arc::new(CallContextBuilder::new(config));
        let clock: Arc<dyn ClockSource> = Arc::new(SystemClock);
        let coordinator = OperationCoordinator::new(limiter.clone(), Arc::clone(&contexts))
            .with_clock(Arc::clone(&clock));
        Self {
            project_name: contexts.project_name().to_string(),
            transport,
            limiter,
            contexts,
            clock,
            coordinator,
            lifecycle,
            retry: RetrySettings::default(),
        }
    }

    #[must_use]
    pub fn with_retry_settings(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = clock;
        self.rebuild_coordinator()
    }

    #[must_use]
    pub fn with_credentials_provider(mut self, provider: Arc<dyn CallCredentialsProvider>) -> Self {
        let contexts = (*self.contexts).clone().with_credentials_provider(provider);
        self.contexts = Arc::new(contexts);
        self.rebuild_coordinator()
    }

    fn rebuild_coordinator(mut self) -> Self {
        self.coordinator =
            OperationCoordinator::new(self.limiter.clone(), Arc::clone(&self.contexts))
                .with_clock(Arc::clone(&self.clock));
        self
    }

    /// `projects/{id}`; also the throttle key of every call.
    #[must_use]
    pub fn project_name(&self) -> &str {
        &self.project_name
    }

    #[must_use]
    pub fn lifecycle(&self) -> &Arc<ResourceLifecycleManager> {
        &self.lifecycle
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lifecycle.is_closed()
    }

    /// Blocks until the client's pools and watchdog have shut down.
    ///
    /// # Errors
    ///
    /// See [`ResourceLifecycleManager::shutdown`].
    pub fn shutdown(&self) -> Result<(), RpcError> {
        self.lifecycle.shutdown()
    }

    /// # Errors
    ///
    /// See [`ResourceLifecycleManager::shutdown_async`].
    pub async fn shutdown_async(&self) -> Result<(), RpcError> {
        self.lifecycle.shutdown_async().await
    }

    fn operations(&self) -> Arc<dyn OperationsClient> {
        Arc::clone(&self.transport) as Arc<dyn OperationsClient>
    }

    fn lister<'a>(
        &'a self,
        kind: OperationKind,
        parent: &'a str,
        filter: String,
    ) -> AdminOperationLister<'a, T> {
        AdminOperationLister {
            client: self,
            kind,
            parent,
            filter,
        }
    }

    /// Sends one throttled, deadline-bounded call through the admin pipeline.
    async fn unary<R, Resp, F, Fut>(
        &self,
        method: &'static str,
        resource: &str,
        request: R,
        send: F,
    ) -> Result<Resp, RpcError>
    where
        R: Send + 'static,
        Resp: Send + 'static,
        F: Fn(Arc<T>, R, InvocationContext) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    {
        self.lifecycle.ensure_open()?;
        let transport = Arc::clone(&self.transport);
        let inner = tower::service_fn(move |call: AdminCall<R>| {
            let transport = Arc::clone(&transport);
            let send = send.clone();
            async move {
                send(transport, call.request, call.context)
                    .await
                    .map_err(RpcError::from)
            }
        });
        let call = AdminCall {
            method,
            destination: self.project_name.clone(),
            context: self.contexts.build(None, resource),
            timeout: Some(self.retry.initial_rpc_timeout),
            request,
        };
        build_admin_pipeline(inner, self.limiter.clone())
            .oneshot(call)
            .await
    }

    async fn list_operations(
        &self,
        kind: OperationKind,
        request: ListOperationsRequest,
    ) -> Result<OperationPage, RpcError> {
        let parent = request.parent.clone();
        match kind {
            OperationKind::Database => {
                self.unary(
                    "list_database_operations",
                    &parent,
                    request,
                    |transport, request, ctx| async move {
                        transport.list_database_operations(&request, ctx).await
                    },
                )
                .await
            }
            OperationKind::Backup => {
                self.unary(
                    "list_backup_operations",
                    &parent,
                    request,
                    |transport, request, ctx| async move {
                        transport.list_backup_operations(&request, ctx).await
                    },
                )
                .await
            }
        }
    }

    // -- Resumable operations ----------------------------------------------

    /// Creates the database named by `create_statement` under `instance`.
    ///
    /// # Errors
    ///
    /// `INVALID_ARGUMENT` if the statement names no database; otherwise as
    /// [`OperationCoordinator::start_or_resume`].
    pub async fn create_database(
        &self,
        instance: &str,
        create_statement: &str,
        extra_statements: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<OperationHandle, RpcError> {
        self.lifecycle.ensure_open()?;
        let Some(database_id) = resource::database_id_from_create_statement(create_statement)
        else {
            return Err(Status::new(
                Code::InvalidArgument,
                format!("not a CREATE DATABASE statement: {create_statement}"),
            )
            .into());
        };

        let request = CreateDatabaseRequest {
            parent: instance.to_string(),
            create_statement: create_statement.to_string(),
            extra_statements,
        };
        let lister = self.lister(
            OperationKind::Database,
            instance,
            create_database_filter(instance, database_id),
        );
        let call = ResumableCall {
            request: &request,
            destination: &self.project_name,
            resource: instance,
            options: None,
            lister: &lister,
            start_time: create_database_start_time,
        };
        self.coordinator
            .start_or_resume(call, self.transport.as_ref(), self.operations(), &self.retry, cancel)
            .await
    }

    /// Creates backup `backup_id` of `database` under `instance`.
    ///
    /// # Errors
    ///
    /// As [`OperationCoordinator::start_or_resume`].
    pub async fn create_backup(
        &self,
        instance: &str,
        backup_id: &str,
        database: &str,
        expire_time: Option<Timestamp>,
        cancel: &CancellationToken,
    ) -> Result<OperationHandle, RpcError> {
        self.lifecycle.ensure_open()?;
        let request = CreateBackupRequest {
            parent: instance.to_string(),
            backup_id: backup_id.to_string(),
            database: database.to_string(),
            expire_time,
        };
        let lister = self.lister(
            OperationKind::Backup,
            instance,
            create_backup_filter(instance, backup_id),
        );
        let call = ResumableCall {
            request: &request,
            destination: &self.project_name,
            resource: instance,
            options: None,
            lister: &lister,
            start_time: create_backup_start_time,
        };
        self.coordinator
            .start_or_resume(call, self.transport.as_ref(), self.operations(), &self.retry, cancel)
            .await
    }

    /// Restores `backup` into a new database `database_id` under `instance`.
    ///
    /// # Errors
    ///
    /// As [`OperationCoordinator::start_or_resume`].
    pub async fn restore_database(
        &self,
        instance: &str,
        database_id: &str,
        backup: &str,
        cancel: &CancellationToken,
    ) -> Result<OperationHandle, RpcError> {
        self.lifecycle.ensure_open()?;
        let request = RestoreDatabaseRequest {
            parent: instance.to_string(),
            database_id: database_id.to_string(),
            backup: backup.to_string(),
        };
        let lister = self.lister(
            OperationKind::Database,
            instance,
            restore_database_filter(instance, database_id),
        );
        let call = ResumableCall {
            request: &request,
            destination: &self.project_name,
            resource: instance,
            options: None,
            lister: &lister,
            start_time: restore_database_start_time,
        };
        self.coordinator
            .start_or_resume(call, self.transport.as_ref(), self.operations(), &self.retry, cancel)
            .await
    }

    /// Applies a schema change, issuing it once.
    ///
    /// With an `operation_id`, a collision with an earlier submission
    /// (`ALREADY_EXISTS`) resumes that submission's operation.
    ///
    /// # Errors
    ///
    /// The transport error of the call or of the resume lookup, or
    /// [`RpcError::Cancelled`].
    pub async fn update_database_ddl(
        &self,
        database: &str,
        statements: Vec<String>,
        operation_id: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<OperationHandle, RpcError> {
        let request = UpdateDatabaseDdlRequest {
            database: database.to_string(),
            statements,
            operation_id: operation_id.clone(),
        };
        let issued = self.unary(
            "update_database_ddl",
            database,
            request,
            |transport, request, ctx| async move {
                transport.update_database_ddl(&request, ctx).await
            },
        );
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Err(RpcError::cancelled("interrupted while submitting schema change"));
            }
            outcome = issued => outcome,
        };

        match outcome {
            Ok(operation) => Ok(self.coordinator.track(
                operation,
                false,
                &self.project_name,
                self.operations(),
            )),
            Err(RpcError::Rpc(status)) if status.code == Code::AlreadyExists => {
                let Some(id) = operation_id else {
                    return Err(status.into());
                };
                let name = resource::database_operation_name(database, &id);
                tracing::info!(operation = %name, "schema change already submitted; resuming it");
                self.resume_operation(&name).await
            }
            Err(e) => Err(e),
        }
    }

    /// Resumes tracking an operation by name. Only issues reads.
    ///
    /// # Errors
    ///
    /// [`RpcError::Closed`] after shutdown, or the lookup's transport error.
    pub async fn resume_operation(&self, name: &str) -> Result<OperationHandle, RpcError> {
        self.lifecycle.ensure_open()?;
        self.coordinator
            .resume(name, &self.project_name, self.operations(), &self.retry)
            .await
    }

    // -- Unary calls ---------------------------------------------------------

    /// # Errors
    ///
    /// [`RpcError::Closed`] after shutdown, or the transport error.
    pub async fn get_operation(&self, name: &str) -> Result<Operation, RpcError> {
        self.unary(
            "get_operation",
            name,
            name.to_string(),
            |transport, name: String, ctx| async move { transport.get_operation(&name, ctx).await },
        )
        .await
    }

    /// # Errors
    ///
    /// [`RpcError::Closed`] after shutdown, or the transport error.
    pub async fn list_database_operations(
        &self,
        request: ListOperationsRequest,
    ) -> Result<OperationPage, RpcError> {
        self.list_operations(OperationKind::Database, request).await
    }

    /// # Errors
    ///
    /// [`RpcError::Closed`] after shutdown, or the transport error.
    pub async fn list_backup_operations(
        &self,
        request: ListOperationsRequest,
    ) -> Result<OperationPage, RpcError> {
        self.list_operations(OperationKind::Backup, request).await
    }
}

impl<T> fmt::Debug for AdminClient<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminClient")
            .field("project_name", &self.project_name)
            .field("limiter", &self.limiter)
            .field("lifecycle", &self.lifecycle.state())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
