//! End-to-end behaviour of the admin client against an in-memory transport.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use spanrpc_client::transport::{
    CreateBackupRequest, CreateDatabaseRequest, ListOperationsRequest, RestoreDatabaseRequest,
    UpdateDatabaseDdlRequest,
};
use spanrpc_client::{
    AdminClient, DatabaseAdminTransport, InvocationContext, LifecycleState, OperationsClient,
    PollSettings, RateLimiterRegistry, RetrySettings, RpcConfig, RpcError,
};
use spanrpc_core::metadata::{Database, RestoreDatabaseMetadata};
use spanrpc_core::{
    resource, Code, ManualClock, Operation, OperationPage, OperationResult, Payload, Status,
    Timestamp,
};
use tokio_util::sync::CancellationToken;

const INSTANCE: &str = "projects/acme/instances/main";
const NOW_MILLIS: u64 = 1_700_000_000_500;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ---------------------------------------------------------------------------
// In-memory transport
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryAdmin {
    starts: Mutex<VecDeque<Result<Operation, Status>>>,
    start_calls: AtomicUsize,
    list_pages: Mutex<Vec<OperationPage>>,
    list_calls: AtomicUsize,
    /// Successive snapshots returned by `get_operation`, per name. The last
    /// one repeats.
    snapshots: Mutex<HashMap<String, VecDeque<Operation>>>,
    reads: AtomicUsize,
}

impl MemoryAdmin {
    fn with_starts(starts: Vec<Result<Operation, Status>>) -> Self {
        Self {
            starts: Mutex::new(starts.into()),
            ..Self::default()
        }
    }

    fn listing(self, pages: Vec<OperationPage>) -> Self {
        *self.list_pages.lock() = pages;
        self
    }

    fn snapshots(self, name: &str, snapshots: Vec<Operation>) -> Self {
        self.snapshots
            .lock()
            .insert(name.to_string(), snapshots.into());
        self
    }

    fn start(&self) -> Result<Operation, Status> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        self.starts
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(Operation::pending("operations/fresh")))
    }

    fn page(&self, request: &ListOperationsRequest) -> OperationPage {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let index = request
            .page_token
            .as_deref()
            .and_then(|token| token.parse::<usize>().ok())
            .unwrap_or(0);
        self.list_pages.lock().get(index).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl OperationsClient for MemoryAdmin {
    async fn get_operation(&self, name: &str, _ctx: InvocationContext) -> Result<Operation, Status> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let mut snapshots = self.snapshots.lock();
        let Some(queue) = snapshots.get_mut(name) else {
            return Err(Status::new(Code::NotFound, format!("{name} not found")));
        };
        let next = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        next.ok_or_else(|| Status::new(Code::NotFound, format!("{name} not found")))
    }
}

#[async_trait]
impl DatabaseAdminTransport for MemoryAdmin {
    async fn create_database(
        &self,
        _request: &CreateDatabaseRequest,
        _ctx: InvocationContext,
    ) -> Result<Operation, Status> {
        self.start()
    }

    async fn create_backup(
        &self,
        _request: &CreateBackupRequest,
        _ctx: InvocationContext,
    ) -> Result<Operation, Status> {
        self.start()
    }

    async fn restore_database(
        &self,
        _request: &RestoreDatabaseRequest,
        _ctx: InvocationContext,
    ) -> Result<Operation, Status> {
        self.start()
    }

    async fn update_database_ddl(
        &self,
        _request: &UpdateDatabaseDdlRequest,
        _ctx: InvocationContext,
    ) -> Result<Operation, Status> {
        self.start()
    }

    async fn list_database_operations(
        &self,
        request: &ListOperationsRequest,
        _ctx: InvocationContext,
    ) -> Result<OperationPage, Status> {
        Ok(self.page(request))
    }

    async fn list_backup_operations(
        &self,
        request: &ListOperationsRequest,
        _ctx: InvocationContext,
    ) -> Result<OperationPage, Status> {
        Ok(self.page(request))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn config(throttle: bool) -> RpcConfig {
    let mut config = RpcConfig {
        project_id: "acme".to_string(),
        ..RpcConfig::default()
    };
    config.throttle.enabled = throttle;
    config.executor.min_worker_threads = 1;
    config.executor.termination_timeout = Duration::from_secs(2);
    config.stream.check_interval = Duration::ZERO;
    config
}

fn fast_retries() -> RetrySettings {
    RetrySettings {
        initial_retry_delay: Duration::from_millis(1),
        max_retry_delay: Duration::from_millis(2),
        max_attempts: 5,
        jitter: false,
        ..RetrySettings::default()
    }
}

fn admin(transport: &Arc<MemoryAdmin>) -> AdminClient<MemoryAdmin> {
    let config = config(false);
    let registry = Arc::new(RateLimiterRegistry::new(&config.throttle));
    AdminClient::new(&config, registry, Arc::clone(transport))
        .unwrap()
        .with_clock(Arc::new(ManualClock::new(NOW_MILLIS)))
        .with_retry_settings(fast_retries())
}

fn created_database(name: &str, db: &str, create_seconds: i64) -> Operation {
    let response = Database {
        name: db.to_string(),
        create_time: Timestamp::new(create_seconds, 0),
    };
    Operation::pending(name).finished(OperationResult::Response(Payload::pack(&response).unwrap()))
}

fn restoring(name: &str, db: &str, start_seconds: i64) -> Operation {
    let mut meta = RestoreDatabaseMetadata {
        name: db.to_string(),
        backup: resource::backup_name(INSTANCE, "nightly"),
        ..RestoreDatabaseMetadata::default()
    };
    meta.progress.start_time = Some(Timestamp::new(start_seconds, 0));
    Operation::pending(name).with_metadata(Payload::pack(&meta).unwrap())
}

// ---------------------------------------------------------------------------
// Resumption
// ---------------------------------------------------------------------------

#[tokio::test]
async fn transient_failure_resumes_instead_of_recreating() {
    init_tracing();
    let db = resource::database_name(INSTANCE, "orders");
    let ours = format!("{db}/operations/create-1");
    // The call time truncates to 1_700_000_000s; a database created in that
    // same second belongs to this call.
    let transport = Arc::new(
        MemoryAdmin::with_starts(vec![Err(Status::unavailable("connection reset"))])
            .listing(vec![OperationPage::last(vec![
                created_database(&format!("{db}/operations/old"), &db, 1_699_999_000),
                created_database(&ours, &db, 1_700_000_000),
            ])])
            .snapshots(&ours, vec![created_database(&ours, &db, 1_700_000_000)]),
    );
    let admin = admin(&transport);

    let handle = admin
        .create_database(INSTANCE, "CREATE DATABASE `orders`", vec![], &CancellationToken::new())
        .await
        .unwrap();

    assert!(handle.is_resumed());
    assert_eq!(handle.name(), ours);
    assert_eq!(transport.start_calls.load(Ordering::SeqCst), 1);
    assert_eq!(transport.list_calls.load(Ordering::SeqCst), 1);

    let created: Database = handle
        .wait_for(&PollSettings::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(created.name, db);
    admin.shutdown_async().await.unwrap();
}

#[tokio::test]
async fn resumption_scans_every_page() {
    init_tracing();
    let db = resource::database_name(INSTANCE, "restored");
    let ours = format!("{db}/operations/restore-2");
    let transport = Arc::new(
        MemoryAdmin::with_starts(vec![Err(Status::deadline_exceeded("slow"))])
            .listing(vec![
                OperationPage::with_next(
                    vec![restoring(&format!("{db}/operations/restore-1"), &db, 1_700_000_000)],
                    "1",
                ),
                OperationPage::last(vec![restoring(&ours, &db, 1_700_000_030)]),
            ])
            .snapshots(&ours, vec![restoring(&ours, &db, 1_700_000_030)]),
    );
    let admin = admin(&transport);

    let handle = admin
        .restore_database(
            INSTANCE,
            "restored",
            &resource::backup_name(INSTANCE, "nightly"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(handle.is_resumed());
    assert_eq!(handle.name(), ours);
    assert_eq!(transport.list_calls.load(Ordering::SeqCst), 2);
    admin.shutdown_async().await.unwrap();
}

#[tokio::test]
async fn non_retryable_failure_surfaces_without_listing() {
    init_tracing();
    let transport = Arc::new(MemoryAdmin::with_starts(vec![Err(Status::new(
        Code::PermissionDenied,
        "caller lacks permission",
    ))]));
    let admin = admin(&transport);

    let err = admin
        .create_database(INSTANCE, "CREATE DATABASE orders", vec![], &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.code(), Some(Code::PermissionDenied));
    assert_eq!(transport.start_calls.load(Ordering::SeqCst), 1);
    assert_eq!(transport.list_calls.load(Ordering::SeqCst), 0);
    admin.shutdown_async().await.unwrap();
}

#[tokio::test]
async fn resuming_by_name_is_idempotent() {
    init_tracing();
    let name = format!("{}/operations/ddl-3", resource::database_name(INSTANCE, "orders"));
    let transport = Arc::new(MemoryAdmin::default().snapshots(&name, vec![Operation::pending(&name)]));
    let admin = admin(&transport);

    let first = admin.resume_operation(&name).await.unwrap();
    let second = admin.resume_operation(&name).await.unwrap();

    assert_eq!(first.name(), second.name());
    assert!(first.is_resumed() && second.is_resumed());
    assert_eq!(transport.reads.load(Ordering::SeqCst), 2);
    assert_eq!(transport.start_calls.load(Ordering::SeqCst), 0);
    admin.shutdown_async().await.unwrap();
}

#[tokio::test]
async fn ddl_retry_with_same_id_follows_existing_operation() {
    init_tracing();
    let database = resource::database_name(INSTANCE, "orders");
    let name = resource::database_operation_name(&database, "add-index");
    let done = Operation::pending(&name).finished(OperationResult::Response(
        Payload::pack(&spanrpc_core::metadata::Empty {}).unwrap(),
    ));
    let transport = Arc::new(
        MemoryAdmin::with_starts(vec![Err(Status::new(Code::AlreadyExists, "duplicate id"))])
            .snapshots(&name, vec![Operation::pending(&name), done]),
    );
    let admin = admin(&transport);

    let handle = admin
        .update_database_ddl(
            &database,
            vec!["CREATE INDEX idx ON t (c)".to_string()],
            Some("add-index".to_string()),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(handle.is_resumed());

    let poll = PollSettings {
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        ..PollSettings::default()
    };
    handle.wait(&poll, &CancellationToken::new()).await.unwrap();
    assert_eq!(transport.start_calls.load(Ordering::SeqCst), 1);
    admin.shutdown_async().await.unwrap();
}

#[tokio::test]
async fn interrupt_during_backoff_is_cancellation() {
    init_tracing();
    let transport = Arc::new(MemoryAdmin::with_starts(vec![
        Err(Status::unavailable("down")),
        Err(Status::unavailable("down")),
    ]));
    let admin = admin(&transport).with_retry_settings(RetrySettings {
        initial_retry_delay: Duration::from_secs(30),
        max_retry_delay: Duration::from_secs(30),
        jitter: false,
        ..RetrySettings::default()
    });
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let err = admin
        .create_database(INSTANCE, "CREATE DATABASE orders", vec![], &cancel)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(transport.start_calls.load(Ordering::SeqCst), 1);
    admin.shutdown_async().await.unwrap();
}

// ---------------------------------------------------------------------------
// Throttling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn clients_of_one_project_share_a_limiter() {
    init_tracing();
    let mut config = config(true);
    config.throttle.requests_per_second = std::num::NonZeroU32::new(1_000).unwrap();
    let registry = Arc::new(RateLimiterRegistry::new(&config.throttle));
    let transport = Arc::new(MemoryAdmin::default());

    let first = AdminClient::new(&config, Arc::clone(&registry), Arc::clone(&transport)).unwrap();
    let second = AdminClient::new(&config, Arc::clone(&registry), Arc::clone(&transport)).unwrap();
    first
        .list_database_operations(ListOperationsRequest::default())
        .await
        .unwrap();
    second
        .list_backup_operations(ListOperationsRequest::default())
        .await
        .unwrap();

    assert_eq!(registry.len(), 1);
    first.shutdown_async().await.unwrap();
    second.shutdown_async().await.unwrap();
}

#[tokio::test]
async fn disabled_throttle_never_installs_limiters() {
    init_tracing();
    let config = config(false);
    let registry = Arc::new(RateLimiterRegistry::new(&config.throttle));
    let transport = Arc::new(MemoryAdmin::default());
    let admin = AdminClient::new(&config, Arc::clone(&registry), transport).unwrap();

    for _ in 0..20 {
        admin
            .list_database_operations(ListOperationsRequest::default())
            .await
            .unwrap();
    }
    assert!(registry.is_empty());
    admin.shutdown_async().await.unwrap();
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[test]
fn shutdown_twice_then_everything_fails_fast() {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let transport = Arc::new(MemoryAdmin::default());
    let admin = admin(&transport);
    admin.lifecycle().executor().unwrap();

    admin.shutdown().unwrap();
    admin.shutdown().unwrap();
    assert!(admin.is_closed());
    assert_eq!(admin.lifecycle().state(), LifecycleState::Closed);

    runtime.block_on(async {
        assert!(matches!(
            admin.get_operation("operations/1").await,
            Err(RpcError::Closed)
        ));
        assert!(matches!(
            admin
                .restore_database(INSTANCE, "d", "backups/b", &CancellationToken::new())
                .await,
            Err(RpcError::Closed)
        ));
    });
    assert!(matches!(admin.lifecycle().executor(), Err(RpcError::Closed)));
    assert_eq!(transport.start_calls.load(Ordering::SeqCst), 0);
}
