use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tapglue_domain::appliers::ApplierSet;
use tapglue_domain::channel::Channel;
use tapglue_domain::cursor::CursorManager;
use tapglue_domain::distributor::{
    Distributor, DistributorConfig, DistributorError, DistributorState, RunSummary,
};
use tapglue_domain::entities::Tenant;
use tapglue_domain::envelope::Sequence;
use tapglue_domain::ids::{AllocatorConfig, IdAllocator};
use tapglue_domain::journal::{Journal, Published};
use tapglue_domain::log_reader::{LogReader, ReaderConfig};
use tapglue_domain::memory::{
    InMemoryCounterStore, InMemoryCursorStore, InMemoryStores, MemoryLog, MemoryLogFault,
};
use tapglue_domain::util::verify_password;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const CONSUMER: &str = "distributor";

struct Harness {
    log: MemoryLog,
    cursor: InMemoryCursorStore,
    memory: InMemoryStores,
    journal: Journal,
    flush_interval: Duration,
}

struct Running {
    distributor: Arc<Distributor>,
    shutdown: CancellationToken,
    task: JoinHandle<Result<RunSummary, DistributorError>>,
}

impl Harness {
    fn new() -> Self {
        let log = MemoryLog::new("tapglue:requests:0");
        let ids = Arc::new(IdAllocator::new(
            Arc::new(InMemoryCounterStore::new()),
            AllocatorConfig::new(1, "intake-test"),
        ));
        Self {
            journal: Journal::new(Arc::new(log.clone()), ids),
            log,
            cursor: InMemoryCursorStore::new(),
            memory: InMemoryStores::new(),
            flush_interval: Duration::from_millis(20),
        }
    }

    fn start(&self) -> Running {
        let reader = LogReader::new(
            Arc::new(self.log.clone()),
            ReaderConfig {
                poll_interval: Duration::from_millis(5),
                backoff_base_ms: 1,
                backoff_max_ms: 5,
            },
        );
        let cursor = CursorManager::new(Arc::new(self.cursor.clone()), CONSUMER, self.flush_interval);
        let appliers = ApplierSet::new(self.memory.stores());
        let config = DistributorConfig {
            worker_count: 4,
            max_workers: 4,
            queue_capacity: 16,
            retry_backoff_base_ms: 1,
            retry_backoff_max_ms: 5,
            ..DistributorConfig::default()
        };
        let distributor = Arc::new(Distributor::new(reader, cursor, appliers, config));
        let shutdown = CancellationToken::new();
        let task = {
            let distributor = distributor.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { distributor.run(shutdown).await })
        };
        Running {
            distributor,
            shutdown,
            task,
        }
    }

    async fn publish(
        &self,
        tenant: Tenant,
        channel: Channel,
        payload: serde_json::Value,
    ) -> Sequence {
        self.publish_on(&tenant.partition_key(), channel, payload)
            .await
            .sequence
    }

    async fn publish_on(
        &self,
        partition_key: &str,
        channel: Channel,
        payload: serde_json::Value,
    ) -> Published {
        self.journal
            .publish(partition_key, channel, payload)
            .await
            .unwrap()
    }
}

impl Running {
    async fn wait_for_eligible(&self, sequence: &Sequence) {
        let stats = self.distributor.stats();
        let expected = Some(sequence.as_str().to_string());
        wait_until(|| {
            let stats = stats.clone();
            let expected = expected.clone();
            async move { stats.snapshot().eligible_position == expected }
        })
        .await;
    }

    async fn stop(self) -> Result<RunSummary, DistributorError> {
        self.shutdown.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("distributor did not stop")
            .unwrap();
        assert_eq!(*self.distributor.state().borrow(), DistributorState::Terminated);
        result
    }
}

async fn wait_until<F, Fut>(check: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn tenant() -> Tenant {
    Tenant::new(1, 1)
}

fn alice() -> serde_json::Value {
    json!({"account_id": 1, "user_name": "alice", "email": "a@x", "password": "p"})
}

#[tokio::test]
async fn cold_start_bootstraps_the_cursor_and_applies() {
    let harness = Harness::new();
    let sequence = harness.publish(tenant(), Channel::AccountUserCreate, alice()).await;

    let running = harness.start();
    running.wait_for_eligible(&sequence).await;
    let summary = running.stop().await.unwrap();

    assert_eq!(harness.cursor.create_calls(), 1);
    assert_eq!(harness.cursor.position(CONSUMER), Some(sequence.clone()));
    assert_eq!(summary.cursor.persisted, Some(sequence));
    assert_eq!(summary.applied, 1);

    let users = harness.memory.all_account_users().await;
    assert_eq!(users.len(), 1);
    assert_ne!(users[0].profile.password, "p");
    assert!(verify_password("p", &users[0].profile.password).unwrap());
}

#[tokio::test]
async fn redelivered_record_changes_nothing() {
    let harness = Harness::new();
    let sequence = harness.publish(tenant(), Channel::AccountUserCreate, alice()).await;
    let running = harness.start();
    running.wait_for_eligible(&sequence).await;
    running.stop().await.unwrap();
    let saved = harness.cursor.history().len();

    harness.log.inject(MemoryLogFault::Replay(sequence.clone()));
    let running = harness.start();
    let stats = running.distributor.stats();
    wait_until(|| {
        let stats = stats.clone();
        async move { stats.snapshot().received >= 1 && stats.snapshot().in_flight == 0 }
    })
    .await;
    let summary = running.stop().await.unwrap();

    assert_eq!(summary.received, 1);
    assert_eq!(harness.memory.all_account_users().await.len(), 1);
    assert_eq!(harness.cursor.position(CONSUMER), Some(sequence));
    assert_eq!(harness.cursor.history().len(), saved);
}

#[tokio::test]
async fn redelivered_event_create_keeps_its_id() {
    let harness = Harness::new();
    harness.memory.register_tenant(tenant()).await;
    let published = harness
        .publish_on(
            &tenant().partition_key(),
            Channel::EventCreate,
            json!({"account_id": 1, "application_id": 1, "user_id": 3, "verb": "like"}),
        )
        .await;
    let running = harness.start();
    running.wait_for_eligible(&published.sequence).await;
    running.stop().await.unwrap();

    harness
        .log
        .inject(MemoryLogFault::Replay(published.sequence.clone()));
    let running = harness.start();
    let stats = running.distributor.stats();
    wait_until(|| {
        let stats = stats.clone();
        async move { stats.snapshot().received >= 1 && stats.snapshot().in_flight == 0 }
    })
    .await;
    running.stop().await.unwrap();

    let events = harness.memory.all_events(tenant()).await;
    assert_eq!(events.len(), 1);
    assert_eq!(Some(events[0].id), published.assigned_id);
}

#[tokio::test]
async fn update_after_create_in_one_partition_wins() {
    let harness = Harness::new();
    harness.memory.register_tenant(tenant()).await;
    harness
        .publish(
            tenant(),
            Channel::EventCreate,
            json!({"account_id": 1, "application_id": 1, "id": 100, "user_id": 3, "verb": "like"}),
        )
        .await;
    let last = harness
        .publish(
            tenant(),
            Channel::EventUpdate,
            json!({"account_id": 1, "application_id": 1, "id": 100, "user_id": 3, "verb": "liked"}),
        )
        .await;

    let running = harness.start();
    running.wait_for_eligible(&last).await;
    running.stop().await.unwrap();

    let events = harness.memory.all_events(tenant()).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].verb, "liked");
    assert!(events[0].common.updated_at > events[0].common.created_at);
}

#[tokio::test]
async fn partition_order_is_preserved_across_workers() {
    let harness = Harness::new();
    let tenants: Vec<Tenant> = (1..=3).map(|app| Tenant::new(1, app)).collect();
    for tenant in &tenants {
        harness.memory.register_tenant(*tenant).await;
        harness
            .publish(
                *tenant,
                Channel::EventCreate,
                json!({"account_id": 1, "application_id": tenant.application_id, "id": 1, "user_id": 1, "verb": "v0"}),
            )
            .await;
    }
    let mut last = Sequence::default();
    for round in 1..=10 {
        for tenant in &tenants {
            last = harness
                .publish(
                    *tenant,
                    Channel::EventUpdate,
                    json!({
                        "account_id": 1,
                        "application_id": tenant.application_id,
                        "id": 1,
                        "user_id": 1,
                        "verb": format!("v{round}")
                    }),
                )
                .await;
        }
    }

    let running = harness.start();
    running.wait_for_eligible(&last).await;
    running.stop().await.unwrap();

    for tenant in tenants {
        let events = harness.memory.all_events(tenant).await;
        assert_eq!(events[0].verb, "v10", "tenant {tenant}");
    }
}

#[tokio::test]
async fn poison_pill_is_skipped() {
    let harness = Harness::new();
    harness.log.append_raw(
        &tenant().partition_key(),
        r#"{"channel":"v02_connection.create","payload":"{not json"}"#,
    );
    harness.log.append_raw(&tenant().partition_key(), "not even an envelope");
    let last = harness.publish(tenant(), Channel::AccountUserCreate, alice()).await;

    let running = harness.start();
    running.wait_for_eligible(&last).await;
    let summary = running.stop().await.unwrap();

    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.applied, 1);
    assert_eq!(harness.cursor.position(CONSUMER), Some(last));
}

#[tokio::test]
async fn unknown_tenant_is_skipped() {
    let harness = Harness::new();
    let last = harness
        .publish(
            Tenant::new(9, 9),
            Channel::EventCreate,
            json!({"account_id": 9, "application_id": 9, "id": 1, "user_id": 1, "verb": "x"}),
        )
        .await;

    let running = harness.start();
    running.wait_for_eligible(&last).await;
    let summary = running.stop().await.unwrap();
    assert_eq!(summary.skipped, 1);
}

#[tokio::test]
async fn failing_apply_never_moves_the_cursor() {
    let harness = Harness::new();
    harness.memory.fail_next_writes(usize::MAX);
    harness.publish(tenant(), Channel::AccountUserCreate, alice()).await;

    let running = harness.start();
    let stats = running.distributor.stats();
    wait_until(|| {
        let stats = stats.clone();
        async move { stats.snapshot().retried >= 3 }
    })
    .await;
    let summary = running.stop().await.unwrap();

    assert_eq!(summary.abandoned, 1);
    assert!(harness.cursor.history().is_empty());
    assert_eq!(harness.cursor.position(CONSUMER), Some(Sequence::default()));
}

#[tokio::test]
async fn abandoned_record_holds_back_its_partition() {
    let harness = Harness::new();
    let stalled = Tenant::new(1, 1);
    let healthy = Tenant::new(1, 2);
    harness.memory.register_tenant(stalled).await;
    harness.memory.register_tenant(healthy).await;
    harness.memory.take_offline(stalled).await;

    let partition = stalled.partition_key();
    harness
        .publish_on(
            &partition,
            Channel::EventCreate,
            json!({"account_id": 1, "application_id": 1, "id": 1, "user_id": 1, "verb": "first"}),
        )
        .await;
    harness
        .publish_on(
            &partition,
            Channel::EventCreate,
            json!({"account_id": 1, "application_id": 2, "id": 2, "user_id": 1, "verb": "second"}),
        )
        .await;

    let running = harness.start();
    let stats = running.distributor.stats();
    wait_until(|| {
        let stats = stats.clone();
        async move { stats.snapshot().received == 2 && stats.snapshot().retried >= 3 }
    })
    .await;
    let summary = running.stop().await.unwrap();

    assert_eq!(summary.abandoned, 2);
    assert!(harness.memory.all_events(healthy).await.is_empty());
    assert!(harness.cursor.history().is_empty());
}

#[tokio::test]
async fn transient_store_failure_is_retried_until_applied() {
    let harness = Harness::new();
    harness.memory.fail_next_writes(2);
    let sequence = harness.publish(tenant(), Channel::AccountUserCreate, alice()).await;

    let running = harness.start();
    running.wait_for_eligible(&sequence).await;
    running.stop().await.unwrap();
    assert_eq!(harness.memory.all_account_users().await.len(), 1);
}

#[tokio::test]
async fn shutdown_flushes_the_latest_cursor_once() {
    let mut harness = Harness::new();
    harness.flush_interval = Duration::from_secs(60);
    let mut last = Sequence::default();
    for index in 0..10 {
        last = harness
            .publish(
                tenant(),
                Channel::AccountUserCreate,
                json!({"account_id": 1, "user_name": format!("u{index}"), "email": format!("u{index}@x"), "password": "p"}),
            )
            .await;
    }

    let running = harness.start();
    running.wait_for_eligible(&last).await;
    assert!(harness.cursor.history().is_empty());
    running.stop().await.unwrap();
    assert_eq!(harness.cursor.history(), vec![last.clone()]);

    let running = harness.start();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let summary = running.stop().await.unwrap();
    assert_eq!(summary.received, 0);
    assert_eq!(harness.cursor.position(CONSUMER), Some(last));
}

#[tokio::test]
async fn fatal_log_error_terminates_the_run() {
    let harness = Harness::new();
    harness.log.inject(MemoryLogFault::Fatal);

    let running = harness.start();
    let result = tokio::time::timeout(Duration::from_secs(5), running.task)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(DistributorError::Reader(_))));
    assert_eq!(*running.distributor.state().borrow(), DistributorState::Terminated);
}
