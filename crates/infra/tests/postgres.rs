//! Runs against a live database when `TAPGLUE_TEST_POSTGRES_URL` is set and
//! returns early otherwise.

use std::time::Duration;

use tapglue_domain::entities::Account;
use tapglue_domain::envelope::Sequence;
use tapglue_domain::ports::counter::{AllocatorError, AllocatorKey, CounterStore, IdKind};
use tapglue_domain::ports::cursor::CursorStore;
use tapglue_domain::ports::store::AccountStore;
use tapglue_infra::db::{PgConfig, PostgresClient};
use tapglue_infra::repositories::{PostgresCounterStore, PostgresCursorStore, PostgresStores};

async fn client() -> Option<PostgresClient> {
    let url = std::env::var("TAPGLUE_TEST_POSTGRES_URL").ok()?;
    let client = PostgresClient::connect(&PgConfig {
        main_url: url,
        replica_urls: Vec::new(),
        max_connections: 2,
    })
    .await
    .expect("connect");
    client.ensure_schema().await.expect("schema");
    Some(client)
}

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}-{}", std::process::id(), tapglue_domain::util::now_ms())
}

#[tokio::test]
async fn cursor_row_bootstrap_and_save() {
    let Some(client) = client().await else {
        return;
    };
    let store = PostgresCursorStore::new(client);
    let consumer = unique("cursor");

    assert_eq!(store.load(&consumer).await.expect("load"), None);
    store.create(&consumer).await.expect("create");
    store.create(&consumer).await.expect("second create is swallowed");
    assert_eq!(
        store.load(&consumer).await.expect("load"),
        Some(Sequence::default())
    );

    let position = Sequence::new("00000000000000000042-00000000000000000000");
    store.save(&consumer, &position).await.expect("save");
    assert_eq!(store.load(&consumer).await.expect("load"), Some(position));
}

#[tokio::test]
async fn counter_leases_are_exclusive() {
    let Some(client) = client().await else {
        return;
    };
    let store = PostgresCounterStore::new(client);
    let key = AllocatorKey::new(
        (tapglue_domain::util::now_ms() % 1_000_000) + i64::from(std::process::id()),
        IdKind::Events,
    );
    let ttl = Duration::from_secs(30);

    assert_eq!(store.acquire(key, "one", ttl).await.expect("acquire"), 0);
    store.advance(key, "one", 500, ttl).await.expect("advance");
    let err = store.acquire(key, "two", ttl).await.expect_err("held");
    assert!(matches!(err, AllocatorError::LeaseHeld(_)));

    store.release(key, "one").await.expect("release");
    assert_eq!(store.acquire(key, "two", ttl).await.expect("acquire"), 500);
    let err = store.advance(key, "one", 900, ttl).await.expect_err("lost");
    assert!(matches!(err, AllocatorError::LeaseLost(_)));
}

#[tokio::test]
async fn account_create_is_idempotent() {
    let Some(client) = client().await else {
        return;
    };
    let stores = PostgresStores::new(client).stores();
    let account = Account {
        account_id: 900_000 + i64::from(std::process::id() % 10_000),
        public_id: unique("acc"),
        name: "first".into(),
        ..Account::default()
    };

    let created = stores.accounts.create(&account).await.expect("create");
    let mut again = account.clone();
    again.name = "second".into();
    let replayed = stores.accounts.create(&again).await.expect("replay");
    assert_eq!(replayed.name, created.name);

    stores.accounts.delete(account.account_id).await.expect("delete");
    let deleted = stores
        .accounts
        .read(account.account_id)
        .await
        .expect("read")
        .expect("still stored");
    assert!(deleted.common.deleted);
}
