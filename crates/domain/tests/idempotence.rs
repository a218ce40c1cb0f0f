use serde_json::{Value, json};
use tapglue_domain::appliers::ApplierSet;
use tapglue_domain::channel::Channel;
use tapglue_domain::entities::{
    Account, AccountUser, Application, ApplicationUser, Connection, Event, Tenant,
};
use tapglue_domain::memory::InMemoryStores;

const REDELIVERIES: usize = 3;

fn tenant() -> Tenant {
    Tenant::new(1, 1)
}

/// One representative record per channel, aimed at the seeded fixtures.
fn payload(channel: Channel) -> Value {
    match channel {
        Channel::AccountUpdate => json!({"account_id": 1, "name": "renamed"}),
        Channel::AccountDelete => json!({"account_id": 1}),
        Channel::AccountUserCreate => {
            json!({"account_id": 1, "user_name": "bob", "email": "b@x", "password": "p"})
        }
        Channel::AccountUserUpdate => {
            json!({"account_id": 1, "id": "au-1", "first_name": "Ann", "password": "p"})
        }
        Channel::AccountUserDelete => json!({"account_id": 1, "id": "au-1"}),
        Channel::ApplicationCreate => {
            json!({"account_id": 1, "application_id": 2, "name": "second"})
        }
        Channel::ApplicationUpdate => {
            json!({"account_id": 1, "application_id": 1, "name": "renamed"})
        }
        Channel::ApplicationDelete => json!({"account_id": 1, "application_id": 1}),
        Channel::ApplicationUserUpdate => {
            json!({"account_id": 1, "application_id": 1, "id": 1, "first_name": "Uno"})
        }
        Channel::ApplicationUserDelete => json!({"account_id": 1, "application_id": 1, "id": 1}),
        Channel::ConnectionCreate => json!({
            "account_id": 1, "application_id": 1,
            "user_from_id": 2, "user_to_id": 3, "type": "friend", "enabled": true
        }),
        Channel::ConnectionConfirm => json!({
            "account_id": 1, "application_id": 1,
            "user_from_id": 1, "user_to_id": 2, "type": "follow"
        }),
        Channel::ConnectionUpdate => json!({
            "account_id": 1, "application_id": 1,
            "user_from_id": 1, "user_to_id": 2, "type": "follow", "enabled": false
        }),
        Channel::ConnectionAutoConnect => json!({
            "user": {"account_id": 1, "application_id": 1, "id": 3},
            "type": "follow",
            "our_stored_users_ids": [1, 2]
        }),
        Channel::ConnectionSocialConnect => json!({
            "user": {"account_id": 1, "application_id": 1, "id": 3},
            "platform": "facebook",
            "social_friends_ids": ["fb-1", "fb-2"],
            "type": "friend"
        }),
        Channel::ConnectionDelete => json!({
            "account_id": 1, "application_id": 1,
            "user_from_id": 1, "user_to_id": 2, "type": "follow"
        }),
        Channel::EventCreate => json!({
            "account_id": 1, "application_id": 1, "id": 200, "user_id": 2, "verb": "share"
        }),
        Channel::EventUpdate => json!({
            "account_id": 1, "application_id": 1, "id": 100, "user_id": 1, "verb": "liked"
        }),
        Channel::EventDelete => {
            json!({"account_id": 1, "application_id": 1, "id": 100, "user_id": 1})
        }
    }
}

async fn seeded() -> InMemoryStores {
    let memory = InMemoryStores::new();
    let stores = memory.stores();

    let account: Account = serde_json::from_value(json!({"account_id": 1, "name": "acme"})).unwrap();
    stores.accounts.create(&account).await.unwrap();
    let account_user: AccountUser = serde_json::from_value(
        json!({"account_id": 1, "id": "au-1", "user_name": "ann", "enabled": true}),
    )
    .unwrap();
    stores.account_users.create(&account_user).await.unwrap();
    memory.open_account_session(1, "au-1").await;

    let application: Application = serde_json::from_value(
        json!({"account_id": 1, "application_id": 1, "name": "app", "enabled": true}),
    )
    .unwrap();
    stores.applications.create(&application).await.unwrap();

    for id in 1..=3u64 {
        let user: ApplicationUser = serde_json::from_value(json!({
            "account_id": 1,
            "application_id": 1,
            "id": id,
            "user_name": format!("user-{id}"),
            "social_ids": {"facebook": format!("fb-{id}")},
            "enabled": true
        }))
        .unwrap();
        stores.application_users.create(&user).await.unwrap();
    }
    memory.open_session(tenant(), 1).await;

    let connection: Connection = serde_json::from_value(json!({
        "account_id": 1, "application_id": 1,
        "user_from_id": 1, "user_to_id": 2, "type": "follow", "enabled": true
    }))
    .unwrap();
    stores.connections.create(&connection).await.unwrap();

    let event: Event = serde_json::from_value(json!({
        "account_id": 1, "application_id": 1, "id": 100, "user_id": 1, "verb": "like"
    }))
    .unwrap();
    stores.events.create(&event).await.unwrap();
    memory
}

#[derive(Debug, PartialEq)]
struct Snapshot {
    account: Option<Account>,
    account_users: Vec<AccountUser>,
    account_sessions: u64,
    applications: Vec<Option<Application>>,
    application_users: Vec<Option<ApplicationUser>>,
    user_sessions: u64,
    connections: Vec<Connection>,
    events: Vec<Event>,
}

async fn snapshot(memory: &InMemoryStores) -> Snapshot {
    let stores = memory.stores();
    let mut applications = Vec::new();
    for application_id in 1..=2 {
        applications.push(
            stores
                .applications
                .read(Tenant::new(1, application_id))
                .await
                .unwrap(),
        );
    }
    let mut application_users = Vec::new();
    for id in 1..=3 {
        application_users.push(stores.application_users.read(tenant(), id).await.unwrap());
    }
    Snapshot {
        account: stores.accounts.read(1).await.unwrap(),
        account_users: memory.all_account_users().await,
        account_sessions: memory.account_session_count(1, "au-1").await,
        applications,
        application_users,
        user_sessions: memory.session_count(tenant(), 1).await,
        connections: memory.all_connections(tenant()).await,
        events: memory.all_events(tenant()).await,
    }
}

#[tokio::test]
async fn every_channel_is_idempotent_under_redelivery() {
    for channel in Channel::ALL {
        let memory = seeded().await;
        let appliers = ApplierSet::new(memory.stores());
        let record = payload(channel).to_string();
        let before = snapshot(&memory).await;

        appliers
            .dispatch(channel, &record)
            .await
            .unwrap_or_else(|err| panic!("{channel}: {err}"));
        let once = snapshot(&memory).await;
        assert_ne!(once, before, "{channel} record changed nothing");

        for _ in 1..REDELIVERIES {
            appliers
                .dispatch(channel, &record)
                .await
                .unwrap_or_else(|err| panic!("{channel} redelivery: {err}"));
        }
        assert_eq!(snapshot(&memory).await, once, "{channel} is not idempotent");
    }
}
