use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::DomainResult;
use crate::entities::{
    Account, AccountUser, Application, ApplicationUser, Connection, ConnectionKey, Event, Tenant,
};
use crate::error::DomainError;
use crate::ports::BoxFuture;
use crate::ports::store::{
    AccountStore, AccountUserStore, ApplicationStore, ApplicationUserStore, ConnectionStore,
    EventStore, Stores,
};

#[derive(Default)]
struct State {
    accounts: HashMap<i64, Account>,
    account_users: HashMap<(i64, String), AccountUser>,
    account_sessions: HashMap<(i64, String), u64>,
    applications: HashMap<Tenant, Application>,
    tenants: HashSet<Tenant>,
    offline: HashSet<Tenant>,
    application_users: HashMap<(Tenant, u64), ApplicationUser>,
    user_sessions: HashMap<(Tenant, u64), u64>,
    connections: HashMap<(Tenant, ConnectionKey), Connection>,
    events: HashMap<(Tenant, u64, u64), Event>,
    next_account_user_id: i64,
}

impl State {
    fn require_tenant(&self, tenant: Tenant) -> DomainResult<()> {
        if self.offline.contains(&tenant) {
            Err(DomainError::Unavailable(format!("{tenant} is offline")))
        } else if self.tenants.contains(&tenant) {
            Ok(())
        } else {
            Err(DomainError::UnknownTenant(tenant))
        }
    }
}

/// Every entity store in one in-memory state, with per-tenant namespaces
/// and injectable write failures.
#[derive(Clone, Default)]
pub struct InMemoryStores {
    state: Arc<RwLock<State>>,
    failing_writes: Arc<AtomicUsize>,
}

impl InMemoryStores {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stores(&self) -> Stores {
        let shared = Arc::new(self.clone());
        Stores {
            accounts: shared.clone(),
            account_users: shared.clone(),
            applications: shared.clone(),
            application_users: shared.clone(),
            connections: shared.clone(),
            events: shared,
        }
    }

    /// Makes the tenant namespace exist without an application row.
    pub async fn register_tenant(&self, tenant: Tenant) {
        self.state.write().await.tenants.insert(tenant);
    }

    /// Every operation on the tenant fails with `Unavailable` from now on.
    pub async fn take_offline(&self, tenant: Tenant) {
        self.state.write().await.offline.insert(tenant);
    }

    /// The next `count` writes fail with `Unavailable`.
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    pub async fn open_session(&self, tenant: Tenant, user_id: u64) {
        *self
            .state
            .write()
            .await
            .user_sessions
            .entry((tenant, user_id))
            .or_default() += 1;
    }

    pub async fn open_account_session(&self, account_id: i64, public_id: &str) {
        *self
            .state
            .write()
            .await
            .account_sessions
            .entry((account_id, public_id.to_string()))
            .or_default() += 1;
    }

    pub async fn session_count(&self, tenant: Tenant, user_id: u64) -> u64 {
        self.state
            .read()
            .await
            .user_sessions
            .get(&(tenant, user_id))
            .copied()
            .unwrap_or_default()
    }

    pub async fn account_session_count(&self, account_id: i64, public_id: &str) -> u64 {
        self.state
            .read()
            .await
            .account_sessions
            .get(&(account_id, public_id.to_string()))
            .copied()
            .unwrap_or_default()
    }

    pub async fn all_account_users(&self) -> Vec<AccountUser> {
        let mut users: Vec<_> = self.state.read().await.account_users.values().cloned().collect();
        users.sort_by_key(|user| user.account_user_id);
        users
    }

    pub async fn all_connections(&self, tenant: Tenant) -> Vec<Connection> {
        let mut connections: Vec<_> = self
            .state
            .read()
            .await
            .connections
            .iter()
            .filter(|((owner, _), _)| *owner == tenant)
            .map(|(_, connection)| connection.clone())
            .collect();
        connections.sort_by_key(|connection| connection.key());
        connections
    }

    pub async fn all_events(&self, tenant: Tenant) -> Vec<Event> {
        let mut events: Vec<_> = self
            .state
            .read()
            .await
            .events
            .iter()
            .filter(|((owner, _, _), _)| *owner == tenant)
            .map(|(_, event)| event.clone())
            .collect();
        events.sort_by_key(|event| (event.user_id, event.id));
        events
    }

    fn check_write(&self) -> DomainResult<()> {
        let fail = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if fail {
            Err(DomainError::Unavailable("injected write failure".into()))
        } else {
            Ok(())
        }
    }
}

fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

impl AccountStore for InMemoryStores {
    fn create(&self, account: &Account) -> BoxFuture<'_, DomainResult<Account>> {
        let mut account = account.clone();
        Box::pin(async move {
            self.check_write()?;
            let mut state = self.state.write().await;
            if let Some(existing) = state.accounts.get(&account.account_id) {
                return Ok(existing.clone());
            }
            account.common.stamp_created(now());
            state.accounts.insert(account.account_id, account.clone());
            Ok(account)
        })
    }

    fn read(&self, account_id: i64) -> BoxFuture<'_, DomainResult<Option<Account>>> {
        Box::pin(async move { Ok(self.state.read().await.accounts.get(&account_id).cloned()) })
    }

    fn update(&self, account: &Account) -> BoxFuture<'_, DomainResult<Account>> {
        let account = account.clone();
        Box::pin(async move {
            self.check_write()?;
            let mut state = self.state.write().await;
            let stored = state
                .accounts
                .get_mut(&account.account_id)
                .ok_or(DomainError::NotFound)?;
            *stored = account.clone();
            Ok(account)
        })
    }

    fn delete(&self, account_id: i64) -> BoxFuture<'_, DomainResult<()>> {
        Box::pin(async move {
            self.check_write()?;
            if let Some(account) = self.state.write().await.accounts.get_mut(&account_id) {
                account.common.soft_delete(now());
            }
            Ok(())
        })
    }
}

impl AccountUserStore for InMemoryStores {
    fn create(&self, user: &AccountUser) -> BoxFuture<'_, DomainResult<AccountUser>> {
        let mut user = user.clone();
        Box::pin(async move {
            self.check_write()?;
            if user.public_id.is_empty() {
                return Err(DomainError::Validation("account user without public id".into()));
            }
            let mut state = self.state.write().await;
            let key = (user.account_id, user.public_id.clone());
            if let Some(existing) = state.account_users.get(&key) {
                return Ok(existing.clone());
            }
            let email_taken = !user.profile.email.is_empty()
                && state.account_users.values().any(|other| {
                    other.account_id == user.account_id
                        && other.profile.email.eq_ignore_ascii_case(&user.profile.email)
                });
            if email_taken {
                return Err(DomainError::Conflict);
            }
            state.next_account_user_id += 1;
            user.account_user_id = state.next_account_user_id;
            user.common.stamp_created(now());
            state.account_users.insert(key, user.clone());
            Ok(user)
        })
    }

    fn read(
        &self,
        account_id: i64,
        public_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<AccountUser>>> {
        let key = (account_id, public_id.to_string());
        Box::pin(async move { Ok(self.state.read().await.account_users.get(&key).cloned()) })
    }

    fn update(&self, user: &AccountUser) -> BoxFuture<'_, DomainResult<AccountUser>> {
        let user = user.clone();
        Box::pin(async move {
            self.check_write()?;
            let mut state = self.state.write().await;
            let stored = state
                .account_users
                .get_mut(&(user.account_id, user.public_id.clone()))
                .ok_or(DomainError::NotFound)?;
            *stored = user.clone();
            Ok(user)
        })
    }

    fn delete(&self, account_id: i64, public_id: &str) -> BoxFuture<'_, DomainResult<()>> {
        let key = (account_id, public_id.to_string());
        Box::pin(async move {
            self.check_write()?;
            if let Some(user) = self.state.write().await.account_users.get_mut(&key) {
                user.common.soft_delete(now());
            }
            Ok(())
        })
    }

    fn destroy_sessions(
        &self,
        account_id: i64,
        public_id: &str,
    ) -> BoxFuture<'_, DomainResult<u64>> {
        let key = (account_id, public_id.to_string());
        Box::pin(async move {
            self.check_write()?;
            Ok(self
                .state
                .write()
                .await
                .account_sessions
                .remove(&key)
                .unwrap_or_default())
        })
    }
}

impl ApplicationStore for InMemoryStores {
    fn create(&self, application: &Application) -> BoxFuture<'_, DomainResult<Application>> {
        let mut application = application.clone();
        Box::pin(async move {
            self.check_write()?;
            let tenant = application.tenant();
            let mut state = self.state.write().await;
            if let Some(existing) = state.applications.get(&tenant) {
                return Ok(existing.clone());
            }
            application.common.stamp_created(now());
            state.applications.insert(tenant, application.clone());
            state.tenants.insert(tenant);
            Ok(application)
        })
    }

    fn read(&self, tenant: Tenant) -> BoxFuture<'_, DomainResult<Option<Application>>> {
        Box::pin(async move { Ok(self.state.read().await.applications.get(&tenant).cloned()) })
    }

    fn update(&self, application: &Application) -> BoxFuture<'_, DomainResult<Application>> {
        let application = application.clone();
        Box::pin(async move {
            self.check_write()?;
            let mut state = self.state.write().await;
            let stored = state
                .applications
                .get_mut(&application.tenant())
                .ok_or(DomainError::NotFound)?;
            *stored = application.clone();
            Ok(application)
        })
    }

    fn delete(&self, tenant: Tenant) -> BoxFuture<'_, DomainResult<()>> {
        Box::pin(async move {
            self.check_write()?;
            if let Some(application) = self.state.write().await.applications.get_mut(&tenant) {
                application.common.soft_delete(now());
            }
            Ok(())
        })
    }
}

impl ApplicationUserStore for InMemoryStores {
    fn create(&self, user: &ApplicationUser) -> BoxFuture<'_, DomainResult<ApplicationUser>> {
        let mut user = user.clone();
        Box::pin(async move {
            self.check_write()?;
            if user.id == 0 {
                return Err(DomainError::Validation("application user without id".into()));
            }
            let tenant = user.tenant();
            let mut state = self.state.write().await;
            state.require_tenant(tenant)?;
            if let Some(existing) = state.application_users.get(&(tenant, user.id)) {
                return Ok(existing.clone());
            }
            user.common.stamp_created(now());
            state.application_users.insert((tenant, user.id), user.clone());
            Ok(user)
        })
    }

    fn read(
        &self,
        tenant: Tenant,
        user_id: u64,
    ) -> BoxFuture<'_, DomainResult<Option<ApplicationUser>>> {
        Box::pin(async move {
            let state = self.state.read().await;
            state.require_tenant(tenant)?;
            Ok(state.application_users.get(&(tenant, user_id)).cloned())
        })
    }

    fn update(&self, user: &ApplicationUser) -> BoxFuture<'_, DomainResult<ApplicationUser>> {
        let user = user.clone();
        Box::pin(async move {
            self.check_write()?;
            let tenant = user.tenant();
            let mut state = self.state.write().await;
            state.require_tenant(tenant)?;
            let stored = state
                .application_users
                .get_mut(&(tenant, user.id))
                .ok_or(DomainError::NotFound)?;
            *stored = user.clone();
            Ok(user)
        })
    }

    fn delete(&self, tenant: Tenant, user_id: u64) -> BoxFuture<'_, DomainResult<()>> {
        Box::pin(async move {
            self.check_write()?;
            let mut state = self.state.write().await;
            state.require_tenant(tenant)?;
            if let Some(user) = state.application_users.get_mut(&(tenant, user_id)) {
                user.common.soft_delete(now());
            }
            Ok(())
        })
    }

    fn find_by_social_ids(
        &self,
        tenant: Tenant,
        platform: &str,
        social_ids: &[String],
    ) -> BoxFuture<'_, DomainResult<Vec<ApplicationUser>>> {
        let platform = platform.to_string();
        let wanted: HashSet<String> = social_ids.iter().cloned().collect();
        Box::pin(async move {
            let state = self.state.read().await;
            state.require_tenant(tenant)?;
            let mut users: Vec<_> = state
                .application_users
                .iter()
                .filter(|((owner, _), user)| {
                    *owner == tenant
                        && !user.common.deleted
                        && user
                            .social_ids
                            .get(&platform)
                            .is_some_and(|id| wanted.contains(id))
                })
                .map(|(_, user)| user.clone())
                .collect();
            users.sort_by_key(|user| user.id);
            Ok(users)
        })
    }

    fn destroy_sessions(&self, tenant: Tenant, user_id: u64) -> BoxFuture<'_, DomainResult<u64>> {
        Box::pin(async move {
            self.check_write()?;
            let mut state = self.state.write().await;
            state.require_tenant(tenant)?;
            Ok(state
                .user_sessions
                .remove(&(tenant, user_id))
                .unwrap_or_default())
        })
    }
}

impl ConnectionStore for InMemoryStores {
    fn create(&self, connection: &Connection) -> BoxFuture<'_, DomainResult<Connection>> {
        let mut connection = connection.clone().normalized();
        Box::pin(async move {
            self.check_write()?;
            let tenant = connection.tenant();
            let mut state = self.state.write().await;
            state.require_tenant(tenant)?;
            let key = (tenant, connection.key());
            if let Some(existing) = state.connections.get(&key) {
                return Ok(existing.clone());
            }
            connection.common.stamp_created(now());
            state.connections.insert(key, connection.clone());
            Ok(connection)
        })
    }

    fn read(
        &self,
        tenant: Tenant,
        key: ConnectionKey,
    ) -> BoxFuture<'_, DomainResult<Option<Connection>>> {
        Box::pin(async move {
            let state = self.state.read().await;
            state.require_tenant(tenant)?;
            Ok(state.connections.get(&(tenant, key)).cloned())
        })
    }

    fn update(&self, connection: &Connection) -> BoxFuture<'_, DomainResult<Connection>> {
        let connection = connection.clone().normalized();
        Box::pin(async move {
            self.check_write()?;
            let tenant = connection.tenant();
            let mut state = self.state.write().await;
            state.require_tenant(tenant)?;
            let stored = state
                .connections
                .get_mut(&(tenant, connection.key()))
                .ok_or(DomainError::NotFound)?;
            *stored = connection.clone();
            Ok(connection)
        })
    }

    fn delete(&self, tenant: Tenant, key: ConnectionKey) -> BoxFuture<'_, DomainResult<()>> {
        Box::pin(async move {
            self.check_write()?;
            let mut state = self.state.write().await;
            state.require_tenant(tenant)?;
            if let Some(connection) = state.connections.get_mut(&(tenant, key)) {
                connection.common.soft_delete(now());
            }
            Ok(())
        })
    }
}

impl EventStore for InMemoryStores {
    fn create(&self, event: &Event) -> BoxFuture<'_, DomainResult<Event>> {
        let mut event = event.clone();
        Box::pin(async move {
            self.check_write()?;
            if event.id == 0 {
                return Err(DomainError::Validation("event without id".into()));
            }
            let tenant = event.tenant();
            let mut state = self.state.write().await;
            state.require_tenant(tenant)?;
            let key = (tenant, event.user_id, event.id);
            if let Some(existing) = state.events.get(&key) {
                return Ok(existing.clone());
            }
            event.common.stamp_created(now());
            state.events.insert(key, event.clone());
            Ok(event)
        })
    }

    fn read(
        &self,
        tenant: Tenant,
        user_id: u64,
        event_id: u64,
    ) -> BoxFuture<'_, DomainResult<Option<Event>>> {
        Box::pin(async move {
            let state = self.state.read().await;
            state.require_tenant(tenant)?;
            Ok(state.events.get(&(tenant, user_id, event_id)).cloned())
        })
    }

    fn update(&self, event: &Event) -> BoxFuture<'_, DomainResult<Event>> {
        let event = event.clone();
        Box::pin(async move {
            self.check_write()?;
            let tenant = event.tenant();
            let mut state = self.state.write().await;
            state.require_tenant(tenant)?;
            let stored = state
                .events
                .get_mut(&(tenant, event.user_id, event.id))
                .ok_or(DomainError::NotFound)?;
            *stored = event.clone();
            Ok(event)
        })
    }

    fn delete(&self, tenant: Tenant, user_id: u64, event_id: u64) -> BoxFuture<'_, DomainResult<()>> {
        Box::pin(async move {
            self.check_write()?;
            let mut state = self.state.write().await;
            state.require_tenant(tenant)?;
            if let Some(event) = state.events.get_mut(&(tenant, user_id, event_id)) {
                event.common.soft_delete(now());
            }
            Ok(())
        })
    }
}
