use std::sync::Arc;

use super::BoxFuture;
use crate::DomainResult;
use crate::entities::{
    Account, AccountUser, Application, ApplicationUser, Connection, ConnectionKey, Event, Tenant,
};

// `create` is idempotent on the natural key and hands back the stored entity.
// `delete` is a soft delete and succeeds when the entity is already gone.

pub trait AccountStore: Send + Sync {
    fn create(&self, account: &Account) -> BoxFuture<'_, DomainResult<Account>>;
    fn read(&self, account_id: i64) -> BoxFuture<'_, DomainResult<Option<Account>>>;
    fn update(&self, account: &Account) -> BoxFuture<'_, DomainResult<Account>>;
    fn delete(&self, account_id: i64) -> BoxFuture<'_, DomainResult<()>>;
}

pub trait AccountUserStore: Send + Sync {
    fn create(&self, user: &AccountUser) -> BoxFuture<'_, DomainResult<AccountUser>>;
    fn read(
        &self,
        account_id: i64,
        public_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<AccountUser>>>;
    fn update(&self, user: &AccountUser) -> BoxFuture<'_, DomainResult<AccountUser>>;
    fn delete(&self, account_id: i64, public_id: &str) -> BoxFuture<'_, DomainResult<()>>;
    fn destroy_sessions(
        &self,
        account_id: i64,
        public_id: &str,
    ) -> BoxFuture<'_, DomainResult<u64>>;
}

pub trait ApplicationStore: Send + Sync {
    /// Also provisions the tenant namespace of the application.
    fn create(&self, application: &Application) -> BoxFuture<'_, DomainResult<Application>>;
    fn read(&self, tenant: Tenant) -> BoxFuture<'_, DomainResult<Option<Application>>>;
    fn update(&self, application: &Application) -> BoxFuture<'_, DomainResult<Application>>;
    fn delete(&self, tenant: Tenant) -> BoxFuture<'_, DomainResult<()>>;
}

pub trait ApplicationUserStore: Send + Sync {
    fn create(&self, user: &ApplicationUser) -> BoxFuture<'_, DomainResult<ApplicationUser>>;
    fn read(
        &self,
        tenant: Tenant,
        user_id: u64,
    ) -> BoxFuture<'_, DomainResult<Option<ApplicationUser>>>;
    fn update(&self, user: &ApplicationUser) -> BoxFuture<'_, DomainResult<ApplicationUser>>;
    fn delete(&self, tenant: Tenant, user_id: u64) -> BoxFuture<'_, DomainResult<()>>;
    /// Users whose `social_ids[platform]` is one of `social_ids`.
    fn find_by_social_ids(
        &self,
        tenant: Tenant,
        platform: &str,
        social_ids: &[String],
    ) -> BoxFuture<'_, DomainResult<Vec<ApplicationUser>>>;
    fn destroy_sessions(&self, tenant: Tenant, user_id: u64) -> BoxFuture<'_, DomainResult<u64>>;
}

pub trait ConnectionStore: Send + Sync {
    fn create(&self, connection: &Connection) -> BoxFuture<'_, DomainResult<Connection>>;
    fn read(
        &self,
        tenant: Tenant,
        key: ConnectionKey,
    ) -> BoxFuture<'_, DomainResult<Option<Connection>>>;
    fn update(&self, connection: &Connection) -> BoxFuture<'_, DomainResult<Connection>>;
    fn delete(&self, tenant: Tenant, key: ConnectionKey) -> BoxFuture<'_, DomainResult<()>>;
}

pub trait EventStore: Send + Sync {
    /// Maintains the geospatial point when latitude and longitude are set.
    fn create(&self, event: &Event) -> BoxFuture<'_, DomainResult<Event>>;
    fn read(
        &self,
        tenant: Tenant,
        user_id: u64,
        event_id: u64,
    ) -> BoxFuture<'_, DomainResult<Option<Event>>>;
    fn update(&self, event: &Event) -> BoxFuture<'_, DomainResult<Event>>;
    fn delete(&self, tenant: Tenant, user_id: u64, event_id: u64) -> BoxFuture<'_, DomainResult<()>>;
}

/// Store façade handed to the appliers.
#[derive(Clone)]
pub struct Stores {
    pub accounts: Arc<dyn AccountStore>,
    pub account_users: Arc<dyn AccountUserStore>,
    pub applications: Arc<dyn ApplicationStore>,
    pub application_users: Arc<dyn ApplicationUserStore>,
    pub connections: Arc<dyn ConnectionStore>,
    pub events: Arc<dyn EventStore>,
}
