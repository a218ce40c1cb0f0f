use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::entities::{
    Account, AccountUser, Application, ApplicationUser, Common, Connection, ConnectionType, Event,
    Tenant,
};
use crate::envelope::DecodeError;
use crate::error::DomainError;
use crate::ports::store::Stores;
use crate::util::{hash_password, public_id, resolve_password};

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("malformed {channel} payload: {source}")]
    Payload {
        channel: Channel,
        source: serde_json::Error,
    },
    #[error("{0} payload carries no id")]
    MissingId(Channel),
    #[error(transparent)]
    Store(#[from] DomainError),
}

/// What the dispatcher does with a record whose apply failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Apply the same record again; the cursor stays behind it.
    Retry,
    /// Log and move on; the cursor may pass the record.
    Skip,
    /// Stop consuming.
    Fatal,
}

impl ApplyError {
    pub fn disposition(&self) -> Disposition {
        match self {
            ApplyError::Decode(_) | ApplyError::Payload { .. } | ApplyError::MissingId(_) => {
                Disposition::Skip
            }
            ApplyError::Store(err) if err.is_transient() => Disposition::Retry,
            ApplyError::Store(_) => Disposition::Skip,
        }
    }

    /// Short label used in logs and metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            ApplyError::Decode(DecodeError::UnknownChannel(_)) => "unknown_channel",
            ApplyError::Decode(_) | ApplyError::Payload { .. } => "decode",
            ApplyError::MissingId(_) => "missing_id",
            ApplyError::Store(DomainError::Validation(_)) => "validation",
            ApplyError::Store(DomainError::Conflict) => "conflict",
            ApplyError::Store(DomainError::UnknownTenant(_)) => "unknown_tenant",
            ApplyError::Store(DomainError::Unavailable(_)) => "store_unavailable",
            ApplyError::Store(_) => "store",
        }
    }
}

trait HasCommon {
    fn common(&self) -> &Common;
    fn common_mut(&mut self) -> &mut Common;
}

macro_rules! has_common {
    ($($entity:ty),*) => {
        $(impl HasCommon for $entity {
            fn common(&self) -> &Common {
                &self.common
            }

            fn common_mut(&mut self) -> &mut Common {
                &mut self.common
            }
        })*
    };
}

has_common!(Account, AccountUser, Application, ApplicationUser, Connection, Event);

// Fields an update payload never overwrites: identity, ownership and
// lifecycle bookkeeping.
const PROTECTED_FIELDS: &[&str] = &[
    "account_id",
    "application_id",
    "account_user_id",
    "id",
    "user_id",
    "user_from_id",
    "user_to_id",
    "type",
    "password",
    "created_at",
    "updated_at",
    "deleted",
];

#[derive(Clone, Debug, Default, serde::Deserialize)]
struct AutoConnectPayload {
    user: ApplicationUser,
    #[serde(rename = "type")]
    kind: Option<ConnectionType>,
    #[serde(default)]
    our_stored_users_ids: Vec<u64>,
}

#[derive(Clone, Debug, Default, serde::Deserialize)]
struct SocialConnectPayload {
    user: ApplicationUser,
    platform: String,
    #[serde(default)]
    social_friends_ids: Vec<String>,
    #[serde(rename = "type")]
    kind: Option<ConnectionType>,
}

/// Outcome of one applier call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Applied {
    Written,
    /// The store already reflected the record, or its target is gone.
    Unchanged,
}

/// One applier per channel over the store façade. Creates carry the id
/// assigned at publish time, so redelivery finds the entity it wrote.
#[derive(Clone)]
pub struct ApplierSet {
    stores: Stores,
}

impl ApplierSet {
    pub fn new(stores: Stores) -> Self {
        Self { stores }
    }

    pub async fn dispatch(&self, channel: Channel, payload: &str) -> Result<Applied, ApplyError> {
        match channel {
            Channel::AccountUpdate => self.account_update(channel, payload).await,
            Channel::AccountDelete => self.account_delete(channel, payload).await,
            Channel::AccountUserCreate => self.account_user_create(channel, payload).await,
            Channel::AccountUserUpdate => self.account_user_update(channel, payload).await,
            Channel::AccountUserDelete => self.account_user_delete(channel, payload).await,
            Channel::ApplicationCreate => self.application_create(channel, payload).await,
            Channel::ApplicationUpdate => self.application_update(channel, payload).await,
            Channel::ApplicationDelete => self.application_delete(channel, payload).await,
            Channel::ApplicationUserUpdate => {
                self.application_user_update(channel, payload).await
            }
            Channel::ApplicationUserDelete => {
                self.application_user_delete(channel, payload).await
            }
            Channel::ConnectionCreate => self.connection_create(channel, payload).await,
            Channel::ConnectionConfirm => self.connection_confirm(channel, payload).await,
            Channel::ConnectionUpdate => self.connection_update(channel, payload).await,
            Channel::ConnectionAutoConnect => self.connection_auto_connect(channel, payload).await,
            Channel::ConnectionSocialConnect => {
                self.connection_social_connect(channel, payload).await
            }
            Channel::ConnectionDelete => self.connection_delete(channel, payload).await,
            Channel::EventCreate => self.event_create(channel, payload).await,
            Channel::EventUpdate => self.event_update(channel, payload).await,
            Channel::EventDelete => self.event_delete(channel, payload).await,
        }
    }

    async fn account_update(&self, channel: Channel, payload: &str) -> Result<Applied, ApplyError> {
        let (account, patch) = decode::<Account>(channel, payload)?;
        let Some(current) = self.stores.accounts.read(account.account_id).await? else {
            return Ok(ignore_vanished(channel));
        };
        let Some(merged) = merge_update(channel, &current, &patch)? else {
            return Ok(Applied::Unchanged);
        };
        self.stores.accounts.update(&merged).await?;
        Ok(Applied::Written)
    }

    async fn account_delete(&self, channel: Channel, payload: &str) -> Result<Applied, ApplyError> {
        let (account, _) = decode::<Account>(channel, payload)?;
        self.stores.accounts.delete(account.account_id).await?;
        Ok(Applied::Written)
    }

    async fn account_user_create(
        &self,
        channel: Channel,
        payload: &str,
    ) -> Result<Applied, ApplyError> {
        let (mut user, _) = decode::<AccountUser>(channel, payload)?;
        if user.public_id.is_empty() {
            user.public_id = public_id(&user.public_id_seed());
        }
        if self
            .stores
            .account_users
            .read(user.account_id, &user.public_id)
            .await?
            .is_some()
        {
            return Ok(Applied::Unchanged);
        }
        if !user.profile.password.is_empty() {
            user.profile.password = hash_password(&user.profile.password);
        }
        user.common.enabled = true;
        self.stores.account_users.create(&user).await?;
        Ok(Applied::Written)
    }

    async fn account_user_update(
        &self,
        channel: Channel,
        payload: &str,
    ) -> Result<Applied, ApplyError> {
        let (user, patch) = decode::<AccountUser>(channel, payload)?;
        let Some(current) = self
            .stores
            .account_users
            .read(user.account_id, &user.public_id)
            .await?
        else {
            return Ok(ignore_vanished(channel));
        };
        let password = resolve_password(&user.profile.password, &current.profile.password);
        let Some(merged) = merge_update_with(channel, &current, &patch, |merged: &mut AccountUser| {
            merged.profile.password = password;
        })?
        else {
            return Ok(Applied::Unchanged);
        };
        self.stores.account_users.update(&merged).await?;
        Ok(Applied::Written)
    }

    async fn account_user_delete(
        &self,
        channel: Channel,
        payload: &str,
    ) -> Result<Applied, ApplyError> {
        let (user, _) = decode::<AccountUser>(channel, payload)?;
        self.stores
            .account_users
            .delete(user.account_id, &user.public_id)
            .await?;
        if let Err(err) = self
            .stores
            .account_users
            .destroy_sessions(user.account_id, &user.public_id)
            .await
        {
            warn!(
                account_id = user.account_id,
                user_id = %user.public_id,
                error = %err,
                "failed to destroy account user sessions"
            );
        }
        Ok(Applied::Written)
    }

    async fn application_create(
        &self,
        channel: Channel,
        payload: &str,
    ) -> Result<Applied, ApplyError> {
        let (mut application, _) = decode::<Application>(channel, payload)?;
        if application.application_id == 0 {
            return Err(ApplyError::MissingId(channel));
        }
        if self
            .stores
            .applications
            .read(application.tenant())
            .await?
            .is_some()
        {
            return Ok(Applied::Unchanged);
        }
        if application.public_id.is_empty() {
            application.public_id = public_id(&format!(
                "{}:{}",
                application.account_id, application.application_id
            ));
        }
        application.common.enabled = true;
        self.stores.applications.create(&application).await?;
        Ok(Applied::Written)
    }

    async fn application_update(
        &self,
        channel: Channel,
        payload: &str,
    ) -> Result<Applied, ApplyError> {
        let (application, patch) = decode::<Application>(channel, payload)?;
        let Some(current) = self.stores.applications.read(application.tenant()).await? else {
            return Ok(ignore_vanished(channel));
        };
        let Some(merged) = merge_update(channel, &current, &patch)? else {
            return Ok(Applied::Unchanged);
        };
        self.stores.applications.update(&merged).await?;
        Ok(Applied::Written)
    }

    async fn application_delete(
        &self,
        channel: Channel,
        payload: &str,
    ) -> Result<Applied, ApplyError> {
        let (application, _) = decode::<Application>(channel, payload)?;
        self.stores.applications.delete(application.tenant()).await?;
        Ok(Applied::Written)
    }

    async fn application_user_update(
        &self,
        channel: Channel,
        payload: &str,
    ) -> Result<Applied, ApplyError> {
        let (user, patch) = decode::<ApplicationUser>(channel, payload)?;
        let Some(current) = self
            .stores
            .application_users
            .read(user.tenant(), user.id)
            .await?
        else {
            return Ok(ignore_vanished(channel));
        };
        let password = resolve_password(&user.profile.password, &current.profile.password);
        let Some(merged) =
            merge_update_with(channel, &current, &patch, |merged: &mut ApplicationUser| {
                merged.profile.password = password;
            })?
        else {
            return Ok(Applied::Unchanged);
        };
        self.stores.application_users.update(&merged).await?;
        Ok(Applied::Written)
    }

    async fn application_user_delete(
        &self,
        channel: Channel,
        payload: &str,
    ) -> Result<Applied, ApplyError> {
        let (user, _) = decode::<ApplicationUser>(channel, payload)?;
        let tenant = user.tenant();
        self.stores.application_users.delete(tenant, user.id).await?;
        if let Err(err) = self
            .stores
            .application_users
            .destroy_sessions(tenant, user.id)
            .await
        {
            warn!(
                account_id = tenant.account_id,
                application_id = tenant.application_id,
                user_id = user.id,
                error = %err,
                "failed to destroy application user sessions"
            );
        }
        Ok(Applied::Written)
    }

    async fn connection_create(
        &self,
        channel: Channel,
        payload: &str,
    ) -> Result<Applied, ApplyError> {
        let (connection, _) = decode::<Connection>(channel, payload)?;
        self.create_connection(connection).await
    }

    async fn create_connection(&self, connection: Connection) -> Result<Applied, ApplyError> {
        let connection = connection.normalized();
        let tenant = connection.tenant();
        match self.stores.connections.read(tenant, connection.key()).await? {
            None => {
                self.stores.connections.create(&connection).await?;
                Ok(Applied::Written)
            }
            Some(mut existing) => {
                let revive = existing.common.deleted
                    || (!existing.common.enabled && connection.common.enabled);
                if !revive {
                    return Ok(Applied::Unchanged);
                }
                existing.common.deleted = false;
                existing.common.enabled = connection.common.enabled;
                existing.common.updated_at = Some(OffsetDateTime::now_utc());
                self.stores.connections.update(&existing).await?;
                Ok(Applied::Written)
            }
        }
    }

    async fn connection_confirm(
        &self,
        channel: Channel,
        payload: &str,
    ) -> Result<Applied, ApplyError> {
        let (connection, _) = decode::<Connection>(channel, payload)?;
        self.confirm_connection(connection).await
    }

    async fn confirm_connection(&self, connection: Connection) -> Result<Applied, ApplyError> {
        let connection = connection.normalized();
        let confirmed_at = connection
            .confirmed_at
            .unwrap_or_else(OffsetDateTime::now_utc);
        match self
            .stores
            .connections
            .read(connection.tenant(), connection.key())
            .await?
        {
            None => {
                let mut created = connection;
                created.confirmed_at = Some(confirmed_at);
                created.common.enabled = true;
                self.stores.connections.create(&created).await?;
                Ok(Applied::Written)
            }
            Some(existing)
                if existing.confirmed_at.is_some()
                    && existing.common.enabled
                    && !existing.common.deleted =>
            {
                Ok(Applied::Unchanged)
            }
            Some(mut existing) => {
                existing.confirmed_at = existing.confirmed_at.or(Some(confirmed_at));
                existing.common.enabled = true;
                existing.common.deleted = false;
                existing.common.updated_at = Some(OffsetDateTime::now_utc());
                self.stores.connections.update(&existing).await?;
                Ok(Applied::Written)
            }
        }
    }

    async fn connection_update(
        &self,
        channel: Channel,
        payload: &str,
    ) -> Result<Applied, ApplyError> {
        let (connection, patch) = decode::<Connection>(channel, payload)?;
        let Some(current) = self
            .stores
            .connections
            .read(connection.tenant(), connection.key())
            .await?
        else {
            return Ok(ignore_vanished(channel));
        };
        let Some(merged) = merge_update(channel, &current, &patch)? else {
            return Ok(Applied::Unchanged);
        };
        self.stores.connections.update(&merged).await?;
        Ok(Applied::Written)
    }

    async fn connection_delete(
        &self,
        channel: Channel,
        payload: &str,
    ) -> Result<Applied, ApplyError> {
        let (connection, _) = decode::<Connection>(channel, payload)?;
        self.stores
            .connections
            .delete(connection.tenant(), connection.key())
            .await?;
        Ok(Applied::Written)
    }

    async fn connection_auto_connect(
        &self,
        channel: Channel,
        payload: &str,
    ) -> Result<Applied, ApplyError> {
        let (request, _) = decode::<AutoConnectPayload>(channel, payload)?;
        let kind = request
            .kind
            .or(request.user.social_connection_type)
            .unwrap_or(ConnectionType::Friend);
        self.connect_pairs(&request.user, kind, &request.our_stored_users_ids)
            .await
    }

    async fn connection_social_connect(
        &self,
        channel: Channel,
        payload: &str,
    ) -> Result<Applied, ApplyError> {
        let (request, _) = decode::<SocialConnectPayload>(channel, payload)?;
        let kind = request
            .kind
            .or(request.user.social_connection_type)
            .unwrap_or(ConnectionType::Friend);
        if request.social_friends_ids.is_empty() {
            return Ok(Applied::Unchanged);
        }
        let friends = self
            .stores
            .application_users
            .find_by_social_ids(
                request.user.tenant(),
                &request.platform,
                &request.social_friends_ids,
            )
            .await?;
        let friend_ids: Vec<u64> = friends.iter().map(|friend| friend.id).collect();
        debug!(
            user_id = request.user.id,
            platform = %request.platform,
            matched = friend_ids.len(),
            "social connect resolved friends"
        );
        self.connect_pairs(&request.user, kind, &friend_ids).await
    }

    /// Creates and confirms one connection per `(user, friend)` pair.
    async fn connect_pairs(
        &self,
        user: &ApplicationUser,
        kind: ConnectionType,
        friend_ids: &[u64],
    ) -> Result<Applied, ApplyError> {
        let mut outcome = Applied::Unchanged;
        for &friend_id in friend_ids {
            if friend_id == user.id {
                continue;
            }
            let connection = Connection {
                account_id: user.account_id,
                application_id: user.application_id,
                user_from_id: user.id,
                user_to_id: friend_id,
                kind,
                confirmed_at: None,
                common: Common {
                    enabled: true,
                    ..Common::default()
                },
            };
            if self.create_connection(connection.clone()).await? == Applied::Written {
                outcome = Applied::Written;
            }
            if self.confirm_connection(connection).await? == Applied::Written {
                outcome = Applied::Written;
            }
        }
        Ok(outcome)
    }

    async fn event_create(&self, channel: Channel, payload: &str) -> Result<Applied, ApplyError> {
        let (event, _) = decode::<Event>(channel, payload)?;
        if event.id == 0 {
            return Err(ApplyError::MissingId(channel));
        }
        if self
            .stores
            .events
            .read(event.tenant(), event.user_id, event.id)
            .await?
            .is_some()
        {
            return Ok(Applied::Unchanged);
        }
        self.stores.events.create(&event).await?;
        Ok(Applied::Written)
    }

    async fn event_update(&self, channel: Channel, payload: &str) -> Result<Applied, ApplyError> {
        let (event, patch) = decode::<Event>(channel, payload)?;
        let Some(current) = self
            .stores
            .events
            .read(event.tenant(), event.user_id, event.id)
            .await?
        else {
            return Ok(ignore_vanished(channel));
        };
        let Some(merged) = merge_update(channel, &current, &patch)? else {
            return Ok(Applied::Unchanged);
        };
        self.stores.events.update(&merged).await?;
        Ok(Applied::Written)
    }

    async fn event_delete(&self, channel: Channel, payload: &str) -> Result<Applied, ApplyError> {
        let (event, _) = decode::<Event>(channel, payload)?;
        self.stores
            .events
            .delete(event.tenant(), event.user_id, event.id)
            .await?;
        Ok(Applied::Written)
    }
}

fn decode<T: DeserializeOwned>(channel: Channel, payload: &str) -> Result<(T, Value), ApplyError> {
    let patch: Value = serde_json::from_str(payload)
        .map_err(|source| ApplyError::Payload { channel, source })?;
    let entity = serde_json::from_value(patch.clone())
        .map_err(|source| ApplyError::Payload { channel, source })?;
    Ok((entity, patch))
}

fn ignore_vanished(channel: Channel) -> Applied {
    debug!(%channel, "update target is gone, ignoring");
    Applied::Unchanged
}

fn merge_update<T>(channel: Channel, current: &T, patch: &Value) -> Result<Option<T>, ApplyError>
where
    T: Serialize + DeserializeOwned + PartialEq + HasCommon,
{
    merge_update_with(channel, current, patch, |_| {})
}

/// Read-modify-write merge: payload fields overwrite the stored document
/// except for protected ones. Returns `None` when the merge changes nothing,
/// or when the stored entity is soft deleted.
fn merge_update_with<T, F>(
    channel: Channel,
    current: &T,
    patch: &Value,
    finish: F,
) -> Result<Option<T>, ApplyError>
where
    T: Serialize + DeserializeOwned + PartialEq + HasCommon,
    F: FnOnce(&mut T),
{
    if current.common().deleted {
        return Ok(None);
    }
    let mut document = serde_json::to_value(current)
        .map_err(|err| DomainError::Corrupt(err.to_string()))?;
    if let (Value::Object(target), Value::Object(fields)) = (&mut document, patch) {
        for (key, value) in fields {
            if !PROTECTED_FIELDS.contains(&key.as_str()) {
                target.insert(key.clone(), value.clone());
            }
        }
    }
    let mut merged: T =
        serde_json::from_value(document).map_err(|source| ApplyError::Payload { channel, source })?;
    finish(&mut merged);
    if merged == *current {
        return Ok(None);
    }
    merged.common_mut().updated_at = Some(OffsetDateTime::now_utc());
    Ok(Some(merged))
}

/// Tenant of a record payload, when it carries one.
pub fn payload_tenant(payload: &str) -> Option<Tenant> {
    let value: Value = serde_json::from_str(payload).ok()?;
    let object = value.get("user").unwrap_or(&value);
    let account_id = object.get("account_id")?.as_i64()?;
    let application_id = object.get("application_id")?.as_i64()?;
    Some(Tenant::new(account_id, application_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStores;
    use crate::util::verify_password;
    use serde_json::json;

    fn setup() -> (InMemoryStores, ApplierSet) {
        let memory = InMemoryStores::new();
        let appliers = ApplierSet::new(memory.stores());
        (memory, appliers)
    }

    fn tenant() -> Tenant {
        Tenant::new(1, 1)
    }

    async fn seed_user(memory: &InMemoryStores, id: u64, facebook: &str) {
        let user: ApplicationUser = serde_json::from_value(json!({
            "account_id": 1,
            "application_id": 1,
            "id": id,
            "user_name": format!("user-{id}"),
            "social_ids": {"facebook": facebook},
            "enabled": true
        }))
        .unwrap();
        memory.stores().application_users.create(&user).await.unwrap();
    }

    #[tokio::test]
    async fn account_user_create_hashes_password_and_is_idempotent() {
        let (memory, appliers) = setup();
        let payload = r#"{"account_id":1,"user_name":"alice","email":"a@x","password":"p"}"#;

        let first = appliers
            .dispatch(Channel::AccountUserCreate, payload)
            .await
            .unwrap();
        let second = appliers
            .dispatch(Channel::AccountUserCreate, payload)
            .await
            .unwrap();
        assert_eq!(first, Applied::Written);
        assert_eq!(second, Applied::Unchanged);

        let users = memory.all_account_users().await;
        assert_eq!(users.len(), 1);
        assert_ne!(users[0].profile.password, "p");
        assert!(verify_password("p", &users[0].profile.password).unwrap());
        assert_eq!(users[0].public_id, public_id("1:a@x"));
    }

    #[tokio::test]
    async fn account_user_update_keeps_hash_for_same_password() {
        let (memory, appliers) = setup();
        appliers
            .dispatch(
                Channel::AccountUserCreate,
                r#"{"account_id":1,"user_name":"alice","email":"a@x","password":"p"}"#,
            )
            .await
            .unwrap();
        let stored = memory.all_account_users().await.remove(0);
        let update = json!({
            "account_id": 1,
            "id": stored.public_id,
            "first_name": "Alice",
            "password": "p"
        })
        .to_string();

        appliers
            .dispatch(Channel::AccountUserUpdate, &update)
            .await
            .unwrap();
        let updated = memory.all_account_users().await.remove(0);
        assert_eq!(updated.profile.first_name, "Alice");
        assert_eq!(updated.profile.password, stored.profile.password);
        assert!(updated.common.updated_at >= stored.common.updated_at);
    }

    #[tokio::test]
    async fn update_of_missing_entity_is_ignored() {
        let (memory, appliers) = setup();
        memory.register_tenant(tenant()).await;
        let outcome = appliers
            .dispatch(
                Channel::EventUpdate,
                r#"{"account_id":1,"application_id":1,"id":7,"user_id":3,"verb":"x"}"#,
            )
            .await
            .unwrap();
        assert_eq!(outcome, Applied::Unchanged);
        assert!(memory.all_events(tenant()).await.is_empty());
    }

    #[tokio::test]
    async fn event_update_merges_fields_and_protects_identity() {
        let (memory, appliers) = setup();
        memory.register_tenant(tenant()).await;
        appliers
            .dispatch(
                Channel::EventCreate,
                r#"{"account_id":1,"application_id":1,"id":100,"user_id":3,"verb":"like","language":"en"}"#,
            )
            .await
            .unwrap();
        appliers
            .dispatch(
                Channel::EventUpdate,
                r#"{"account_id":1,"application_id":1,"id":100,"user_id":3,"verb":"liked","created_at":"2001-01-01T00:00:00Z"}"#,
            )
            .await
            .unwrap();

        let events = memory.all_events(tenant()).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].verb, "liked");
        assert_eq!(events[0].language, "en");
        assert!(events[0].common.updated_at > events[0].common.created_at);
        assert_ne!(
            events[0].common.created_at.unwrap().year(),
            2001,
            "created_at must not be overwritten"
        );
    }

    #[tokio::test]
    async fn creates_without_an_id_are_skipped() {
        let (memory, appliers) = setup();
        memory.register_tenant(tenant()).await;
        for _ in 0..3 {
            let err = appliers
                .dispatch(
                    Channel::EventCreate,
                    r#"{"account_id":1,"application_id":1,"user_id":3,"verb":"like"}"#,
                )
                .await
                .unwrap_err();
            assert_eq!(err.reason(), "missing_id");
            assert_eq!(err.disposition(), Disposition::Skip);
        }
        assert!(memory.all_events(tenant()).await.is_empty());

        let err = appliers
            .dispatch(Channel::ApplicationCreate, r#"{"account_id":1,"name":"app"}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, ApplyError::MissingId(Channel::ApplicationCreate)));
    }

    #[tokio::test]
    async fn redelivered_creates_write_once() {
        let (memory, appliers) = setup();
        let application = r#"{"account_id":1,"application_id":1,"name":"app"}"#;
        let event = r#"{"account_id":1,"application_id":1,"id":100,"user_id":3,"verb":"like"}"#;

        let mut outcomes = Vec::new();
        for _ in 0..3 {
            outcomes.push(
                appliers
                    .dispatch(Channel::ApplicationCreate, application)
                    .await
                    .unwrap(),
            );
            outcomes.push(appliers.dispatch(Channel::EventCreate, event).await.unwrap());
        }
        assert_eq!(&outcomes[..2], &[Applied::Written, Applied::Written]);
        assert!(outcomes[2..].iter().all(|outcome| *outcome == Applied::Unchanged));

        assert_eq!(memory.all_events(tenant()).await.len(), 1);
        let stored = memory
            .stores()
            .applications
            .read(tenant())
            .await
            .unwrap()
            .expect("application stored");
        assert_eq!(stored.name, "app");
    }

    #[tokio::test]
    async fn application_user_delete_soft_deletes_and_drops_sessions() {
        let (memory, appliers) = setup();
        memory.register_tenant(tenant()).await;
        seed_user(&memory, 5, "fb-5").await;
        memory.open_session(tenant(), 5).await;
        memory.open_session(tenant(), 5).await;

        appliers
            .dispatch(
                Channel::ApplicationUserDelete,
                r#"{"account_id":1,"application_id":1,"id":5}"#,
            )
            .await
            .unwrap();

        let user = memory
            .stores()
            .application_users
            .read(tenant(), 5)
            .await
            .unwrap()
            .unwrap();
        assert!(user.common.deleted);
        assert!(!user.common.enabled);
        assert_eq!(memory.session_count(tenant(), 5).await, 0);
    }

    #[tokio::test]
    async fn friend_connection_is_one_record_per_pair() {
        let (memory, appliers) = setup();
        memory.register_tenant(tenant()).await;
        appliers
            .dispatch(
                Channel::ConnectionCreate,
                r#"{"account_id":1,"application_id":1,"user_from_id":9,"user_to_id":2,"type":"friend","enabled":true}"#,
            )
            .await
            .unwrap();
        let again = appliers
            .dispatch(
                Channel::ConnectionCreate,
                r#"{"account_id":1,"application_id":1,"user_from_id":2,"user_to_id":9,"type":"friend","enabled":true}"#,
            )
            .await
            .unwrap();
        assert_eq!(again, Applied::Unchanged);

        let connections = memory.all_connections(tenant()).await;
        assert_eq!(connections.len(), 1);
        assert_eq!(
            (connections[0].user_from_id, connections[0].user_to_id),
            (2, 9)
        );
    }

    #[tokio::test]
    async fn confirm_stamps_once() {
        let (memory, appliers) = setup();
        memory.register_tenant(tenant()).await;
        let payload = r#"{"account_id":1,"application_id":1,"user_from_id":1,"user_to_id":2,"type":"follow"}"#;
        appliers
            .dispatch(Channel::ConnectionCreate, payload)
            .await
            .unwrap();
        appliers
            .dispatch(Channel::ConnectionConfirm, payload)
            .await
            .unwrap();
        let confirmed = memory.all_connections(tenant()).await.remove(0);
        assert!(confirmed.confirmed_at.is_some());
        assert!(confirmed.common.enabled);

        let again = appliers
            .dispatch(Channel::ConnectionConfirm, payload)
            .await
            .unwrap();
        assert_eq!(again, Applied::Unchanged);
        assert_eq!(memory.all_connections(tenant()).await.remove(0), confirmed);
    }

    #[tokio::test]
    async fn social_connect_links_matched_users_only() {
        let (memory, appliers) = setup();
        memory.register_tenant(tenant()).await;
        seed_user(&memory, 1, "fb-1").await;
        seed_user(&memory, 2, "fb-2").await;
        seed_user(&memory, 3, "fb-3").await;

        let payload = json!({
            "user": {"account_id": 1, "application_id": 1, "id": 1},
            "platform": "facebook",
            "social_friends_ids": ["fb-2", "fb-3", "fb-unknown"],
            "type": "friend"
        })
        .to_string();
        appliers
            .dispatch(Channel::ConnectionSocialConnect, &payload)
            .await
            .unwrap();
        appliers
            .dispatch(Channel::ConnectionSocialConnect, &payload)
            .await
            .unwrap();

        let connections = memory.all_connections(tenant()).await;
        assert_eq!(connections.len(), 2);
        assert!(
            connections
                .iter()
                .all(|connection| connection.confirmed_at.is_some() && connection.common.enabled)
        );
    }

    #[tokio::test]
    async fn auto_connect_skips_self_pairs() {
        let (memory, appliers) = setup();
        memory.register_tenant(tenant()).await;
        let payload = json!({
            "user": {"account_id": 1, "application_id": 1, "id": 4},
            "type": "follow",
            "our_stored_users_ids": [4, 5, 6]
        })
        .to_string();
        appliers
            .dispatch(Channel::ConnectionAutoConnect, &payload)
            .await
            .unwrap();
        let connections = memory.all_connections(tenant()).await;
        assert_eq!(connections.len(), 2);
        assert!(connections.iter().all(|connection| connection.user_from_id == 4));
    }

    #[tokio::test]
    async fn unknown_tenant_is_skipped() {
        let (_, appliers) = setup();
        let err = appliers
            .dispatch(
                Channel::EventCreate,
                r#"{"account_id":8,"application_id":8,"id":1,"user_id":1}"#,
            )
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "unknown_tenant");
        assert_eq!(err.disposition(), Disposition::Skip);
    }

    #[tokio::test]
    async fn malformed_payload_is_skipped_and_outage_is_retried() {
        let (memory, appliers) = setup();
        let err = appliers
            .dispatch(Channel::ConnectionCreate, "{oops")
            .await
            .unwrap_err();
        assert_eq!(err.disposition(), Disposition::Skip);

        memory.register_tenant(tenant()).await;
        memory.fail_next_writes(1);
        let err = appliers
            .dispatch(
                Channel::EventCreate,
                r#"{"account_id":1,"application_id":1,"id":1,"user_id":1}"#,
            )
            .await
            .unwrap_err();
        assert_eq!(err.disposition(), Disposition::Retry);
    }

    #[test]
    fn payload_tenant_reads_nested_users() {
        assert_eq!(
            payload_tenant(r#"{"user":{"account_id":3,"application_id":4}}"#),
            Some(Tenant::new(3, 4))
        );
        assert_eq!(
            payload_tenant(r#"{"account_id":3,"application_id":4}"#),
            Some(Tenant::new(3, 4))
        );
        assert_eq!(payload_tenant("{}"), None);
    }
}
