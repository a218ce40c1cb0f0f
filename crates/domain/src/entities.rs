use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// `(account_id, application_id)`, the unit of data isolation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tenant {
    pub account_id: i64,
    pub application_id: i64,
}

impl Tenant {
    pub fn new(account_id: i64, application_id: i64) -> Self {
        Self {
            account_id,
            application_id,
        }
    }

    /// Name of the per-tenant namespace, `app_<account>_<application>`.
    pub fn schema(&self) -> String {
        format!("app_{}_{}", self.account_id, self.application_id)
    }

    pub fn parse_schema(name: &str) -> Option<Self> {
        let rest = name.strip_prefix("app_")?;
        let (account, application) = rest.split_once('_')?;
        let account_id = account.parse::<i64>().ok()?;
        let application_id = application.parse::<i64>().ok()?;
        if account_id < 0 || application_id < 0 {
            return None;
        }
        Some(Self::new(account_id, application_id))
    }

    pub fn partition_key(&self) -> String {
        format!("partitionKey-{}-{}", self.account_id, self.application_id)
    }
}

impl fmt::Display for Tenant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.schema())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub url: String,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub width: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub height: String,
}

/// Fields every stored entity carries.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Common {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<Vec<Image>>,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<OffsetDateTime>,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub updated_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub deleted: bool,
}

impl Common {
    pub fn stamp_created(&mut self, now: OffsetDateTime) {
        if self.created_at.is_none() {
            self.created_at = Some(now);
        }
        self.updated_at = Some(now);
    }

    /// No-op on an already deleted entity.
    pub fn soft_delete(&mut self, now: OffsetDateTime) {
        if self.deleted {
            return;
        }
        self.enabled = false;
        self.deleted = true;
        self.updated_at = Some(now);
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default)]
    pub user_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub first_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub email: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_login: Option<OffsetDateTime>,
    #[serde(default)]
    pub activated: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub account_id: i64,
    #[serde(rename = "id", default)]
    pub public_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub token: String,
    #[serde(flatten)]
    pub common: Common,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountUser {
    pub account_id: i64,
    #[serde(default)]
    pub account_user_id: i64,
    #[serde(rename = "id", default)]
    pub public_id: String,
    #[serde(flatten)]
    pub profile: UserProfile,
    #[serde(flatten)]
    pub common: Common,
}

impl AccountUser {
    /// Seed of the version-5 public id when the frontend did not assign one.
    pub fn public_id_seed(&self) -> String {
        format!("{}:{}", self.account_id, self.profile.email.to_lowercase())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub account_id: i64,
    #[serde(default)]
    pub application_id: i64,
    #[serde(rename = "id", default)]
    pub public_id: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub url: String,
    #[serde(flatten)]
    pub common: Common,
}

impl Application {
    pub fn tenant(&self) -> Tenant {
        Tenant::new(self.account_id, self.application_id)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplicationUser {
    pub account_id: i64,
    pub application_id: i64,
    #[serde(default)]
    pub id: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub custom_id: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub social_ids: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub social_connections_ids: BTreeMap<String, Vec<String>>,
    #[serde(
        rename = "connection_type",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub social_connection_type: Option<ConnectionType>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub device_ids: Vec<String>,
    #[serde(flatten)]
    pub profile: UserProfile,
    #[serde(flatten)]
    pub common: Common,
}

impl ApplicationUser {
    pub fn tenant(&self) -> Tenant {
        Tenant::new(self.account_id, self.application_id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Friend,
    Follow,
}

impl ConnectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionType::Friend => "friend",
            ConnectionType::Follow => "follow",
        }
    }
}

/// Storage key of a connection. Friendships are symmetric, so the pair is
/// normalized to `(min, max)`; follows keep their direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey {
    pub user_from_id: u64,
    pub user_to_id: u64,
    pub kind: ConnectionType,
}

impl ConnectionKey {
    pub fn new(user_from_id: u64, user_to_id: u64, kind: ConnectionType) -> Self {
        let (user_from_id, user_to_id) = match kind {
            ConnectionType::Friend if user_from_id > user_to_id => (user_to_id, user_from_id),
            _ => (user_from_id, user_to_id),
        };
        Self {
            user_from_id,
            user_to_id,
            kind,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub account_id: i64,
    pub application_id: i64,
    pub user_from_id: u64,
    pub user_to_id: u64,
    #[serde(rename = "type")]
    pub kind: ConnectionType,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub confirmed_at: Option<OffsetDateTime>,
    #[serde(flatten)]
    pub common: Common,
}

impl Connection {
    pub fn tenant(&self) -> Tenant {
        Tenant::new(self.account_id, self.application_id)
    }

    pub fn key(&self) -> ConnectionKey {
        ConnectionKey::new(self.user_from_id, self.user_to_id, self.kind)
    }

    /// Rewrites the pair into its stored orientation.
    pub fn normalized(mut self) -> Self {
        let key = self.key();
        self.user_from_id = key.user_from_id;
        self.user_to_id = key.user_to_id;
        self
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Visibility {
    Private,
    #[default]
    Connections,
    Public,
}

impl TryFrom<u8> for Visibility {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            10 => Ok(Visibility::Private),
            20 => Ok(Visibility::Connections),
            30 => Ok(Visibility::Public),
            other => Err(format!("unknown event visibility {other}")),
        }
    }
}

impl From<Visibility> for u8 {
    fn from(value: Visibility) -> Self {
        match value {
            Visibility::Private => 10,
            Visibility::Connections => 20,
            Visibility::Public => 30,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Object {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default)]
    pub display_name: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image: Vec<Image>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    /// Well-known-text form, longitude first.
    pub fn wkt(&self) -> String {
        format!("POINT({} {})", self.longitude, self.latitude)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub account_id: i64,
    pub application_id: i64,
    #[serde(default)]
    pub id: u64,
    pub user_id: u64,
    #[serde(default)]
    pub verb: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub language: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub priority: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<Object>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Object>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instrument: Option<Object>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub participant: Vec<Participant>,
    #[serde(flatten)]
    pub common: Common,
}

impl Event {
    pub fn tenant(&self) -> Tenant {
        Tenant::new(self.account_id, self.application_id)
    }

    pub fn geo_point(&self) -> Option<GeoPoint> {
        match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => Some(GeoPoint {
                latitude,
                longitude,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tenant_schema_round_trips() {
        let tenant = Tenant::new(12, 7);
        assert_eq!(tenant.schema(), "app_12_7");
        assert_eq!(Tenant::parse_schema("app_12_7"), Some(tenant));
        assert_eq!(Tenant::parse_schema("app_12"), None);
        assert_eq!(Tenant::parse_schema("app_x_1"), None);
        assert_eq!(Tenant::parse_schema("application_1_1"), None);
    }

    #[test]
    fn friend_keys_ignore_direction() {
        let forward = ConnectionKey::new(9, 3, ConnectionType::Friend);
        let backward = ConnectionKey::new(3, 9, ConnectionType::Friend);
        assert_eq!(forward, backward);
        assert_eq!(forward.user_from_id, 3);

        let follow = ConnectionKey::new(9, 3, ConnectionType::Follow);
        assert_ne!(follow, ConnectionKey::new(3, 9, ConnectionType::Follow));
    }

    #[test]
    fn event_decodes_visibility_and_geo() {
        let event: Event = serde_json::from_value(json!({
            "account_id": 1,
            "application_id": 2,
            "id": 100,
            "user_id": 5,
            "verb": "like",
            "visibility": 30,
            "latitude": 52.5,
            "longitude": 13.4,
            "enabled": true
        }))
        .unwrap();
        assert_eq!(event.visibility, Visibility::Public);
        assert_eq!(event.geo_point().unwrap().wkt(), "POINT(13.4 52.5)");
        assert!(event.common.enabled);

        let invalid = serde_json::from_value::<Event>(json!({
            "account_id": 1,
            "application_id": 2,
            "user_id": 5,
            "visibility": 15
        }));
        assert!(invalid.is_err());
    }
}
