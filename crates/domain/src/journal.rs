//! Publishing side of the request journal. Ids of new events and
//! applications are minted here, before the record reaches the log, so every
//! delivery of a create carries the same id.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::entities::Tenant;
use crate::envelope::{Envelope, Sequence};
use crate::ids::IdAllocator;
use crate::ports::counter::{AllocatorError, AllocatorKey, IdKind};
use crate::ports::log::{LogError, LogProducer};

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("{0} payload must be a JSON object")]
    NotAnObject(Channel),
    #[error("{channel} payload has no numeric {field}")]
    MissingField {
        channel: Channel,
        field: &'static str,
    },
    #[error(transparent)]
    Allocator(#[from] AllocatorError),
    #[error(transparent)]
    Log(#[from] LogError),
    #[error("envelope encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Published {
    pub sequence: Sequence,
    /// Id minted for a create that arrived without one.
    pub assigned_id: Option<u64>,
}

pub struct Journal {
    producer: Arc<dyn LogProducer>,
    ids: Arc<IdAllocator>,
}

impl Journal {
    pub fn new(producer: Arc<dyn LogProducer>, ids: Arc<IdAllocator>) -> Self {
        Self { producer, ids }
    }

    /// Appends one mutation. Allocator exhaustion aborts the create and
    /// nothing is published.
    pub async fn publish(
        &self,
        partition_key: &str,
        channel: Channel,
        mut payload: Value,
    ) -> Result<Published, JournalError> {
        let assigned_id = self.assign_id(channel, &mut payload).await?;
        let envelope = Envelope::new(channel, &payload)?;
        let sequence = self.producer.publish(partition_key, &envelope).await?;
        debug!(%channel, %sequence, ?assigned_id, "record published");
        Ok(Published {
            sequence,
            assigned_id,
        })
    }

    async fn assign_id(
        &self,
        channel: Channel,
        payload: &mut Value,
    ) -> Result<Option<u64>, JournalError> {
        let (key, field) = match channel {
            Channel::EventCreate => {
                let application_id = numeric(channel, payload, "application_id")?;
                (AllocatorKey::new(application_id, IdKind::Events), "id")
            }
            Channel::ApplicationCreate => (
                AllocatorKey::new(0, IdKind::Applications),
                "application_id",
            ),
            _ => return Ok(None),
        };
        let object = payload
            .as_object_mut()
            .ok_or(JournalError::NotAnObject(channel))?;
        if object.get(field).and_then(Value::as_u64).is_some_and(|id| id != 0) {
            return Ok(None);
        }
        let id = self.ids.next_id(key.application_id, key.kind).await?;
        object.insert(field.to_string(), Value::from(id));
        Ok(Some(id))
    }

    /// Leases the user and event keys of `tenants`, plus the application
    /// key, ahead of the first publish. Keys held elsewhere are leased on
    /// first use instead.
    pub async fn warm_up(&self, tenants: &[Tenant]) {
        let mut keys = vec![AllocatorKey::new(0, IdKind::Applications)];
        for tenant in tenants {
            keys.push(AllocatorKey::new(tenant.application_id, IdKind::Users));
            keys.push(AllocatorKey::new(tenant.application_id, IdKind::Events));
        }
        for key in keys {
            if let Err(err) = self.ids.warm_up(&[key]).await {
                warn!(%key, error = %err, "id allocator warm-up failed for key");
            }
        }
    }
}

fn numeric(channel: Channel, payload: &Value, field: &'static str) -> Result<i64, JournalError> {
    payload
        .get(field)
        .and_then(Value::as_i64)
        .ok_or(JournalError::MissingField { channel, field })
}
