use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channel::{Channel, UnknownChannel};

/// Log-assigned position of a record. Positions compare lexicographically;
/// the empty sequence stands for the log's trim horizon.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sequence(String);

impl Sequence {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("<trim-horizon>")
        } else {
            f.write_str(&self.0)
        }
    }
}

/// Wire form published by the frontend: `{"channel":"..","payload":".."}`,
/// where `payload` is the JSON-encoded entity as a string.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub channel: String,
    pub payload: String,
}

impl Envelope {
    pub fn new<T: Serialize>(channel: Channel, payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            channel: channel.as_str().to_string(),
            payload: serde_json::to_string(payload)?,
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Envelope(#[from] serde_json::Error),
    #[error(transparent)]
    UnknownChannel(#[from] UnknownChannel),
}

/// One immutable entry of the log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub sequence: Sequence,
    pub partition_key: String,
    pub data: String,
}

impl Record {
    pub fn new(sequence: Sequence, partition_key: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            sequence,
            partition_key: partition_key.into(),
            data: data.into(),
        }
    }

    /// Splits the record into its channel and raw payload.
    pub fn decode(&self) -> Result<(Channel, String), DecodeError> {
        let envelope: Envelope = serde_json::from_str(&self.data)?;
        let channel = envelope.channel.parse::<Channel>()?;
        Ok((channel, envelope.payload))
    }
}
