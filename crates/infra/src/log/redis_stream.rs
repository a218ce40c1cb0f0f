use redis::aio::ConnectionManager;
use redis::streams::StreamRangeReply;
use redis::{ErrorKind, RedisError};
use sha2::{Digest, Sha256};
use tapglue_domain::envelope::{Envelope, Record, Sequence};
use tapglue_domain::ports::BoxFuture;
use tapglue_domain::ports::log::{LogError, LogProducer, LogSource};

use crate::config::AppConfig;

const PARTITION_KEY_FIELD: &str = "partition_key";
const DATA_FIELD: &str = "data";

/// Request journal kept in redis streams, one stream per shard named
/// `<prefix>:<shard>`. Reads are bound to a single shard; publishing routes
/// each partition key to its shard.
#[derive(Clone)]
pub struct RedisStreamLog {
    manager: ConnectionManager,
    prefix: String,
    shards: u32,
    stream: String,
}

impl RedisStreamLog {
    pub async fn connect(
        redis_url: &str,
        prefix: impl Into<String>,
        shards: u32,
        shard: u32,
    ) -> Result<Self, LogError> {
        let shards = shards.max(1);
        if shard >= shards {
            return Err(LogError::Fatal(format!(
                "shard {shard} is outside of the {shards} configured shards"
            )));
        }
        let client = redis::Client::open(redis_url).map_err(classify)?;
        let manager = ConnectionManager::new(client).await.map_err(classify)?;
        let prefix = prefix.into();
        let stream = stream_key(&prefix, shard);
        tracing::info!(stream = %stream, shards, "redis stream log connected");
        Ok(Self {
            manager,
            prefix,
            shards,
            stream,
        })
    }

    pub async fn from_config(config: &AppConfig) -> Result<Self, LogError> {
        Self::connect(
            &config.redis_url,
            config.log_stream.clone(),
            config.log_shards,
            config.log_shard,
        )
        .await
    }
}

fn stream_key(prefix: &str, shard: u32) -> String {
    format!("{prefix}:{shard}")
}

/// Stable across processes, so every producer picks the same shard.
pub fn shard_for(partition_key: &str, shards: u32) -> u32 {
    let digest = Sha256::digest(partition_key.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(head) % u64::from(shards.max(1))) as u32
}

/// `<ms>-<seq>` stream id to a sequence that orders lexicographically.
pub fn encode_sequence(stream_id: &str) -> Result<Sequence, LogError> {
    let (millis, seq) = split_id(stream_id)?;
    Ok(Sequence::new(format!("{millis:020}-{seq:020}")))
}

pub fn decode_sequence(sequence: &Sequence) -> Result<String, LogError> {
    let (millis, seq) = split_id(sequence.as_str())?;
    Ok(format!("{millis}-{seq}"))
}

fn split_id(raw: &str) -> Result<(u64, u64), LogError> {
    let malformed = || LogError::Serialization(format!("malformed stream id '{raw}'"));
    let (millis, seq) = raw.split_once('-').ok_or_else(malformed)?;
    let millis = millis.parse::<u64>().map_err(|_| malformed())?;
    let seq = seq.parse::<u64>().map_err(|_| malformed())?;
    Ok((millis, seq))
}

fn classify(err: RedisError) -> LogError {
    if err.kind() == ErrorKind::AuthenticationFailed
        || matches!(err.code(), Some("NOAUTH" | "WRONGPASS" | "WRONGTYPE" | "NOPERM"))
    {
        return LogError::Fatal(err.to_string());
    }
    if err.kind() == ErrorKind::TypeError {
        return LogError::Serialization(err.to_string());
    }
    LogError::Transient(err.to_string())
}

impl LogSource for RedisStreamLog {
    fn stream(&self) -> &str {
        &self.stream
    }

    fn fetch(
        &self,
        after: Option<&Sequence>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<Record>, LogError>> {
        let after = after.filter(|sequence| !sequence.is_empty()).cloned();
        Box::pin(async move {
            let start = match &after {
                Some(sequence) => format!("({}", decode_sequence(sequence)?),
                None => String::from("-"),
            };
            let mut conn = self.manager.clone();
            let reply: StreamRangeReply = redis::cmd("XRANGE")
                .arg(&self.stream)
                .arg(start)
                .arg("+")
                .arg("COUNT")
                .arg(limit.max(1))
                .query_async(&mut conn)
                .await
                .map_err(classify)?;

            let mut records = Vec::with_capacity(reply.ids.len());
            for entry in reply.ids {
                let sequence = encode_sequence(&entry.id)?;
                let data: Option<String> = entry.get(DATA_FIELD);
                let Some(data) = data else {
                    return Err(LogError::Serialization(format!(
                        "entry {} of {} has no {DATA_FIELD} field",
                        entry.id, self.stream
                    )));
                };
                let partition_key: String = entry.get(PARTITION_KEY_FIELD).unwrap_or_default();
                records.push(Record::new(sequence, partition_key, data));
            }
            Ok(records)
        })
    }
}

impl LogProducer for RedisStreamLog {
    fn publish(
        &self,
        partition_key: &str,
        envelope: &Envelope,
    ) -> BoxFuture<'_, Result<Sequence, LogError>> {
        let partition_key = partition_key.to_string();
        let data = envelope.to_json();
        Box::pin(async move {
            let data = data.map_err(|err| LogError::Serialization(err.to_string()))?;
            let stream = stream_key(&self.prefix, shard_for(&partition_key, self.shards));
            let mut conn = self.manager.clone();
            let id: String = redis::cmd("XADD")
                .arg(&stream)
                .arg("*")
                .arg(PARTITION_KEY_FIELD)
                .arg(&partition_key)
                .arg(DATA_FIELD)
                .arg(data)
                .query_async(&mut conn)
                .await
                .map_err(classify)?;
            encode_sequence(&id)
        })
    }
}
