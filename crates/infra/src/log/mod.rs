mod redis_stream;

pub use redis_stream::{RedisStreamLog, decode_sequence, encode_sequence, shard_for};
