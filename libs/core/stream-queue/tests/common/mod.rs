#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use stream_queue::{RedisStreamClient, StreamClient};
use test_utils::{TestDataBuilder, TestRedis};

pub async fn client(redis: &TestRedis) -> Arc<dyn StreamClient> {
    Arc::new(RedisStreamClient::new(redis.connection_manager().await))
}

pub fn fields(names: &TestDataBuilder, seq: usize) -> HashMap<String, String> {
    names.fields(seq, &[]).into_iter().collect()
}

pub fn typed_fields(names: &TestDataBuilder, seq: usize, kind: &str) -> HashMap<String, String> {
    names.fields(seq, &[("type", kind)]).into_iter().collect()
}

/// Add `count` entries and return their IDs in order
pub async fn seed(
    client: &Arc<dyn StreamClient>,
    names: &TestDataBuilder,
    stream: &str,
    count: usize,
) -> Vec<String> {
    let mut ids = Vec::with_capacity(count);
    for seq in 0..count {
        ids.push(client.add(stream, &fields(names, seq), None).await.unwrap());
    }
    ids
}
