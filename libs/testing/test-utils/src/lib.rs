//! Shared test utilities for queue testing
//!
//! - `TestRedis`: Redis container with automatic cleanup (feature: "redis")
//! - `TestDataBuilder`: deterministic stream, group and consumer names (always available)
//! - `assertions`: custom assertion helpers (always available)
//!
//! # Usage
//!
//! Add `features = ["redis"]` to your dev-dependencies:
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { workspace = true, features = ["redis"] }
//! ```
//!
//! Then in your tests:
//!
//! ```rust,ignore
//! use test_utils::{TestDataBuilder, TestRedis};
//!
//! #[tokio::test]
//! async fn my_queue_test() {
//!     let redis = TestRedis::new().await;
//!     let names = TestDataBuilder::from_test_name("my_queue_test");
//!
//!     let conn = redis.connection_manager().await;
//!     let stream = names.stream_key("jobs");
//! }
//! ```

use uuid::Uuid;

#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "redis")]
pub use redis::TestRedis;

/// Builder for test data with deterministic randomization
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    /// Create a new builder with a seed (for deterministic tests)
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Create from test name (generates seed from test name hash)
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("test_claim_idle");
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Stream key scoped to this test, e.g. `test:jobs:12345`
    pub fn stream_key(&self, name: &str) -> String {
        format!("test:{}:{}", name, self.seed)
    }

    /// Consumer group name scoped to this test
    pub fn group(&self, name: &str) -> String {
        format!("{}-{}", name, self.seed)
    }

    /// Consumer name scoped to this test
    pub fn consumer(&self, name: &str) -> String {
        format!("consumer-{}-{}", name, self.seed)
    }

    /// Deterministic UUID, handy as a payload correlation id
    pub fn correlation_id(&self) -> Uuid {
        let bytes = self.seed.to_le_bytes();
        let mut uuid_bytes = [0u8; 16];
        uuid_bytes[..8].copy_from_slice(&bytes);
        uuid_bytes[8..16].copy_from_slice(&bytes);
        Uuid::from_bytes(uuid_bytes)
    }

    /// Field map for a stream entry: `seq`, `test` and any extra pairs
    pub fn fields(&self, seq: usize, extra: &[(&str, &str)]) -> Vec<(String, String)> {
        let mut fields = vec![
            ("seq".to_string(), seq.to_string()),
            ("test".to_string(), self.seed.to_string()),
        ];
        fields.extend(extra.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        fields
    }
}

/// Test assertion helpers
pub mod assertions {
    use std::future::Future;
    use std::time::Duration;

    /// Assert that an optional value is Some
    pub fn assert_some<T>(value: Option<T>, context: &str) -> T {
        value.unwrap_or_else(|| panic!("{}: expected Some, got None", context))
    }

    /// Poll `check` every 20ms until it returns true, panicking after `timeout`
    pub async fn eventually<F, Fut>(timeout: Duration, context: &str, mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if check().await {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("{}: condition not met within {:?}", context, timeout);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_builder_deterministic() {
        let builder1 = TestDataBuilder::new(42);
        let builder2 = TestDataBuilder::new(42);

        assert_eq!(builder1.correlation_id(), builder2.correlation_id());
        assert_eq!(builder1.stream_key("jobs"), builder2.stream_key("jobs"));
        assert_eq!(builder1.stream_key("jobs"), "test:jobs:42");
        assert_eq!(builder1.group("workers"), "workers-42");
        assert_eq!(builder1.consumer("a"), "consumer-a-42");
    }

    #[test]
    fn test_data_builder_different_names() {
        let builder1 = TestDataBuilder::from_test_name("test1");
        let builder2 = TestDataBuilder::from_test_name("test2");

        assert_ne!(builder1.stream_key("q"), builder2.stream_key("q"));
    }

    #[test]
    fn test_fields_include_extras() {
        let fields = TestDataBuilder::new(7).fields(3, &[("type", "echo")]);

        assert_eq!(fields[0], ("seq".to_string(), "3".to_string()));
        assert_eq!(fields[1], ("test".to_string(), "7".to_string()));
        assert_eq!(fields[2], ("type".to_string(), "echo".to_string()));
    }
}
