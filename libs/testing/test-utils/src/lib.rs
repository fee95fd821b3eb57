//! Shared test utilities for the retrieval crates
//!
//! - `TestDataBuilder`: deterministic ids, names and vectors derived from a seed
//! - `assertions`: assertion helpers with contextual messages
//! - `init_test_tracing`: routes `tracing` output through the test harness
//!
//! # Usage
//!
//! ```
//! use test_utils::TestDataBuilder;
//!
//! let builder = TestDataBuilder::from_test_name("test_query_ranks_by_distance");
//! let collection = builder.name("collection", "main");
//! let mut vectors = builder.rng();
//! let v = builder.vector(&mut vectors, 8);
//! assert_eq!(v.len(), 8);
//! assert!(collection.starts_with("test-collection-"));
//! ```

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Once;
use uuid::Uuid;

/// Builder for test data with deterministic randomization
///
/// This ensures tests are reproducible by using seeded random data.
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    /// Create a new builder with a seed (for deterministic tests)
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Create from test name (generates seed from test name hash)
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Deterministic record id; `n` distinguishes ids within one test
    pub fn record_id(&self, n: u64) -> Uuid {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&self.seed.to_be_bytes());
        bytes[8..].copy_from_slice(&n.to_be_bytes());
        Uuid::from_bytes(bytes)
    }

    /// Generate a unique name, e.g. `test-collection-12345-main`
    pub fn name(&self, prefix: &str, suffix: &str) -> String {
        format!("test-{}-{}-{}", prefix, self.seed, suffix)
    }

    /// Random generator seeded from this builder
    pub fn rng(&self) -> StdRng {
        StdRng::seed_from_u64(self.seed)
    }

    /// Vector with components uniform in `[-1, 1)`
    pub fn vector(&self, rng: &mut StdRng, dimension: usize) -> Vec<f32> {
        (0..dimension).map(|_| rng.gen_range(-1.0..1.0)).collect()
    }

    /// `count` vectors scattered within `spread` of `center`
    pub fn cluster(
        &self,
        rng: &mut StdRng,
        center: &[f32],
        spread: f32,
        count: usize,
    ) -> Vec<Vec<f32>> {
        (0..count)
            .map(|_| {
                center
                    .iter()
                    .map(|c| c + rng.gen_range(-spread..spread))
                    .collect()
            })
            .collect()
    }
}

/// Install a fmt subscriber writing through the test harness; safe to call
/// from every test.
pub fn init_test_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
        tracing::debug!("Test tracing initialized");
    });
}

/// Test assertion helpers
pub mod assertions {
    use uuid::Uuid;

    /// Assert that two UUIDs are equal with a nice error message
    pub fn assert_uuid_eq(actual: Uuid, expected: Uuid, context: &str) {
        assert_eq!(
            actual, expected,
            "{}: expected UUID {}, got {}",
            context, expected, actual
        );
    }

    /// Assert that an optional value is Some
    pub fn assert_some<T>(value: Option<T>, context: &str) -> T {
        value.unwrap_or_else(|| panic!("{}: expected Some, got None", context))
    }

    /// Assert two floats differ by at most `epsilon`
    pub fn assert_close(actual: f32, expected: f32, epsilon: f32, context: &str) {
        assert!(
            (actual - expected).abs() <= epsilon,
            "{}: expected {} (±{}), got {}",
            context,
            expected,
            epsilon,
            actual
        );
    }

    /// Assert a sequence is non-decreasing
    pub fn assert_ascending(values: &[f32], context: &str) {
        if let Some(pos) = values.windows(2).position(|w| w[0] > w[1]) {
            panic!(
                "{}: not ascending at position {}: {} > {}",
                context,
                pos,
                values[pos],
                values[pos + 1]
            );
        }
    }
}
