use core_config::{ConfigError, FromEnv, env_parse, env_parse_optional};
use serde::{Deserialize, Serialize};

use crate::chunking::{DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE};
use crate::index::TrainParams;
use crate::retry::RetryConfig;

/// Similarity index settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Lists used by `build_index` calls that do not name a count
    pub list_count: usize,
    /// Lists probed by queries that do not name a count
    pub probe_count: usize,
    pub max_iterations: usize,
    pub train_batch_size: usize,
    pub seed: u64,
    /// Rebuild in the background once a collection has grown by this factor
    /// since its last build. `None` disables automatic rebuilds.
    pub auto_rebuild_growth: Option<f64>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            list_count: 100,
            probe_count: 1,
            max_iterations: 25,
            train_batch_size: 1024,
            seed: 42,
            auto_rebuild_growth: None,
        }
    }
}

impl IndexConfig {
    pub fn train_params(&self) -> TrainParams {
        TrainParams {
            list_count: self.list_count,
            max_iterations: self.max_iterations,
            batch_size: self.train_batch_size,
            seed: self.seed,
        }
    }
}

/// Ingest and query settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Budget for one embedding call including its retries
    pub embed_timeout_ms: u64,
    pub retry: RetryConfig,
    /// Candidates fetched per requested result, to absorb filtering
    pub overfetch_factor: usize,
    /// Capacity of the index event queue
    pub queue_capacity: usize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            embed_timeout_ms: 30_000,
            retry: RetryConfig::default(),
            overfetch_factor: 4,
            queue_capacity: 1024,
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub index: IndexConfig,
    pub pipeline: PipelineConfig,
}

impl RetrievalConfig {
    /// Reject settings no component can run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("RETRIEVAL_LIST_COUNT", self.index.list_count),
            ("RETRIEVAL_PROBE_COUNT", self.index.probe_count),
            ("RETRIEVAL_KMEANS_MAX_ITERATIONS", self.index.max_iterations),
            ("RETRIEVAL_KMEANS_BATCH_SIZE", self.index.train_batch_size),
            ("RETRIEVAL_OVERFETCH_FACTOR", self.pipeline.overfetch_factor),
            ("RETRIEVAL_QUEUE_CAPACITY", self.pipeline.queue_capacity),
            ("RETRIEVAL_CHUNK_SIZE", self.pipeline.chunk_size),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(invalid(key, "must be positive"));
            }
        }
        if self.pipeline.embed_timeout_ms == 0 {
            return Err(invalid("RETRIEVAL_EMBED_TIMEOUT_MS", "must be positive"));
        }
        if self.pipeline.chunk_overlap >= self.pipeline.chunk_size {
            return Err(invalid(
                "RETRIEVAL_CHUNK_OVERLAP",
                "must be smaller than RETRIEVAL_CHUNK_SIZE",
            ));
        }
        if let Some(growth) = self.index.auto_rebuild_growth {
            if !(growth > 1.0 && growth.is_finite()) {
                return Err(invalid("RETRIEVAL_AUTO_REBUILD_GROWTH", "must be greater than 1"));
            }
        }
        Ok(())
    }
}

fn invalid(key: &str, details: &str) -> ConfigError {
    ConfigError::ParseError {
        key: key.to_string(),
        details: details.to_string(),
    }
}

impl FromEnv for RetrievalConfig {
    /// Reads `RETRIEVAL_*` variables; unset ones keep their defaults:
    /// - RETRIEVAL_LIST_COUNT (100), RETRIEVAL_PROBE_COUNT (1)
    /// - RETRIEVAL_KMEANS_MAX_ITERATIONS (25), RETRIEVAL_KMEANS_BATCH_SIZE (1024),
    ///   RETRIEVAL_KMEANS_SEED (42)
    /// - RETRIEVAL_AUTO_REBUILD_GROWTH (unset: disabled)
    /// - RETRIEVAL_EMBED_TIMEOUT_MS (30000), RETRIEVAL_EMBED_MAX_RETRIES (3),
    ///   RETRIEVAL_EMBED_RETRY_DELAY_MS (100), RETRIEVAL_EMBED_RETRY_MAX_DELAY_MS (5000)
    /// - RETRIEVAL_OVERFETCH_FACTOR (4), RETRIEVAL_QUEUE_CAPACITY (1024)
    /// - RETRIEVAL_CHUNK_SIZE (2000), RETRIEVAL_CHUNK_OVERLAP (200)
    fn from_env() -> Result<Self, ConfigError> {
        let index_defaults = IndexConfig::default();
        let pipeline_defaults = PipelineConfig::default();
        let retry_defaults = pipeline_defaults.retry.clone();

        let config = Self {
            index: IndexConfig {
                list_count: env_parse("RETRIEVAL_LIST_COUNT", index_defaults.list_count)?,
                probe_count: env_parse("RETRIEVAL_PROBE_COUNT", index_defaults.probe_count)?,
                max_iterations: env_parse(
                    "RETRIEVAL_KMEANS_MAX_ITERATIONS",
                    index_defaults.max_iterations,
                )?,
                train_batch_size: env_parse(
                    "RETRIEVAL_KMEANS_BATCH_SIZE",
                    index_defaults.train_batch_size,
                )?,
                seed: env_parse("RETRIEVAL_KMEANS_SEED", index_defaults.seed)?,
                auto_rebuild_growth: env_parse_optional("RETRIEVAL_AUTO_REBUILD_GROWTH")?,
            },
            pipeline: PipelineConfig {
                embed_timeout_ms: env_parse(
                    "RETRIEVAL_EMBED_TIMEOUT_MS",
                    pipeline_defaults.embed_timeout_ms,
                )?,
                retry: RetryConfig {
                    max_retries: env_parse(
                        "RETRIEVAL_EMBED_MAX_RETRIES",
                        retry_defaults.max_retries,
                    )?,
                    initial_delay_ms: env_parse(
                        "RETRIEVAL_EMBED_RETRY_DELAY_MS",
                        retry_defaults.initial_delay_ms,
                    )?,
                    max_delay_ms: env_parse(
                        "RETRIEVAL_EMBED_RETRY_MAX_DELAY_MS",
                        retry_defaults.max_delay_ms,
                    )?,
                    ..retry_defaults
                },
                overfetch_factor: env_parse(
                    "RETRIEVAL_OVERFETCH_FACTOR",
                    pipeline_defaults.overfetch_factor,
                )?,
                queue_capacity: env_parse(
                    "RETRIEVAL_QUEUE_CAPACITY",
                    pipeline_defaults.queue_capacity,
                )?,
                chunk_size: env_parse("RETRIEVAL_CHUNK_SIZE", pipeline_defaults.chunk_size)?,
                chunk_overlap: env_parse(
                    "RETRIEVAL_CHUNK_OVERLAP",
                    pipeline_defaults.chunk_overlap,
                )?,
            },
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: [&str; 14] = [
        "RETRIEVAL_LIST_COUNT",
        "RETRIEVAL_PROBE_COUNT",
        "RETRIEVAL_KMEANS_MAX_ITERATIONS",
        "RETRIEVAL_KMEANS_BATCH_SIZE",
        "RETRIEVAL_KMEANS_SEED",
        "RETRIEVAL_AUTO_REBUILD_GROWTH",
        "RETRIEVAL_EMBED_TIMEOUT_MS",
        "RETRIEVAL_EMBED_MAX_RETRIES",
        "RETRIEVAL_EMBED_RETRY_DELAY_MS",
        "RETRIEVAL_EMBED_RETRY_MAX_DELAY_MS",
        "RETRIEVAL_OVERFETCH_FACTOR",
        "RETRIEVAL_QUEUE_CAPACITY",
        "RETRIEVAL_CHUNK_SIZE",
        "RETRIEVAL_CHUNK_OVERLAP",
    ];

    fn with_env<F: FnOnce()>(overrides: &[(&str, &str)], f: F) {
        let vars: Vec<(&str, Option<&str>)> = VARS
            .iter()
            .map(|key| {
                let value = overrides.iter().find(|(k, _)| k == key).map(|(_, v)| *v);
                (*key, value)
            })
            .collect();
        temp_env::with_vars(vars, f);
    }

    #[test]
    fn test_from_env_defaults() {
        with_env(&[], || {
            let config = RetrievalConfig::from_env().unwrap();
            assert_eq!(config, RetrievalConfig::default());
            assert_eq!(config.index.list_count, 100);
            assert_eq!(config.index.auto_rebuild_growth, None);
            assert_eq!(config.pipeline.chunk_size, 2000);
            assert_eq!(config.pipeline.chunk_overlap, 200);
        });
    }

    #[test]
    fn test_from_env_overrides() {
        with_env(
            &[
                ("RETRIEVAL_LIST_COUNT", "16"),
                ("RETRIEVAL_PROBE_COUNT", "4"),
                ("RETRIEVAL_AUTO_REBUILD_GROWTH", "2.0"),
                ("RETRIEVAL_EMBED_TIMEOUT_MS", "500"),
                ("RETRIEVAL_EMBED_MAX_RETRIES", "5"),
                ("RETRIEVAL_QUEUE_CAPACITY", "8"),
            ],
            || {
                let config = RetrievalConfig::from_env().unwrap();
                assert_eq!(config.index.list_count, 16);
                assert_eq!(config.index.probe_count, 4);
                assert_eq!(config.index.auto_rebuild_growth, Some(2.0));
                assert_eq!(config.pipeline.embed_timeout_ms, 500);
                assert_eq!(config.pipeline.retry.max_retries, 5);
                assert!(config.pipeline.retry.use_jitter);
                assert_eq!(config.pipeline.queue_capacity, 8);

                let params = config.index.train_params();
                assert_eq!(params.list_count, 16);
                assert_eq!(params.seed, 42);
            },
        );
    }

    #[test]
    fn test_from_env_parse_error_names_key() {
        with_env(&[("RETRIEVAL_PROBE_COUNT", "all")], || {
            match RetrievalConfig::from_env() {
                Err(ConfigError::ParseError { key, .. }) => {
                    assert_eq!(key, "RETRIEVAL_PROBE_COUNT")
                }
                other => panic!("unexpected result: {:?}", other),
            }
        });
    }

    #[test]
    fn test_validation_rejects_unusable_values() {
        for (key, value) in [
            ("RETRIEVAL_LIST_COUNT", "0"),
            ("RETRIEVAL_QUEUE_CAPACITY", "0"),
            ("RETRIEVAL_EMBED_TIMEOUT_MS", "0"),
            ("RETRIEVAL_CHUNK_OVERLAP", "2000"),
            ("RETRIEVAL_AUTO_REBUILD_GROWTH", "0.5"),
        ] {
            with_env(&[(key, value)], || {
                match RetrievalConfig::from_env() {
                    Err(ConfigError::ParseError { key: reported, .. }) => {
                        assert_eq!(reported, key)
                    }
                    other => panic!("{}={} accepted: {:?}", key, value, other),
                }
            });
        }
    }
}
