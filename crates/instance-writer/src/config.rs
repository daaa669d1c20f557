//! Writer Configuration

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::WriterError;

/// Default ring buffer capacity
pub const DEFAULT_MAX_BUFFERED: usize = 10_000;
/// Default number of concurrent sink calls
pub const DEFAULT_MAX_REQUESTS: usize = 10;
/// Default number of records per sink call
pub const DEFAULT_MAX_BATCH_SIZE: usize = 1_000;

/// Environment variable prefix read by [`WriterConfig::load`]
pub const ENV_PREFIX: &str = "INSTANCE_WRITER";

/// Writer limits. A zero means "unset" and resolves to the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Records held before the oldest get overwritten (default: 10000)
    pub max_buffered: usize,
    /// Concurrent sink calls allowed at once (default: 10)
    pub max_requests: usize,
    /// Largest batch handed to a single sink call (default: 1000)
    pub max_batch_size: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_buffered: DEFAULT_MAX_BUFFERED,
            max_requests: DEFAULT_MAX_REQUESTS,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }
}

impl WriterConfig {
    /// Config with every field unset
    pub fn unset() -> Self {
        Self {
            max_buffered: 0,
            max_requests: 0,
            max_batch_size: 0,
        }
    }

    /// Set the ring buffer capacity
    pub fn with_max_buffered(mut self, max_buffered: usize) -> Self {
        self.max_buffered = max_buffered;
        self
    }

    /// Set the concurrent request limit
    pub fn with_max_requests(mut self, max_requests: usize) -> Self {
        self.max_requests = max_requests;
        self
    }

    /// Set the batch size limit
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    /// Replace unset (zero) fields with their defaults
    pub fn resolved(self) -> Self {
        fn or_default(value: usize, default: usize) -> usize {
            if value == 0 {
                default
            } else {
                value
            }
        }

        Self {
            max_buffered: or_default(self.max_buffered, DEFAULT_MAX_BUFFERED),
            max_requests: or_default(self.max_requests, DEFAULT_MAX_REQUESTS),
            max_batch_size: or_default(self.max_batch_size, DEFAULT_MAX_BATCH_SIZE),
        }
    }

    /// Load from an optional file, overridden by `INSTANCE_WRITER_*` env vars
    pub fn load(path: Option<&Path>) -> Result<Self, WriterError> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    /// Same as [`WriterConfig::load`] with a custom environment prefix
    pub fn load_with_prefix(path: Option<&Path>, env_prefix: &str) -> Result<Self, WriterError> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }

        let loaded: WriterConfig = builder
            .add_source(::config::Environment::with_prefix(env_prefix).try_parsing(true))
            .build()?
            .try_deserialize()?;

        Ok(loaded)
    }
}
