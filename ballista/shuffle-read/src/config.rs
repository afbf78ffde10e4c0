// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Configuration of shuffle reads.

use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;

use crate::buffer_pool::BatchShuffleReadBufferPool;
use crate::error::{Result, ShuffleReadError};

const CONFIG_PREFIX: &str = "ballista.shuffle.read.";

/// Buffer request timeout of read schedulers, in milliseconds.
pub const SHUFFLE_READ_BUFFER_REQUEST_TIMEOUT: &str =
    "ballista.shuffle.read.buffer_request_timeout_ms";
/// Bounded wait of one buffer pool request, in milliseconds.
pub const SHUFFLE_READ_POOL_REQUEST_WAIT: &str = "ballista.shuffle.read.pool_request_wait_ms";
/// Size of one read buffer, in bytes.
pub const SHUFFLE_READ_BUFFER_SIZE: &str = "ballista.shuffle.read.buffer_size";
/// Total shuffle read memory of a process, in bytes.
pub const SHUFFLE_READ_MEMORY: &str = "ballista.shuffle.read.memory";

static CONFIG_ENTRIES: LazyLock<HashMap<String, ConfigEntry>> = LazyLock::new(|| {
    let entries = vec![
        ConfigEntry::new(SHUFFLE_READ_BUFFER_REQUEST_TIMEOUT,
                         "Milliseconds a read scheduler waits for read buffers before failing its readers",
                         "300000"),
        ConfigEntry::new(SHUFFLE_READ_POOL_REQUEST_WAIT,
                         "Milliseconds a single buffer request waits for recycled buffers",
                         "2000"),
        ConfigEntry::new(SHUFFLE_READ_BUFFER_SIZE,
                         "Size in bytes of a single read buffer",
                         (32 * 1024).to_string()),
        ConfigEntry::new(SHUFFLE_READ_MEMORY,
                         "Total memory in bytes shared by all shuffle reads of a process",
                         (64 * 1024 * 1024).to_string()),
    ];
    entries
        .into_iter()
        .map(|e| (e.name.clone(), e))
        .collect::<HashMap<_, _>>()
});

/// Configuration option meta-data
#[derive(Debug, Clone)]
pub struct ConfigEntry {
    name: String,
    description: String,
    default_value: String,
}

impl ConfigEntry {
    fn new(name: &str, description: &str, default_value: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            default_value: default_value.into(),
        }
    }

    /// Key of the option.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Human readable description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Value used when the option is not set.
    pub fn default_value(&self) -> &str {
        &self.default_value
    }
}

/// Configuration of the shuffle read path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShuffleReadConfig {
    /// Time a read scheduler waits for buffers while holding none before its
    /// readers fail (default: 5 minutes)
    pub buffer_request_timeout: Duration,
    /// Time a single pool request waits for recycled buffers (default: 2s)
    pub pool_request_wait: Duration,
    /// Size of one read buffer in bytes (default: 32KB)
    pub buffer_size: usize,
    /// Memory shared by all shuffle reads of the process (default: 64MB)
    pub total_memory: usize,
}

impl Default for ShuffleReadConfig {
    fn default() -> Self {
        Self {
            buffer_request_timeout: Duration::from_secs(5 * 60),
            pool_request_wait: Duration::from_secs(2),
            // 32 KB
            buffer_size: 32 * 1024,
            // 64 MB
            total_memory: 64 * 1024 * 1024,
        }
    }
}

impl ShuffleReadConfig {
    /// Create a configuration from key-value pairs. Keys outside of the
    /// `ballista.shuffle.read.` namespace are ignored.
    pub fn with_settings(settings: &HashMap<String, String>) -> Result<Self> {
        let supported_entries = Self::valid_entries();
        for name in settings.keys() {
            if name.starts_with(CONFIG_PREFIX) && !supported_entries.contains_key(name) {
                return Err(ShuffleReadError::Configuration(format!(
                    "Unknown configuration setting '{name}'"
                )));
            }
        }

        let config = Self {
            buffer_request_timeout: Duration::from_millis(Self::get_u64_setting(
                settings,
                SHUFFLE_READ_BUFFER_REQUEST_TIMEOUT,
            )?),
            pool_request_wait: Duration::from_millis(Self::get_u64_setting(
                settings,
                SHUFFLE_READ_POOL_REQUEST_WAIT,
            )?),
            buffer_size: Self::get_u64_setting(settings, SHUFFLE_READ_BUFFER_SIZE)? as usize,
            total_memory: Self::get_u64_setting(settings, SHUFFLE_READ_MEMORY)? as usize,
        };
        config.validate()?;
        Ok(config)
    }

    /// All available configuration options
    pub fn valid_entries() -> &'static HashMap<String, ConfigEntry> {
        &CONFIG_ENTRIES
    }

    /// Checks that the values are usable.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_request_timeout.is_zero() {
            return Err(ShuffleReadError::Configuration(format!(
                "'{SHUFFLE_READ_BUFFER_REQUEST_TIMEOUT}' must be positive"
            )));
        }
        if self.pool_request_wait.is_zero() {
            return Err(ShuffleReadError::Configuration(format!(
                "'{SHUFFLE_READ_POOL_REQUEST_WAIT}' must be positive"
            )));
        }
        if self.buffer_size == 0 {
            return Err(ShuffleReadError::Configuration(format!(
                "'{SHUFFLE_READ_BUFFER_SIZE}' must be positive"
            )));
        }
        if self.total_memory < self.buffer_size {
            return Err(ShuffleReadError::Configuration(format!(
                "'{SHUFFLE_READ_MEMORY}' ({}) must hold at least one buffer of {} bytes",
                self.total_memory, self.buffer_size
            )));
        }
        Ok(())
    }

    /// Sets the buffer request timeout.
    pub fn with_buffer_request_timeout(mut self, timeout: Duration) -> Self {
        self.buffer_request_timeout = timeout;
        self
    }

    /// Creates the process-wide buffer pool described by this configuration.
    pub fn create_buffer_pool(&self) -> Result<BatchShuffleReadBufferPool> {
        self.validate()?;
        BatchShuffleReadBufferPool::try_new(
            self.total_memory,
            self.buffer_size,
            self.pool_request_wait,
        )
    }

    fn get_u64_setting(settings: &HashMap<String, String>, key: &str) -> Result<u64> {
        let value = match settings.get(key) {
            Some(v) => v.as_str(),
            None => Self::valid_entries()
                .get(key)
                .map(|entry| entry.default_value())
                .ok_or_else(|| {
                    ShuffleReadError::Internal(format!("No configuration entry for '{key}'"))
                })?,
        };
        value.trim().parse::<u64>().map_err(|e| {
            ShuffleReadError::Configuration(format!(
                "Failed to parse value '{value}' for configuration setting '{key}': {e}"
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::BufferPool;

    #[test]
    fn default_config() -> Result<()> {
        let config = ShuffleReadConfig::with_settings(&HashMap::new())?;
        assert_eq!(config, ShuffleReadConfig::default());
        assert_eq!(config.buffer_request_timeout, Duration::from_secs(300));
        assert_eq!(config.buffer_size, 32 * 1024);
        Ok(())
    }

    #[test]
    fn custom_config() -> Result<()> {
        let settings = HashMap::from([
            (SHUFFLE_READ_BUFFER_REQUEST_TIMEOUT.to_string(), "1500".to_string()),
            (SHUFFLE_READ_BUFFER_SIZE.to_string(), "4096".to_string()),
            (SHUFFLE_READ_MEMORY.to_string(), "1048576".to_string()),
            ("ballista.job.name".to_string(), "ignored".to_string()),
        ]);
        let config = ShuffleReadConfig::with_settings(&settings)?;
        assert_eq!(config.buffer_request_timeout, Duration::from_millis(1500));
        assert_eq!(config.pool_request_wait, Duration::from_secs(2));
        assert_eq!(config.buffer_size, 4096);
        assert_eq!(config.total_memory, 1024 * 1024);

        let pool = config.create_buffer_pool()?;
        assert_eq!(pool.num_total_buffers(), 256);
        assert_eq!(pool.buffers_per_request(), 256);
        Ok(())
    }

    #[test]
    fn custom_config_invalid() {
        let settings = HashMap::from([(
            SHUFFLE_READ_BUFFER_SIZE.to_string(),
            "large".to_string(),
        )]);
        let result = ShuffleReadConfig::with_settings(&settings);
        assert!(matches!(result, Err(ShuffleReadError::Configuration(_))));

        let settings = HashMap::from([(
            "ballista.shuffle.read.unknown".to_string(),
            "1".to_string(),
        )]);
        let result = ShuffleReadConfig::with_settings(&settings);
        assert!(matches!(result, Err(ShuffleReadError::Configuration(_))));

        let settings = HashMap::from([(SHUFFLE_READ_MEMORY.to_string(), "1024".to_string())]);
        let result = ShuffleReadConfig::with_settings(&settings);
        assert!(matches!(result, Err(ShuffleReadError::Configuration(_))));

        let config = ShuffleReadConfig::default().with_buffer_request_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
        assert!(config.create_buffer_pool().is_err());
    }

    #[test]
    fn zero_pool_request_wait_is_rejected() {
        let settings = HashMap::from([(
            SHUFFLE_READ_POOL_REQUEST_WAIT.to_string(),
            "0".to_string(),
        )]);
        let result = ShuffleReadConfig::with_settings(&settings);
        assert!(matches!(
            result,
            Err(ShuffleReadError::Configuration(message)) if message.contains(SHUFFLE_READ_POOL_REQUEST_WAIT)
        ));

        let config = ShuffleReadConfig {
            pool_request_wait: Duration::ZERO,
            ..ShuffleReadConfig::default()
        };
        assert!(config.create_buffer_pool().is_err());
    }

    #[test]
    fn entries_have_valid_defaults() {
        for entry in ShuffleReadConfig::valid_entries().values() {
            assert!(entry.name().starts_with(CONFIG_PREFIX));
            assert!(!entry.description().is_empty());
            assert!(entry.default_value().parse::<u64>().is_ok());
        }
    }
}
