//! Queue configuration types

use crate::error::{BrokerError, Result};
use crate::tags::MAX_TAGS_LIMIT;
use serde::{Deserialize, Serialize};

/// Queue configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueConfig {
    /// Maximum outstanding items (ready plus processing) across all tag groups
    pub max_size: usize,
    /// Maximum tags per tag set, capped at [`MAX_TAGS_LIMIT`]
    #[serde(default = "default_max_tags")]
    pub max_tags: usize,
    /// Keep permanently failed items in a bounded dead-letter queue
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead_letter_capacity: Option<usize>,
}

fn default_max_tags() -> usize {
    16
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 1024,
            max_tags: default_max_tags(),
            dead_letter_capacity: None,
        }
    }
}

impl QueueConfig {
    /// Create a configuration with the given capacity
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            ..Self::default()
        }
    }

    /// Set the tag limit (builder pattern)
    pub fn with_max_tags(mut self, max_tags: usize) -> Self {
        self.max_tags = max_tags;
        self
    }

    /// Enable the dead-letter queue (builder pattern)
    pub fn with_dead_letters(mut self, capacity: usize) -> Self {
        self.dead_letter_capacity = Some(capacity);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(BrokerError::ConfigError(
                "max_size must be greater than zero".to_string(),
            ));
        }
        if self.max_tags == 0 || self.max_tags > MAX_TAGS_LIMIT {
            return Err(BrokerError::ConfigError(format!(
                "max_tags must be between 1 and {}",
                MAX_TAGS_LIMIT
            )));
        }
        if self.dead_letter_capacity == Some(0) {
            return Err(BrokerError::ConfigError(
                "dead_letter_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
