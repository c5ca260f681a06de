use buffer_state::BufferStateConfig;
use hwc_slots::HwcSlotAllocatorConfig;
use serde::{Deserialize, Serialize};

pub const DEFAULT_FENCE_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferLatchConfig {
    pub slots: HwcSlotAllocatorConfig,
    pub buffer_state: BufferStateConfig,
    pub fence_event_capacity: usize,
}

impl Default for BufferLatchConfig {
    fn default() -> Self {
        Self {
            slots: HwcSlotAllocatorConfig::default(),
            buffer_state: BufferStateConfig::default(),
            fence_event_capacity: DEFAULT_FENCE_EVENT_CAPACITY,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse buffer latch config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid buffer latch config: {0}")]
    Invalid(&'static str),
}

impl BufferLatchConfig {
    /// Parses a JSON document; missing fields keep their defaults.
    pub fn from_json_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slots.capacity == 0 {
            return Err(ConfigError::Invalid("slots.capacity must be at least 1"));
        }
        if self.buffer_state.frame_tracker.max_records == 0 {
            return Err(ConfigError::Invalid(
                "buffer_state.frame_tracker.max_records must be at least 1",
            ));
        }
        if self.buffer_state.counter_trace_capacity == 0 {
            return Err(ConfigError::Invalid(
                "buffer_state.counter_trace_capacity must be at least 1",
            ));
        }
        if self.fence_event_capacity == 0 {
            return Err(ConfigError::Invalid("fence_event_capacity must be at least 1"));
        }
        Ok(())
    }
}
