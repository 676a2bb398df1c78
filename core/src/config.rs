//! Engine tunables.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Smallest accepted code arena (one host page).
pub const MIN_CODE_ARENA_SIZE: usize = 4096;

/// Translation engine configuration.
///
/// Missing fields take their defaults when deserialized, so a
/// config file only needs to name what it overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcgConfig {
    /// Interpreted executions of one PA before it is queued for
    /// compilation. Lower values compile colder code sooner at the
    /// price of compile work that may never pay back.
    pub promotion_threshold: u32,
    /// Maximum guest instructions between two safepoints inside a
    /// compiled block. Bounds interrupt latency of compiled loops.
    pub safepoint_interval: u32,
    /// Capacity of the host code arena in bytes. When full, least
    /// recently used blocks are evicted.
    pub code_arena_size: usize,
    /// Capacity of the compile queue. Requests beyond it are dropped
    /// and retried on a later miss.
    pub compile_queue_depth: usize,
    /// Maximum guest instructions in one basic block.
    pub max_block_insns: u32,
    /// Run compilation on a background worker thread. When off, the
    /// embedder drains the queue itself.
    pub background_compile: bool,
}

impl Default for TcgConfig {
    fn default() -> Self {
        Self {
            promotion_threshold: 64,
            safepoint_interval: 65536,
            code_arena_size: 128 * 1024 * 1024,
            compile_queue_depth: 256,
            max_block_insns: 512,
            background_compile: true,
        }
    }
}

impl TcgConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.promotion_threshold == 0
            || self.promotion_threshold > u16::MAX as u32
        {
            return Err(ConfigError::PromotionThreshold(
                self.promotion_threshold,
            ));
        }
        if self.safepoint_interval == 0 {
            return Err(ConfigError::SafepointInterval);
        }
        if self.code_arena_size < MIN_CODE_ARENA_SIZE {
            return Err(ConfigError::ArenaTooSmall {
                min: MIN_CODE_ARENA_SIZE,
                got: self.code_arena_size,
            });
        }
        if self.compile_queue_depth == 0 {
            return Err(ConfigError::QueueDepth);
        }
        if self.max_block_insns == 0 || self.max_block_insns > 4096 {
            return Err(ConfigError::MaxBlockInsns(self.max_block_insns));
        }
        Ok(())
    }
}
