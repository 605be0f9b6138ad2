//! Pool tuning knobs. Defaults match the original deployment; each can be
//! overridden from the environment (`FSP_*`) the way the collector's other
//! options are.

use crate::util::constants::{DEFAULT_FREE_BATCH, DEFAULT_FSP_CAPACITY, DEFAULT_PAGE_SIZE_SMALL};

#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Size of a small page; the unit the free lists and targets deal in.
    pub page_size: usize,
    /// Batch size when handing empty pages back to the allocator.
    pub free_batch: usize,
    /// Initial capacity of the from-space index.
    pub fsp_capacity: usize,
    /// Number of per-CPU free-list shards.
    pub cpu_shards: usize,
}

fn env_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(value) => value.parse().unwrap_or_else(|_| {
            log::warn!("ignoring unparsable {}={}", key, value);
            default
        }),
        Err(_) => default,
    }
}

impl PoolOptions {
    pub fn from_env() -> Self {
        Self {
            page_size: env_usize("FSP_PAGE_SIZE", DEFAULT_PAGE_SIZE_SMALL),
            free_batch: env_usize("FSP_FREE_BATCH", DEFAULT_FREE_BATCH),
            fsp_capacity: env_usize("FSP_CAPACITY", DEFAULT_FSP_CAPACITY),
            cpu_shards: env_usize("FSP_CPU_SHARDS", num_cpus::get()),
        }
    }
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE_SMALL,
            free_batch: DEFAULT_FREE_BATCH,
            fsp_capacity: DEFAULT_FSP_CAPACITY,
            cpu_shards: num_cpus::get(),
        }
    }
}
