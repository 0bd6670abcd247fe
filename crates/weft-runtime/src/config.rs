//! Runtime configuration

use weft_core::{env_get, WeftError, WeftResult};

/// Configuration for the runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of worker threads (defaults to CPU count, `WEFT_WORKERS`)
    pub workers: usize,

    /// Stack size per fiber in bytes (`WEFT_STACK_KB`)
    pub stack_size: usize,

    /// Timer wheel tick resolution in milliseconds (`WEFT_TICK_MS`)
    pub tick_ms: u64,

    /// Timer wheel slot count
    pub wheel_slots: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            workers: env_get("WEFT_WORKERS", cpus),
            stack_size: env_get("WEFT_STACK_KB", 128usize) * 1024,
            tick_ms: env_get("WEFT_TICK_MS", 1u64),
            wheel_slots: 256,
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker threads
    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    /// Set the per-fiber stack size in bytes
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    /// Set the timer tick resolution in milliseconds
    pub fn tick_ms(mut self, ms: u64) -> Self {
        self.tick_ms = ms;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> WeftResult<()> {
        if self.workers == 0 {
            return Err(WeftError::Config("workers must be at least 1"));
        }
        if self.stack_size == 0 {
            return Err(WeftError::Config("stack size must be non-zero"));
        }
        if self.tick_ms == 0 {
            return Err(WeftError::Config("tick resolution must be non-zero"));
        }
        if self.wheel_slots == 0 {
            return Err(WeftError::Config("wheel must have at least one slot"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(RuntimeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let cfg = RuntimeConfig::default().workers(0);
        assert!(matches!(cfg.validate(), Err(WeftError::Config(_))));
    }

    #[test]
    fn test_builder() {
        let cfg = RuntimeConfig::new().workers(2).stack_size(64 * 1024).tick_ms(5);
        assert_eq!(cfg.workers, 2);
        assert_eq!(cfg.stack_size, 64 * 1024);
        assert_eq!(cfg.tick_ms, 5);
    }
}
