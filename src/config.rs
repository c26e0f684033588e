use serde::{Deserialize, Serialize};

/// Manager-wide configuration with sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RbmConfig {
    pub device: DeviceConfig,
    pub allocator: AllocatorConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Logical block size in bytes. Must be a power of two.
    pub block_size: u64,
    /// Try to open the device with `O_DIRECT`, falling back to buffered
    /// I/O with `O_SYNC` if the device or filesystem doesn't support it.
    pub use_direct_io: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatorConfig {
    /// Whether bitmap blocks carry a CRC32C checksum
    /// (`RBM_BITMAP_BLOCK_CRC`). Disabling this is only meant for test
    /// fixtures that exercise the codec without the checksum path.
    pub bitmap_block_crc: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub enable_logging: bool,
    pub log_level: String,
    pub max_log_events: usize,
}

impl RbmConfig {
    /// Default configuration for production use.
    pub fn production() -> Self {
        RbmConfig {
            device: DeviceConfig {
                block_size: 4096,
                use_direct_io: true,
            },
            allocator: AllocatorConfig {
                bitmap_block_crc: true,
            },
            monitoring: MonitoringConfig {
                enable_logging: true,
                log_level: "info".to_string(),
                max_log_events: 10_000,
            },
        }
    }

    /// Configuration for unit/integration tests: no `O_DIRECT` (scratch
    /// files under `tempfile` are rarely aligned the way raw devices are),
    /// verbose logging, small bounded log buffer.
    pub fn testing() -> Self {
        let mut cfg = Self::production();
        cfg.device.use_direct_io = false;
        cfg.monitoring.log_level = "debug".to_string();
        cfg.monitoring.max_log_events = 1_000;
        cfg
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json).map_err(|e| anyhow::anyhow!("failed to parse config: {e}"))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.device.block_size == 0 || !self.device.block_size.is_power_of_two() {
            errors.push("device.block_size must be a nonzero power of two".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Default for RbmConfig {
    fn default() -> Self {
        Self::production()
    }
}
