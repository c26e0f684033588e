//! A persistent block allocator for a fixed-size device: a checksummed
//! superblock, an on-disk bitmap region, and a transactional interface for
//! reserving and releasing contiguous runs of fixed-size blocks. Storage
//! allocation substrate for higher-level object/extent layers, not a
//! general-purpose filesystem.

pub mod allocator;
pub mod bitmap;
pub mod config;
pub mod device;
pub mod error;
pub mod interval_set;
pub mod logging;
pub mod manager;
pub mod superblock;
pub mod transaction;

pub use allocator::find_free_block;
pub use bitmap::{rbm_sync_block_bitmap, rbm_sync_block_bitmap_by_range, BitmapOp, RbmBitmapBlock};
pub use config::{AllocatorConfig, DeviceConfig, MonitoringConfig, RbmConfig};
pub use device::{align_up, is_aligned, BlockDevice, FileBlockDevice};
pub use error::{RbmError, Result};
pub use interval_set::IntervalSet;
pub use logging::{EventLog, LogLevel, RbmLogEvent};
pub use manager::{MkfsConfig, Rbm};
pub use superblock::{RbmFeature, RbmMetadataHeader, RBM_MAGIC, RBM_SUPERBLOCK_SIZE};
pub use transaction::{DeltaOp, RbmAllocDelta, Transaction};
