use std::path::Path;

use log::{debug, info};

use crate::allocator::find_free_block;
use crate::bitmap::{rbm_sync_block_bitmap, rbm_sync_block_bitmap_by_range, BitmapOp, RbmBitmapBlock};
use crate::device::{BlockDevice, FileBlockDevice};
use crate::error::{RbmError, Result};
use crate::superblock::{RbmFeature, RbmMetadataHeader, RBM_MAGIC, RBM_SUPERBLOCK_SIZE};
use crate::transaction::{DeltaOp, Transaction};

/// Geometry handed to `Rbm::mkfs`.
#[derive(Debug, Clone, Copy)]
pub struct MkfsConfig {
    pub start: u64,
    pub end: u64,
    pub block_size: u64,
    pub total_size: u64,
}

/// Number of leading bit positions (superblock + bitmap area) that are
/// permanently allocated and never handed out, given a formatted device's
/// `start_data_area`/`block_size`.
fn reserved_blocks(header: &RbmMetadataHeader) -> u64 {
    (header.start_data_area - header.start) / header.block_size
}

/// Smallest `alloc_area_size` (in bytes, a multiple of `block_size`) whose
/// bitmap blocks can address every block left over after the superblock,
/// including the bitmap area's own blocks.
///
/// If `n` is the number of bitmap blocks and `m` the bits each one holds,
/// the data area gets `available - n` blocks, and needs `n >= ceil((available
/// - n) / m)` bitmap blocks to cover them, i.e. `n >= available / (m + 1)`
/// rounded up.
fn alloc_area_size(total_size: u64, block_size: u64) -> u64 {
    let m = RbmBitmapBlock::max_block_by_bitmap_block(block_size as usize);
    let available = (total_size - RBM_SUPERBLOCK_SIZE as u64) / block_size;
    let n = (available + m) / (m + 1);
    n.max(1) * block_size
}

/// Owns the device handle and the in-memory superblock; the single entry
/// point for formatting, attaching to, and operating on a block device.
///
/// Single-threaded cooperative scheduling, per the manager's concurrency
/// model: every method takes `&mut self` and there is no internal fan-out,
/// so callers serialize through the future chain naturally.
pub struct Rbm<D: BlockDevice> {
    device: D,
    header: RbmMetadataHeader,
}

impl Rbm<FileBlockDevice> {
    /// Format a fresh device, or do nothing if a valid superblock is
    /// already present at `cfg.start` (idempotent).
    pub async fn mkfs(path: &Path, cfg: MkfsConfig) -> Result<()> {
        if cfg.total_size != cfg.end - cfg.start {
            return Err(RbmError::InvalidConfig(
                "total_size must equal end - start".to_string(),
            ));
        }
        if cfg.total_size < 2 * cfg.block_size {
            return Err(RbmError::InvalidConfig(
                "total_size must hold at least a superblock and one bitmap block".to_string(),
            ));
        }
        if cfg.block_size == 0 || !cfg.block_size.is_power_of_two() {
            return Err(RbmError::InvalidConfig(
                "block_size must be a nonzero power of two".to_string(),
            ));
        }

        let mut device = FileBlockDevice::new(cfg.block_size);
        device.open(path, false).await?;

        let already_formatted = {
            let mut buf = vec![0u8; RBM_SUPERBLOCK_SIZE];
            match device.read(cfg.start, &mut buf).await {
                Ok(()) => RbmMetadataHeader::from_bytes(&buf).is_ok(),
                Err(_) => false,
            }
        };
        if already_formatted {
            info!("mkfs: superblock already present at {}, leaving untouched", cfg.start);
            device.close().await?;
            return Ok(());
        }

        let result = Self::format(&mut device, cfg).await;
        device.close().await?;
        result
    }

    async fn format(device: &mut FileBlockDevice, cfg: MkfsConfig) -> Result<()> {
        let feature = RbmFeature::BITMAP_BLOCK_CRC;
        let start_alloc_area = cfg.start + RBM_SUPERBLOCK_SIZE as u64;
        let area_size = alloc_area_size(cfg.total_size, cfg.block_size);
        let start_data_area = start_alloc_area + area_size;
        if start_data_area >= cfg.end {
            return Err(RbmError::InvalidConfig(
                "device too small to hold any data blocks".to_string(),
            ));
        }
        let total_data_blocks = (cfg.end - start_data_area) / cfg.block_size;
        let free_block_count = cfg.total_size / cfg.block_size - 2;

        let header = RbmMetadataHeader {
            uuid: uuid::Uuid::new_v4(),
            magic: RBM_MAGIC,
            start: cfg.start,
            end: cfg.end,
            block_size: cfg.block_size,
            size: cfg.total_size,
            free_block_count,
            alloc_area_size: area_size,
            start_alloc_area,
            start_data_area,
            flag: 0,
            feature,
            crc: 0,
        };

        device.write(cfg.start, &header.to_bytes()).await?;

        Self::init_bitmap(device, &header, total_data_blocks).await?;

        info!(
            "mkfs: formatted device at {} ({} bytes, {} data blocks)",
            cfg.start, cfg.total_size, total_data_blocks
        );
        Ok(())
    }

    /// Lay out the bitmap area per §4.6: reserved blocks and tail slack
    /// are permanently set, the rest of the data region is cleared.
    async fn init_bitmap(
        device: &mut FileBlockDevice,
        header: &RbmMetadataHeader,
        total_data_blocks: u64,
    ) -> Result<()> {
        let block_size = header.block_size;
        let feature = header.feature;
        let start_alloc_area = header.start_alloc_area;
        let m = RbmBitmapBlock::max_block_by_bitmap_block(block_size as usize);
        let reserved = reserved_blocks(header);
        debug_assert!(reserved <= m, "reserved region must fit in one bitmap block");

        let total_covered = reserved + total_data_blocks;
        let full_blocks_count = total_covered / m;
        let remain = total_covered % m;

        // Block 0 always carries the reserved bits; if the whole covered
        // range fits in one bitmap block it also carries the tail slack.
        let mut block0 = RbmBitmapBlock::new_zeroed(block_size as usize);
        if reserved > 0 {
            block0.set_range(0, reserved - 1, true);
        }
        if full_blocks_count == 0 && remain < m {
            block0.set_range(remain, m - 1, true);
        }
        rbm_sync_block_bitmap(device, start_alloc_area, block_size, feature, &block0, 0).await?;

        // Any further fully-covered bitmap blocks are pure data and start
        // out entirely free.
        if full_blocks_count > 1 {
            rbm_sync_block_bitmap_by_range(
                device,
                start_alloc_area,
                block_size,
                feature,
                m,
                full_blocks_count * m - 1,
                BitmapOp::AllClear,
            )
            .await?;
        }

        // A separate final bitmap block beyond block 0, with tail slack.
        if full_blocks_count >= 1 && remain > 0 {
            let mut tail = RbmBitmapBlock::new_zeroed(block_size as usize);
            tail.set_range(remain, m - 1, true);
            rbm_sync_block_bitmap(device, start_alloc_area, block_size, feature, &tail, full_blocks_count).await?;
        }

        Ok(())
    }

    /// Open an existing device, reading and verifying the superblock at
    /// `superblock_addr`.
    pub async fn open(path: &Path, superblock_addr: u64) -> Result<Self> {
        let mut device = FileBlockDevice::new(4096);
        device.open(path, false).await?;

        let mut buf = vec![0u8; RBM_SUPERBLOCK_SIZE];
        let header = match device.read(superblock_addr, &mut buf).await {
            Ok(()) => RbmMetadataHeader::from_bytes(&buf),
            Err(e) => Err(e),
        };
        let header = match header {
            Ok(h) => h,
            Err(_) => {
                let _ = device.close().await;
                return Err(RbmError::NotFound(format!(
                    "no valid superblock at {superblock_addr}"
                )));
            }
        };

        // The device was opened with a placeholder block size before the
        // real one was known; re-probe/re-open at the superblock's value
        // if it differs (ordinary files keep whatever was probed).
        if header.block_size != device.block_size() {
            device.close().await?;
            device = FileBlockDevice::new(header.block_size);
            device.open(path, false).await?;
        }

        info!(
            "open: attached to device {} at {superblock_addr}, {} free blocks",
            header.uuid, header.free_block_count
        );
        Ok(Rbm { device, header })
    }
}

impl<D: BlockDevice> Rbm<D> {
    pub async fn close(&mut self) -> Result<()> {
        self.device.close().await
    }

    pub fn header(&self) -> &RbmMetadataHeader {
        &self.header
    }

    /// Bounds-check an address against the device's total size. Shared by
    /// `read` and `write`; `read` additionally checks `buf.len()` (§4.7).
    fn check_addr(&self, addr: u64) -> Result<()> {
        let bound = self.header.end - self.header.start;
        if addr > bound {
            return Err(RbmError::OutOfRange(format!(
                "addr {addr} outside [0, {bound})"
            )));
        }
        Ok(())
    }

    /// Read `buf.len()` bytes at `addr`. Bounds-checked against the
    /// device's total size, both `addr` and `buf.len()` (§4.7); the caller
    /// is responsible for staying within the data area.
    pub async fn read(&mut self, addr: u64, buf: &mut [u8]) -> Result<()> {
        self.check_addr(addr)?;
        let bound = self.header.end - self.header.start;
        if buf.len() as u64 > bound {
            return Err(RbmError::OutOfRange(format!(
                "len {} outside [0, {bound})",
                buf.len()
            )));
        }
        self.device.read(addr, buf).await
    }

    /// Write `buf` at `addr`. Bounds-checked against the device's total
    /// size on `addr` only — §4.7 does not require `write` to also bound
    /// `buf.len()`.
    pub async fn write(&mut self, addr: u64, buf: &[u8]) -> Result<()> {
        self.check_addr(addr)?;
        self.device.write(addr, buf).await
    }

    fn reserved_blocks(&self) -> u64 {
        reserved_blocks(&self.header)
    }

    fn total_data_blocks(&self) -> u64 {
        (self.header.end - self.header.start_data_area) / self.header.block_size
    }

    /// Find `ceil(size / block_size)` free blocks and record a `SET` delta
    /// on `txn`. Does not touch the on-disk bitmap.
    pub async fn alloc_extent(&mut self, txn: &mut Transaction, size: u64) -> Result<()> {
        let count = (size + self.header.block_size - 1) / self.header.block_size;
        let pending = txn.pending_set_ids();
        let found = find_free_block(
            &mut self.device,
            self.header.start_alloc_area,
            self.header.block_size,
            self.header.feature,
            self.reserved_blocks(),
            self.total_data_blocks(),
            &pending,
            count,
        )
        .await?;
        if found.is_empty() {
            return Err(RbmError::NoSpace);
        }
        txn.push_delta(DeltaOp::Set, found);
        Ok(())
    }

    /// Record a `CLEAR` delta for `[from, to]` (both inclusive byte
    /// addresses — §9 open question 4). Does not touch the on-disk
    /// bitmap.
    pub fn free_extent(&mut self, txn: &mut Transaction, from: u64, to: u64) -> Result<()> {
        let block_size = self.header.block_size;
        let data_start = self.header.start_data_area;
        let first = (from - data_start) / block_size;
        let last = (to - data_start) / block_size;
        let mut ids = crate::interval_set::IntervalSet::new();
        ids.insert(first, last - first + 1);
        txn.push_delta(DeltaOp::Clear, ids);
        Ok(())
    }

    pub fn abort_allocation(&mut self, txn: &mut Transaction) {
        txn.abort();
    }

    /// Persist every delta on `txn` to the on-disk bitmap, in
    /// delta-insertion and then interval-iteration order, and adjust the
    /// in-memory `free_block_count`. The superblock itself is not
    /// rewritten here — see `sync_superblock` and Open Question 1.
    pub async fn complete_allocation(&mut self, txn: &mut Transaction) -> Result<()> {
        let reserved = self.reserved_blocks();
        let mut set_count: u64 = 0;
        let mut clear_count: u64 = 0;

        for delta in txn.deltas() {
            let op = match delta.op {
                DeltaOp::Set => BitmapOp::AllSet,
                DeltaOp::Clear => BitmapOp::AllClear,
            };
            for (start, len) in delta.alloc_blk_ids.iter() {
                let abs_start = start + reserved;
                let abs_end = abs_start + len - 1;
                rbm_sync_block_bitmap_by_range(
                    &mut self.device,
                    self.header.start_alloc_area,
                    self.header.block_size,
                    self.header.feature,
                    abs_start,
                    abs_end,
                    op,
                )
                .await?;
                match delta.op {
                    DeltaOp::Set => set_count += len,
                    DeltaOp::Clear => clear_count += len,
                }
            }
        }

        self.header.free_block_count = self
            .header
            .free_block_count
            .saturating_sub(set_count)
            .saturating_add(clear_count);
        debug!(
            "complete_allocation: -{} +{} free_block_count now {}",
            set_count, clear_count, self.header.free_block_count
        );
        txn.abort();
        Ok(())
    }

    /// Explicit, caller-invoked persistence of the in-memory superblock
    /// (notably `free_block_count`). `complete_allocation` never calls
    /// this on its own — see Open Question 1.
    pub async fn sync_superblock(&mut self) -> Result<()> {
        self.device
            .write(self.header.start, &self.header.to_bytes())
            .await
    }
}
