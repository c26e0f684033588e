use crate::device::BlockDevice;
use crate::error::{RbmError, Result};
use crate::superblock::RbmFeature;

/// Size of the fixed bitmap-block header: a `u32` payload length followed
/// by a `u32` CRC32C checksum over the bit array.
const BITMAP_HEADER_SIZE: usize = 8;

/// Which state to apply to every bit in a range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitmapOp {
    AllSet,
    AllClear,
}

/// One device block's worth of allocation state: a small header (payload
/// size, checksum) followed by a packed bit array. Bit `i` corresponds to
/// data block id `bitmap_block_no * max_block_by_bitmap_block() + i`.
#[derive(Debug, Clone)]
pub struct RbmBitmapBlock {
    pub bits: Vec<u8>,
    block_size: usize,
}

impl RbmBitmapBlock {
    /// Number of bits a bitmap block of `block_size` bytes can hold: the
    /// largest whole-byte bit count that fits after the header.
    pub fn max_block_by_bitmap_block(block_size: usize) -> u64 {
        ((block_size - BITMAP_HEADER_SIZE) * 8) as u64
    }

    /// A fresh, all-zero (all-free) bitmap block.
    pub fn new_zeroed(block_size: usize) -> Self {
        let payload_bytes = block_size - BITMAP_HEADER_SIZE;
        RbmBitmapBlock {
            bits: vec![0u8; payload_bytes],
            block_size,
        }
    }

    /// A fresh bitmap block with every bit set (all-allocated).
    pub fn new_filled(block_size: usize) -> Self {
        let payload_bytes = block_size - BITMAP_HEADER_SIZE;
        RbmBitmapBlock {
            bits: vec![0xFFu8; payload_bytes],
            block_size,
        }
    }

    pub fn new_for_op(block_size: usize, op: BitmapOp) -> Self {
        match op {
            BitmapOp::AllSet => Self::new_filled(block_size),
            BitmapOp::AllClear => Self::new_zeroed(block_size),
        }
    }

    pub fn get_bit(&self, i: u64) -> bool {
        let idx = (i / 8) as usize;
        let mask = 1u8 << (i % 8);
        (self.bits[idx] & mask) != 0
    }

    pub fn set_bit(&mut self, i: u64, value: bool) {
        let idx = (i / 8) as usize;
        let mask = 1u8 << (i % 8);
        if value {
            self.bits[idx] |= mask;
        } else {
            self.bits[idx] &= !mask;
        }
    }

    /// Set every bit in the inclusive range `[lo, hi]` to `value`.
    pub fn set_range(&mut self, lo: u64, hi: u64, value: bool) {
        for i in lo..=hi {
            self.set_bit(i, value);
        }
    }

    /// Encode into a full `block_size` buffer. Recomputes the checksum
    /// over the bit array when `feature` requests it.
    pub fn to_bytes(&self, feature: RbmFeature) -> Vec<u8> {
        let mut buf = vec![0u8; self.block_size];
        let payload_len = self.bits.len() as u32;
        buf[0..4].copy_from_slice(&payload_len.to_le_bytes());
        let checksum = if feature.contains(RbmFeature::BITMAP_BLOCK_CRC) {
            crc32c::crc32c(&self.bits)
        } else {
            0
        };
        buf[4..8].copy_from_slice(&checksum.to_le_bytes());
        buf[BITMAP_HEADER_SIZE..BITMAP_HEADER_SIZE + self.bits.len()].copy_from_slice(&self.bits);
        buf
    }

    /// Decode a bitmap block, verifying its checksum if `feature` requests
    /// it.
    pub fn from_bytes(buf: &[u8], block_size: usize, feature: RbmFeature) -> Result<Self> {
        if buf.len() < block_size {
            return Err(RbmError::Io("buffer too small for bitmap block".to_string()));
        }
        let payload_len = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
        let checksum = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let expected_len = block_size - BITMAP_HEADER_SIZE;
        if payload_len != expected_len {
            return Err(RbmError::Io("bitmap block payload length mismatch".to_string()));
        }
        let bits = buf[BITMAP_HEADER_SIZE..BITMAP_HEADER_SIZE + payload_len].to_vec();
        if feature.contains(RbmFeature::BITMAP_BLOCK_CRC) {
            let computed = crc32c::crc32c(&bits);
            if computed != checksum {
                return Err(RbmError::Io("bitmap block checksum mismatch".to_string()));
            }
        }
        Ok(RbmBitmapBlock { bits, block_size })
    }
}

/// Apply `op` to every bit in the inclusive block-id range
/// `[start_blk, end_blk]`, reading and writing at most the bitmap blocks
/// that overlap the range.
///
/// This distinguishes the four alignment cases described for the bitmap
/// engine: fully aligned (no reads needed, middle blocks synthesized),
/// single unaligned block (one read-modify-write), front-unaligned /
/// back-aligned (one read, then synthesized blocks), and the fully
/// general case (two reads, synthesized blocks in between). Every call
/// performs at most two reads and one write.
pub async fn rbm_sync_block_bitmap_by_range<D: BlockDevice>(
    device: &mut D,
    start_alloc_area: u64,
    block_size: u64,
    feature: RbmFeature,
    start_blk: u64,
    end_blk: u64,
    op: BitmapOp,
) -> Result<()> {
    let m = RbmBitmapBlock::max_block_by_bitmap_block(block_size as usize);
    let bitmap_addr = |block_no: u64| start_alloc_area + block_no * block_size;

    let first_block_no = start_blk / m;
    let last_block_no = end_blk / m;
    let num_blocks = last_block_no - first_block_no + 1;

    let front_aligned = start_blk % m == 0;
    let back_aligned = (end_blk + 1) % m == 0;

    if front_aligned && back_aligned {
        // Case 1: fully aligned. No reads required; every covered block is
        // entirely overwritten, so synthesize fresh blocks and write them
        // as one contiguous buffer.
        let fresh = RbmBitmapBlock::new_for_op(block_size as usize, op);
        let fresh_bytes = fresh.to_bytes(feature);
        let mut combined = Vec::with_capacity(fresh_bytes.len() * num_blocks as usize);
        for _ in 0..num_blocks {
            combined.extend_from_slice(&fresh_bytes);
        }
        device
            .write(bitmap_addr(first_block_no), &combined)
            .await?;
        return Ok(());
    }

    if num_blocks == 1 {
        // Case 2: single unaligned bitmap block. Read-modify-write.
        let addr = bitmap_addr(first_block_no);
        let mut buf = vec![0u8; block_size as usize];
        device.read(addr, &mut buf).await?;
        let mut block = RbmBitmapBlock::from_bytes(&buf, block_size as usize, feature)?;
        let lo = start_blk % m;
        let hi = end_blk % m;
        block.set_range(lo, hi, op == BitmapOp::AllSet);
        let encoded = block.to_bytes(feature);
        device.write(addr, &encoded).await?;
        return Ok(());
    }

    if back_aligned {
        // Case 3: front-unaligned, back-aligned. Read and patch the first
        // block's tail, then append freshly synthesized fully-op blocks
        // for the rest of the range.
        let first_addr = bitmap_addr(first_block_no);
        let mut first_buf = vec![0u8; block_size as usize];
        device.read(first_addr, &mut first_buf).await?;
        let mut first_block = RbmBitmapBlock::from_bytes(&first_buf, block_size as usize, feature)?;
        let lo = start_blk % m;
        first_block.set_range(lo, m - 1, op == BitmapOp::AllSet);

        let mut combined = first_block.to_bytes(feature);
        let fresh = RbmBitmapBlock::new_for_op(block_size as usize, op);
        let fresh_bytes = fresh.to_bytes(feature);
        for _ in 0..(num_blocks - 1) {
            combined.extend_from_slice(&fresh_bytes);
        }
        debug_assert_eq!(combined.len() as u64, num_blocks * block_size);
        device.write(first_addr, &combined).await?;
        return Ok(());
    }

    // Case 4: general case, front- and back-unaligned. Read both the
    // first and last bitmap blocks, patch their edges, and synthesize any
    // fully-covered blocks in between. The combined write buffer must
    // span exactly [first_addr, next_addr_after_last + block_size).
    let first_addr = bitmap_addr(first_block_no);
    let last_addr = bitmap_addr(last_block_no);

    let mut first_buf = vec![0u8; block_size as usize];
    device.read(first_addr, &mut first_buf).await?;
    let mut first_block = RbmBitmapBlock::from_bytes(&first_buf, block_size as usize, feature)?;
    let lo = start_blk % m;
    first_block.set_range(lo, m - 1, op == BitmapOp::AllSet);

    let mut last_buf = vec![0u8; block_size as usize];
    device.read(last_addr, &mut last_buf).await?;
    let mut last_block = RbmBitmapBlock::from_bytes(&last_buf, block_size as usize, feature)?;
    let hi = end_blk % m;
    last_block.set_range(0, hi, op == BitmapOp::AllSet);

    let mut combined = first_block.to_bytes(feature);
    if num_blocks > 2 {
        let fresh = RbmBitmapBlock::new_for_op(block_size as usize, op);
        let fresh_bytes = fresh.to_bytes(feature);
        for _ in 0..(num_blocks - 2) {
            combined.extend_from_slice(&fresh_bytes);
        }
    }
    combined.extend_from_slice(&last_block.to_bytes(feature));

    debug_assert_eq!(combined.len() as u64, (last_addr + block_size) - first_addr);
    device.write(first_addr, &combined).await?;
    Ok(())
}

/// Aligned write of a single already-populated bitmap block. Used at
/// mkfs time, where the caller has already built the block's contents
/// rather than deriving them from a uniform `BitmapOp`.
pub async fn rbm_sync_block_bitmap<D: BlockDevice>(
    device: &mut D,
    start_alloc_area: u64,
    block_size: u64,
    feature: RbmFeature,
    block: &RbmBitmapBlock,
    block_no: u64,
) -> Result<()> {
    let addr = start_alloc_area + block_no * block_size;
    let encoded = block.to_bytes(feature);
    device.write(addr, &encoded).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::FileBlockDevice;

    const BLOCK_SIZE: u64 = 4096;

    async fn fresh_device(total_bytes: u64) -> (FileBlockDevice, tempfile::NamedTempFile) {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tokio::fs::File::create(tmp.path())
            .await
            .unwrap()
            .set_len(total_bytes)
            .await
            .unwrap();
        let mut dev = FileBlockDevice::new(BLOCK_SIZE);
        dev.open(tmp.path(), false).await.unwrap();
        (dev, tmp)
    }

    #[tokio::test]
    async fn bit_addressing_roundtrips_every_position() {
        let m = RbmBitmapBlock::max_block_by_bitmap_block(BLOCK_SIZE as usize);
        let mut block = RbmBitmapBlock::new_zeroed(BLOCK_SIZE as usize);
        for i in [0u64, 1, m / 2, m - 1] {
            block.set_bit(i, true);
            assert!(block.get_bit(i));
            block.set_bit(i, false);
            assert!(!block.get_bit(i));
        }
    }

    #[tokio::test]
    async fn codec_roundtrips_with_crc() {
        let mut block = RbmBitmapBlock::new_zeroed(BLOCK_SIZE as usize);
        block.set_bit(3, true);
        block.set_bit(100, true);
        let encoded = block.to_bytes(RbmFeature::BITMAP_BLOCK_CRC);
        let decoded =
            RbmBitmapBlock::from_bytes(&encoded, BLOCK_SIZE as usize, RbmFeature::BITMAP_BLOCK_CRC).unwrap();
        assert!(decoded.get_bit(3));
        assert!(decoded.get_bit(100));
        assert!(!decoded.get_bit(4));
    }

    #[tokio::test]
    async fn crc_mismatch_is_rejected() {
        let block = RbmBitmapBlock::new_zeroed(BLOCK_SIZE as usize);
        let mut encoded = block.to_bytes(RbmFeature::BITMAP_BLOCK_CRC);
        encoded[BITMAP_HEADER_SIZE] ^= 0x01;
        let result =
            RbmBitmapBlock::from_bytes(&encoded, BLOCK_SIZE as usize, RbmFeature::BITMAP_BLOCK_CRC);
        assert!(matches!(result, Err(RbmError::Io(_))));
    }

    #[tokio::test]
    async fn fully_aligned_range_needs_no_read() {
        let m = RbmBitmapBlock::max_block_by_bitmap_block(BLOCK_SIZE as usize);
        let (mut dev, _guard) = fresh_device(BLOCK_SIZE * 4).await;
        let feature = RbmFeature::BITMAP_BLOCK_CRC;
        // Range covering exactly one full bitmap block.
        rbm_sync_block_bitmap_by_range(&mut dev, 0, BLOCK_SIZE, feature, 0, m - 1, BitmapOp::AllSet)
            .await
            .unwrap();
        let mut buf = vec![0u8; BLOCK_SIZE as usize];
        dev.read(0, &mut buf).await.unwrap();
        let block = RbmBitmapBlock::from_bytes(&buf, BLOCK_SIZE as usize, feature).unwrap();
        for i in 0..m {
            assert!(block.get_bit(i));
        }
    }

    #[tokio::test]
    async fn single_unaligned_block_only_touches_requested_bits() {
        let (mut dev, _guard) = fresh_device(BLOCK_SIZE * 2).await;
        let feature = RbmFeature::BITMAP_BLOCK_CRC;
        rbm_sync_block_bitmap_by_range(&mut dev, 0, BLOCK_SIZE, feature, 10, 20, BitmapOp::AllSet)
            .await
            .unwrap();
        let mut buf = vec![0u8; BLOCK_SIZE as usize];
        dev.read(0, &mut buf).await.unwrap();
        let block = RbmBitmapBlock::from_bytes(&buf, BLOCK_SIZE as usize, feature).unwrap();
        for i in 0..10 {
            assert!(!block.get_bit(i));
        }
        for i in 10..=20 {
            assert!(block.get_bit(i));
        }
        assert!(!block.get_bit(21));
    }

    #[tokio::test]
    async fn general_case_spans_exactly_the_requested_blocks() {
        let m = RbmBitmapBlock::max_block_by_bitmap_block(BLOCK_SIZE as usize);
        // Three bitmap blocks' worth of device, plus room for the data area.
        let (mut dev, _guard) = fresh_device(BLOCK_SIZE * 4).await;
        let feature = RbmFeature::BITMAP_BLOCK_CRC;
        let start = m - 5; // unaligned front, in block 0
        let end = 2 * m + 5; // unaligned back, in block 2
        rbm_sync_block_bitmap_by_range(&mut dev, 0, BLOCK_SIZE, feature, start, end, BitmapOp::AllSet)
            .await
            .unwrap();

        for block_no in 0..3u64 {
            let mut buf = vec![0u8; BLOCK_SIZE as usize];
            dev.read(block_no * BLOCK_SIZE, &mut buf).await.unwrap();
            let block = RbmBitmapBlock::from_bytes(&buf, BLOCK_SIZE as usize, feature).unwrap();
            match block_no {
                0 => {
                    for i in 0..(m - 5) {
                        assert!(!block.get_bit(i));
                    }
                    for i in (m - 5)..m {
                        assert!(block.get_bit(i));
                    }
                }
                1 => {
                    for i in 0..m {
                        assert!(block.get_bit(i));
                    }
                }
                2 => {
                    for i in 0..=5 {
                        assert!(block.get_bit(i));
                    }
                    for i in 6..m {
                        assert!(!block.get_bit(i));
                    }
                }
                _ => unreachable!(),
            }
        }
    }
}
