use crate::bitmap::RbmBitmapBlock;
use crate::device::BlockDevice;
use crate::error::Result;
use crate::interval_set::IntervalSet;
use crate::superblock::RbmFeature;

/// Scan the on-disk bitmap for a contiguous run of `count` free block ids,
/// skipping any id already claimed by `pending` (a transaction's pending
/// `SET` deltas).
///
/// Bitmap bit positions are absolute block offsets from the device `start`
/// (bit 0 is the superblock's own block), while `pending` and the returned
/// `IntervalSet` are expressed in `blk_id_t` — dense ids relative to
/// `start_data_area`. `reserved_blocks` is the number of leading bit
/// positions occupied by the superblock and bitmap area themselves
/// (`start_data_area / block_size`); the scan begins there and reports ids
/// as `absolute_position - reserved_blocks`.
///
/// First-fit in block-id order: the earliest contiguous run wins. Any
/// accepted-but-discontiguous candidate resets the accumulator rather than
/// being folded into a non-contiguous result, so the returned set (when
/// non-empty) is always a single contiguous run of exactly `count` ids.
/// Returns an empty `IntervalSet` if the scan reaches the data area
/// without finding enough free blocks (ENOSPC is the caller's concern,
/// signaled by the empty result).
#[allow(clippy::too_many_arguments)]
pub async fn find_free_block<D: BlockDevice>(
    device: &mut D,
    start_alloc_area: u64,
    block_size: u64,
    feature: RbmFeature,
    reserved_blocks: u64,
    total_data_blocks: u64,
    pending: &IntervalSet,
    count: u64,
) -> Result<IntervalSet> {
    let mut result = IntervalSet::new();
    if count == 0 {
        return Ok(result);
    }

    let m = RbmBitmapBlock::max_block_by_bitmap_block(block_size as usize);
    let total_covered = reserved_blocks + total_data_blocks;
    let num_bitmap_blocks = (total_covered + m - 1) / m;

    let mut run_start: Option<u64> = None;
    let mut run_len: u64 = 0;

    'scan: for bitmap_block_no in 0..num_bitmap_blocks {
        let addr = start_alloc_area + bitmap_block_no * block_size;
        let mut buf = vec![0u8; block_size as usize];
        device.read(addr, &mut buf).await?;
        let block = RbmBitmapBlock::from_bytes(&buf, block_size as usize, feature)?;

        for i in 0..m {
            let pos = bitmap_block_no * m + i;
            if pos >= total_covered {
                break 'scan;
            }
            if pos < reserved_blocks {
                run_start = None;
                run_len = 0;
                continue;
            }
            let b = pos - reserved_blocks;

            if pending.intersects(b) || block.get_bit(i) {
                run_start = None;
                run_len = 0;
                continue;
            }

            match run_start {
                Some(start) if start + run_len == b => {
                    run_len += 1;
                }
                _ => {
                    run_start = Some(b);
                    run_len = 1;
                }
            }

            if run_len == count {
                result.insert(run_start.unwrap(), run_len);
                return Ok(result);
            }
        }
    }

    // Not enough contiguous free blocks were found.
    Ok(IntervalSet::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::FileBlockDevice;

    const BLOCK_SIZE: u64 = 4096;

    async fn device_with_all_free(total_bitmap_blocks: u64) -> (FileBlockDevice, tempfile::NamedTempFile) {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let total = BLOCK_SIZE * total_bitmap_blocks;
        tokio::fs::File::create(tmp.path())
            .await
            .unwrap()
            .set_len(total)
            .await
            .unwrap();
        let mut dev = FileBlockDevice::new(BLOCK_SIZE);
        dev.open(tmp.path(), false).await.unwrap();

        let zeroed = RbmBitmapBlock::new_zeroed(BLOCK_SIZE as usize).to_bytes(RbmFeature::BITMAP_BLOCK_CRC);
        for block_no in 0..total_bitmap_blocks {
            dev.write(block_no * BLOCK_SIZE, &zeroed).await.unwrap();
        }
        (dev, tmp)
    }

    #[tokio::test]
    async fn finds_contiguous_run_from_lowest_free_id() {
        let (mut dev, _guard) = device_with_all_free(1).await;
        let pending = IntervalSet::new();
        let m = RbmBitmapBlock::max_block_by_bitmap_block(BLOCK_SIZE as usize);
        let found = find_free_block(&mut dev, 0, BLOCK_SIZE, RbmFeature::BITMAP_BLOCK_CRC, 0, m, &pending, 3)
            .await
            .unwrap();
        assert_eq!(found.iter().collect::<Vec<_>>(), vec![(0, 3)]);
    }

    #[tokio::test]
    async fn skips_pending_transaction_allocations() {
        let (mut dev, _guard) = device_with_all_free(1).await;
        let mut pending = IntervalSet::new();
        pending.insert(0, 2); // blocks 0,1 already claimed by this txn
        let m = RbmBitmapBlock::max_block_by_bitmap_block(BLOCK_SIZE as usize);
        let found = find_free_block(&mut dev, 0, BLOCK_SIZE, RbmFeature::BITMAP_BLOCK_CRC, 0, m, &pending, 2)
            .await
            .unwrap();
        assert_eq!(found.iter().collect::<Vec<_>>(), vec![(2, 2)]);
    }

    #[tokio::test]
    async fn restarts_on_a_gap_in_already_allocated_blocks() {
        let (mut dev, _guard) = device_with_all_free(1).await;
        let m = RbmBitmapBlock::max_block_by_bitmap_block(BLOCK_SIZE as usize);
        // Mark blocks [0..5) and [6..10) allocated on-disk, leaving a
        // single-block gap at id 5.
        let mut buf = vec![0u8; BLOCK_SIZE as usize];
        dev.read(0, &mut buf).await.unwrap();
        let mut block = RbmBitmapBlock::from_bytes(&buf, BLOCK_SIZE as usize, RbmFeature::BITMAP_BLOCK_CRC).unwrap();
        block.set_range(0, 4, true);
        block.set_range(6, 9, true);
        dev.write(0, &block.to_bytes(RbmFeature::BITMAP_BLOCK_CRC)).await.unwrap();

        let pending = IntervalSet::new();
        // Request 2 contiguous blocks: the only free run long enough
        // starts strictly after the gap, at id 10.
        let found = find_free_block(&mut dev, 0, BLOCK_SIZE, RbmFeature::BITMAP_BLOCK_CRC, 0, m, &pending, 2)
            .await
            .unwrap();
        assert_eq!(found.iter().collect::<Vec<_>>(), vec![(10, 2)]);
    }

    #[tokio::test]
    async fn returns_empty_set_on_enospc() {
        let (mut dev, _guard) = device_with_all_free(1).await;
        let m = RbmBitmapBlock::max_block_by_bitmap_block(BLOCK_SIZE as usize);
        let pending = IntervalSet::new();
        let found = find_free_block(
            &mut dev,
            0,
            BLOCK_SIZE,
            RbmFeature::BITMAP_BLOCK_CRC,
            0,
            m,
            &pending,
            m + 1,
        )
        .await
        .unwrap();
        assert!(found.is_empty());
    }
}
