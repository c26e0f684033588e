use uuid::Uuid;

use crate::error::{RbmError, Result};

/// Sentinel value identifying a formatted device. A mismatch means "no
/// valid superblock", not merely "different version" — this layout does
/// not version the superblock.
pub const RBM_MAGIC: u32 = 0xFF;

/// Fixed size of the on-disk superblock region: one aligned device block.
pub const RBM_SUPERBLOCK_SIZE: usize = 4096;

bitflags::bitflags! {
    /// Feature bits recorded in the superblock.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RbmFeature: u32 {
        /// Bitmap blocks carry a CRC32C checksum over their bit array.
        const BITMAP_BLOCK_CRC = 0b0000_0001;
    }
}

/// On-disk superblock describing device geometry and allocator state.
///
/// Encoded in a fixed field order; `crc` is computed over the encoded
/// record with the `crc` field itself treated as zero, then filled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RbmMetadataHeader {
    pub uuid: Uuid,
    pub magic: u32,
    pub start: u64,
    pub end: u64,
    pub block_size: u64,
    pub size: u64,
    pub free_block_count: u64,
    pub alloc_area_size: u64,
    pub start_alloc_area: u64,
    pub start_data_area: u64,
    pub flag: u32,
    pub feature: RbmFeature,
    pub crc: u32,
}

// Layout (all little-endian):
// 0      magic              u32
// 4      uuid               16 bytes
// 20     start              u64
// 28     end                u64
// 36     block_size         u64
// 44     size               u64
// 52     free_block_count   u64
// 60     alloc_area_size    u64
// 68     start_alloc_area   u64
// 76     start_data_area    u64
// 84     flag               u32
// 88     feature            u32
// 92     crc                u32
const OFF_MAGIC: usize = 0;
const OFF_UUID: usize = 4;
const OFF_START: usize = 20;
const OFF_END: usize = 28;
const OFF_BLOCK_SIZE: usize = 36;
const OFF_SIZE: usize = 44;
const OFF_FREE_BLOCK_COUNT: usize = 52;
const OFF_ALLOC_AREA_SIZE: usize = 60;
const OFF_START_ALLOC_AREA: usize = 68;
const OFF_START_DATA_AREA: usize = 76;
const OFF_FLAG: usize = 84;
const OFF_FEATURE: usize = 88;
const OFF_CRC: usize = 92;
const ENCODED_LEN: usize = 96;

impl RbmMetadataHeader {
    /// Encode into a `RBM_SUPERBLOCK_SIZE` buffer, computing `crc` over the
    /// encoded record with the `crc` field treated as zero.
    pub fn to_bytes(&self) -> [u8; RBM_SUPERBLOCK_SIZE] {
        let mut buf = [0u8; RBM_SUPERBLOCK_SIZE];
        buf[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(&self.magic.to_le_bytes());
        buf[OFF_UUID..OFF_UUID + 16].copy_from_slice(self.uuid.as_bytes());
        buf[OFF_START..OFF_START + 8].copy_from_slice(&self.start.to_le_bytes());
        buf[OFF_END..OFF_END + 8].copy_from_slice(&self.end.to_le_bytes());
        buf[OFF_BLOCK_SIZE..OFF_BLOCK_SIZE + 8].copy_from_slice(&self.block_size.to_le_bytes());
        buf[OFF_SIZE..OFF_SIZE + 8].copy_from_slice(&self.size.to_le_bytes());
        buf[OFF_FREE_BLOCK_COUNT..OFF_FREE_BLOCK_COUNT + 8]
            .copy_from_slice(&self.free_block_count.to_le_bytes());
        buf[OFF_ALLOC_AREA_SIZE..OFF_ALLOC_AREA_SIZE + 8]
            .copy_from_slice(&self.alloc_area_size.to_le_bytes());
        buf[OFF_START_ALLOC_AREA..OFF_START_ALLOC_AREA + 8]
            .copy_from_slice(&self.start_alloc_area.to_le_bytes());
        buf[OFF_START_DATA_AREA..OFF_START_DATA_AREA + 8]
            .copy_from_slice(&self.start_data_area.to_le_bytes());
        buf[OFF_FLAG..OFF_FLAG + 4].copy_from_slice(&self.flag.to_le_bytes());
        buf[OFF_FEATURE..OFF_FEATURE + 4].copy_from_slice(&self.feature.bits().to_le_bytes());
        // crc field left zeroed for the hash, then filled in below.

        let crc = crc32c::crc32c(&buf[..ENCODED_LEN]);
        buf[OFF_CRC..OFF_CRC + 4].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decode and verify a superblock. Returns `NotFound` on magic
    /// mismatch, `Io` on CRC mismatch (both treated as "device not
    /// formatted"/"corrupt" per the manager's error surface).
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < RBM_SUPERBLOCK_SIZE {
            return Err(RbmError::Io("buffer too small for superblock".to_string()));
        }

        let magic = u32::from_le_bytes(buf[OFF_MAGIC..OFF_MAGIC + 4].try_into().unwrap());
        if magic != RBM_MAGIC {
            return Err(RbmError::NotFound("superblock magic mismatch".to_string()));
        }

        let stored_crc = u32::from_le_bytes(buf[OFF_CRC..OFF_CRC + 4].try_into().unwrap());
        let mut check_buf = [0u8; ENCODED_LEN];
        check_buf.copy_from_slice(&buf[..ENCODED_LEN]);
        check_buf[OFF_CRC..OFF_CRC + 4].copy_from_slice(&[0, 0, 0, 0]);
        let computed_crc = crc32c::crc32c(&check_buf);
        if computed_crc != stored_crc {
            return Err(RbmError::Io("superblock checksum mismatch".to_string()));
        }

        let uuid = Uuid::from_bytes(buf[OFF_UUID..OFF_UUID + 16].try_into().unwrap());
        let start = u64::from_le_bytes(buf[OFF_START..OFF_START + 8].try_into().unwrap());
        let end = u64::from_le_bytes(buf[OFF_END..OFF_END + 8].try_into().unwrap());
        let block_size = u64::from_le_bytes(buf[OFF_BLOCK_SIZE..OFF_BLOCK_SIZE + 8].try_into().unwrap());
        let size = u64::from_le_bytes(buf[OFF_SIZE..OFF_SIZE + 8].try_into().unwrap());
        let free_block_count =
            u64::from_le_bytes(buf[OFF_FREE_BLOCK_COUNT..OFF_FREE_BLOCK_COUNT + 8].try_into().unwrap());
        let alloc_area_size =
            u64::from_le_bytes(buf[OFF_ALLOC_AREA_SIZE..OFF_ALLOC_AREA_SIZE + 8].try_into().unwrap());
        let start_alloc_area = u64::from_le_bytes(
            buf[OFF_START_ALLOC_AREA..OFF_START_ALLOC_AREA + 8].try_into().unwrap(),
        );
        let start_data_area = u64::from_le_bytes(
            buf[OFF_START_DATA_AREA..OFF_START_DATA_AREA + 8].try_into().unwrap(),
        );
        let flag = u32::from_le_bytes(buf[OFF_FLAG..OFF_FLAG + 4].try_into().unwrap());
        let feature_bits = u32::from_le_bytes(buf[OFF_FEATURE..OFF_FEATURE + 4].try_into().unwrap());
        let feature = RbmFeature::from_bits_truncate(feature_bits);

        Ok(RbmMetadataHeader {
            uuid,
            magic,
            start,
            end,
            block_size,
            size,
            free_block_count,
            alloc_area_size,
            start_alloc_area,
            start_data_area,
            flag,
            feature,
            crc: stored_crc,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> RbmMetadataHeader {
        RbmMetadataHeader {
            uuid: Uuid::new_v4(),
            magic: RBM_MAGIC,
            start: 0,
            end: 1_048_576,
            block_size: 4096,
            size: 1_048_576,
            free_block_count: 254,
            alloc_area_size: 4096,
            start_alloc_area: 4096,
            start_data_area: 8192,
            flag: 0,
            feature: RbmFeature::BITMAP_BLOCK_CRC,
            crc: 0,
        }
    }

    #[test]
    fn round_trips_through_encode_decode() {
        let hdr = sample_header();
        let bytes = hdr.to_bytes();
        let decoded = RbmMetadataHeader::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.uuid, hdr.uuid);
        assert_eq!(decoded.start, hdr.start);
        assert_eq!(decoded.end, hdr.end);
        assert_eq!(decoded.block_size, hdr.block_size);
        assert_eq!(decoded.free_block_count, hdr.free_block_count);
        assert_eq!(decoded.feature, hdr.feature);
    }

    #[test]
    fn bad_magic_is_not_found() {
        let hdr = sample_header();
        let mut bytes = hdr.to_bytes();
        bytes[OFF_MAGIC] ^= 0xFF;
        assert!(matches!(
            RbmMetadataHeader::from_bytes(&bytes),
            Err(RbmError::NotFound(_))
        ));
    }

    #[test]
    fn flipped_bit_fails_crc() {
        let hdr = sample_header();
        let mut bytes = hdr.to_bytes();
        // Flip a bit well past the checksum field, inside the payload.
        bytes[OFF_START_DATA_AREA] ^= 0x01;
        assert!(matches!(
            RbmMetadataHeader::from_bytes(&bytes),
            Err(RbmError::Io(_))
        ));
    }
}
