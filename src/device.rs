use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::error::{RbmError, Result};

/// Contract for the non-volatile device this manager is built on top of.
///
/// Every method suspends as a future; within one device there is no
/// internal parallelism, matching the single-threaded cooperative
/// scheduling model described for this manager. `addr` and `buf.len()`
/// must be multiples of `block_size()`; implementations may assert this
/// but the manager itself is responsible for aligning every call.
#[allow(async_fn_in_trait)]
pub trait BlockDevice {
    async fn open(&mut self, path: &Path, read_only: bool) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
    async fn read(&mut self, addr: u64, buf: &mut [u8]) -> Result<()>;
    async fn write(&mut self, addr: u64, buf: &[u8]) -> Result<()>;
    fn block_size(&self) -> u64;
}

/// Round `value` up to the next multiple of `align`.
pub fn align_up(value: u64, align: u64) -> u64 {
    if align == 0 {
        return value;
    }
    (value + align - 1) / align * align
}

/// Whether `addr` is a multiple of `align`.
pub fn is_aligned(addr: u64, align: u64) -> bool {
    align == 0 || addr % align == 0
}

/// A `BlockDevice` backed by a regular file or raw block device, opened
/// with `O_DIRECT` where possible and falling back to buffered I/O
/// otherwise. Logical block size is probed with `BLKSSZGET` on Linux block
/// devices and defaults to 4096 bytes for ordinary files.
pub struct FileBlockDevice {
    path: Option<PathBuf>,
    file: Option<File>,
    block_size: u64,
    supports_direct: bool,
}

impl FileBlockDevice {
    pub fn new(block_size: u64) -> Self {
        FileBlockDevice {
            path: None,
            file: None,
            block_size,
            supports_direct: false,
        }
    }

    fn file_mut(&mut self) -> Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| RbmError::Io("device not open".to_string()))
    }

    #[cfg(target_os = "linux")]
    fn probe_block_size(fd: std::os::unix::io::RawFd) -> Option<u64> {
        const BLKSSZGET: libc::c_ulong = 0x1268;
        let mut blksz: libc::c_uint = 0;
        let ret = unsafe { libc::ioctl(fd, BLKSSZGET as _, &mut blksz) };
        if ret == 0 {
            Some(blksz as u64)
        } else {
            None
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn probe_block_size(_fd: std::os::unix::io::RawFd) -> Option<u64> {
        None
    }
}

impl BlockDevice for FileBlockDevice {
    async fn open(&mut self, path: &Path, read_only: bool) -> Result<()> {
        #[cfg(unix)]
        let direct_opts = {
            use std::os::unix::fs::OpenOptionsExt;
            let mut opts = OpenOptions::new();
            opts.read(true).write(!read_only);
            opts.custom_flags(libc::O_DIRECT);
            opts
        };
        #[cfg(not(unix))]
        let direct_opts = {
            let mut opts = OpenOptions::new();
            opts.read(true).write(!read_only);
            opts
        };

        let (file, supports_direct) = match direct_opts.open(path).await {
            Ok(f) => (f, true),
            Err(_) => {
                #[cfg(unix)]
                let fallback = {
                    use std::os::unix::fs::OpenOptionsExt;
                    let mut opts = OpenOptions::new();
                    opts.read(true).write(!read_only);
                    opts.custom_flags(libc::O_SYNC);
                    opts
                };
                #[cfg(not(unix))]
                let fallback = {
                    let mut opts = OpenOptions::new();
                    opts.read(true).write(!read_only);
                    opts
                };
                let f = fallback
                    .open(path)
                    .await
                    .map_err(|e| RbmError::NotFound(format!("{}: {e}", path.display())))?;
                (f, false)
            }
        };

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            if let Some(sz) = Self::probe_block_size(file.as_raw_fd()) {
                self.block_size = sz;
            }
        }

        self.path = Some(path.to_path_buf());
        self.file = Some(file);
        self.supports_direct = supports_direct;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }
        self.path = None;
        Ok(())
    }

    async fn read(&mut self, addr: u64, buf: &mut [u8]) -> Result<()> {
        debug_assert!(is_aligned(addr, self.block_size));
        debug_assert!(is_aligned(buf.len() as u64, self.block_size));
        let file = self.file_mut()?;
        file.seek(std::io::SeekFrom::Start(addr)).await?;
        file.read_exact(buf).await?;
        Ok(())
    }

    async fn write(&mut self, addr: u64, buf: &[u8]) -> Result<()> {
        debug_assert!(is_aligned(addr, self.block_size));
        debug_assert!(is_aligned(buf.len() as u64, self.block_size));
        let file = self.file_mut()?;
        file.seek(std::io::SeekFrom::Start(addr)).await?;
        file.write_all(buf).await?;
        file.sync_data().await?;
        Ok(())
    }

    fn block_size(&self) -> u64 {
        self.block_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_next_multiple() {
        assert_eq!(align_up(0, 4096), 0);
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_up(4097, 4096), 8192);
    }

    #[test]
    fn is_aligned_checks_multiples() {
        assert!(is_aligned(0, 4096));
        assert!(is_aligned(8192, 4096));
        assert!(!is_aligned(1, 4096));
    }

    #[tokio::test]
    async fn file_block_device_round_trips_data() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tokio::fs::File::create(tmp.path())
            .await
            .unwrap()
            .set_len(4096 * 4)
            .await
            .unwrap();

        let mut dev = FileBlockDevice::new(4096);
        dev.open(tmp.path(), false).await.unwrap();

        let mut payload = vec![0xABu8; 4096];
        payload[0] = 0x11;
        dev.write(4096, &payload).await.unwrap();

        let mut readback = vec![0u8; 4096];
        dev.read(4096, &mut readback).await.unwrap();
        assert_eq!(readback, payload);

        dev.close().await.unwrap();
    }
}
