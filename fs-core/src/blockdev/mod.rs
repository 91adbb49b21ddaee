//! Block device I/O operations for mfsck

mod blockdev_trait;

use async_trait::async_trait;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::Mutex;

// Re-export the block device trait and related types
pub use self::blockdev_trait::{
    BlockDevice, BlockDeviceError, Result, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE,
};
use self::blockdev_trait::check_range;

/// A block device that is backed by a file or a raw device node
#[derive(Debug)]
pub struct FileBackedBlockDevice {
    file: Mutex<Option<File>>,
    path: PathBuf,
    size: u64,
    device_id: u64,
    read_only: bool,
}

impl FileBackedBlockDevice {
    /// Create a new zero-filled image file of `size` bytes
    pub async fn create(path: impl AsRef<Path>, size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;

        file.set_len(size).await?;
        let device_id = Self::identify(&path)?;

        Ok(Self {
            file: Mutex::new(Some(file)),
            path,
            size,
            device_id,
            read_only: false,
        })
    }

    /// Open an existing image or device node
    pub async fn open(path: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)
            .await?;

        // Get the actual size (handles both files and block devices)
        let size = Self::get_block_device_size(&path)?;
        let device_id = Self::identify(&path)?;

        log::debug!(
            "Opened {} ({} bytes, {})",
            path.display(),
            size,
            if read_only { "read-only" } else { "read-write" }
        );

        Ok(Self {
            file: Mutex::new(Some(file)),
            path,
            size,
            device_id,
            read_only,
        })
    }

    /// Get the size of a block device using platform-specific methods
    fn get_block_device_size(path: &Path) -> Result<u64> {
        #[cfg(unix)]
        {
            Self::get_block_device_size_unix(path)
        }
        #[cfg(not(unix))]
        {
            Ok(std::fs::metadata(path)?.len())
        }
    }

    /// Unix-specific block device size detection
    #[cfg(unix)]
    fn get_block_device_size_unix(path: &Path) -> Result<u64> {
        use std::fs::File as StdFile;
        use std::os::unix::fs::FileTypeExt;
        use std::os::unix::io::AsRawFd;

        let metadata = std::fs::metadata(path)?;
        if !metadata.file_type().is_block_device() {
            return Ok(metadata.len());
        }

        let file = StdFile::open(path)?;
        let fd = file.as_raw_fd();

        // BLKGETSIZE64 = 0x80081272 on Linux
        const BLKGETSIZE64: libc::c_ulong = 0x80081272;

        let mut size: u64 = 0;
        let result = unsafe { libc::ioctl(fd, BLKGETSIZE64, &mut size as *mut u64) };

        if result == -1 {
            return Err(BlockDeviceError::Io(std::io::Error::last_os_error()));
        }

        Ok(size)
    }

    /// Stable identifier for the device: the device number for device nodes,
    /// the inode number for image files
    fn identify(path: &Path) -> Result<u64> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::{FileTypeExt, MetadataExt};
            let metadata = std::fs::metadata(path)?;
            if metadata.file_type().is_block_device() {
                Ok(metadata.rdev())
            } else {
                Ok(metadata.ino())
            }
        }
        #[cfg(not(unix))]
        {
            let _ = path;
            Ok(0)
        }
    }

    /// Path the device was opened from
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl BlockDevice for FileBackedBlockDevice {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.size)?;

        let mut file_guard = self.file.lock().await;
        if let Some(file) = &mut *file_guard {
            file.seek(SeekFrom::Start(offset)).await?;
            file.read_exact(buf).await?;
            Ok(())
        } else {
            Err(BlockDeviceError::DeviceClosed)
        }
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(BlockDeviceError::ReadOnly);
        }
        check_range(offset, data.len(), self.size)?;

        let mut file_guard = self.file.lock().await;
        if let Some(file) = &mut *file_guard {
            file.seek(SeekFrom::Start(offset)).await?;
            file.write_all(data).await?;
            file.flush().await?;
            Ok(())
        } else {
            Err(BlockDeviceError::DeviceClosed)
        }
    }

    fn size(&self) -> u64 {
        self.size
    }

    async fn sync(&self) -> Result<()> {
        let mut file_guard = self.file.lock().await;

        if let Some(file) = &mut *file_guard {
            file.sync_all().await?;
            Ok(())
        } else {
            Err(BlockDeviceError::DeviceClosed)
        }
    }

    async fn close(&mut self) -> Result<()> {
        let mut file_guard = self.file.lock().await;

        if file_guard.take().is_some() {
            Ok(())
        } else {
            Err(BlockDeviceError::DeviceClosed)
        }
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn device_id(&self) -> u64 {
        self.device_id
    }
}

/// A device held entirely in memory, used for tests and benchmarks
#[derive(Debug)]
pub struct MemoryBlockDevice {
    data: RwLock<Vec<u8>>,
    device_id: u64,
    read_only: bool,
}

impl MemoryBlockDevice {
    /// Create a zero-filled device of `size` bytes
    pub fn new(size: usize) -> Self {
        Self::from_bytes(vec![0u8; size])
    }

    /// Wrap an existing image
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
            device_id: 0,
            read_only: false,
        }
    }

    /// Same contents, but every write fails with [`BlockDeviceError::ReadOnly`]
    pub fn read_only(self) -> Self {
        Self {
            read_only: true,
            ..self
        }
    }

    /// Copy of the current image
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

#[async_trait]
impl BlockDevice for MemoryBlockDevice {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.data.read();
        check_range(offset, buf.len(), data.len() as u64)?;
        let start = offset as usize;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(BlockDeviceError::ReadOnly);
        }
        let mut image = self.data.write();
        check_range(offset, data.len(), image.len() as u64)?;
        let start = offset as usize;
        image[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.data.read().len() as u64
    }

    async fn sync(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn device_id(&self) -> u64 {
        self.device_id
    }
}
