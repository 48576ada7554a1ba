//! Component G — the block backend interface.
//!
//! The NBD session (`nbd_session`) is generic over anything implementing
//! `BlockBackend`; this module supplies two concrete backends: `FileBackend`
//! for a regular file or block device path, and `MemBackend`, an in-memory
//! implementation used by tests.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::Mutex;

use xoe_core::XoeError;

/// `BLKGETSIZE64` on Linux: query the byte size of a block device that the
/// `File::metadata().len()` path can't see (regular files report their
/// length directly; block device nodes report 0 there).
#[cfg(target_os = "linux")]
const BLKGETSIZE64: libc::c_ulong = 0x8004_1260;

/// Query a block device's size via `ioctl(BLKGETSIZE64)` (spec §4.G, §9:
/// "platform-specific block-device size query ... is the backend's
/// problem, not the core's"). Regular files never reach this path.
#[cfg(target_os = "linux")]
fn block_device_size(file: &File) -> Result<u64, XoeError> {
    let mut size: u64 = 0;
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size as *mut u64) };
    if rc != 0 {
        return Err(XoeError::io(std::io::Error::last_os_error()));
    }
    Ok(size)
}

#[cfg(not(target_os = "linux"))]
fn block_device_size(file: &File) -> Result<u64, XoeError> {
    // BLKGETSIZE64 is Linux-specific (macOS/BSD use DKIOCGETBLOCKCOUNT or
    // lseek(SEEK_END) instead, spec §9); fall back to metadata length,
    // which is the lseek-equivalent result for most platforms' device nodes.
    file.metadata().map(|m| m.len()).map_err(XoeError::io)
}

/// The contract the NBD session consumes from a storage collaborator.
///
/// `pread`/`pwrite` are positional: they do not move an implicit cursor.
/// Implementations serialise concurrent calls internally (the spec's
/// `io_mutex`) since positional syscalls on some platforms are not
/// intrinsically thread-safe and because trim ordering matters.
pub trait BlockBackend: Send + Sync {
    fn pread(&self, offset: u64, length: u32) -> Result<Vec<u8>, XoeError>;
    fn pwrite(&self, offset: u64, data: &[u8]) -> Result<(), XoeError>;
    fn flush(&self) -> Result<(), XoeError>;
    /// Best-effort discard. A backend that cannot trim still returns `Ok`;
    /// callers treat trim as always succeeding (spec §4.F).
    fn trim(&self, offset: u64, length: u32) -> Result<(), XoeError>;
    fn get_size(&self) -> u64;
    fn get_block_size(&self) -> u32;
    fn is_read_only(&self) -> bool;
}

/// A file- or block-device-backed `BlockBackend`.
pub struct FileBackend {
    file: Mutex<File>,
    size: u64,
    block_size: u32,
    read_only: bool,
}

impl FileBackend {
    /// Opens `path`, detecting regular file vs. block device from the
    /// path's metadata (spec §4.G) and querying size accordingly: a block
    /// device's `ioctl(BLKGETSIZE64)` on Linux, `File::metadata().len()`
    /// for everything else.
    pub fn open(path: impl AsRef<Path>, read_only: bool, block_size: u32) -> Result<Self, XoeError> {
        let path = path.as_ref();
        let file = if read_only {
            OpenOptions::new().read(true).open(path).map_err(XoeError::io)?
        } else {
            OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .map_err(XoeError::io)?
        };
        let metadata = file.metadata().map_err(XoeError::io)?;
        let size = if metadata.file_type().is_block_device() {
            block_device_size(&file)?
        } else {
            metadata.len()
        };
        Ok(Self {
            file: Mutex::new(file),
            size,
            block_size,
            read_only,
        })
    }
}

impl BlockBackend for FileBackend {
    fn pread(&self, offset: u64, length: u32) -> Result<Vec<u8>, XoeError> {
        let end = offset
            .checked_add(length as u64)
            .ok_or_else(|| XoeError::InvalidArgument("read range overflows u64".into()))?;
        if end > self.size {
            return Err(XoeError::InvalidArgument(format!(
                "read of {length} bytes at offset {offset} exceeds backend size {}",
                self.size
            )));
        }
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset)).map_err(XoeError::io)?;
        let mut buf = vec![0u8; length as usize];
        file.read_exact(&mut buf).map_err(|_| {
            XoeError::IoError(format!("short read at offset {offset} length {length}"))
        })?;
        Ok(buf)
    }

    fn pwrite(&self, offset: u64, data: &[u8]) -> Result<(), XoeError> {
        if self.read_only {
            return Err(XoeError::PermissionDenied("backend is read-only".into()));
        }
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| XoeError::InvalidArgument("write range overflows u64".into()))?;
        if end > self.size {
            return Err(XoeError::InvalidArgument(format!(
                "write of {} bytes at offset {offset} exceeds backend size {}",
                data.len(),
                self.size
            )));
        }
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset)).map_err(XoeError::io)?;
        file.write_all(data).map_err(XoeError::io)
    }

    fn flush(&self) -> Result<(), XoeError> {
        self.file.lock().unwrap().flush().map_err(XoeError::io)
    }

    fn trim(&self, _offset: u64, _length: u32) -> Result<(), XoeError> {
        // No portable discard primitive for plain files; honoured as a
        // best-effort no-op per the spec's trim-is-non-fatal contract.
        Ok(())
    }

    fn get_size(&self) -> u64 {
        self.size
    }

    fn get_block_size(&self) -> u32 {
        self.block_size
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

/// An in-memory `BlockBackend`, for tests that exercise the NBD session
/// without touching the filesystem.
pub struct MemBackend {
    data: Mutex<Vec<u8>>,
    block_size: u32,
    read_only: bool,
}

impl MemBackend {
    pub fn new(size: u64, block_size: u32, read_only: bool) -> Self {
        Self {
            data: Mutex::new(vec![0u8; size as usize]),
            block_size,
            read_only,
        }
    }
}

impl BlockBackend for MemBackend {
    fn pread(&self, offset: u64, length: u32) -> Result<Vec<u8>, XoeError> {
        let data = self.data.lock().unwrap();
        let start = offset as usize;
        let end = start + length as usize;
        if end > data.len() {
            return Err(XoeError::InvalidArgument("read past end of backend".into()));
        }
        Ok(data[start..end].to_vec())
    }

    fn pwrite(&self, offset: u64, chunk: &[u8]) -> Result<(), XoeError> {
        if self.read_only {
            return Err(XoeError::PermissionDenied("backend is read-only".into()));
        }
        let mut data = self.data.lock().unwrap();
        let start = offset as usize;
        let end = start + chunk.len();
        if end > data.len() {
            return Err(XoeError::InvalidArgument("write past end of backend".into()));
        }
        data[start..end].copy_from_slice(chunk);
        Ok(())
    }

    fn flush(&self) -> Result<(), XoeError> {
        Ok(())
    }

    fn trim(&self, _offset: u64, _length: u32) -> Result<(), XoeError> {
        Ok(())
    }

    fn get_size(&self) -> u64 {
        self.data.lock().unwrap().len() as u64
    }

    fn get_block_size(&self) -> u32 {
        self.block_size
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_backend_pwrite_then_pread_round_trips() {
        let backend = MemBackend::new(4096, 512, false);
        backend.pwrite(100, b"hello").unwrap();
        assert_eq!(backend.pread(100, 5).unwrap(), b"hello");
    }

    #[test]
    fn read_only_backend_rejects_writes() {
        let backend = MemBackend::new(4096, 512, true);
        assert!(matches!(
            backend.pwrite(0, b"x"),
            Err(XoeError::PermissionDenied(_))
        ));
    }

    #[test]
    fn write_past_end_is_invalid_argument() {
        let backend = MemBackend::new(8, 512, false);
        assert!(matches!(
            backend.pwrite(4, b"12345"),
            Err(XoeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn read_past_end_is_invalid_argument() {
        let backend = MemBackend::new(8, 512, false);
        assert!(matches!(
            backend.pread(4, 5),
            Err(XoeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn file_backend_round_trips_through_a_tempfile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        std::fs::write(&path, vec![0u8; 1024]).unwrap();

        let backend = FileBackend::open(&path, false, 512).unwrap();
        backend.pwrite(10, b"xyz").unwrap();
        assert_eq!(backend.pread(10, 3).unwrap(), b"xyz");
        assert_eq!(backend.get_size(), 1024);
    }

    #[test]
    fn file_backend_rejects_write_past_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        std::fs::write(&path, vec![0u8; 16]).unwrap();

        let backend = FileBackend::open(&path, false, 512).unwrap();
        assert!(matches!(
            backend.pwrite(10, b"0123456789"),
            Err(XoeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn file_backend_rejects_read_past_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        std::fs::write(&path, vec![0u8; 16]).unwrap();

        let backend = FileBackend::open(&path, false, 512).unwrap();
        assert!(matches!(
            backend.pread(10, 10),
            Err(XoeError::InvalidArgument(_))
        ));
    }
}
