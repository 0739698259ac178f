//! # Backing Store Capability Layer
//!
//! The hive engine never touches files directly; every byte that moves
//! between memory and the backing store goes through the [`FileBacking`]
//! trait. The trait is the whole of the file-I/O contract: positional read,
//! positional write, flush, and size extension. Keeping it this narrow means
//! the engine can be driven against an in-memory store in tests, against a
//! plain file in production, or against whatever the embedding system uses
//! for durable storage.
//!
//! ## Offset Convention
//!
//! Offsets passed to a `FileBacking` are absolute file offsets. The hive
//! layer is responsible for the base-block displacement (stable storage
//! offset 0 lives at file offset `BASE_BLOCK_SIZE`).
//!
//! ## Error Model
//!
//! All operations return `eyre::Result` with the file context attached.
//! The hive layer maps failures to `HiveError::Io`; a read failure while
//! faulting a view in surfaces as `HiveError::UnmappedCell` to the cell's
//! caller.
//!
//! ## Implementations
//!
//! - [`FileStore`]: a `std::fs::File` with positional I/O.
//! - [`MemoryBacking`]: a growable `Vec<u8>`; used by tests and by hives
//!   that exist only to be compacted or merged and never persisted.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};

/// Positional I/O capabilities the hive engine requires of its backing
/// store. Mirrors the read/write/flush/set-size callback contract.
pub trait FileBacking: Send {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    fn flush(&mut self) -> Result<()>;

    /// Grow or shrink the store. `old_len` is the caller's view of the
    /// current length so an implementation can detect lost races.
    fn set_size(&mut self, new_len: u64, old_len: u64) -> Result<()>;

    fn len(&self) -> u64;
}

/// File-system backing for a hive.
#[derive(Debug)]
pub struct FileStore {
    file: File,
    path: PathBuf,
    len: u64,
}

impl FileStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open hive file '{}'", path.display()))?;

        let len = file
            .metadata()
            .wrap_err_with(|| format!("failed to get metadata for '{}'", path.display()))?
            .len();

        ensure!(len > 0, "cannot open empty hive file '{}'", path.display());

        Ok(Self {
            file,
            path: path.to_path_buf(),
            len,
        })
    }

    pub fn create<P: AsRef<Path>>(path: P, initial_len: u64) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create hive file '{}'", path.display()))?;

        file.set_len(initial_len)
            .wrap_err_with(|| format!("failed to set file size to {} bytes", initial_len))?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            len: initial_len,
        })
    }
}

impl FileBacking for FileStore {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.read_exact(buf))
            .wrap_err_with(|| {
                format!(
                    "failed to read {} bytes at offset {} from '{}'",
                    buf.len(),
                    offset,
                    self.path.display()
                )
            })
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.write_all(data))
            .wrap_err_with(|| {
                format!(
                    "failed to write {} bytes at offset {} to '{}'",
                    data.len(),
                    offset,
                    self.path.display()
                )
            })
    }

    fn flush(&mut self) -> Result<()> {
        self.file
            .sync_data()
            .wrap_err_with(|| format!("failed to flush '{}'", self.path.display()))
    }

    fn set_size(&mut self, new_len: u64, old_len: u64) -> Result<()> {
        ensure!(
            self.len == old_len,
            "stale length for '{}': caller thinks {} but store has {}",
            self.path.display(),
            old_len,
            self.len
        );

        self.file
            .set_len(new_len)
            .wrap_err_with(|| format!("failed to resize '{}' to {}", self.path.display(), new_len))?;
        self.len = new_len;
        Ok(())
    }

    fn len(&self) -> u64 {
        self.len
    }
}

/// Heap-backed store. Reads past the end fail the same way a short file
/// read does, so tests exercise the same error paths as on-disk hives.
#[derive(Debug, Default)]
pub struct MemoryBacking {
    data: Vec<u8>,
    /// When set, every operation fails; tests use this to simulate an
    /// unavailable backing store.
    fail_io: bool,
}

impl MemoryBacking {
    pub fn new(initial_len: u64) -> Self {
        Self {
            data: vec![0u8; initial_len as usize],
            fail_io: false,
        }
    }

    pub fn set_fail_io(&mut self, fail: bool) {
        self.fail_io = fail;
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl FileBacking for MemoryBacking {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        ensure!(!self.fail_io, "simulated I/O failure");
        let offset = offset as usize;
        ensure!(
            offset + buf.len() <= self.data.len(),
            "read of {} bytes at {} past end of memory store ({} bytes)",
            buf.len(),
            offset,
            self.data.len()
        );
        buf.copy_from_slice(&self.data[offset..offset + buf.len()]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        ensure!(!self.fail_io, "simulated I/O failure");
        let offset = offset as usize;
        ensure!(
            offset + data.len() <= self.data.len(),
            "write of {} bytes at {} past end of memory store ({} bytes)",
            data.len(),
            offset,
            self.data.len()
        );
        self.data[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        ensure!(!self.fail_io, "simulated I/O failure");
        Ok(())
    }

    fn set_size(&mut self, new_len: u64, old_len: u64) -> Result<()> {
        ensure!(!self.fail_io, "simulated I/O failure");
        ensure!(
            self.data.len() as u64 == old_len,
            "stale length: caller thinks {} but store has {}",
            old_len,
            self.data.len()
        );
        self.data.resize(new_len as usize, 0);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }
}
