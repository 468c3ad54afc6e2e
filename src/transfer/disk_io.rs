//! Striped random-access I/O on the backing data file.
//!
//! The data file is opened through N independent handles ("stripes"). A key
//! is routed to a stripe by hash, so reads for unrelated keys take different
//! locks while reads and writes on the same stripe are serialized.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum DiskIoError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Data file {0} has been closed")]
    Closed(PathBuf),
}

/// Transfer statistics.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiskIoStats {
    pub total_writes: u64,
    pub total_reads: u64,
    pub total_bytes_written: u64,
    pub total_bytes_read: u64,
}

/// A data file accessed through a power-of-two number of handles.
pub struct StripedFile {
    path: PathBuf,

    /// One handle per stripe; `None` once force-closed.
    stripes: Box<[Mutex<Option<File>>]>,

    mask: usize,

    stats: Mutex<DiskIoStats>,
}

impl StripedFile {
    /// Open `stripes` handles on `path`, creating it if needed.
    ///
    /// The stripe count is rounded up to the next power of two. With
    /// `truncate` the existing contents are discarded.
    pub fn open(path: &Path, stripes: usize, truncate: bool) -> Result<Self, DiskIoError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let count = stripes.max(1).next_power_of_two();
        let mut handles = Vec::with_capacity(count);
        for i in 0..count {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(truncate && i == 0)
                .open(path)?;
            handles.push(Mutex::new(Some(file)));
        }

        debug!(path = %path.display(), stripes = count, truncate, "Opened data file");

        Ok(Self {
            path: path.to_path_buf(),
            stripes: handles.into_boxed_slice(),
            mask: count - 1,
            stats: Mutex::new(DiskIoStats::default()),
        })
    }

    /// Stripe index for a key hash.
    pub fn stripe_for(&self, hash: u64) -> usize {
        (hash as usize) & self.mask
    }

    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read `len` bytes at `offset` through the stripe selected by `hash`.
    pub fn read_at(&self, hash: u64, offset: u64, len: usize) -> Result<Vec<u8>, DiskIoError> {
        let mut guard = self.stripes[self.stripe_for(hash)].lock();
        let file = guard
            .as_mut()
            .ok_or_else(|| DiskIoError::Closed(self.path.clone()))?;

        let mut buf = vec![0u8; len];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        drop(guard);

        let mut stats = self.stats.lock();
        stats.total_reads += 1;
        stats.total_bytes_read += len as u64;
        Ok(buf)
    }

    /// Write `data` at `offset` through the stripe selected by `hash`.
    pub fn write_at(&self, hash: u64, offset: u64, data: &[u8]) -> Result<(), DiskIoError> {
        let mut guard = self.stripes[self.stripe_for(hash)].lock();
        let file = guard
            .as_mut()
            .ok_or_else(|| DiskIoError::Closed(self.path.clone()))?;

        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        drop(guard);

        let mut stats = self.stats.lock();
        stats.total_writes += 1;
        stats.total_bytes_written += data.len() as u64;
        Ok(())
    }

    /// Current length of the data file.
    pub fn len(&self) -> Result<u64, DiskIoError> {
        let guard = self.stripes[0].lock();
        let file = guard
            .as_ref()
            .ok_or_else(|| DiskIoError::Closed(self.path.clone()))?;
        Ok(file.metadata()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, DiskIoError> {
        Ok(self.len()? == 0)
    }

    /// Truncate (or extend) the data file to `len` bytes.
    pub fn set_len(&self, len: u64) -> Result<(), DiskIoError> {
        let guard = self.stripes[0].lock();
        let file = guard
            .as_ref()
            .ok_or_else(|| DiskIoError::Closed(self.path.clone()))?;
        file.set_len(len)?;
        debug!(path = %self.path.display(), len, "Resized data file");
        Ok(())
    }

    /// Flush file contents to stable storage.
    pub fn sync(&self) -> Result<(), DiskIoError> {
        let guard = self.stripes[0].lock();
        let file = guard
            .as_ref()
            .ok_or_else(|| DiskIoError::Closed(self.path.clone()))?;
        file.sync_data()?;
        Ok(())
    }

    /// Drop every handle. Later reads and writes fail with [`DiskIoError::Closed`].
    pub fn close(&self) {
        for stripe in self.stripes.iter() {
            if let Some(file) = stripe.lock().take() {
                if let Err(e) = file.sync_all() {
                    warn!(path = %self.path.display(), error = %e, "Failed to sync data file on close");
                }
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.stripes[0].lock().is_none()
    }

    pub fn stats(&self) -> DiskIoStats {
        *self.stats.lock()
    }
}
