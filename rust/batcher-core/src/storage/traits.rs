// rust/batcher-core/src/storage/traits.rs

//! Storage abstraction traits for shard files.
//!
//! Shard stores read array files through these traits so the same loader
//! code works against the local filesystem or an in-memory mock.

use std::io::{Read, Seek, Write};
use std::path::Path;

use crate::error::Result;

/// A handle for reading from storage.
pub trait StorageReader: Read + Seek + Send {
    /// Returns the total size of the object in bytes.
    fn size(&self) -> u64;

    /// Reads `length` bytes starting at `start`.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails or the range is out of bounds.
    fn read_range(&mut self, start: u64, length: usize) -> Result<Vec<u8>>;

    /// Reads the whole object into memory.
    fn read_all(&mut self) -> Result<Vec<u8>> {
        let size = self.size() as usize;
        self.read_range(0, size)
    }
}

/// A handle for writing to storage.
pub trait StorageWriter: Write + Send {
    /// Flushes and syncs the written data. The writer must not be used
    /// afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if flushing or syncing fails.
    fn finish(self: Box<Self>) -> Result<()>;
}

/// The storage backend shard stores read from.
///
/// Object-safe; shared between loader threads as `Arc<dyn StorageBackend>`.
pub trait StorageBackend: Send + Sync {
    /// Opens an object for reading.
    ///
    /// # Errors
    ///
    /// Returns an error if the object doesn't exist or cannot be opened.
    fn open_read(&self, path: &Path) -> Result<Box<dyn StorageReader>>;

    /// Opens an object for writing, truncating any existing object and
    /// creating parent directories.
    fn open_write(&self, path: &Path) -> Result<Box<dyn StorageWriter>>;
}
