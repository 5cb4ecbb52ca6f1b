// rust/batcher-core/src/storage/local.rs

//! Local filesystem storage backend.
//!
//! Shard files above the configured size threshold are memory-mapped;
//! smaller ones go through a buffered reader.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use super::traits::{StorageBackend, StorageReader, StorageWriter};
use crate::config::StorageConfig;
use crate::error::{BatcherError, Result};

/// Local filesystem storage backend.
///
/// Relative paths are resolved against `base_path`; absolute paths are used
/// as given.
pub struct LocalStorage {
    base_path: PathBuf,
    buffer_size: usize,
    use_mmap: bool,
    mmap_threshold: u64,
}

impl LocalStorage {
    /// Creates a new `LocalStorage` instance from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the base path cannot be created.
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let base_path = config.base_path.clone();

        if !base_path.exists() {
            fs::create_dir_all(&base_path).map_err(|e| {
                BatcherError::storage_with_source(&base_path, "failed to create base directory", e)
            })?;
        }

        Ok(Self {
            base_path,
            buffer_size: config.buffer_size,
            use_mmap: config.use_mmap,
            mmap_threshold: config.mmap_threshold,
        })
    }

    /// Returns the directory relative paths are resolved against.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_path.join(path)
        }
    }
}

impl StorageBackend for LocalStorage {
    fn open_read(&self, path: &Path) -> Result<Box<dyn StorageReader>> {
        let full_path = self.resolve_path(path);
        let file = File::open(&full_path)
            .map_err(|e| BatcherError::storage_with_source(&full_path, "failed to open shard file", e))?;

        let size = file
            .metadata()
            .map_err(|e| {
                BatcherError::storage_with_source(&full_path, "failed to read file metadata", e)
            })?
            .len();

        // Zero-length files cannot be mapped on every platform.
        if self.use_mmap && size > 0 && size >= self.mmap_threshold {
            // SAFETY: the file is opened read-only and the map lives as long
            // as the reader. Shard files are treated as immutable for the run.
            let mmap = unsafe { Mmap::map(&file) }.map_err(|e| {
                BatcherError::storage_with_source(&full_path, "failed to memory-map file", e)
            })?;

            Ok(Box::new(MmapReader::new(mmap, full_path)))
        } else {
            Ok(Box::new(LocalReader::new(file, size, self.buffer_size, full_path)))
        }
    }

    fn open_write(&self, path: &Path) -> Result<Box<dyn StorageWriter>> {
        let full_path = self.resolve_path(path);

        if let Some(parent) = full_path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| {
                    BatcherError::storage_with_source(
                        parent,
                        "failed to create parent directories",
                        e,
                    )
                })?;
            }
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&full_path)
            .map_err(|e| {
                BatcherError::storage_with_source(&full_path, "failed to create file", e)
            })?;

        Ok(Box::new(LocalWriter::new(file, self.buffer_size, full_path)))
    }
}

/// Buffered file reader.
struct LocalReader {
    reader: BufReader<File>,
    size: u64,
    path: PathBuf,
}

impl LocalReader {
    fn new(file: File, size: u64, buffer_size: usize, path: PathBuf) -> Self {
        Self {
            reader: BufReader::with_capacity(buffer_size, file),
            size,
            path,
        }
    }
}

impl Read for LocalReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Seek for LocalReader {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.reader.seek(pos)
    }
}

impl StorageReader for LocalReader {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_range(&mut self, start: u64, length: usize) -> Result<Vec<u8>> {
        self.seek(SeekFrom::Start(start)).map_err(|e| {
            BatcherError::storage_with_source(
                &self.path,
                format!("failed to seek to position {start}"),
                e,
            )
        })?;

        let mut buf = vec![0u8; length];
        self.read_exact(&mut buf).map_err(|e| {
            BatcherError::storage_with_source(
                &self.path,
                format!("failed to read {length} bytes at position {start}"),
                e,
            )
        })?;

        Ok(buf)
    }
}

/// Memory-mapped file reader.
struct MmapReader {
    mmap: Mmap,
    position: u64,
    path: PathBuf,
}

impl MmapReader {
    fn new(mmap: Mmap, path: PathBuf) -> Self {
        Self {
            mmap,
            position: 0,
            path,
        }
    }
}

impl Read for MmapReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let pos = (self.position as usize).min(self.mmap.len());
        let remaining = &self.mmap[pos..];
        let to_read = buf.len().min(remaining.len());

        buf[..to_read].copy_from_slice(&remaining[..to_read]);
        self.position = (pos + to_read) as u64;
        Ok(to_read)
    }
}

impl Seek for MmapReader {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(offset) => self.mmap.len() as i64 + offset,
            SeekFrom::Current(offset) => self.position as i64 + offset,
        };

        if new_pos < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek to negative position",
            ));
        }

        self.position = new_pos as u64;
        Ok(self.position)
    }
}

impl StorageReader for MmapReader {
    fn size(&self) -> u64 {
        self.mmap.len() as u64
    }

    fn read_range(&mut self, start: u64, length: usize) -> Result<Vec<u8>> {
        let start = start as usize;
        let end = start + length;

        if end > self.mmap.len() {
            return Err(BatcherError::storage(
                &self.path,
                format!(
                    "read range {}..{} exceeds file size {}",
                    start,
                    end,
                    self.mmap.len()
                ),
            ));
        }

        Ok(self.mmap[start..end].to_vec())
    }
}

/// Buffered file writer.
struct LocalWriter {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl LocalWriter {
    fn new(file: File, buffer_size: usize, path: PathBuf) -> Self {
        Self {
            writer: BufWriter::with_capacity(buffer_size, file),
            path,
        }
    }
}

impl Write for LocalWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

impl StorageWriter for LocalWriter {
    fn finish(mut self: Box<Self>) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| BatcherError::storage_with_source(&self.path, "failed to flush writer", e))?;

        self.writer.get_ref().sync_all().map_err(|e| {
            BatcherError::storage_with_source(&self.path, "failed to sync file to disk", e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_storage() -> (LocalStorage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = StorageConfig {
            base_path: temp_dir.path().to_path_buf(),
            buffer_size: 4096,
            use_mmap: true,
            mmap_threshold: 1024, // Low threshold for testing
        };
        let storage = LocalStorage::new(&config).unwrap();
        (storage, temp_dir)
    }

    fn write_file(storage: &LocalStorage, path: &str, data: &[u8]) {
        let mut writer = storage.open_write(Path::new(path)).unwrap();
        writer.write_all(data).unwrap();
        writer.finish().unwrap();
    }

    #[test]
    fn test_new_creates_base_dir() {
        let temp_dir = TempDir::new().unwrap();
        let new_base = temp_dir.path().join("shards");

        let config = StorageConfig {
            base_path: new_base.clone(),
            ..Default::default()
        };

        let storage = LocalStorage::new(&config).unwrap();
        assert!(new_base.exists());
        assert_eq!(storage.base_path(), new_base.as_path());
    }

    #[test]
    fn test_rewrite_truncates() {
        let (storage, _temp) = create_test_storage();
        write_file(&storage, "x_0.npy", b"hello world");
        write_file(&storage, "x_0.npy", b"hi");

        let mut reader = storage.open_read(Path::new("x_0.npy")).unwrap();
        assert_eq!(reader.size(), 2);
        assert_eq!(reader.read_all().unwrap(), b"hi");
    }

    #[test]
    fn test_buffered_read_all() {
        let (storage, _temp) = create_test_storage();
        write_file(&storage, "small.bin", b"below threshold");

        let mut reader = storage.open_read(Path::new("small.bin")).unwrap();
        assert_eq!(reader.size(), 15);
        assert_eq!(reader.read_all().unwrap(), b"below threshold");
    }

    #[test]
    fn test_mmap_read_range() {
        let (storage, _temp) = create_test_storage();
        let data: Vec<u8> = (0..4096).map(|i| (i % 256) as u8).collect();
        write_file(&storage, "large.bin", &data);

        let mut reader = storage.open_read(Path::new("large.bin")).unwrap();
        assert_eq!(reader.read_range(1000, 24).unwrap(), &data[1000..1024]);
        assert_eq!(reader.read_all().unwrap(), data);

        let result = reader.read_range(4090, 100);
        assert!(result.is_err());
    }

    #[test]
    fn test_mmap_seek_and_read() {
        let (storage, _temp) = create_test_storage();
        let data: Vec<u8> = (0..2048).map(|i| (i % 251) as u8).collect();
        write_file(&storage, "seek.bin", &data);

        let mut reader = storage.open_read(Path::new("seek.bin")).unwrap();
        reader.seek(SeekFrom::End(-8)).unwrap();
        let mut tail = Vec::new();
        reader.read_to_end(&mut tail).unwrap();
        assert_eq!(tail, &data[2040..]);

        assert!(reader.seek(SeekFrom::Current(-5000)).is_err());
    }

    #[test]
    fn test_mmap_disabled() {
        let temp_dir = TempDir::new().unwrap();
        let config = StorageConfig {
            base_path: temp_dir.path().to_path_buf(),
            buffer_size: 4096,
            use_mmap: false,
            mmap_threshold: 1024,
        };
        let storage = LocalStorage::new(&config).unwrap();

        let data: Vec<u8> = (0..2048).map(|i| (i % 256) as u8).collect();
        write_file(&storage, "large.bin", &data);

        let mut reader = storage.open_read(Path::new("large.bin")).unwrap();
        assert_eq!(reader.read_all().unwrap(), data);
    }

    #[test]
    fn test_empty_file_reads_empty() {
        let (storage, _temp) = create_test_storage();
        write_file(&storage, "empty.bin", b"");

        let mut reader = storage.open_read(Path::new("empty.bin")).unwrap();
        assert!(reader.read_all().unwrap().is_empty());
    }

    #[test]
    fn test_write_creates_parent_dirs() {
        let (storage, temp) = create_test_storage();
        write_file(&storage, "a/b/c.bin", b"nested");
        assert!(temp.path().join("a/b/c.bin").exists());
    }

    #[test]
    fn test_absolute_path_bypasses_base() {
        let (storage, _temp) = create_test_storage();
        let other = TempDir::new().unwrap();
        let abs = other.path().join("abs.bin");
        std::fs::write(&abs, b"outside").unwrap();

        let mut reader = storage.open_read(&abs).unwrap();
        assert_eq!(reader.read_all().unwrap(), b"outside");
    }

    #[test]
    fn test_open_missing_reports_path() {
        let (storage, _temp) = create_test_storage();
        let err = storage.open_read(Path::new("gone.npy")).err().unwrap();
        assert!(err.to_string().contains("gone.npy"));
    }
}
