use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use drift_base::{BlobKey, Error, Result};
use rand::Rng;
use sha1::{Digest, Sha1};
use tracing::{debug, warn};

const TMP_PREFIX: &str = "incoming_";
const TMP_EXTENSION: &str = "tmp";

/// Options for opening a [`BlobStore`].
#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// Create the directory if it does not exist.
    pub create: bool,
    /// Open read-write. A read-only store refuses writers and GC.
    pub writeable: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            create: true,
            writeable: true,
        }
    }
}

/// A content-addressed store of immutable blobs in one directory.
///
/// See the [crate docs](crate) for the file layout. All operations are
/// synchronous; callers that must not block an async reactor run them on a
/// worker thread.
#[derive(Debug, Clone)]
pub struct BlobStore {
    dir: PathBuf,
    options: StoreOptions,
}

impl BlobStore {
    /// Open (or create, per the options) the store at `dir`.
    pub fn open(dir: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.is_dir() {
            if !options.create {
                return Err(Error::CantOpenFile);
            }
            fs::create_dir_all(&dir)?;
        }
        let store = Self { dir, options };
        if options.writeable {
            store.reap_temp_files();
        }
        Ok(store)
    }

    /// The directory this store lives in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The path a blob with `key` would occupy.
    pub fn path(&self, key: &BlobKey) -> PathBuf {
        self.dir.join(key.filename())
    }

    /// Whether a blob with `key` is installed.
    pub fn has(&self, key: &BlobKey) -> bool {
        self.path(key).is_file()
    }

    /// Size in bytes of the stored blob, or `None` when absent.
    pub fn size(&self, key: &BlobKey) -> Option<u64> {
        fs::metadata(self.path(key)).ok().map(|m| m.len())
    }

    /// Read the full content of a blob, verifying it against its key.
    pub fn get_contents(&self, key: &BlobKey) -> Result<Bytes> {
        let mut file = open_blob(&self.path(key))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        if BlobKey::compute(&data) != *key {
            return Err(Error::CorruptData);
        }
        Ok(data.into())
    }

    /// Store `data`, returning its key.
    ///
    /// Idempotent: putting bytes that are already stored returns the
    /// existing key and leaves the store untouched.
    pub fn put(&self, data: impl AsRef<[u8]>) -> Result<BlobKey> {
        let mut writer = self.open_write_stream()?;
        writer.write(data.as_ref())?;
        writer.install(None)
    }

    /// Open a random-access reader over a stored blob.
    pub fn open_read_stream(&self, key: &BlobKey) -> Result<BlobReadStream> {
        let file = open_blob(&self.path(key))?;
        Ok(BlobReadStream { file })
    }

    /// Open a sequential writer producing a new blob.
    pub fn open_write_stream(&self) -> Result<BlobWriteStream> {
        if !self.options.writeable {
            return Err(Error::CantOpenFile);
        }
        let tmp_path = self.dir.join(temp_name());
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)?;
        Ok(BlobWriteStream {
            dir: self.dir.clone(),
            tmp_path: Some(tmp_path),
            file: Some(file),
            sha1: Sha1::new(),
            key: None,
        })
    }

    /// Number of installed blobs.
    pub fn count(&self) -> Result<u64> {
        Ok(self.blob_entries()?.len() as u64)
    }

    /// Total size in bytes of all installed blobs.
    pub fn total_size(&self) -> Result<u64> {
        let mut total = 0;
        for (path, _) in self.blob_entries()? {
            total += fs::metadata(path)?.len();
        }
        Ok(total)
    }

    /// Garbage collection: delete every blob whose key is not in `in_use`.
    ///
    /// Returns the number of blobs removed. The caller must guarantee no
    /// writer is concurrently installing a key outside the set.
    pub fn delete_all_except(&self, in_use: &HashSet<BlobKey>) -> Result<usize> {
        if !self.options.writeable {
            return Err(Error::CantOpenFile);
        }
        let mut removed = 0;
        for (path, key) in self.blob_entries()? {
            if !in_use.contains(&key) {
                debug!(key = %key, "deleting unreferenced blob");
                fs::remove_file(path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Delete the entire store directory.
    pub fn delete_store(self) -> Result<()> {
        fs::remove_dir_all(&self.dir)?;
        Ok(())
    }

    fn blob_entries(&self) -> Result<Vec<(PathBuf, BlobKey)>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Ok(key) = BlobKey::from_filename(name) {
                entries.push((entry.path(), key));
            }
        }
        Ok(entries)
    }

    // Temp files can only be left behind by a crash mid-write.
    fn reap_temp_files(&self) {
        let Ok(dir) = fs::read_dir(&self.dir) else {
            return;
        };
        for entry in dir.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with(TMP_PREFIX) && name.ends_with(TMP_EXTENSION) {
                debug!(file = name, "reaping orphaned temp file");
                if let Err(err) = fs::remove_file(entry.path()) {
                    warn!(file = name, "failed to reap temp file: {err}");
                }
            }
        }
    }
}

fn open_blob(path: &Path) -> Result<File> {
    match File::open(path) {
        Ok(file) => Ok(file),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Err(Error::NotFound),
        Err(err) => Err(err.into()),
    }
}

fn temp_name() -> String {
    format!(
        "{TMP_PREFIX}{:016x}.{TMP_EXTENSION}",
        rand::thread_rng().gen::<u64>()
    )
}

/// Random-access reader over one stored blob.
#[derive(Debug)]
pub struct BlobReadStream {
    file: File,
}

impl BlobReadStream {
    /// Total length of the blob in bytes.
    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Whether the blob is empty.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Position the next read at `offset` bytes from the start.
    pub fn seek(&mut self, offset: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    /// Read up to `buf.len()` bytes. Returns the number read; reading at or
    /// past the end returns a short (possibly zero-length) read.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.file.read(buf)?)
    }
}

/// Sequential writer producing a new blob.
///
/// Bytes are digested while they are written. After [`compute_key`] no more
/// data may be written; [`install`] renames the finished file to its
/// content-addressed name. Dropping the stream without installing removes
/// the temp file.
///
/// [`compute_key`]: BlobWriteStream::compute_key
/// [`install`]: BlobWriteStream::install
#[derive(Debug)]
pub struct BlobWriteStream {
    dir: PathBuf,
    tmp_path: Option<PathBuf>,
    file: Option<File>,
    sha1: Sha1,
    key: Option<BlobKey>,
}

impl BlobWriteStream {
    /// Append `data` to the blob.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.key.is_some() {
            return Err(Error::Internal(
                "write after compute_key on blob stream".into(),
            ));
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| Error::Internal("write on installed blob stream".into()))?;
        file.write_all(data)?;
        self.sha1.update(data);
        Ok(())
    }

    /// Finalize the digest. Further writes are refused.
    pub fn compute_key(&mut self) -> BlobKey {
        if let Some(key) = self.key {
            return key;
        }
        let sha1 = std::mem::take(&mut self.sha1);
        let key = BlobKey::from_bytes(sha1.finalize().into());
        self.key = Some(key);
        key
    }

    /// Move the finished blob into the store and return its key.
    ///
    /// With `expected` set, a digest mismatch fails with
    /// [`Error::CorruptData`] and the data is discarded. Losing an install
    /// race to a concurrent writer of the same content is a success.
    pub fn install(mut self, expected: Option<&BlobKey>) -> Result<BlobKey> {
        let key = self.compute_key();
        if let Some(expected) = expected {
            if *expected != key {
                return Err(Error::CorruptData);
            }
        }
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        let tmp_path = self
            .tmp_path
            .take()
            .ok_or_else(|| Error::Internal("blob stream installed twice".into()))?;
        let dest = self.dir.join(key.filename());
        if dest.is_file() {
            // Lost the race; identical content is already installed.
            fs::remove_file(&tmp_path)?;
        } else {
            fs::rename(&tmp_path, &dest)?;
        }
        Ok(key)
    }
}

impl Drop for BlobWriteStream {
    fn drop(&mut self) {
        if let Some(tmp_path) = self.tmp_path.take() {
            drop(self.file.take());
            if let Err(err) = fs::remove_file(&tmp_path) {
                warn!("failed to remove abandoned temp file: {err}");
            }
        }
    }
}
