//! # Crash-recoverable keyed byte store, one file per name, safe across processes.
//!
//! This crate provides the Keyed Blob Store Adapter that a higher-level
//! policy layer (see the `vardb` crate) builds its record semantics on top
//! of. It is implemented as a log-structured hash table similar to
//! [Bitcask](https://riak.com/assets/bitcask-intro.pdf): writes are appended
//! to the end of the file and never overwritten in place, while an
//! in-memory hash table tracks the most recent offset of every key so reads
//! never need to scan. [`KeyedStore::compact`] reclaims the space of
//! superseded and deleted entries by rewriting the file to only the latest
//! generation.
//!
//! Unlike a single-process cache, a `KeyedStore` is meant to be opened
//! independently and repeatedly by many cooperating OS processes that all
//! point at the same file (the worker-process model of a web server). There
//! is no in-process synchronization beyond what the OS file system gives us
//! for free; instead, every [`KeyedStore::open`] call takes an OS advisory
//! lock (via `fs2`) sized to the requested [`OpenMode`] -- shared for
//! [`OpenMode::ReadOnly`], exclusive for [`OpenMode::CreateOrWrite`] -- and
//! holds it until the store is dropped, so the whole open/act/close session
//! is the critical section other processes serialize against. [`KeyedStore::lock`]/
//! [`KeyedStore::unlock`] exist on top of that for a caller that needs to
//! narrow or release the lock for part of a session (e.g. a background sweep
//! that only needs the lock held long enough to snapshot the live key set).
//! Replacing any of this with an in-process mutex would silently corrupt
//! data shared between processes.
//!
//! ## Example
//!
//! ```
//! use vardb_store::{KeyedStore, OpenMode};
//! use tempfile::tempdir;
//!
//! let dir = tempdir().unwrap();
//! let path = dir.path().join("example");
//!
//! let mut store = KeyedStore::open(&path, OpenMode::CreateOrWrite).unwrap();
//! store.store(b"key", b"value").unwrap();
//! assert_eq!(store.fetch(b"key").unwrap(), Some(b"value".to_vec()));
//!
//! store.delete(b"key").unwrap();
//! assert_eq!(store.fetch(b"key").unwrap(), None);
//! ```

mod entry;

use entry::Entry;
use fs2::FileExt;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// The error type for keyed store operations.
#[derive(Debug)]
pub enum Error {
    /// Caused by an underlying file system operation.
    IoError(io::Error),
    /// A record's header or CRC did not match its content; the log was
    /// truncated to the last known-good offset during recovery.
    CorruptEntry,
    /// `store`/`delete`/`compact` was called on a store opened read-only.
    ReadOnly,
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::IoError(e)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(e) => write!(f, "keyed store io error: {}", e),
            Error::CorruptEntry => write!(f, "keyed store record is corrupt"),
            Error::ReadOnly => write!(f, "keyed store is opened read-only"),
        }
    }
}

/// A specialized `Result` type for keyed store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Whether a store is opened for reading only, or for reading and writing
/// (creating the file if it does not yet exist).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpenMode {
    /// Fails if the file does not already exist. No writes are permitted.
    ReadOnly,
    /// Creates the file if necessary. Reads and writes are both permitted.
    CreateOrWrite,
}

/// The kind of OS advisory lock to take on a store's underlying file.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LockMode {
    /// Any number of processes may hold a shared lock concurrently; it only
    /// excludes exclusive locks.
    Shared,
    /// At most one process may hold an exclusive lock, and only if no other
    /// process holds any lock (shared or exclusive) at the same time.
    Exclusive,
}

/// A crash-recoverable keyed byte store backed by a single append-only file.
pub struct KeyedStore {
    path: PathBuf,
    file: File,
    mode: OpenMode,
    /// Maps each live key to the file offset where its most recent record
    /// starts. Keys deleted by a tombstone record are absent.
    offsets: HashMap<Vec<u8>, u64>,
    /// Logical end of the file; the offset the next write will start at.
    len: u64,
    /// Bytes occupied by records superseded by a later write, or by
    /// tombstones themselves, that [`KeyedStore::compact`] can reclaim.
    dead_bytes: u64,
}

impl KeyedStore {
    /// Opens (and for [`OpenMode::CreateOrWrite`], creates if missing) the
    /// keyed store file at `path`, takes an OS advisory lock sized to `mode`
    /// (blocking until it is available), then replays the log to rebuild
    /// the in-memory offset index.
    ///
    /// The lock is taken *before* replay so that the offset index and file
    /// length this store computes can never be invalidated by a concurrent
    /// process appending to the same file mid-replay; it is held for the
    /// entire lifetime of the returned store (released by [`KeyedStore::unlock`]
    /// or on drop), matching the "open, act, close" critical section callers
    /// are expected to use this type for. [`OpenMode::ReadOnly`] takes a
    /// shared lock (any number of readers may hold it together);
    /// [`OpenMode::CreateOrWrite`] takes an exclusive one, since writers must
    /// not race each other's `append`s.
    ///
    /// If the log ends with a damaged record (a crash mid-write), the
    /// damaged tail is logged and, for [`OpenMode::CreateOrWrite`], the file
    /// is truncated to the last known-good record so future writes simply
    /// overwrite the damaged tail. A store opened [`OpenMode::ReadOnly`]
    /// cannot truncate; it instead just stops replaying at the damaged
    /// record and treats everything before it as the store's contents.
    pub fn open(path: impl AsRef<Path>, mode: OpenMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = match mode {
            OpenMode::ReadOnly => OpenOptions::new().read(true).open(&path)?,
            OpenMode::CreateOrWrite => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)?,
        };
        match mode {
            OpenMode::ReadOnly => file.lock_shared()?,
            OpenMode::CreateOrWrite => file.lock_exclusive()?,
        }

        let mut store = Self {
            path,
            file,
            mode,
            offsets: HashMap::new(),
            len: 0,
            dead_bytes: 0,
        };
        store.replay()?;
        Ok(store)
    }

    fn replay(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut offset = 0u64;
        loop {
            match Entry::read_from(&mut self.file) {
                Ok(Some(entry)) => {
                    let entry_len = entry.encoded_len();
                    if self.offsets.remove(&entry.key).is_some() {
                        self.dead_bytes += entry_len;
                    }
                    if entry.tombstone {
                        self.dead_bytes += entry_len;
                    } else {
                        self.offsets.insert(entry.key, offset);
                    }
                    offset += entry_len;
                }
                Ok(None) => break,
                Err(Error::CorruptEntry) => {
                    log::warn!(
                        "truncating corrupt record in {} at offset {}",
                        self.path.display(),
                        offset
                    );
                    if self.mode == OpenMode::CreateOrWrite {
                        self.file.set_len(offset)?;
                    }
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        self.len = offset;
        Ok(())
    }

    /// The path of the store's backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total length of the backing file in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns `true` if the store has no live or dead records at all.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Takes (or converts to) an OS advisory lock on the store's file,
    /// blocking until it is available. [`KeyedStore::open`] already holds a
    /// lock sized to the open mode for the whole session; call this to
    /// change that lock's mode for part of the session (e.g. downgrading a
    /// [`OpenMode::CreateOrWrite`] store's exclusive lock to a shared one
    /// while only reading). Held until [`KeyedStore::unlock`] is called or
    /// the store is dropped.
    pub fn lock(&mut self, mode: LockMode) -> Result<()> {
        match mode {
            LockMode::Shared => self.file.lock_shared()?,
            LockMode::Exclusive => self.file.lock_exclusive()?,
        }
        Ok(())
    }

    /// Releases the lock held on the store's file, whether taken implicitly
    /// by [`KeyedStore::open`] or explicitly by [`KeyedStore::lock`]. A
    /// caller that unlocks mid-session and keeps using the store is
    /// responsible for any cross-process races that follow (as
    /// `vardb::Manager::sweep` intentionally does for its key-snapshot
    /// phase).
    pub fn unlock(&mut self) -> Result<()> {
        self.file.unlock()?;
        Ok(())
    }

    /// Returns the most recent value stored for `key`, or `None` if the key
    /// was never stored or has since been deleted.
    pub fn fetch(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let offset = match self.offsets.get(key) {
            Some(o) => *o,
            None => return Ok(None),
        };
        self.file.seek(SeekFrom::Start(offset))?;
        let entry = Entry::read_from(&mut self.file)?.ok_or(Error::CorruptEntry)?;
        Ok(Some(entry.value))
    }

    /// Appends a new value for `key`, superseding any prior value.
    ///
    /// Always atomic from the point of view of other processes: the record
    /// is a single contiguous append, so a reader never observes a
    /// partially-written record (other than the tail-truncation recovery
    /// `open` performs after a genuine crash mid-write).
    pub fn store(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.require_writable()?;
        let entry = Entry::value(key.to_vec(), value.to_vec());
        self.append(entry, key)
    }

    /// Marks `key` as deleted by appending a tombstone record.
    ///
    /// Returns `Ok(())` even if the key was not present; deleting an absent
    /// key is not an error (mirrors the forgiving semantics the collection
    /// manager relies on when a racing sweep already removed the record).
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.require_writable()?;
        let had_key = self.offsets.remove(key).is_some();
        let entry = Entry::tombstone(key.to_vec());
        let entry_len = entry.encoded_len();
        self.file.seek(SeekFrom::Start(self.len))?;
        entry.write_to(&mut self.file)?;
        self.file.sync_data()?;
        self.len += entry_len;
        self.dead_bytes += entry_len;
        if had_key {
            self.dead_bytes += entry_len;
        }
        Ok(())
    }

    fn append(&mut self, entry: Entry, key: &[u8]) -> Result<()> {
        let entry_len = entry.encoded_len();
        let offset = self.len;
        self.file.seek(SeekFrom::Start(offset))?;
        entry.write_to(&mut self.file)?;
        self.file.sync_data()?;
        if let Some(_prev_offset) = self.offsets.insert(key.to_vec(), offset) {
            self.dead_bytes += entry_len;
        }
        self.len += entry_len;
        Ok(())
    }

    fn require_writable(&self) -> Result<()> {
        if self.mode == OpenMode::CreateOrWrite {
            Ok(())
        } else {
            Err(Error::ReadOnly)
        }
    }

    /// Returns a snapshot of every live (non-deleted) key currently in the
    /// store, in no particular order.
    ///
    /// Since the full key set is already resident in memory, this never
    /// touches the file; callers that need a consistent view across
    /// multiple processes should wrap the call (and any later per-key
    /// operations derived from it) in [`KeyedStore::lock`].
    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.offsets.keys().cloned().collect()
    }

    /// Rewrites the backing file to contain only the latest live value of
    /// each key, reclaiming the space used by superseded writes and
    /// tombstones.
    ///
    /// Requires an exclusive lock, since it replaces the file in place and
    /// other processes must not be reading or writing to it concurrently
    /// with a compaction; a store opened with [`OpenMode::CreateOrWrite`]
    /// already holds one for its whole session (see [`KeyedStore::open`]).
    /// A caller that downgraded its lock with [`KeyedStore::lock`] must
    /// re-acquire [`LockMode::Exclusive`] before calling this.
    pub fn compact(&mut self) -> Result<()> {
        self.require_writable()?;
        let compacted_path = compacted_file_name(&self.path);
        let mut compacted = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&compacted_path)?;

        let mut new_offsets = HashMap::with_capacity(self.offsets.len());
        let mut offset = 0u64;
        let mut keys: Vec<_> = self.offsets.keys().cloned().collect();
        keys.sort();
        for key in keys {
            let value = self.fetch(&key)?.expect("key from offsets must resolve");
            let entry = Entry::value(key.clone(), value);
            let entry_len = entry.encoded_len();
            entry.write_to(&mut compacted)?;
            new_offsets.insert(key, offset);
            offset += entry_len;
        }
        compacted.sync_all()?;
        drop(compacted);

        std::fs::rename(&compacted_path, &self.path)?;
        self.file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)?;
        self.offsets = new_offsets;
        self.len = offset;
        self.dead_bytes = 0;
        Ok(())
    }
}

fn compacted_file_name(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".compacting");
    PathBuf::from(name)
}

impl Drop for KeyedStore {
    fn drop(&mut self) {
        let _ = self.unlock();
    }
}
