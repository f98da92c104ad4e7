//! # Persistent collection store for per-client/per-session variable state.
//!
//! A `vardb` collection is an ordered multimap of `name -> value` byte
//! strings, keyed by a caller-chosen record key and persisted under a
//! *collection name* (one [`vardb_store::KeyedStore`] file per name, at
//! `<data_dir>/<name>`). Collections are the long-lived, cross-request state
//! a rule engine accumulates about a client, a session or an IP address:
//! request counts, sliding-window rates, anomaly scores and similar
//! bookkeeping that must survive past the end of a single transaction.
//!
//! On top of the plain keyed byte store, this crate adds the policy a rule
//! engine actually needs:
//!
//!   - a compact [`codec`] that marshals a [`Collection`] to and from the
//!     on-disk blob format, preserving insertion order and first-match
//!     lookup semantics (it is a multimap, not a map: duplicate names can
//!     occur and both instances must remain removable)
//!   - a small set of reserved *meta-variables* (`KEY`, `TIMEOUT`,
//!     `CREATE_TIME`, `LAST_UPDATE_TIME`, `UPDATE_COUNTER`, `UPDATE_RATE`,
//!     `IS_NEW`, and `__expire_<NAME>`) that [`Manager::retrieve`] and
//!     [`Manager::store`] interpret to expire individual variables, expire
//!     whole collections, and derive an update-rate statistic
//!   - [`Manager::sweep`], a background pass that reclaims collections whose
//!     `__expire_KEY` has elapsed without waiting for a live transaction to
//!     visit them
//!
//! ## Example
//!
//! ```
//! use tempfile::tempdir;
//! use vardb::{Collection, Manager};
//!
//! let dir = tempdir().unwrap();
//! let mgr = Manager::new(dir.path());
//!
//! let mut col = Collection::new();
//! col.set("__name", b"ip");
//! col.set("__key", b"1.2.3.4");
//! col.set("KEY", b"1.2.3.4");
//! col.set("TIMEOUT", b"60");
//! col.set("CREATE_TIME", b"1000");
//! col.set("__expire_KEY", b"1060");
//! col.set("IS_NEW", b"1");
//!
//! mgr.store(col).unwrap();
//!
//! let retrieved = mgr.retrieve(b"ip", b"1.2.3.4", 1030).unwrap().unwrap();
//! assert_eq!(retrieved.get("UPDATE_COUNTER"), Some(b"1".as_slice()));
//! ```

pub mod codec;
mod manager;

use std::fmt;
use std::path::PathBuf;

/// A single `(name, value)` pair as it appears in a [`Collection`].
///
/// Names and values are treated as opaque bytes; in practice they are
/// human-readable ASCII, but nothing in this crate assumes that. Both are
/// bounded to 65535 bytes in their on-disk form (see [`codec`]); longer
/// in-memory values are silently truncated by [`codec::encode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

/// An ordered multimap of [`Variable`]s, preserving the insertion order of
/// first appearance.
///
/// Lookups by name return the first matching entry, matching the semantics
/// of the `apr_table_t` this crate's on-disk format was designed around: a
/// later `set` of an already-present name inserts a second entry rather than
/// overwriting the first, and removal must be able to remove every matching
/// entry, not just the first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Collection {
    vars: Vec<Variable>,
}

impl Collection {
    /// Creates an empty collection.
    pub fn new() -> Self {
        Self { vars: Vec::new() }
    }

    /// Returns the value of the first variable named `name`, if any.
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.get_bytes(name.as_bytes())
    }

    /// Like [`Collection::get`], but for a byte-string name.
    pub fn get_bytes(&self, name: &[u8]) -> Option<&[u8]> {
        self.vars
            .iter()
            .find(|v| v.name == name)
            .map(|v| v.value.as_slice())
    }

    /// Appends a new variable, even if a variable with the same name is
    /// already present (see the multimap note on [`Collection`]).
    pub fn push(&mut self, name: impl AsRef<[u8]>, value: impl AsRef<[u8]>) {
        self.vars.push(Variable {
            name: name.as_ref().to_vec(),
            value: value.as_ref().to_vec(),
        });
    }

    /// Sets the value of `name`, overwriting the first existing occurrence
    /// in place or appending a new variable if `name` is not yet present.
    ///
    /// This is the common case callers want (a single logical slot per
    /// meta-variable); use [`Collection::push`] directly to intentionally
    /// create a duplicate.
    pub fn set(&mut self, name: impl AsRef<[u8]>, value: impl AsRef<[u8]>) {
        let name = name.as_ref();
        let value = value.as_ref().to_vec();
        if let Some(v) = self.vars.iter_mut().find(|v| v.name == name) {
            v.value = value;
        } else {
            self.vars.push(Variable {
                name: name.to_vec(),
                value,
            });
        }
    }

    /// Removes every variable named `name`. Returns `true` if at least one
    /// was removed.
    pub fn remove(&mut self, name: &[u8]) -> bool {
        let before = self.vars.len();
        self.vars.retain(|v| v.name != name);
        self.vars.len() != before
    }

    /// Returns `true` if at least one variable is named `name`.
    pub fn contains(&self, name: &[u8]) -> bool {
        self.vars.iter().any(|v| v.name == name)
    }

    /// Iterates over all variables in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Variable> {
        self.vars.iter()
    }

    /// The number of variables currently in the collection (including
    /// duplicates and the in-memory-only `__name`/`__key`).
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Returns `true` if the collection has no variables at all.
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Reads a variable's value as a base-10 integer, ignoring the variable
    /// if it is absent or not a valid integer.
    ///
    /// Matches the original C implementation's use of `atoi`, which silently
    /// treats a malformed numeric field as `0` rather than failing the whole
    /// operation; this crate instead treats it as simply absent so callers
    /// can apply their own default.
    pub(crate) fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name)
            .and_then(|v| std::str::from_utf8(v).ok())
            .and_then(|s| s.trim().parse::<i64>().ok())
    }
}

impl FromIterator<Variable> for Collection {
    fn from_iter<I: IntoIterator<Item = Variable>>(iter: I) -> Self {
        Self {
            vars: iter.into_iter().collect(),
        }
    }
}

/// The error type for collection store operations.
#[derive(Debug)]
pub enum Error {
    /// No `data_dir` was configured on the [`Manager`].
    NotConfigured,
    /// Caused by a failed operation of the underlying keyed store.
    StoreError(vardb_store::Error),
    /// A stored blob failed a bounds or length check while decoding.
    Corrupt,
    /// `store` was called on a collection missing `__name` or `__key`.
    MissingRequiredField(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotConfigured => write!(f, "no data directory configured"),
            Error::StoreError(e) => write!(f, "collection store error: {}", e),
            Error::Corrupt => write!(f, "collection blob is corrupt"),
            Error::MissingRequiredField(field) => {
                write!(f, "collection is missing required field \"{}\"", field)
            }
        }
    }
}

impl From<vardb_store::Error> for Error {
    fn from(e: vardb_store::Error) -> Self {
        Error::StoreError(e)
    }
}

/// A specialized `Result` type for collection store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The policy layer over [`vardb_store`]: retrieves, persists and sweeps
/// [`Collection`]s according to the meta-variable rules documented on the
/// crate.
///
/// Holds exactly the one piece of configuration this system needs: the
/// directory under which every collection name's file lives. A `Manager`
/// with no `data_dir` is a valid, inert value: every operation short-circuits
/// rather than panicking, matching the original `SecDataDir`-unset behavior.
pub struct Manager {
    data_dir: Option<PathBuf>,
}

impl Manager {
    /// Creates a manager backed by collection files under `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(data_dir.into()),
        }
    }

    /// Creates a manager with no configured data directory. Every operation
    /// on it is a documented no-op (see the crate's module docs).
    pub fn unconfigured() -> Self {
        Self { data_dir: None }
    }
}
