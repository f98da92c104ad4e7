//! The policy layer: [`Manager::retrieve`], [`Manager::store`] and
//! [`Manager::sweep`], plus the meta-variable rules they enforce.

use crate::{codec, Collection, Error, Manager, Result};
use std::time::{SystemTime, UNIX_EPOCH};
use vardb_store::{KeyedStore, LockMode, OpenMode};

/// Appends the NUL terminator the on-disk key layout expects (the length
/// stored by the underlying keyed file is `len(key) + 1`, see spec §6).
fn keyed(key: &[u8]) -> Vec<u8> {
    let mut k = key.to_vec();
    k.push(0);
    k
}

/// Wall-clock seconds since the Unix epoch, used for everything the
/// original implementation drove off `apr_time_now()`: refreshing
/// `__expire_KEY`, `LAST_UPDATE_TIME` and the `UPDATE_RATE` derivation.
///
/// Distinct from the `request_time` parameter callers pass into
/// [`Manager::retrieve`], which governs per-variable expiry so that every
/// expiry check within one transaction sees a stable snapshot in time
/// rather than drifting mid-transaction.
fn now_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_secs() as i64
}

impl Manager {
    /// Loads the collection named `key` from the collection file `name`,
    /// applying per-variable expiry and, if the collection itself has
    /// expired or never had a `KEY`, deleting it.
    ///
    /// `request_time` is the Unix-second timestamp every `__expire_*`
    /// variable is compared against; it should be the timestamp of the
    /// caller's current transaction, not a fresh `now()` call, so that a
    /// single transaction observes a consistent expiry snapshot.
    ///
    /// Returns `None` both when no collection exists and when any error
    /// occurs reading or decoding one: a failed retrieve is deliberately
    /// indistinguishable from a legitimate absence (see the crate's
    /// `DESIGN.md` for why this matches the source's philosophy).
    pub fn retrieve(&self, name: &[u8], key: &[u8], request_time: i64) -> Option<Collection> {
        let data_dir = match &self.data_dir {
            Some(d) => d,
            None => {
                log::error!(
                    "unable to retrieve collection (name {:?}, key {:?}): no data directory configured",
                    String::from_utf8_lossy(name),
                    String::from_utf8_lossy(key)
                );
                return None;
            }
        };
        let path = data_dir.join(String::from_utf8_lossy(name).as_ref());

        let mut store = match KeyedStore::open(&path, OpenMode::ReadOnly) {
            Ok(s) => s,
            Err(_) => return None,
        };
        let blob = match store.fetch(&keyed(key)) {
            Ok(Some(b)) => b,
            Ok(None) => return None,
            Err(e) => {
                log::error!("failed to read collection file {:?}: {}", path, e);
                return None;
            }
        };
        drop(store);

        let mut col = match codec::decode(&blob) {
            Ok(c) => c,
            Err(_) => return None,
        };
        for var in col.iter() {
            log::trace!(
                "read variable: name {:?}, value {:?}",
                String::from_utf8_lossy(&var.name),
                String::from_utf8_lossy(&var.value)
            );
        }

        let expired = expire_variables(&mut col, request_time);

        if col.get("KEY").is_none() {
            return match self.delete_collection(&path, key, name, expired) {
                Ok(()) => None,
                Err(e) => {
                    log::error!(
                        "failed deleting collection (name {:?}, key {:?}): {}",
                        String::from_utf8_lossy(name),
                        String::from_utf8_lossy(key),
                        e
                    );
                    None
                }
            };
        }

        derive_update_rate(&mut col, now_seconds());

        log::info!(
            "retrieved collection (name {:?}, key {:?})",
            String::from_utf8_lossy(name),
            String::from_utf8_lossy(key)
        );
        Some(col)
    }

    fn delete_collection(
        &self,
        path: &std::path::Path,
        key: &[u8],
        name: &[u8],
        expired: bool,
    ) -> Result<()> {
        let mut store = KeyedStore::open(path, OpenMode::CreateOrWrite)?;
        store.delete(&keyed(key))?;
        if expired {
            log::trace!(
                "collection expired (name {:?}, key {:?})",
                String::from_utf8_lossy(name),
                String::from_utf8_lossy(key)
            );
        }
        log::info!(
            "deleted collection (name {:?}, key {:?})",
            String::from_utf8_lossy(name),
            String::from_utf8_lossy(key)
        );
        Ok(())
    }

    /// Persists `col` to `<data_dir>/<__name>` under key `__key`, refreshing
    /// `__expire_KEY`, `LAST_UPDATE_TIME` and `UPDATE_COUNTER` along the way.
    ///
    /// `col` must contain the in-memory-only `__name` and `__key` variables;
    /// everything else about the meta-variables below is owned by `store`
    /// and should not be pre-set by the caller expecting it to survive:
    ///
    ///   - `IS_NEW` and `UPDATE_RATE` are removed.
    ///   - `__expire_KEY` is refreshed to `now + TIMEOUT` if both `TIMEOUT`
    ///     and `__expire_KEY` are already present (a first-ever store must
    ///     have the caller pre-populate `__expire_KEY`, see `DESIGN.md`).
    ///   - `LAST_UPDATE_TIME` is set to the current time.
    ///   - `UPDATE_COUNTER` is incremented (starting at 1 if absent).
    pub fn store(&self, mut col: Collection) -> Result<()> {
        let name = col
            .get("__name")
            .ok_or(Error::MissingRequiredField("__name"))?
            .to_vec();
        let key = col
            .get("__key")
            .ok_or(Error::MissingRequiredField("__key"))?
            .to_vec();
        let data_dir = self.data_dir.as_ref().ok_or_else(|| {
            log::error!(
                "unable to store collection (name {:?}, key {:?}): no data directory configured",
                String::from_utf8_lossy(&name),
                String::from_utf8_lossy(&key)
            );
            Error::NotConfigured
        })?;

        col.remove(b"IS_NEW");
        col.remove(b"UPDATE_RATE");

        let now = now_seconds();
        if let Some(timeout) = col.get_i64("TIMEOUT") {
            if col.contains(b"__expire_KEY") {
                col.set("__expire_KEY", (now + timeout).to_string());
            }
        }

        col.set("LAST_UPDATE_TIME", now.to_string());

        let counter = col.get_i64("UPDATE_COUNTER").unwrap_or(0) + 1;
        col.set("UPDATE_COUNTER", counter.to_string());

        let blob = codec::encode(&col);

        let path = data_dir.join(String::from_utf8_lossy(&name).as_ref());
        let result = (|| -> Result<()> {
            let mut store = KeyedStore::open(&path, OpenMode::CreateOrWrite)?;
            store.store(&keyed(&key), &blob)?;
            Ok(())
        })();

        match &result {
            Ok(()) => log::info!(
                "persisted collection (name {:?}, key {:?})",
                String::from_utf8_lossy(&name),
                String::from_utf8_lossy(&key)
            ),
            Err(e) => log::error!(
                "failed to persist collection (name {:?}, key {:?}): {}",
                String::from_utf8_lossy(&name),
                String::from_utf8_lossy(&key),
                e
            ),
        }
        result
    }

    /// Deletes every record in collection file `name` whose `__expire_KEY`
    /// has elapsed as of `now`.
    ///
    /// Opening the file for write already takes an exclusive lock for the
    /// whole session (see `vardb_store::KeyedStore::open`); this downgrades
    /// that to a shared lock just long enough to snapshot the file's keys,
    /// then releases the lock entirely before visiting each key
    /// individually -- concurrent `store`/`retrieve` calls from other
    /// workers are not blocked out for the whole sweep, at the cost of a
    /// race where a key deleted (or re-created) by another worker between
    /// the snapshot and our fetch/delete is simply skipped rather than
    /// erroring (see `DESIGN.md`'s Open Question decisions).
    ///
    /// Silently does nothing if no data directory is configured, matching
    /// the source's "user has been warned enough times already" silence.
    pub fn sweep(&self, name: &[u8]) -> Result<()> {
        let data_dir = match &self.data_dir {
            Some(d) => d,
            None => return Ok(()),
        };
        let path = data_dir.join(String::from_utf8_lossy(name).as_ref());
        let mut store = KeyedStore::open(&path, OpenMode::CreateOrWrite)?;

        store.lock(LockMode::Shared)?;
        let keys = store.keys();
        store.unlock()?;

        log::trace!(
            "found {} record(s) in file {:?}",
            keys.len(),
            String::from_utf8_lossy(name)
        );

        let now = now_seconds();
        for key in keys {
            let blob = match store.fetch(&key) {
                Ok(Some(b)) => b,
                Ok(None) => continue, // raced with a concurrent delete
                Err(e) => {
                    log::error!("failed reading collection file {:?}: {}", path, e);
                    return Err(e.into());
                }
            };
            let col = match codec::decode(&blob) {
                Ok(c) => c,
                Err(e) => {
                    log::error!("collection file {:?} is corrupt, aborting sweep", path);
                    return Err(e);
                }
            };
            let expire = match col.get_i64("__expire_KEY") {
                Some(t) => t,
                None => {
                    log::error!(
                        "collection cleanup discovered entry with no __expire_KEY (name {:?})",
                        String::from_utf8_lossy(name)
                    );
                    continue;
                }
            };
            log::trace!(
                "record (name {:?}) set to expire in {} second(s)",
                String::from_utf8_lossy(name),
                expire - now
            );
            if expire <= now {
                store.delete(&key)?;
                log::info!(
                    "removed stale collection (name {:?})",
                    String::from_utf8_lossy(name)
                );
            }
        }
        Ok(())
    }
}

/// Removes every variable whose `__expire_<NAME>` has elapsed as of
/// `request_time`, along with the `__expire_<NAME>` entry itself. Returns
/// `true` if `__expire_KEY` was among the expired entries (the whole
/// collection, not just one variable, has expired).
///
/// Restarts the scan after each removal since removing two entries shifts
/// every later index; this terminates because each pass through the loop
/// either removes a pair of entries or completes without finding one.
fn expire_variables(col: &mut Collection, request_time: i64) -> bool {
    let mut expired = false;
    loop {
        let hit = col.iter().find_map(|var| {
            let bare = var.name.strip_prefix(b"__expire_")?;
            let expiry: i64 = std::str::from_utf8(&var.value).ok()?.trim().parse().ok()?;
            (expiry <= request_time).then(|| (bare.to_vec(), var.name.clone()))
        });
        let (bare_name, expire_name) = match hit {
            Some(pair) => pair,
            None => break,
        };

        if expire_name == b"__expire_KEY" {
            expired = true;
        }
        log::trace!(
            "removing key {:?} from collection",
            String::from_utf8_lossy(&bare_name)
        );
        log::trace!(
            "removing key {:?} from collection",
            String::from_utf8_lossy(&expire_name)
        );
        col.remove(&bare_name);
        col.remove(&expire_name);
        log::info!(
            "removed expired variable {:?}",
            String::from_utf8_lossy(&bare_name)
        );

        if expired {
            break;
        }
    }
    expired
}

/// Sets `UPDATE_RATE := 60 * UPDATE_COUNTER / (now - CREATE_TIME)` (or `0`
/// if no time has elapsed yet), skipping silently if either source field is
/// absent. Never persisted: removed again by the next `store` (see
/// [`codec::encode`] and invariant I4).
fn derive_update_rate(col: &mut Collection, now: i64) {
    let create_time = match col.get_i64("CREATE_TIME") {
        Some(c) => c,
        None => return,
    };
    let counter = match col.get_i64("UPDATE_COUNTER") {
        Some(c) => c,
        None => return,
    };
    let delta = now - create_time;
    let rate = if delta == 0 { 0 } else { (60 * counter) / delta };
    col.set("UPDATE_RATE", rate.to_string());
}
