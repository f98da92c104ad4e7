//! On-disk record format for a single key/value pair in a [`crate::KeyedStore`].
//!
//! Every record is self-describing and CRC-guarded so that a store recovers
//! from a crash mid-write by truncating at the first damaged record, the
//! same strategy `assemblage_kv`'s log-structured entries use (there, CRCs
//! guard whole transactions; here, guarding individual records is enough
//! since this store has no transactions or versions to roll back).
//!
//! Record layout (all integers little-endian):
//!
//! ```text
//! flag: u8        0 = value, 1 = tombstone (deleted key)
//! key_len: u32
//! key: [u8; key_len]
//! val_len: u32
//! val: [u8; val_len]
//! crc: u32        crc32 of everything above
//! ```

use crate::{Error, Result};
use crc32fast::Hasher;
use std::io::{Read, Write};

const FLAG_VALUE: u8 = 0;
const FLAG_TOMBSTONE: u8 = 1;

/// A single record as it appears in the store's append-only log.
pub(crate) struct Entry {
    pub tombstone: bool,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Entry {
    pub fn value(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            tombstone: false,
            key,
            value,
        }
    }

    pub fn tombstone(key: Vec<u8>) -> Self {
        Self {
            tombstone: true,
            key,
            value: Vec::new(),
        }
    }

    /// Total on-disk length of this entry once encoded.
    pub fn encoded_len(&self) -> u64 {
        (1 + 4 + self.key.len() + 4 + self.value.len() + 4) as u64
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        let flag = if self.tombstone {
            FLAG_TOMBSTONE
        } else {
            FLAG_VALUE
        };
        let key_len = (self.key.len() as u32).to_le_bytes();
        let val_len = (self.value.len() as u32).to_le_bytes();

        let mut crc = Hasher::new();
        crc.update(&[flag]);
        crc.update(&key_len);
        crc.update(&self.key);
        crc.update(&val_len);
        crc.update(&self.value);

        w.write_all(&[flag])?;
        w.write_all(&key_len)?;
        w.write_all(&self.key)?;
        w.write_all(&val_len)?;
        w.write_all(&self.value)?;
        w.write_all(&crc.finalize().to_le_bytes())?;
        Ok(())
    }

    /// Reads one entry starting at the reader's current position.
    ///
    /// Returns `Ok(None)` if the reader is exactly at a clean end of log (no
    /// bytes at all could be read for the flag byte). Returns
    /// `Err(Error::CorruptEntry)` if a record starts but is truncated or its
    /// CRC does not match; the caller treats this as "the log ends here"
    /// during recovery and truncates the file to the last good offset.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Option<Self>> {
        let mut flag_buf = [0u8; 1];
        if !read_maybe_eof(r, &mut flag_buf)? {
            return Ok(None);
        }
        let tombstone = match flag_buf[0] {
            FLAG_VALUE => false,
            FLAG_TOMBSTONE => true,
            _ => return Err(Error::CorruptEntry),
        };

        let mut key_len_buf = [0u8; 4];
        read_exact_or_corrupt(r, &mut key_len_buf)?;
        let key_len = u32::from_le_bytes(key_len_buf) as usize;
        let mut key = vec![0u8; key_len];
        read_exact_or_corrupt(r, &mut key)?;

        let mut val_len_buf = [0u8; 4];
        read_exact_or_corrupt(r, &mut val_len_buf)?;
        let val_len = u32::from_le_bytes(val_len_buf) as usize;
        let mut value = vec![0u8; val_len];
        read_exact_or_corrupt(r, &mut value)?;

        let mut crc_buf = [0u8; 4];
        read_exact_or_corrupt(r, &mut crc_buf)?;
        let crc_stored = u32::from_le_bytes(crc_buf);

        let mut crc = Hasher::new();
        crc.update(&flag_buf);
        crc.update(&key_len_buf);
        crc.update(&key);
        crc.update(&val_len_buf);
        crc.update(&value);
        if crc.finalize() != crc_stored {
            return Err(Error::CorruptEntry);
        }

        Ok(Some(Self {
            tombstone,
            key,
            value,
        }))
    }
}

/// Like `read_exact`, but distinguishes "nothing left to read at all" (a
/// clean end of file) from "some bytes were available but not enough" (a
/// truncated write, i.e. corruption).
fn read_maybe_eof<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut read = 0;
    while read < buf.len() {
        match r.read(&mut buf[read..])? {
            0 if read == 0 => return Ok(false),
            0 => return Err(Error::CorruptEntry),
            n => read += n,
        }
    }
    Ok(true)
}

fn read_exact_or_corrupt<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<()> {
    r.read_exact(buf).map_err(|_| Error::CorruptEntry)
}
