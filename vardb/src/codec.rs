//! The on-disk binary format for a [`Collection`], as [`encode`]/[`decode`].
//!
//! ```text
//! header     : 3 bytes = 0x49 0x52 0x01
//! pair       : name_field value_field
//! name_field : u16 big-endian length L (including trailing NUL),
//!              L bytes of name payload (last byte = 0x00)
//! value_field: u16 big-endian length L (including trailing NUL),
//!              L bytes of value payload (last byte = 0x00)
//! terminator : u16 big-endian 0x0000 (a zero-length name)
//! ```
//!
//! Lengths are stored as "payload length + 1" so the maximum in-memory
//! string length is 65535 bytes; [`encode`] clamps any longer string to
//! 65535 payload bytes plus the trailing NUL. The 3-byte header is reserved
//! for future versioning and is written but not validated on decode (see
//! the crate's `DESIGN.md` for why).

use crate::{Collection, Error, Result, Variable};

/// The fixed 3-byte prefix every encoded blob starts with.
const HEADER: [u8; 3] = [0x49, 0x52, 0x01];

/// The maximum length (including the trailing NUL) a single name or value
/// field can occupy on disk.
const MAX_FIELD_LEN: usize = 65536;

/// Variables that are never written to disk: `IS_NEW` is caller-only
/// bookkeeping consumed by the first `store`, `UPDATE_RATE` is derived fresh
/// on every `retrieve` and would otherwise go stale between stores, and
/// `__name`/`__key` are the in-memory-only handles that identify which file
/// and record a collection belongs to (see the crate's `Collection` docs).
fn is_transient(name: &[u8]) -> bool {
    matches!(name, b"IS_NEW" | b"UPDATE_RATE" | b"__name" | b"__key")
}

/// Encodes `col` into the on-disk blob format.
///
/// Skips `IS_NEW`, `UPDATE_RATE` and the in-memory-only `__name`/`__key`
/// handles (the manager is expected to have already removed `IS_NEW`/
/// `UPDATE_RATE` before encoding, but the codec enforces all four
/// independently so that invariant I4 -- "`UPDATE_RATE` never appears on
/// disk" -- and the `__name`/`__key` "never serialized to disk" rule from
/// the `Collection` docs cannot be violated by a caller that forgets).
/// Fields longer than 65535 bytes are clamped rather than rejected;
/// encoding a valid collection never fails.
pub fn encode(col: &Collection) -> Vec<u8> {
    let fields: Vec<&Variable> = col.iter().filter(|v| !is_transient(&v.name)).collect();

    let mut size = HEADER.len() + 2;
    for var in &fields {
        size += 2 + field_len(&var.name);
        size += 2 + field_len(&var.value);
    }

    let mut buf = Vec::with_capacity(size);
    buf.extend_from_slice(&HEADER);
    for var in &fields {
        write_field(&mut buf, &var.name);
        write_field(&mut buf, &var.value);
    }
    buf.extend_from_slice(&0u16.to_be_bytes());
    buf
}

/// The on-disk length (2-byte length prefix + payload + NUL) of a field
/// after clamping to [`MAX_FIELD_LEN`].
fn field_len(bytes: &[u8]) -> usize {
    (bytes.len() + 1).min(MAX_FIELD_LEN)
}

fn write_field(buf: &mut Vec<u8>, bytes: &[u8]) {
    let len = field_len(bytes);
    buf.extend_from_slice(&(len as u16).to_be_bytes());
    buf.extend_from_slice(&bytes[..len - 1]);
    buf.push(0);
}

/// Decodes a blob previously produced by [`encode`] (or a compatible writer)
/// back into a [`Collection`].
///
/// Returns [`Error::Corrupt`] only for a genuinely truncated record (a
/// length field whose payload would run past the end of the buffer).
/// Trailing garbage after the zero-length terminator and an oversize length
/// field are logged as warnings but do not fail decoding -- both are
/// treated as "a version skew or partial corruption we can still recover
/// the collection parsed so far from", matching the historical decoder's
/// defensive posture.
pub fn decode(bytes: &[u8]) -> Result<Collection> {
    let size = bytes.len();
    let mut col = Collection::new();
    if size < HEADER.len() {
        return Err(Error::Corrupt);
    }
    let mut offset = HEADER.len();

    while offset + 1 < size {
        let name_len = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]) as usize;

        if name_len == 0 {
            if offset < size - 2 {
                log::trace!(
                    "blob[{}]: {} byte(s) remaining after terminator",
                    offset,
                    size - offset
                );
                log::warn!(
                    "possibly corrupted database: var name length = 0 at blob offset {}-{}",
                    offset,
                    offset + 1
                );
            }
            return Ok(col);
        }
        if name_len > MAX_FIELD_LEN {
            log::trace!(
                "blob[{}]: {} byte(s) remaining, oversize length 0x{:04x}",
                offset,
                size - offset,
                name_len
            );
            log::warn!(
                "possibly corrupted database: var name length > 65536 (0x{:04x}) at blob offset {}-{}",
                name_len,
                offset,
                offset + 1
            );
            return Ok(col);
        }

        offset += 2;
        if offset + name_len > size {
            return Err(Error::Corrupt);
        }
        let name = bytes[offset..offset + name_len - 1].to_vec();
        offset += name_len;

        if offset + 1 >= size {
            return Err(Error::Corrupt);
        }
        let value_len = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]) as usize;
        offset += 2;
        if offset + value_len > size {
            return Err(Error::Corrupt);
        }
        let value = bytes[offset..offset + value_len - 1].to_vec();
        offset += value_len;

        col.push(name, value);
    }

    Ok(col)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn round_trip_preserves_order_and_values() {
        let mut col = Collection::new();
        col.push("KEY", "1.2.3.4");
        col.push("TIMEOUT", "60");
        col.push("__expire_KEY", "1060");

        let bytes = encode(&col);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, col);
    }

    #[test]
    fn header_is_stable() {
        let col = Collection::new();
        let bytes = encode(&col);
        assert_eq!(&bytes[0..3], &HEADER);
    }

    #[test]
    fn terminator_is_zero() {
        let mut col = Collection::new();
        col.push("A", "b");
        let bytes = encode(&col);
        assert_eq!(&bytes[bytes.len() - 2..], &[0, 0]);
    }

    #[test]
    fn encode_skips_is_new_and_update_rate() {
        let mut col = Collection::new();
        col.push("KEY", "k");
        col.push("IS_NEW", "1");
        col.push("UPDATE_RATE", "2");
        let bytes = encode(&col);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded.get("KEY"), Some(b"k".as_slice()));
    }

    #[test]
    fn encode_skips_name_and_key_handles() {
        let mut col = Collection::new();
        col.push("__name", "IP");
        col.push("__key", "1.2.3.4");
        col.push("KEY", "1.2.3.4");
        let bytes = encode(&col);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded.get("__name"), None);
        assert_eq!(decoded.get("__key"), None);
    }

    #[test]
    fn encode_clamps_oversize_fields() {
        let mut col = Collection::new();
        let long_name = vec![b'x'; 70_000];
        col.push(long_name, "v");
        let bytes = encode(&col);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.iter().next().unwrap().name.len(), 65535);
    }

    #[test]
    fn decode_fails_on_truncated_name() {
        init_log();
        let mut bytes = HEADER.to_vec();
        bytes.extend_from_slice(&5u16.to_be_bytes());
        bytes.extend_from_slice(b"ab"); // only 2 of the promised 5 bytes
        assert!(matches!(decode(&bytes), Err(Error::Corrupt)));
    }

    #[test]
    fn decode_stops_gracefully_on_trailing_garbage() {
        init_log();
        let mut col = Collection::new();
        col.push("A", "b");
        let mut bytes = encode(&col);
        bytes.truncate(bytes.len() - 2); // drop the terminator
        bytes.extend_from_slice(&[1, 2, 3]); // garbage in its place
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.get("A"), Some(b"b".as_slice()));
    }

    #[test]
    fn decode_duplicate_names_both_survive() {
        let mut col = Collection::new();
        col.push("__expire_FOO", "1");
        col.push("__expire_FOO", "2");
        let bytes = encode(&col);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.len(), 2);
    }
}
