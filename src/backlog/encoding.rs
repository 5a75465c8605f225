//! Record encoding for backlog and snapshot files.
//!
//! One key per line. Inside a record `\` is written as `\\`, LF as `\n` and CR
//! as `\r`, so any key (whitespace and newlines included) survives a round trip.
//! Unknown escapes and a trailing lone backslash decode literally, which keeps
//! plain one-key-per-line files readable.

use ahash::AHashSet;
use bytes::{BufMut, Bytes, BytesMut};

use crate::store::ExpiredKey;

/// Append the encoded record for `key`, including the trailing newline.
pub fn encode_record(key: &ExpiredKey, out: &mut BytesMut) {
    out.reserve(key.as_bytes().len() + 1);
    for &b in key.as_bytes() {
        match b {
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            other => out.put_u8(other),
        }
    }
    out.put_u8(b'\n');
}

pub fn decode_record(line: &[u8]) -> ExpiredKey {
    let mut out = BytesMut::with_capacity(line.len());
    let mut iter = line.iter().copied().peekable();
    while let Some(b) = iter.next() {
        if b != b'\\' {
            out.put_u8(b);
            continue;
        }
        match iter.peek().copied() {
            Some(b'\\') => {
                iter.next();
                out.put_u8(b'\\');
            }
            Some(b'n') => {
                iter.next();
                out.put_u8(b'\n');
            }
            Some(b'r') => {
                iter.next();
                out.put_u8(b'\r');
            }
            _ => out.put_u8(b'\\'),
        }
    }
    ExpiredKey::new(out.freeze())
}

/// Decode every record in `data`. Blank lines are skipped.
pub fn decode_records(data: &[u8]) -> Vec<ExpiredKey> {
    data.split(|&b| b == b'\n')
        .filter(|line| !line.is_empty())
        .map(decode_record)
        .collect()
}

pub fn encode_records<'a>(keys: impl IntoIterator<Item = &'a ExpiredKey>) -> Bytes {
    let mut out = BytesMut::new();
    for key in keys {
        encode_record(key, &mut out);
    }
    out.freeze()
}

/// Drop repeated keys, keeping the first occurrence of each in order.
pub fn dedup_first_occurrence(keys: impl IntoIterator<Item = ExpiredKey>) -> Vec<ExpiredKey> {
    let mut seen = AHashSet::new();
    keys.into_iter()
        .filter(|key| seen.insert(key.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(names: &[&str]) -> Vec<ExpiredKey> {
        names.iter().map(|&n| ExpiredKey::from(n)).collect()
    }

    #[test]
    fn test_keys_with_whitespace_and_newlines_stay_whole() {
        let original = keys(&["session:42", "cart items", "multi\nline\r\n", "back\\slash", "tab\there"]);
        let encoded = encode_records(&original);
        assert_eq!(encoded.iter().filter(|&&b| b == b'\n').count(), original.len());
        assert_eq!(decode_records(&encoded), original);
    }

    #[test]
    fn test_plain_lines_decode_unchanged() {
        let data = b"k1\nk2\n\nC:\\temp\\x\nends-with\\";
        assert_eq!(
            decode_records(data),
            keys(&["k1", "k2", "C:\\temp\\x", "ends-with\\"])
        );
    }

    #[test]
    fn test_empty_input_has_no_records() {
        assert!(decode_records(b"").is_empty());
        assert!(decode_records(b"\n\n").is_empty());
    }

    #[test]
    fn test_dedup_keeps_first_occurrence_order() {
        let deduped = dedup_first_occurrence(keys(&["k1", "k2", "k1", "k3", "k2"]));
        assert_eq!(deduped, keys(&["k1", "k2", "k3"]));
    }

    #[test]
    fn test_dedup_is_exact_match() {
        let deduped = dedup_first_occurrence(keys(&["a", "a ", "A", "a"]));
        assert_eq!(deduped, keys(&["a", "a ", "A"]));
    }
}
