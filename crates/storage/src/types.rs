//! Common types used across storage operations.

use bytes::Bytes;

/// Key-value pair returned from range queries.
///
/// # Examples
///
/// ```
/// use bytes::Bytes;
/// use sso_ticket_storage::KeyValue;
///
/// let kv = KeyValue::new(Bytes::from("ticket/TGT-1"), Bytes::from("{}"));
/// assert_eq!(kv.key, Bytes::from("ticket/TGT-1"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    /// The key identifying this entry.
    pub key: Bytes,

    /// The value stored at this key.
    pub value: Bytes,
}

impl KeyValue {
    /// Creates a new key-value pair.
    pub fn new(key: Bytes, value: Bytes) -> Self {
        Self { key, value }
    }
}

/// Returns the exclusive upper bound of all keys that start with `prefix`.
///
/// Used to turn a prefix scan into a `start..end` range. Returns `None` when
/// no finite bound exists (the prefix is empty or consists solely of `0xFF`
/// bytes), in which case callers should scan with an unbounded end.
///
/// # Examples
///
/// ```
/// use sso_ticket_storage::types::prefix_end;
///
/// assert_eq!(prefix_end(b"ticket/"), Some(b"ticket0".to_vec()));
/// assert_eq!(prefix_end(&[0xFF, 0xFF]), None);
/// ```
#[must_use]
pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_end_increments_last_byte() {
        assert_eq!(prefix_end(b"abc"), Some(b"abd".to_vec()));
    }

    #[test]
    fn test_prefix_end_carries_over_max_bytes() {
        assert_eq!(prefix_end(&[b'a', 0xFF]), Some(vec![b'b']));
    }

    #[test]
    fn test_prefix_end_empty_prefix() {
        assert_eq!(prefix_end(b""), None);
    }
}
