//! Key/value vector codec for the master/worker channel.
//!
//! A record is an ordered sequence of `(key, value)` byte pairs. On the
//! wire each pair is `key = value PAIR_SEP`, and a frame ends with one
//! extra `PAIR_SEP` so the frame delimiter is two consecutive zero bytes.
//!
//! Keys and values carry explicit lengths, so serialized values may
//! contain any byte (captured plugin output included). The parser splits
//! on the pair separator, which means a value holding that byte cannot be
//! re-split; frame extraction and serialization still preserve such
//! values untouched.

/// Key/value separator on the wire.
pub const KV_SEP: u8 = b'=';
/// Pair separator on the wire.
pub const PAIR_SEP: u8 = 0;
/// Frame delimiter: the pair separator of the last pair plus the sentinel.
pub const FRAME_DELIM: &[u8] = b"\0\0";

/// One key/value pair. Both sides are plain bytes with explicit lengths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// An insertion-ordered vector of key/value pairs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KvVec {
    pairs: Vec<KeyValue>,
    sorted: bool,
}

/// A serialized [`KvVec`]: the pair bytes plus the two-byte frame
/// terminator. `data.len()` is the full on-wire size; `payload` is the
/// size without the terminator.
#[derive(Debug, Clone)]
pub struct KvBuf {
    pub data: Vec<u8>,
    pub payload: usize,
}

impl KvVec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with room for `hint` pairs.
    pub fn with_hint(hint: usize) -> Self {
        Self {
            pairs: Vec::with_capacity(hint),
            sorted: false,
        }
    }

    /// Append a pair, growing the backing storage to hold at least five
    /// more pairs whenever it is full.
    pub fn add(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        if self.pairs.len() == self.pairs.capacity() {
            self.pairs.reserve(5);
        }
        self.pairs.push(KeyValue {
            key: key.into(),
            value: value.into(),
        });
        self.sorted = false;
    }

    /// Append a pair from string slices.
    pub fn add_str(&mut self, key: &str, value: &str) {
        self.add(key.as_bytes().to_vec(), value.as_bytes().to_vec());
    }

    /// Linear lookup of the first pair with the given key.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.pairs
            .iter()
            .find(|kv| kv.key == key)
            .map(|kv| kv.value.as_slice())
    }

    pub fn iter(&self) -> std::slice::Iter<'_, KeyValue> {
        self.pairs.iter()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn is_sorted(&self) -> bool {
        self.sorted
    }

    /// Sort pairs lexicographically by key and mark the vector sorted.
    pub fn sort(&mut self) {
        self.pairs.sort_by(|a, b| a.key.cmp(&b.key));
        self.sorted = true;
    }

    /// Serialize into a framed buffer using the given separators.
    ///
    /// The reported [`KvBuf::data`] length includes the trailing
    /// sentinel; callers ship the whole thing in one write.
    pub fn to_buf(&self, kv_sep: u8, pair_sep: u8) -> KvBuf {
        let mut size = 2; // frame terminator
        for kv in &self.pairs {
            size += kv.key.len() + kv.value.len() + 2;
        }

        let mut data = Vec::with_capacity(size);
        for kv in &self.pairs {
            data.extend_from_slice(&kv.key);
            data.push(kv_sep);
            data.extend_from_slice(&kv.value);
            data.push(pair_sep);
        }
        let payload = data.len();
        data.resize(size, 0);
        KvBuf { data, payload }
    }

    /// Serialize with the wire defaults (`=` and zero bytes).
    pub fn to_frame(&self) -> KvBuf {
        self.to_buf(KV_SEP, PAIR_SEP)
    }

    /// Parse a byte range back into a vector.
    ///
    /// Returns `None` when the input holds no pair separator at all.
    /// A zero-length key anywhere but the very start marks the end of a
    /// well-formed frame (that is how the terminator reads); whatever was
    /// parsed up to that point is returned. The scan never runs past
    /// `buf`.
    pub fn parse(buf: &[u8], kv_sep: u8, pair_sep: u8) -> Option<KvVec> {
        if buf.is_empty() {
            return None;
        }
        let num_pairs = buf.iter().filter(|&&b| b == pair_sep).count();
        if num_pairs == 0 {
            return None;
        }

        let mut kvv = KvVec::with_hint(num_pairs);
        let mut offset = 0;
        while offset < buf.len() {
            // keys can't begin with the pair separator; hitting one here
            // means we've reached the frame terminator
            if offset != 0 && buf[offset] == pair_sep {
                return Some(kvv);
            }

            let key_len = match buf[offset..].iter().position(|&b| b == kv_sep) {
                Some(n) => n,
                None => break,
            };
            let key = buf[offset..offset + key_len].to_vec();
            offset += key_len + 1;

            let value_len = match buf[offset..].iter().position(|&b| b == pair_sep) {
                Some(n) => n,
                None => break,
            };
            let value = buf[offset..offset + value_len].to_vec();
            offset += value_len + 1;

            kvv.add(key, value);
        }

        Some(kvv)
    }

    /// Parse with the wire defaults.
    pub fn parse_frame(buf: &[u8]) -> Option<KvVec> {
        Self::parse(buf, KV_SEP, PAIR_SEP)
    }
}

impl<'a> IntoIterator for &'a KvVec {
    type Item = &'a KeyValue;
    type IntoIter = std::slice::Iter<'a, KeyValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> KvVec {
        let mut kvv = KvVec::new();
        kvv.add_str("job_id", "12");
        kvv.add_str("type", "0");
        kvv.add_str("command", "/bin/echo hello");
        kvv.add_str("timeout", "30");
        kvv
    }

    #[test]
    fn test_roundtrip() {
        let kvv = sample();
        let buf = kvv.to_frame();
        let parsed = KvVec::parse_frame(&buf.data).unwrap();
        assert_eq!(parsed, kvv);
    }

    #[test]
    fn test_frame_terminator_and_size() {
        let kvv = sample();
        let buf = kvv.to_frame();

        // ends with two zero bytes
        assert_eq!(&buf.data[buf.data.len() - 2..], FRAME_DELIM);

        // size is sum of pair lengths plus 2 per pair plus the terminator
        let pair_bytes: usize = kvv.iter().map(|kv| kv.key.len() + kv.value.len()).sum();
        assert_eq!(buf.data.len(), pair_bytes + 2 * kvv.len() + 2);
        assert_eq!(buf.payload, buf.data.len() - 2);
    }

    #[test]
    fn test_empty_value() {
        let mut kvv = KvVec::new();
        kvv.add_str("key", "");
        kvv.add_str("other", "x");
        let buf = kvv.to_frame();
        let parsed = KvVec::parse_frame(&buf.data).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed.get(b"key"), Some(&b""[..]));
        assert_eq!(parsed.get(b"other"), Some(&b"x"[..]));
    }

    #[test]
    fn test_empty_vector_is_bare_terminator() {
        let kvv = KvVec::new();
        let buf = kvv.to_frame();
        assert_eq!(buf.data, b"\0\0");
        assert_eq!(buf.payload, 0);
    }

    #[test]
    fn test_parse_stops_at_terminator() {
        // two frames back to back; parse must not walk into the second
        let mut first = sample().to_frame().data;
        let second = {
            let mut kvv = KvVec::new();
            kvv.add_str("extra", "frame");
            kvv.to_frame().data
        };
        first.extend_from_slice(&second);

        let parsed = KvVec::parse_frame(&first).unwrap();
        assert_eq!(parsed.len(), 4);
        assert!(parsed.get(b"extra").is_none());
    }

    #[test]
    fn test_parse_truncated_input() {
        let buf = sample().to_frame();
        // chop mid-value: the incomplete trailing pair is dropped
        let parsed = KvVec::parse_frame(&buf.data[..buf.payload - 3]).unwrap();
        assert_eq!(parsed.len(), 3);
    }

    #[test]
    fn test_parse_no_separator() {
        assert!(KvVec::parse_frame(b"no separators here").is_none());
        assert!(KvVec::parse_frame(b"").is_none());
    }

    #[test]
    fn test_binary_value_serializes_fully() {
        let mut kvv = KvVec::new();
        kvv.add(b"blob".to_vec(), vec![1u8, 2, 255, 7]);
        let buf = kvv.to_frame();
        assert_eq!(&buf.data[..buf.payload], b"blob=\x01\x02\xff\x07\0");
        let parsed = KvVec::parse_frame(&buf.data).unwrap();
        assert_eq!(parsed.get(b"blob"), Some(&[1u8, 2, 255, 7][..]));
    }

    #[test]
    fn test_sort() {
        let mut kvv = KvVec::new();
        kvv.add_str("zeta", "1");
        kvv.add_str("alpha", "2");
        kvv.add_str("mid", "3");
        assert!(!kvv.is_sorted());

        kvv.sort();
        assert!(kvv.is_sorted());
        let keys: Vec<&[u8]> = kvv.iter().map(|kv| kv.key.as_slice()).collect();
        assert_eq!(keys, vec![&b"alpha"[..], &b"mid"[..], &b"zeta"[..]]);

        kvv.add_str("beta", "4");
        assert!(!kvv.is_sorted());
    }

    #[test]
    fn test_insertion_order_preserved() {
        let kvv = sample();
        let keys: Vec<&[u8]> = kvv.iter().map(|kv| kv.key.as_slice()).collect();
        assert_eq!(
            keys,
            vec![&b"job_id"[..], &b"type"[..], &b"command"[..], &b"timeout"[..]]
        );
    }

    #[test]
    fn test_get() {
        let kvv = sample();
        assert_eq!(kvv.get(b"type"), Some(&b"0"[..]));
        assert_eq!(kvv.get(b"missing"), None);
    }
}
