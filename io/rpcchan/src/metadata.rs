//! RPC metadata (headers and trailers).

use bytes::Bytes;
use std::time::Duration;

/// Key suffix marking a binary-valued metadata entry.
pub const BINARY_SUFFIX: &str = "-bin";

/// Returns true if `key` names a binary-valued entry.
pub fn is_binary_key(key: &str) -> bool {
    key.ends_with(BINARY_SUFFIX)
}

/// A single metadata value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataValue {
    /// Printable text, used for keys without the `-bin` suffix.
    Ascii(String),
    /// Arbitrary bytes, used for keys with the `-bin` suffix.
    Binary(Bytes),
}

impl MetadataValue {
    /// Raw bytes of the value.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            MetadataValue::Ascii(s) => s.as_bytes(),
            MetadataValue::Binary(b) => b,
        }
    }

    /// Text of the value, if this is a text value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Ascii(s) => Some(s),
            MetadataValue::Binary(_) => None,
        }
    }
}

/// RPC metadata key-value pairs.
///
/// Metadata is used for headers (sent before the first message) and
/// trailers (sent with the final status). Keys are lowercase ASCII,
/// insertion order is preserved and a key may repeat.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, MetadataValue)>,
}

impl Metadata {
    /// Create empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a text value.
    ///
    /// Keys are normalized to lowercase. Multiple values for the same
    /// key are allowed. A `-bin` key stores the text's bytes as a binary
    /// value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into().to_ascii_lowercase();
        let value = value.into();

        let value = if is_binary_key(&key) {
            MetadataValue::Binary(Bytes::from(value))
        } else {
            MetadataValue::Ascii(value)
        };
        self.entries.push((key, value));
    }

    /// Insert a binary value.
    ///
    /// The `-bin` suffix is appended to the key if missing.
    pub fn insert_bin(&mut self, key: impl Into<String>, value: impl Into<Bytes>) {
        let mut key = key.into().to_ascii_lowercase();
        if !is_binary_key(&key) {
            key.push_str(BINARY_SUFFIX);
        }
        self.entries.push((key, MetadataValue::Binary(value.into())));
    }

    /// Insert an already-typed value as-is.
    pub fn insert_value(&mut self, key: impl Into<String>, value: MetadataValue) {
        self.entries.push((key.into().to_ascii_lowercase(), value));
    }

    /// Get the first text value for a key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.get_value(key).and_then(MetadataValue::as_str)
    }

    /// Get the first binary value for a key.
    pub fn get_bin(&self, key: &str) -> Option<&[u8]> {
        match self.get_value(key)? {
            MetadataValue::Binary(b) => Some(b),
            MetadataValue::Ascii(_) => None,
        }
    }

    /// Get the first value for a key, whatever its kind.
    pub fn get_value(&self, key: &str) -> Option<&MetadataValue> {
        let key = key.to_ascii_lowercase();
        self.entries.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    /// Get all text values for a key, in insertion order.
    pub fn get_all(&self, key: &str) -> Vec<&str> {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .filter(|(k, _)| *k == key)
            .filter_map(|(_, v)| v.as_str())
            .collect()
    }

    /// Check if a key exists.
    pub fn contains_key(&self, key: &str) -> bool {
        self.get_value(key).is_some()
    }

    /// Remove all values for a key, returning them.
    pub fn remove(&mut self, key: &str) -> Vec<MetadataValue> {
        let key = key.to_ascii_lowercase();
        let mut removed = Vec::new();
        self.entries.retain(|(k, v)| {
            if *k == key {
                removed.push(v.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Append every entry of `other`, keeping its order.
    pub fn extend(&mut self, other: Metadata) {
        self.entries.extend(other.entries);
    }

    /// Iterate over all entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetadataValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Check if metadata is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Get the number of entries (including duplicates).
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl FromIterator<(String, String)> for Metadata {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut metadata = Metadata::new();
        for (key, value) in iter {
            metadata.insert(key, value);
        }
        metadata
    }
}

impl FromIterator<(String, MetadataValue)> for Metadata {
    fn from_iter<T: IntoIterator<Item = (String, MetadataValue)>>(iter: T) -> Self {
        let mut metadata = Metadata::new();
        for (key, value) in iter {
            metadata.insert_value(key, value);
        }
        metadata
    }
}

/// Standard RPC timeout format, as carried in the `grpc-timeout` header.
///
/// Format: `<value><unit>` where unit is:
/// - `n`: nanoseconds
/// - `u`: microseconds
/// - `m`: milliseconds
/// - `S`: seconds
/// - `M`: minutes
/// - `H`: hours
#[derive(Debug, Clone, Copy)]
pub struct Timeout {
    /// Timeout in nanoseconds.
    nanos: u64,
}

impl Timeout {
    /// Create a timeout from seconds.
    pub fn from_secs(secs: u64) -> Self {
        Self {
            nanos: secs.saturating_mul(1_000_000_000),
        }
    }

    /// Create a timeout from milliseconds.
    pub fn from_millis(millis: u64) -> Self {
        Self {
            nanos: millis.saturating_mul(1_000_000),
        }
    }

    /// Create a timeout from a duration.
    pub fn from_duration(duration: Duration) -> Self {
        Self {
            nanos: u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX),
        }
    }

    /// Get the timeout as a duration.
    pub fn as_duration(&self) -> Duration {
        Duration::from_nanos(self.nanos)
    }

    /// Format as a timeout header value.
    ///
    /// The value part is limited to eight digits, so the unit is chosen
    /// to fit; precision is only dropped when nothing smaller fits.
    pub fn to_header_value(self) -> String {
        const UNITS: [(u64, char); 6] = [
            (1, 'n'),
            (1_000, 'u'),
            (1_000_000, 'm'),
            (1_000_000_000, 'S'),
            (60_000_000_000, 'M'),
            (3_600_000_000_000, 'H'),
        ];
        const MAX_VALUE: u64 = 99_999_999;

        // Prefer the largest exact unit.
        for (scale, unit) in UNITS.iter().rev() {
            if self.nanos >= *scale
                && self.nanos.is_multiple_of(*scale)
                && self.nanos / scale <= MAX_VALUE
            {
                return format!("{}{}", self.nanos / scale, unit);
            }
        }

        // Otherwise the smallest unit that fits, rounding up.
        for (scale, unit) in UNITS.iter() {
            let value = self.nanos.div_ceil(*scale);
            if value <= MAX_VALUE {
                return format!("{}{}", value, unit);
            }
        }

        format!("{}H", MAX_VALUE)
    }

    /// Parse from a timeout header value.
    pub fn parse(s: &str) -> Option<Self> {
        if s.is_empty() || !s.is_ascii() {
            return None;
        }

        let (value_str, unit) = s.split_at(s.len() - 1);
        let value: u64 = value_str.parse().ok()?;

        let scale: u64 = match unit {
            "n" => 1,
            "u" => 1_000,
            "m" => 1_000_000,
            "S" => 1_000_000_000,
            "M" => 60_000_000_000,
            "H" => 3_600_000_000_000,
            _ => return None,
        };

        Some(Self {
            nanos: value.saturating_mul(scale),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_new() {
        let md = Metadata::new();
        assert!(md.is_empty());
        assert_eq!(md.len(), 0);
    }

    #[test]
    fn test_metadata_insert_get() {
        let mut md = Metadata::new();
        md.insert("X-Request-Id", "abc");

        assert_eq!(md.get("x-request-id"), Some("abc"));
        assert_eq!(md.get("X-Request-Id"), Some("abc"));
    }

    #[test]
    fn test_metadata_multiple_values_keep_order() {
        let mut md = Metadata::new();
        md.insert("key", "value1");
        md.insert("other", "x");
        md.insert("key", "value2");

        assert_eq!(md.get("key"), Some("value1"));
        assert_eq!(md.get_all("key"), vec!["value1", "value2"]);

        let keys: Vec<_> = md.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["key", "other", "key"]);
    }

    #[test]
    fn test_metadata_binary() {
        let mut md = Metadata::new();
        md.insert_bin("trace", vec![0u8, 159, 146, 150]);

        assert!(md.contains_key("trace-bin"));
        assert_eq!(md.get_bin("trace-bin"), Some(&[0u8, 159, 146, 150][..]));
        // Binary values are not visible through the text accessor.
        assert!(md.get("trace-bin").is_none());
    }

    #[test]
    fn test_metadata_insert_text_under_binary_key() {
        let mut md = Metadata::new();
        md.insert("raw-bin", "hello");
        assert_eq!(md.get_bin("raw-bin"), Some(&b"hello"[..]));
    }

    #[test]
    fn test_metadata_remove() {
        let mut md = Metadata::new();
        md.insert("key", "value1");
        md.insert("keep", "v");
        md.insert("key", "value2");

        let removed = md.remove("key");
        assert_eq!(removed.len(), 2);
        assert_eq!(md.len(), 1);
        assert_eq!(md.get("keep"), Some("v"));
        assert!(md.remove("nonexistent").is_empty());
    }

    #[test]
    fn test_metadata_extend() {
        let mut a = Metadata::new();
        a.insert("a", "1");
        let mut b = Metadata::new();
        b.insert("b", "2");
        b.insert("a", "3");

        a.extend(b);
        assert_eq!(a.len(), 3);
        assert_eq!(a.get_all("a"), vec!["1", "3"]);
    }

    #[test]
    fn test_metadata_from_iterator() {
        let pairs = vec![
            ("key1".to_string(), "value1".to_string()),
            ("key2".to_string(), "value2".to_string()),
        ];

        let md: Metadata = pairs.into_iter().collect();
        assert_eq!(md.len(), 2);
        assert_eq!(md.get("key1"), Some("value1"));
        assert_eq!(md.get("key2"), Some("value2"));
    }

    #[test]
    fn test_timeout_from_secs() {
        let timeout = Timeout::from_secs(10);
        assert_eq!(timeout.as_duration().as_secs(), 10);
    }

    #[test]
    fn test_timeout_from_duration() {
        let duration = Duration::from_secs(5);
        assert_eq!(Timeout::from_duration(duration).as_duration(), duration);
    }

    #[test]
    fn test_timeout_format() {
        assert_eq!(Timeout::from_secs(10).to_header_value(), "10S");
        assert_eq!(Timeout::from_millis(500).to_header_value(), "500m");
        assert_eq!(Timeout::from_secs(3600).to_header_value(), "1H");
        assert_eq!(Timeout::from_secs(120).to_header_value(), "2M");
        assert_eq!(Timeout { nanos: 1000 }.to_header_value(), "1u");
        assert_eq!(Timeout { nanos: 500 }.to_header_value(), "500n");
    }

    #[test]
    fn test_timeout_format_limits_digits() {
        // 1.5 seconds plus one nanosecond does not fit in eight digits of
        // nanoseconds, so it is rounded up to microseconds.
        let t = Timeout { nanos: 1_500_000_001 };
        assert_eq!(t.to_header_value(), "1500001u");
    }

    #[test]
    fn test_timeout_parse_all_units() {
        assert_eq!(Timeout::parse("100n").unwrap().as_duration().as_nanos(), 100);
        assert_eq!(Timeout::parse("50u").unwrap().as_duration().as_micros(), 50);
        assert_eq!(Timeout::parse("200m").unwrap().as_duration().as_millis(), 200);
        assert_eq!(Timeout::parse("30S").unwrap().as_duration().as_secs(), 30);
        assert_eq!(Timeout::parse("5M").unwrap().as_duration().as_secs(), 300);
        assert_eq!(Timeout::parse("1H").unwrap().as_duration().as_secs(), 3600);
    }

    #[test]
    fn test_timeout_parse_invalid() {
        assert!(Timeout::parse("").is_none());
        assert!(Timeout::parse("10x").is_none());
        assert!(Timeout::parse("10s").is_none());
        assert!(Timeout::parse("abcS").is_none());
        assert!(Timeout::parse("1é").is_none());
    }
}
