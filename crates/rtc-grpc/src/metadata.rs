// ABOUTME: Call metadata as an ordered string multimap.
// ABOUTME: Converts between the wire representation and tonic's MetadataMap.

use std::collections::BTreeMap;

use tonic::metadata::{
    AsciiMetadataKey, AsciiMetadataValue, BinaryMetadataKey, BinaryMetadataValue, MetadataMap,
};

/// Header or trailer metadata. Keys are lower-cased; each key keeps its
/// values in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: BTreeMap<String, Vec<String>>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value for `key`, keeping any existing values.
    pub fn append(&mut self, key: impl AsRef<str>, value: impl Into<String>) {
        self.entries
            .entry(key.as_ref().to_ascii_lowercase())
            .or_default()
            .push(value.into());
    }

    /// Replace all values for `key`.
    pub fn insert(&mut self, key: impl AsRef<str>, values: Vec<String>) {
        self.entries.insert(key.as_ref().to_ascii_lowercase(), values);
    }

    /// First value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.get_all(key).first().map(String::as_str)
    }

    /// All values for `key`, empty if absent.
    pub fn get_all(&self, key: &str) -> &[String] {
        self.entries
            .get(&key.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn from_proto(md: &rtc_proto::Metadata) -> Self {
        let mut out = Self::new();
        for (key, strings) in &md.md {
            for value in &strings.values {
                out.append(key, value.clone());
            }
        }
        out
    }

    pub fn to_proto(&self) -> rtc_proto::Metadata {
        rtc_proto::Metadata {
            md: self
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), rtc_proto::Strings { values: v.clone() }))
                .collect(),
        }
    }

    /// Convert into tonic metadata. Keys ending in `-bin` become binary
    /// entries; entries tonic cannot represent are skipped.
    pub fn to_metadata_map(&self) -> MetadataMap {
        let mut map = MetadataMap::new();
        for (key, values) in &self.entries {
            if key.ends_with("-bin") {
                let Ok(bin_key) = BinaryMetadataKey::from_bytes(key.as_bytes()) else {
                    tracing::warn!(key = %key, "skipping invalid binary metadata key");
                    continue;
                };
                for value in values {
                    map.append_bin(bin_key.clone(), BinaryMetadataValue::from_bytes(value.as_bytes()));
                }
                continue;
            }

            let Ok(ascii_key) = AsciiMetadataKey::from_bytes(key.as_bytes()) else {
                tracing::warn!(key = %key, "skipping invalid metadata key");
                continue;
            };
            for value in values {
                match AsciiMetadataValue::try_from(value.as_str()) {
                    Ok(v) => {
                        map.append(ascii_key.clone(), v);
                    }
                    Err(_) => tracing::warn!(key = %key, "skipping invalid metadata value"),
                }
            }
        }
        map
    }
}

impl From<&rtc_proto::Metadata> for Metadata {
    fn from(md: &rtc_proto::Metadata) -> Self {
        Self::from_proto(md)
    }
}

impl From<&Metadata> for rtc_proto::Metadata {
    fn from(md: &Metadata) -> Self {
        md.to_proto()
    }
}

impl<K, V> FromIterator<(K, V)> for Metadata
where
    K: AsRef<str>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut out = Self::new();
        for (k, v) in iter {
            out.append(k, v);
        }
        out
    }
}
