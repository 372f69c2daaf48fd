//! Content descriptors: the resolvable record for one identifier (content type,
//! metadata, locators and, for full publishes, the local copy of the bytes).

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::identifier::ContentIdentifier;

/// Transport through which a locator is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LocatorKind {
    Bluetooth,
    Http,
    Wifi,
}

/// An address plus transport kind at which a node holding the content may be reached.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Locator {
    pub kind: LocatorKind,
    pub address: String,
}

impl Locator {
    pub fn new(kind: LocatorKind, address: impl Into<String>) -> Self {
        Self {
            kind,
            address: address.into(),
        }
    }

    pub fn bluetooth(mac: impl Into<String>) -> Self {
        Self::new(LocatorKind::Bluetooth, mac)
    }

    /// Render per the kind's URI scheme (`nimacbt://<mac>` for Bluetooth).
    pub fn to_uri(&self) -> String {
        match self.kind {
            LocatorKind::Bluetooth => format!("nimacbt://{}", self.address),
            LocatorKind::Wifi => format!("niwifi://{}", self.address),
            LocatorKind::Http if self.address.contains("://") => self.address.clone(),
            LocatorKind::Http => format!("http://{}", self.address),
        }
    }
}

/// Ordered string-to-string mapping. Insertion order is kept and a key may only be inserted once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, String)>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new entry. A key that is already present is rejected, never overwritten.
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), MetadataError> {
        let key = key.into();
        if self.contains_key(&key) {
            return Err(MetadataError::DuplicateKey(key));
        }
        self.entries.push((key, value.into()));
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetadataError {
    #[error("metadata key already present: {0}")]
    DuplicateKey(String),
}

impl Serialize for Metadata {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Metadata {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        struct MetadataVisitor;

        impl<'de> Visitor<'de> for MetadataVisitor {
            type Value = Metadata;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of string keys to string values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Metadata, A::Error> {
                let mut metadata = Metadata::new();
                while let Some((k, v)) = access.next_entry::<String, String>()? {
                    metadata.insert(k, v).map_err(serde::de::Error::custom)?;
                }
                Ok(metadata)
            }
        }

        d.deserialize_map(MetadataVisitor)
    }
}

/// Full resolvable record for one identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentDescriptor {
    identifier: ContentIdentifier,
    pub content_type: String,
    pub metadata: Metadata,
    pub locators: BTreeSet<Locator>,
    local_file_path: Option<PathBuf>,
}

impl ContentDescriptor {
    pub fn new(identifier: ContentIdentifier, content_type: impl Into<String>) -> Self {
        Self {
            identifier,
            content_type: content_type.into(),
            metadata: Metadata::new(),
            locators: BTreeSet::new(),
            local_file_path: None,
        }
    }

    pub fn identifier(&self) -> &ContentIdentifier {
        &self.identifier
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_locators(mut self, locators: impl IntoIterator<Item = Locator>) -> Self {
        self.locators.extend(locators);
        self
    }

    /// Returns false if an equal (kind, address) locator was already present.
    pub fn add_locator(&mut self, locator: Locator) -> bool {
        self.locators.insert(locator)
    }

    /// Attach this node's copy of the bytes ("full" descriptor). The file must exist now;
    /// nothing guarantees it still exists when the descriptor is read later.
    pub fn with_local_file(mut self, path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        if !path.is_file() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("content file {} does not exist", path.display()),
            ));
        }
        self.local_file_path = Some(path);
        Ok(self)
    }

    /// Drop the local copy reference, leaving a "lite" descriptor (metadata and locators only).
    pub fn without_local_file(mut self) -> Self {
        self.local_file_path = None;
        self
    }

    pub fn local_file_path(&self) -> Option<&Path> {
        self.local_file_path.as_deref()
    }

    pub fn is_full(&self) -> bool {
        self.local_file_path.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_rejects_duplicate_key() {
        let mut m = Metadata::new();
        m.insert("url", "http://a").unwrap();
        assert_eq!(
            m.insert("url", "http://b"),
            Err(MetadataError::DuplicateKey("url".into()))
        );
        assert_eq!(m.get("url"), Some("http://a"));
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn metadata_json_keeps_insertion_order() {
        let mut m = Metadata::new();
        m.insert("zeta", "1").unwrap();
        m.insert("alpha", "2").unwrap();
        m.insert("mid", "3").unwrap();
        let json = serde_json::to_string(&m).unwrap();
        assert_eq!(json, r#"{"zeta":"1","alpha":"2","mid":"3"}"#);
        let back: Metadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn metadata_deserialize_rejects_duplicates() {
        let r: Result<Metadata, _> = serde_json::from_str(r#"{"a":"1","a":"2"}"#);
        assert!(r.is_err());
    }

    #[test]
    fn locator_uris() {
        assert_eq!(
            Locator::bluetooth("00:11:22:33:44:55").to_uri(),
            "nimacbt://00:11:22:33:44:55"
        );
        assert_eq!(
            Locator::new(LocatorKind::Wifi, "192.168.1.4:45679").to_uri(),
            "niwifi://192.168.1.4:45679"
        );
        assert_eq!(
            Locator::new(LocatorKind::Http, "example.com").to_uri(),
            "http://example.com"
        );
        assert_eq!(
            Locator::new(LocatorKind::Http, "https://example.com").to_uri(),
            "https://example.com"
        );
    }

    #[test]
    fn locators_have_set_semantics() {
        let mut d = ContentDescriptor::new(ContentIdentifier::new("sha-256", "aa"), "text/html");
        assert!(d.add_locator(Locator::bluetooth("m")));
        assert!(!d.add_locator(Locator::bluetooth("m")));
        assert!(d.add_locator(Locator::new(LocatorKind::Wifi, "m")));
        assert_eq!(d.locators.len(), 2);
    }

    #[test]
    fn local_file_must_exist_at_creation() {
        let d = ContentDescriptor::new(ContentIdentifier::new("sha-256", "aa"), "text/html");
        assert!(d
            .clone()
            .with_local_file("/definitely/not/here.html")
            .is_err());

        let file = tempfile::NamedTempFile::new().unwrap();
        let full = d.with_local_file(file.path()).unwrap();
        assert!(full.is_full());
        assert_eq!(full.local_file_path(), Some(file.path()));
        assert!(!full.without_local_file().is_full());
    }
}
