//! Local content store: at most one descriptor per identifier, optionally persisted as one
//! JSON document per descriptor under `<root>/descriptors`. Received content bytes live
//! under `<root>/content`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use crate::descriptor::ContentDescriptor;
use crate::identifier::ContentIdentifier;
use crate::integrity;

const DESCRIPTOR_DIR: &str = "descriptors";
const CONTENT_DIR: &str = "content";

/// Hash-keyed store. All operations take `&self`; a single lock serializes writers so a
/// reader always sees the latest completed put or remove.
pub struct ContentStore {
    entries: RwLock<HashMap<ContentIdentifier, ContentDescriptor>>,
    root: Option<PathBuf>,
}

impl ContentStore {
    /// Store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            root: None,
        }
    }

    /// Open (or create) a persistent store under `root` and load every descriptor in it.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let descriptors = root.join(DESCRIPTOR_DIR);
        fs::create_dir_all(&descriptors)?;
        fs::create_dir_all(root.join(CONTENT_DIR))?;

        let mut entries = HashMap::new();
        for entry in fs::read_dir(&descriptors)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path)?;
            let descriptor: ContentDescriptor = serde_json::from_slice(&bytes)
                .map_err(|source| StoreError::Corrupt { path, source })?;
            entries.insert(descriptor.identifier().clone(), descriptor);
        }
        Ok(Self {
            entries: RwLock::new(entries),
            root: Some(root),
        })
    }

    /// Insert or replace the descriptor for its identifier. Returns the replaced descriptor.
    pub fn put(
        &self,
        descriptor: ContentDescriptor,
    ) -> Result<Option<ContentDescriptor>, StoreError> {
        let mut entries = self.entries.write();
        if let Some(path) = self.descriptor_path(descriptor.identifier()) {
            let json = serde_json::to_vec_pretty(&descriptor).map_err(StoreError::Encode)?;
            write_atomically(&path, &json)?;
        }
        Ok(entries.insert(descriptor.identifier().clone(), descriptor))
    }

    pub fn get(&self, identifier: &ContentIdentifier) -> Option<ContentDescriptor> {
        self.entries.read().get(identifier).cloned()
    }

    /// Remove the descriptor for `identifier`. Content files are left in place.
    pub fn remove(
        &self,
        identifier: &ContentIdentifier,
    ) -> Result<Option<ContentDescriptor>, StoreError> {
        let mut entries = self.entries.write();
        if !entries.contains_key(identifier) {
            return Ok(None);
        }
        if let Some(path) = self.descriptor_path(identifier) {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(entries.remove(identifier))
    }

    pub fn contains(&self, identifier: &ContentIdentifier) -> bool {
        self.entries.read().contains_key(identifier)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn identifiers(&self) -> Vec<ContentIdentifier> {
        self.entries.read().keys().cloned().collect()
    }

    /// Where bytes for `identifier` are kept. None for in-memory stores.
    pub fn content_path(&self, identifier: &ContentIdentifier) -> Option<PathBuf> {
        self.root
            .as_ref()
            .map(|root| root.join(CONTENT_DIR).join(file_stem(identifier)))
    }

    fn descriptor_path(&self, identifier: &ContentIdentifier) -> Option<PathBuf> {
        self.root.as_ref().map(|root| {
            root.join(DESCRIPTOR_DIR)
                .join(format!("{}.json", file_stem(identifier)))
        })
    }
}

/// File names are derived from the identifier's display form so remote-supplied names
/// can never escape the store directory.
fn file_stem(identifier: &ContentIdentifier) -> String {
    integrity::hash_content(identifier.to_string().as_bytes())
}

fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt descriptor {}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("descriptor encode error: {0}")]
    Encode(serde_json::Error),
}
