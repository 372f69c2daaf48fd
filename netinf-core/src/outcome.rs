//! Typed results of search, retrieve and publish exchanges with a name-resolution service,
//! and the mapping from raw HTTP responses onto them.

use std::fmt;
use std::path::PathBuf;

use serde_json::Value;

use crate::descriptor::Metadata;
use crate::identifier::{ContentIdentifier, IdentifierParseError};

/// Status tag of a protocol exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    Failed,
    NoContent,
    InvalidContent,
    NoFilePath,
    FileMissingOnDisk,
    NoContentType,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Ok => "ok",
            Status::Failed => "failed",
            Status::NoContent => "no content",
            Status::InvalidContent => "invalid content",
            Status::NoFilePath => "no file path",
            Status::FileMissingOnDisk => "file missing on disk",
            Status::NoContentType => "no content type",
        };
        f.write_str(s)
    }
}

/// Result of one exchange. Only `Ok` carries a payload; every other tag is terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolOutcome<T> {
    Ok(T),
    Failed,
    NoContent,
    InvalidContent,
    NoFilePath,
    FileMissingOnDisk,
    NoContentType,
}

impl<T> ProtocolOutcome<T> {
    pub fn status(&self) -> Status {
        match self {
            ProtocolOutcome::Ok(_) => Status::Ok,
            ProtocolOutcome::Failed => Status::Failed,
            ProtocolOutcome::NoContent => Status::NoContent,
            ProtocolOutcome::InvalidContent => Status::InvalidContent,
            ProtocolOutcome::NoFilePath => Status::NoFilePath,
            ProtocolOutcome::FileMissingOnDisk => Status::FileMissingOnDisk,
            ProtocolOutcome::NoContentType => Status::NoContentType,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ProtocolOutcome::Ok(_))
    }

    pub fn ok(self) -> Option<T> {
        match self {
            ProtocolOutcome::Ok(v) => Some(v),
            _ => None,
        }
    }

    /// Map the payload, keeping failure tags as they are.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ProtocolOutcome<U> {
        match self {
            ProtocolOutcome::Ok(v) => ProtocolOutcome::Ok(f(v)),
            ProtocolOutcome::Failed => ProtocolOutcome::Failed,
            ProtocolOutcome::NoContent => ProtocolOutcome::NoContent,
            ProtocolOutcome::InvalidContent => ProtocolOutcome::InvalidContent,
            ProtocolOutcome::NoFilePath => ProtocolOutcome::NoFilePath,
            ProtocolOutcome::FileMissingOnDisk => ProtocolOutcome::FileMissingOnDisk,
            ProtocolOutcome::NoContentType => ProtocolOutcome::NoContentType,
        }
    }
}

/// One candidate answer of a search, in the order the service ranked it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResult {
    /// Raw `ni` URI as returned by the service.
    pub uri: String,
    pub metadata: Metadata,
}

impl SearchResult {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn identifier(&self) -> Result<ContentIdentifier, IdentifierParseError> {
        self.uri.parse()
    }
}

/// Payload of a successful retrieve: where the bytes are and what they are.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievePayload {
    pub file: PathBuf,
    pub content_type: String,
}

pub type SearchOutcome = ProtocolOutcome<Vec<SearchResult>>;
pub type RetrieveOutcome = ProtocolOutcome<RetrievePayload>;
pub type PublishOutcome = ProtocolOutcome<()>;

/// JSON keys of a retrieve response body. Deployments name them differently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrieveKeys {
    pub file_path: String,
    pub content_type: String,
}

impl Default for RetrieveKeys {
    fn default() -> Self {
        Self {
            file_path: "filePath".to_string(),
            content_type: "contentType".to_string(),
        }
    }
}

const HTTP_OK: u16 = 200;

/// Parse a body into JSON, mapping the two body-level failures.
fn parse_body<T>(status: u16, body: &[u8]) -> Result<Value, ProtocolOutcome<T>> {
    if status != HTTP_OK {
        return Err(ProtocolOutcome::Failed);
    }
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(ProtocolOutcome::NoContent);
    }
    serde_json::from_slice(body).map_err(|_| ProtocolOutcome::InvalidContent)
}

/// Map a retrieve response. File path is checked before content type; the file must exist now.
pub fn parse_retrieve_response(status: u16, body: &[u8], keys: &RetrieveKeys) -> RetrieveOutcome {
    let json = match parse_body(status, body) {
        Ok(v) => v,
        Err(outcome) => return outcome,
    };
    let Value::Object(obj) = json else {
        return ProtocolOutcome::InvalidContent;
    };
    let Some(path) = obj.get(&keys.file_path).and_then(Value::as_str) else {
        return ProtocolOutcome::NoFilePath;
    };
    let file = PathBuf::from(path);
    if !file.exists() {
        return ProtocolOutcome::FileMissingOnDisk;
    }
    let Some(content_type) = obj.get(&keys.content_type).and_then(Value::as_str) else {
        return ProtocolOutcome::NoContentType;
    };
    ProtocolOutcome::Ok(RetrievePayload {
        file,
        content_type: content_type.to_string(),
    })
}

/// Map a search response: either a bare JSON array or an object with a `results` array.
/// Each entry must carry an `ni` string; an optional `meta` object becomes metadata.
pub fn parse_search_response(status: u16, body: &[u8]) -> SearchOutcome {
    let json = match parse_body(status, body) {
        Ok(v) => v,
        Err(outcome) => return outcome,
    };
    let entries = match json {
        Value::Array(a) => a,
        Value::Object(mut obj) => match obj.remove("results") {
            Some(Value::Array(a)) => a,
            _ => return ProtocolOutcome::InvalidContent,
        },
        _ => return ProtocolOutcome::InvalidContent,
    };
    let mut results = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(uri) = entry.get("ni").and_then(Value::as_str) else {
            return ProtocolOutcome::InvalidContent;
        };
        let mut result = SearchResult::new(uri);
        if let Some(Value::Object(meta)) = entry.get("meta") {
            for (k, v) in meta {
                let v = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                // serde_json objects cannot repeat keys
                let _ = result.metadata.insert(k.clone(), v);
            }
        }
        results.push(result);
    }
    ProtocolOutcome::Ok(results)
}

/// Map a publish response. The body is informational only.
pub fn parse_publish_response(status: u16) -> PublishOutcome {
    if status == HTTP_OK {
        ProtocolOutcome::Ok(())
    } else {
        ProtocolOutcome::Failed
    }
}
