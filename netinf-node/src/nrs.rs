//! HTTP client for the name resolution service (NRS): search, retrieve and publish.
//! Every exchange is a multipart POST; transport errors and timeouts map to `Failed`.

use std::time::Duration;

use async_trait::async_trait;
use netinf_core::outcome::{parse_publish_response, parse_retrieve_response, parse_search_response};
use netinf_core::{
    ContentDescriptor, ContentIdentifier, Metadata, MetadataError, ProtocolOutcome,
    PublishOutcome, ResolutionError, ResolutionService, RetrieveKeys, RetrieveOutcome,
    SearchOutcome,
};
use rand::Rng;
use reqwest::multipart::{Form, Part};
use serde::Serialize;
use tracing::{debug, warn};
use url::Url;

use crate::config::NrsSettings;
use crate::fetch::Searcher;
use crate::retrieve::Retriever;

/// Upper bound (exclusive) for message ids.
const MSGID_RANGE: u32 = 100_000_000;

pub struct NrsClient {
    http: reqwest::Client,
    base: Url,
    settings: NrsSettings,
    keys: RetrieveKeys,
}

#[derive(Debug, thiserror::Error)]
pub enum NrsError {
    #[error("invalid NRS address: {0}")]
    Url(#[from] url::ParseError),
    #[error("http client: {0}")]
    Client(#[from] reqwest::Error),
}

impl NrsClient {
    pub fn new(
        settings: &NrsSettings,
        keys: RetrieveKeys,
        timeout: Duration,
    ) -> Result<Self, NrsError> {
        let base = Url::parse(&format!("http://{}:{}/", settings.host, settings.port))?;
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base,
            settings: settings.clone(),
            keys,
        })
    }

    /// Candidate identifiers for `tokens` (usually the source URL), in server order.
    pub async fn search(&self, tokens: &str) -> SearchOutcome {
        let msgid = new_msgid();
        debug!(tokens, msgid, "nrs search");
        let form = Form::new()
            .text("tokens", tokens.to_string())
            .text("msgid", msgid.to_string())
            .text("ext", r#"{"meta":{}}"#);
        match self.post(&self.settings.search_path, form).await {
            Some((status, body)) => parse_search_response(status, &body),
            None => ProtocolOutcome::Failed,
        }
    }

    pub async fn retrieve(&self, identifier: &ContentIdentifier) -> RetrieveOutcome {
        let msgid = new_msgid();
        debug!(%identifier, msgid, "nrs retrieve");
        let form = Form::new()
            .text("URI", identifier.to_string())
            .text("msgid", msgid.to_string());
        match self.post(&self.settings.retrieve_path, form).await {
            Some((status, body)) => parse_retrieve_response(status, &body, &self.keys),
            None => ProtocolOutcome::Failed,
        }
    }

    /// Register `descriptor`. A full descriptor also uploads its file as the `octets` part.
    pub async fn publish(
        &self,
        descriptor: &ContentDescriptor,
    ) -> Result<PublishOutcome, ResolutionError> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let fields = publish_fields(descriptor, new_msgid(), now_ms)?;
        let mut form = Form::new();
        for (name, value) in fields {
            form = form.text(name, value);
        }
        if let Some(path) = descriptor.local_file_path() {
            let bytes = tokio::fs::read(path).await?;
            let part = Part::bytes(bytes.clone())
                .mime_str(&descriptor.content_type)
                .unwrap_or_else(|_| Part::bytes(bytes));
            form = form.part("octets", part);
        }
        debug!(identifier = %descriptor.identifier(), full = descriptor.is_full(), "nrs publish");
        Ok(match self.post(&self.settings.publish_path, form).await {
            Some((status, _)) => parse_publish_response(status),
            None => ProtocolOutcome::Failed,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, url::ParseError> {
        self.base.join(path.trim_start_matches('/'))
    }

    /// None on transport failure or timeout.
    async fn post(&self, path: &str, form: Form) -> Option<(u16, Vec<u8>)> {
        let url = match self.endpoint(path) {
            Ok(u) => u,
            Err(e) => {
                warn!(path, error = %e, "bad NRS path");
                return None;
            }
        };
        let resp = match self.http.post(url.clone()).multipart(form).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(%url, error = %e, "NRS request failed");
                return None;
            }
        };
        let status = resp.status().as_u16();
        match resp.bytes().await {
            Ok(body) => Some((status, body.to_vec())),
            Err(e) => {
                warn!(%url, error = %e, "NRS response body unreadable");
                None
            }
        }
    }
}

fn new_msgid() -> u32 {
    rand::thread_rng().gen_range(0..MSGID_RANGE)
}

#[derive(Serialize)]
struct Ext<'a> {
    meta: &'a Metadata,
}

/// Text fields of a publish request, in wire order: URI, msgid, loc1..N, rform, ext.
/// `ext.meta` starts with `ct` and `time` (the descriptor's own `time` when it has one).
pub fn publish_fields(
    descriptor: &ContentDescriptor,
    msgid: u32,
    now_ms: i64,
) -> Result<Vec<(String, String)>, MetadataError> {
    let id = descriptor.identifier();
    let mut fields = vec![
        (
            "URI".to_string(),
            id.to_uri_with_content_type(&descriptor.content_type),
        ),
        ("msgid".to_string(), msgid.to_string()),
    ];
    for (i, locator) in descriptor.locators.iter().enumerate() {
        fields.push((format!("loc{}", i + 1), locator.to_uri()));
    }
    fields.push(("rform".to_string(), "json".to_string()));

    let mut meta = Metadata::new();
    meta.insert("ct", descriptor.content_type.clone())?;
    let time = descriptor
        .metadata
        .get("time")
        .map(str::to_string)
        .unwrap_or_else(|| now_ms.to_string());
    meta.insert("time", time)?;
    for (k, v) in descriptor.metadata.iter() {
        if !meta.contains_key(k) {
            meta.insert(k, v)?;
        }
    }
    // Metadata serializes as a plain string map
    let ext = serde_json::to_string(&Ext { meta: &meta }).unwrap_or_else(|_| "{}".to_string());
    fields.push(("ext".to_string(), ext));
    Ok(fields)
}

#[async_trait]
impl ResolutionService for NrsClient {
    fn name(&self) -> &'static str {
        "nrs"
    }

    async fn get(
        &self,
        _identifier: &ContentIdentifier,
    ) -> Result<ContentDescriptor, ResolutionError> {
        Err(ResolutionError::Unsupported {
            service: "nrs",
            operation: "get",
        })
    }

    async fn put(&self, descriptor: &ContentDescriptor) -> Result<(), ResolutionError> {
        match self.publish(descriptor).await? {
            ProtocolOutcome::Ok(()) => Ok(()),
            other => Err(ResolutionError::Protocol(other.status())),
        }
    }

    async fn delete(&self, _identifier: &ContentIdentifier) -> Result<(), ResolutionError> {
        Err(ResolutionError::Unsupported {
            service: "nrs",
            operation: "delete",
        })
    }

    async fn list_versions(
        &self,
        _identifier: &ContentIdentifier,
    ) -> Result<Vec<ContentIdentifier>, ResolutionError> {
        Err(ResolutionError::Unsupported {
            service: "nrs",
            operation: "list_versions",
        })
    }
}

#[async_trait]
impl Searcher for NrsClient {
    async fn search(&self, source: &str) -> SearchOutcome {
        NrsClient::search(self, source).await
    }
}

#[async_trait]
impl Retriever for NrsClient {
    fn name(&self) -> &'static str {
        "nrs"
    }

    async fn retrieve(&self, identifier: &ContentIdentifier) -> RetrieveOutcome {
        NrsClient::retrieve(self, identifier).await
    }
}
