//! Peer-backed resolution: requests go to the request servers of discovered peers.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use netinf_core::{
    integrity, ContentDescriptor, ContentIdentifier, PeerRequest, PeerResponse, ProtocolOutcome,
    ResolutionError, ResolutionService, RetrieveOutcome, RetrievePayload,
};
use tracing::{debug, warn};

use crate::discovery::PeerSet;
use crate::retrieve::Retriever;
use crate::transport::exchange;

pub struct PeerResolutionService {
    peers: PeerSet,
    timeout: Duration,
}

impl PeerResolutionService {
    pub fn new(peers: PeerSet, timeout: Duration) -> Self {
        Self { peers, timeout }
    }

    /// Request server addresses, most recently seen first.
    fn addresses(&self) -> Result<Vec<SocketAddr>, ResolutionError> {
        let mut records: Vec<_> = self.peers.read().values().cloned().collect();
        if records.is_empty() {
            return Err(ResolutionError::TransportUnavailable(
                "no peers discovered".into(),
            ));
        }
        records.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        Ok(records.into_iter().map(|r| r.addr).collect())
    }

    async fn ask(&self, addr: SocketAddr, request: PeerRequest) -> Option<PeerResponse> {
        match exchange(addr, request, self.timeout).await {
            Ok(resp) => Some(resp),
            Err(e) => {
                debug!(%addr, error = %e, "peer exchange failed");
                None
            }
        }
    }

    /// First peer answering with a descriptor; `content` is None when no peer sent bytes.
    pub async fn fetch(
        &self,
        identifier: &ContentIdentifier,
    ) -> Result<(ContentDescriptor, Option<Vec<u8>>), ResolutionError> {
        let mut descriptor_only = None;
        for addr in self.addresses()? {
            if let Some(PeerResponse::Found {
                descriptor,
                content,
            }) = self.ask(addr, PeerRequest::Get(identifier.clone())).await
            {
                if content.is_some() {
                    return Ok((descriptor, content));
                }
                descriptor_only.get_or_insert(descriptor);
            }
        }
        descriptor_only
            .map(|d| (d, None))
            .ok_or_else(|| ResolutionError::NotFound(identifier.clone()))
    }
}

#[async_trait]
impl ResolutionService for PeerResolutionService {
    fn name(&self) -> &'static str {
        "peer"
    }

    async fn get(
        &self,
        identifier: &ContentIdentifier,
    ) -> Result<ContentDescriptor, ResolutionError> {
        self.fetch(identifier).await.map(|(d, _)| d)
    }

    /// Offered to every known peer; succeeds if any peer stored it.
    async fn put(&self, descriptor: &ContentDescriptor) -> Result<(), ResolutionError> {
        let content = match descriptor.local_file_path() {
            Some(path) => Some(tokio::fs::read(path).await?),
            None => None,
        };
        let mut stored = false;
        for addr in self.addresses()? {
            let request = PeerRequest::Put {
                descriptor: descriptor.clone(),
                content: content.clone(),
            };
            match self.ask(addr, request).await {
                Some(PeerResponse::Stored) => stored = true,
                Some(PeerResponse::Error { message }) => {
                    warn!(%addr, message, "peer rejected put")
                }
                _ => {}
            }
        }
        if stored {
            Ok(())
        } else {
            Err(ResolutionError::TransportUnavailable(
                "no peer accepted the put".into(),
            ))
        }
    }

    async fn delete(&self, identifier: &ContentIdentifier) -> Result<(), ResolutionError> {
        let mut deleted = false;
        for addr in self.addresses()? {
            if let Some(PeerResponse::Deleted) =
                self.ask(addr, PeerRequest::Delete(identifier.clone())).await
            {
                deleted = true;
            }
        }
        if deleted {
            Ok(())
        } else {
            Err(ResolutionError::NotFound(identifier.clone()))
        }
    }

    async fn list_versions(
        &self,
        identifier: &ContentIdentifier,
    ) -> Result<Vec<ContentIdentifier>, ResolutionError> {
        for addr in self.addresses()? {
            if let Some(PeerResponse::Versions(versions)) = self
                .ask(addr, PeerRequest::ListVersions(identifier.clone()))
                .await
            {
                if !versions.is_empty() {
                    return Ok(versions);
                }
            }
        }
        Ok(Vec::new())
    }
}

/// Retrieval from peers. Received bytes are written under `cache_dir`.
pub struct PeerRetriever {
    service: Arc<PeerResolutionService>,
    cache_dir: PathBuf,
}

impl PeerRetriever {
    pub fn new(service: Arc<PeerResolutionService>, cache_dir: PathBuf) -> Self {
        Self { service, cache_dir }
    }

    async fn materialize(
        &self,
        identifier: &ContentIdentifier,
        bytes: &[u8],
    ) -> io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.cache_dir).await?;
        let file = self
            .cache_dir
            .join(integrity::hash_content(identifier.to_string().as_bytes()));
        tokio::fs::write(&file, bytes).await?;
        Ok(file)
    }
}

#[async_trait]
impl Retriever for PeerRetriever {
    fn name(&self) -> &'static str {
        "peer"
    }

    async fn retrieve(&self, identifier: &ContentIdentifier) -> RetrieveOutcome {
        let (descriptor, content) = match self.service.fetch(identifier).await {
            Ok(found) => found,
            Err(e) => {
                debug!(%identifier, error = %e, "peer retrieve failed");
                return ProtocolOutcome::Failed;
            }
        };
        let Some(bytes) = content else {
            return ProtocolOutcome::NoContent;
        };
        if descriptor.content_type.is_empty() {
            return ProtocolOutcome::NoContentType;
        }
        match self.materialize(identifier, &bytes).await {
            Ok(file) => ProtocolOutcome::Ok(RetrievePayload {
                file,
                content_type: descriptor.content_type,
            }),
            Err(e) => {
                warn!(%identifier, error = %e, "cannot cache peer content");
                ProtocolOutcome::Failed
            }
        }
    }
}
