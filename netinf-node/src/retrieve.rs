//! Retrieval sources and the ordered fallback chain walked for a selected identifier.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use netinf_core::{
    integrity, ContentIdentifier, ContentStore, ProtocolOutcome, RetrieveOutcome, RetrievePayload,
};
use tracing::debug;

/// A source that can turn an identifier into a file on disk.
/// The fetch driver does not time out a retrieval; composites bound their own sources.
#[async_trait]
pub trait Retriever: Send + Sync {
    fn name(&self) -> &'static str;

    async fn retrieve(&self, identifier: &ContentIdentifier) -> RetrieveOutcome;
}

/// Content this node already holds.
pub struct LocalRetriever {
    store: Arc<ContentStore>,
}

impl LocalRetriever {
    pub fn new(store: Arc<ContentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Retriever for LocalRetriever {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn retrieve(&self, identifier: &ContentIdentifier) -> RetrieveOutcome {
        let Some(descriptor) = self.store.get(identifier) else {
            return ProtocolOutcome::NoContent;
        };
        let Some(file) = descriptor.local_file_path() else {
            return ProtocolOutcome::NoFilePath;
        };
        if !tokio::fs::try_exists(file).await.unwrap_or(false) {
            return ProtocolOutcome::FileMissingOnDisk;
        }
        if descriptor.content_type.is_empty() {
            return ProtocolOutcome::NoContentType;
        }
        ProtocolOutcome::Ok(RetrievePayload {
            file: file.to_path_buf(),
            content_type: descriptor.content_type.clone(),
        })
    }
}

/// Sources in configured order. Each attempt is bounded by `timeout` (expiry counts as
/// `Failed`); the first `Ok` wins, otherwise the last failure is returned.
pub struct RetrievalChain {
    sources: Vec<Arc<dyn Retriever>>,
    timeout: Duration,
    verify: bool,
}

impl RetrievalChain {
    pub fn new(sources: Vec<Arc<dyn Retriever>>, timeout: Duration, verify: bool) -> Self {
        Self {
            sources,
            timeout,
            verify,
        }
    }

    /// False when the file's digest does not match. Algorithms we cannot compute pass.
    async fn verified(&self, payload: &RetrievePayload, identifier: &ContentIdentifier) -> bool {
        let Ok(bytes) = tokio::fs::read(&payload.file).await else {
            return false;
        };
        integrity::verify_content(&bytes, identifier).unwrap_or(true)
    }
}

#[async_trait]
impl Retriever for RetrievalChain {
    fn name(&self) -> &'static str {
        "chain"
    }

    async fn retrieve(&self, identifier: &ContentIdentifier) -> RetrieveOutcome {
        let mut last = ProtocolOutcome::Failed;
        for source in &self.sources {
            let outcome = tokio::time::timeout(self.timeout, source.retrieve(identifier))
                .await
                .unwrap_or(ProtocolOutcome::Failed);
            match outcome {
                ProtocolOutcome::Ok(payload) => {
                    if self.verify && !self.verified(&payload, identifier).await {
                        debug!(source = source.name(), %identifier, "digest mismatch");
                        last = ProtocolOutcome::InvalidContent;
                        continue;
                    }
                    debug!(source = source.name(), %identifier, "retrieved");
                    return ProtocolOutcome::Ok(payload);
                }
                other => {
                    debug!(source = source.name(), %identifier, status = %other.status(), "retrieve failed");
                    last = other;
                }
            }
        }
        last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netinf_core::{ContentDescriptor, Status};
    use std::path::PathBuf;

    struct Fixed(RetrieveOutcome);

    #[async_trait]
    impl Retriever for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }
        async fn retrieve(&self, _: &ContentIdentifier) -> RetrieveOutcome {
            self.0.clone()
        }
    }

    struct Stalled;

    #[async_trait]
    impl Retriever for Stalled {
        fn name(&self) -> &'static str {
            "stalled"
        }
        async fn retrieve(&self, _: &ContentIdentifier) -> RetrieveOutcome {
            tokio::time::sleep(Duration::from_secs(30)).await;
            ProtocolOutcome::NoContent
        }
    }

    fn id() -> ContentIdentifier {
        ContentIdentifier::new("sha-256", "abc123")
    }

    fn payload(file: PathBuf) -> RetrieveOutcome {
        ProtocolOutcome::Ok(RetrievePayload {
            file,
            content_type: "text/html".into(),
        })
    }

    fn chain(sources: Vec<Arc<dyn Retriever>>, verify: bool) -> RetrievalChain {
        RetrievalChain::new(sources, Duration::from_millis(100), verify)
    }

    #[tokio::test]
    async fn falls_through_to_first_success() {
        let c = chain(
            vec![
                Arc::new(Fixed(ProtocolOutcome::NoContentType)),
                Arc::new(Stalled),
                Arc::new(Fixed(payload("/tmp/page.html".into()))),
            ],
            false,
        );
        assert!(c.retrieve(&id()).await.is_ok());
    }

    #[tokio::test]
    async fn all_failing_returns_last_status() {
        let c = chain(
            vec![
                Arc::new(Fixed(ProtocolOutcome::NoFilePath)),
                Arc::new(Fixed(ProtocolOutcome::NoContentType)),
            ],
            false,
        );
        assert_eq!(c.retrieve(&id()).await.status(), Status::NoContentType);
        assert_eq!(chain(vec![], false).retrieve(&id()).await.status(), Status::Failed);
        assert_eq!(
            chain(vec![Arc::new(Stalled)], false).retrieve(&id()).await.status(),
            Status::Failed
        );
    }

    #[tokio::test]
    async fn verification_rejects_mismatched_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("page");
        std::fs::write(&file, b"abc").unwrap();
        let good = ContentIdentifier::new(integrity::SHA_256, integrity::hash_content(b"abc"));

        let c = chain(vec![Arc::new(Fixed(payload(file.clone())))], true);
        assert!(c.retrieve(&good).await.is_ok());
        assert_eq!(c.retrieve(&id()).await.status(), Status::InvalidContent);

        let unchecked = chain(vec![Arc::new(Fixed(payload(file)))], false);
        assert!(unchecked.retrieve(&id()).await.is_ok());
    }

    #[tokio::test]
    async fn local_retriever_statuses() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("page.html");
        std::fs::write(&file, b"<html/>").unwrap();
        let store = Arc::new(ContentStore::in_memory());
        let local = LocalRetriever::new(store.clone());

        assert_eq!(local.retrieve(&id()).await.status(), Status::NoContent);

        store.put(ContentDescriptor::new(id(), "text/html")).unwrap();
        assert_eq!(local.retrieve(&id()).await.status(), Status::NoFilePath);

        store
            .put(ContentDescriptor::new(id(), "").with_local_file(&file).unwrap())
            .unwrap();
        assert_eq!(local.retrieve(&id()).await.status(), Status::NoContentType);

        store
            .put(ContentDescriptor::new(id(), "text/html").with_local_file(&file).unwrap())
            .unwrap();
        let ok = local.retrieve(&id()).await.ok().unwrap();
        assert_eq!(ok.file, file);

        std::fs::remove_file(&file).unwrap();
        assert_eq!(local.retrieve(&id()).await.status(), Status::FileMissingOnDisk);
    }
}
