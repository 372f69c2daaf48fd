//! Fetch driver: runs the core fetch machine against real collaborators, one async
//! step at a time. Search, download and publish are each bounded by the timeout.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use netinf_core::{
    integrity, DownloadedContent, FetchError, FetchMachine, FetchPolicy, FetchReport, FetchStep,
    Locator, ProtocolOutcome, PublishPlan, PublishPlanError, ResolutionError, ResolutionService,
    SearchOutcome,
};
use tracing::{debug, info, warn};

use crate::collab::{Downloader, Notifier, PresentationSink};
use crate::radio::Radio;
use crate::retrieve::Retriever;

#[async_trait]
pub trait Searcher: Send + Sync {
    async fn search(&self, source: &str) -> SearchOutcome;
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("no radio capability")]
    NoRadio,
    #[error("radio disabled")]
    RadioDisabled,
    #[error("radio has no local address")]
    NoLocalAddress,
    #[error("content file: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Plan(#[from] PublishPlanError),
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error("publish timed out")]
    Timeout,
}

/// Everything a fetch needs, passed in explicitly.
pub struct FetcherParts {
    pub searcher: Arc<dyn Searcher>,
    /// Not bounded by `timeout` as a whole; see `RetrievalChain`.
    pub retriever: Arc<dyn Retriever>,
    pub downloader: Arc<dyn Downloader>,
    pub sink: Arc<dyn PresentationSink>,
    pub notifier: Arc<dyn Notifier>,
    pub publisher: Arc<dyn ResolutionService>,
    pub radio: Option<Arc<dyn Radio>>,
    pub policy: FetchPolicy,
    /// Downloaded bytes are kept here as `<hash>`. Should be absolute.
    pub download_dir: PathBuf,
    pub timeout: Duration,
}

pub struct Fetcher {
    parts: FetcherParts,
}

impl Fetcher {
    pub fn new(parts: FetcherParts) -> Self {
        Self { parts }
    }

    /// Run one fetch to completion. Only an internal sequencing bug returns Err.
    pub async fn fetch(&self, source: &str) -> Result<FetchReport, FetchError> {
        let (mut machine, mut step) = FetchMachine::start(source, self.parts.policy.clone());
        loop {
            step = match step {
                FetchStep::Search { source } => {
                    let outcome = self
                        .bounded(self.parts.searcher.search(&source))
                        .await
                        .unwrap_or(ProtocolOutcome::Failed);
                    debug!(%source, status = %outcome.status(), "search");
                    machine.on_searched(outcome)?
                }
                FetchStep::Retrieve { identifier } => {
                    // the retriever bounds each of its sources itself
                    let outcome = self.parts.retriever.retrieve(&identifier).await;
                    debug!(%identifier, status = %outcome.status(), "retrieve");
                    machine.on_retrieved(outcome)?
                }
                FetchStep::Download { source } => {
                    let content = self.download(&source).await;
                    machine.on_downloaded(content)?
                }
                FetchStep::Display { file, base_address } => {
                    let bytes = match tokio::fs::read(&file).await {
                        Ok(b) => Some(b),
                        Err(e) => {
                            warn!(file = %file.display(), error = %e, "obtained content unreadable");
                            None
                        }
                    };
                    self.parts.sink.display(bytes.as_deref(), &base_address).await;
                    machine.on_displayed()?
                }
                FetchStep::Publish(plan) => {
                    let result = self.publish(&plan).await.map_err(|e| {
                        warn!(identifier = %plan.identifier, error = %e, "publish failed");
                        e.to_string()
                    });
                    if result.is_ok() {
                        info!(identifier = %plan.identifier, full = plan.full_put, "published");
                    }
                    machine.on_published(result)?
                }
                FetchStep::Notify { message } => {
                    self.parts.notifier.notify(&message);
                    machine.on_notified()?
                }
                FetchStep::Finish(report) => return Ok(report),
            };
        }
    }

    async fn bounded<T>(&self, fut: impl Future<Output = T>) -> Option<T> {
        tokio::time::timeout(self.parts.timeout, fut).await.ok()
    }

    async fn download(&self, source: &str) -> Option<DownloadedContent> {
        let object = self.bounded(self.parts.downloader.fetch(source)).await.flatten()?;
        let hash = integrity::hash_content(&object.bytes);
        let file = self.parts.download_dir.join(&hash);
        let written = async {
            tokio::fs::create_dir_all(&self.parts.download_dir).await?;
            tokio::fs::write(&file, &object.bytes).await
        };
        if let Err(e) = written.await {
            warn!(file = %file.display(), error = %e, "cannot keep downloaded content");
            return None;
        }
        Some(DownloadedContent {
            file,
            content_type: object.content_type,
            hash,
        })
    }

    /// Locators are this node's own radio address; no usable radio aborts the publish.
    async fn publish(&self, plan: &PublishPlan) -> Result<(), PublishError> {
        let radio = self.parts.radio.as_ref().ok_or(PublishError::NoRadio)?;
        if !radio.is_enabled() {
            return Err(PublishError::RadioDisabled);
        }
        let address = radio.local_address().ok_or(PublishError::NoLocalAddress)?;
        let locator = Locator::new(radio.locator_kind(), address);
        let size = tokio::fs::metadata(&plan.file).await?.len();
        let now_ms = chrono::Utc::now().timestamp_millis();
        let descriptor = plan.descriptor(size, now_ms, [locator])?;
        self.bounded(self.parts.publisher.put(&descriptor))
            .await
            .ok_or(PublishError::Timeout)??;
        Ok(())
    }
}
