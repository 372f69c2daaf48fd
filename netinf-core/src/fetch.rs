//! Fetch state machine: search → retrieve → (download) → display → publish.
//! Host-driven: the host performs each step it is handed and feeds the outcome back;
//! the machine decides what happens next. Exactly one of a Display step or a Notify
//! step is produced per fetch.

use std::path::PathBuf;

use crate::descriptor::{ContentDescriptor, Locator, Metadata, MetadataError};
use crate::identifier::ContentIdentifier;
use crate::integrity;
use crate::outcome::{RetrieveOutcome, SearchOutcome, Status};

/// Message handed to the notification sink when every route to the content failed.
pub const DOWNLOAD_FAILED_MESSAGE: &str = "Could not download page. Check internet connection.";

/// Read-only policy inputs for one fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPolicy {
    /// Algorithm label for identifiers computed from downloaded bytes.
    pub hash_algorithm: String,
    pub publish_on_success: bool,
    /// Embed the content in the publish ("full put") instead of metadata and locators only.
    pub full_put: bool,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            hash_algorithm: integrity::SHA_256.to_string(),
            publish_on_success: false,
            full_put: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    Searching,
    Retrieving,
    Downloading,
    Displaying,
    Publishing,
    Notifying,
    Done,
}

/// Which route produced the displayed content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Retrieved,
    Downloaded,
}

/// Bytes obtained by the raw download, already written to `file` by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedContent {
    pub file: PathBuf,
    pub content_type: String,
    /// Hash of the downloaded bytes under the policy's algorithm.
    pub hash: String,
}

/// What the host must do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchStep {
    Search { source: String },
    Retrieve { identifier: ContentIdentifier },
    Download { source: String },
    Display { file: PathBuf, base_address: String },
    Publish(PublishPlan),
    Notify { message: String },
    Finish(FetchReport),
}

/// Everything needed to publish obtained content, minus the inputs only the host has
/// (file size, clock, radio address).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishPlan {
    pub identifier: ContentIdentifier,
    pub content_type: String,
    /// Absolute path of the obtained content.
    pub file: PathBuf,
    pub source: String,
    pub full_put: bool,
}

impl PublishPlan {
    /// Descriptor to hand to the resolution service. Metadata is
    /// {filesize, filepath, time, url}; the file is attached only for a full put.
    pub fn descriptor(
        &self,
        file_size: u64,
        captured_at_ms: i64,
        locators: impl IntoIterator<Item = Locator>,
    ) -> Result<ContentDescriptor, PublishPlanError> {
        let mut metadata = Metadata::new();
        metadata.insert("filesize", file_size.to_string())?;
        metadata.insert("filepath", self.file.display().to_string())?;
        metadata.insert("time", captured_at_ms.to_string())?;
        metadata.insert("url", self.source.clone())?;

        let descriptor = ContentDescriptor::new(self.identifier.clone(), self.content_type.clone())
            .with_metadata(metadata)
            .with_locators(locators);
        if self.full_put {
            Ok(descriptor.with_local_file(&self.file)?)
        } else {
            Ok(descriptor)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PublishPlanError {
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error("content file unavailable: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishStatus {
    Skipped,
    Published,
    Failed(String),
}

/// Summary of one finished fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchReport {
    pub source: String,
    /// None when the fetch failed terminally.
    pub origin: Option<Origin>,
    pub identifier: Option<ContentIdentifier>,
    pub search: Status,
    /// None when retrieval was never attempted.
    pub retrieve: Option<Status>,
    pub publish: PublishStatus,
}

impl FetchReport {
    pub fn succeeded(&self) -> bool {
        self.origin.is_some()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("{event} received while {state:?}")]
    UnexpectedEvent {
        state: FetchState,
        event: &'static str,
    },
}

/// One fetch request. Each instance is independent of every other.
pub struct FetchMachine {
    policy: FetchPolicy,
    state: FetchState,
    report: FetchReport,
    obtained: Option<(PathBuf, String)>,
}

impl FetchMachine {
    /// Create the machine and the first step (always a search for `source`).
    pub fn start(source: impl Into<String>, policy: FetchPolicy) -> (Self, FetchStep) {
        let source = source.into();
        let machine = Self {
            policy,
            state: FetchState::Searching,
            report: FetchReport {
                source: source.clone(),
                origin: None,
                identifier: None,
                search: Status::Failed,
                retrieve: None,
                publish: PublishStatus::Skipped,
            },
            obtained: None,
        };
        (machine, FetchStep::Search { source })
    }

    pub fn state(&self) -> FetchState {
        self.state
    }

    pub fn source(&self) -> &str {
        &self.report.source
    }

    /// First result wins. Non-ok outcomes, empty results and unparseable `ni` URIs all
    /// route to the download.
    pub fn on_searched(&mut self, outcome: SearchOutcome) -> Result<FetchStep, FetchError> {
        self.require_state(FetchState::Searching, "search outcome")?;
        self.report.search = outcome.status();
        let selected = outcome
            .ok()
            .and_then(|results| results.into_iter().next())
            .and_then(|first| first.identifier().ok());
        match selected {
            Some(identifier) => {
                self.report.identifier = Some(identifier.clone());
                self.state = FetchState::Retrieving;
                Ok(FetchStep::Retrieve { identifier })
            }
            None => Ok(self.download()),
        }
    }

    pub fn on_retrieved(&mut self, outcome: RetrieveOutcome) -> Result<FetchStep, FetchError> {
        self.require_state(FetchState::Retrieving, "retrieve outcome")?;
        self.report.retrieve = Some(outcome.status());
        match outcome.ok() {
            Some(payload) => {
                self.report.origin = Some(Origin::Retrieved);
                Ok(self.display(payload.file, payload.content_type))
            }
            None => Ok(self.download()),
        }
    }

    /// `None` means the downloader produced no object: terminal failure.
    pub fn on_downloaded(
        &mut self,
        content: Option<DownloadedContent>,
    ) -> Result<FetchStep, FetchError> {
        self.require_state(FetchState::Downloading, "download outcome")?;
        match content {
            Some(c) => {
                self.report.identifier = Some(ContentIdentifier::new(
                    self.policy.hash_algorithm.clone(),
                    c.hash,
                ));
                self.report.origin = Some(Origin::Downloaded);
                Ok(self.display(c.file, c.content_type))
            }
            None => {
                self.state = FetchState::Notifying;
                Ok(FetchStep::Notify {
                    message: DOWNLOAD_FAILED_MESSAGE.to_string(),
                })
            }
        }
    }

    pub fn on_displayed(&mut self) -> Result<FetchStep, FetchError> {
        self.require_state(FetchState::Displaying, "display completion")?;
        if !self.policy.publish_on_success {
            return Ok(self.finish());
        }
        match (&self.report.identifier, &self.obtained) {
            (Some(identifier), Some((file, content_type))) => {
                let plan = PublishPlan {
                    identifier: identifier.clone(),
                    content_type: content_type.clone(),
                    file: file.clone(),
                    source: self.report.source.clone(),
                    full_put: self.policy.full_put,
                };
                self.state = FetchState::Publishing;
                Ok(FetchStep::Publish(plan))
            }
            _ => Ok(self.finish()),
        }
    }

    /// Publish failures are recorded, never propagated.
    pub fn on_published(&mut self, result: Result<(), String>) -> Result<FetchStep, FetchError> {
        self.require_state(FetchState::Publishing, "publish outcome")?;
        self.report.publish = match result {
            Ok(()) => PublishStatus::Published,
            Err(reason) => PublishStatus::Failed(reason),
        };
        Ok(self.finish())
    }

    pub fn on_notified(&mut self) -> Result<FetchStep, FetchError> {
        self.require_state(FetchState::Notifying, "notification")?;
        Ok(self.finish())
    }

    fn require_state(&self, state: FetchState, event: &'static str) -> Result<(), FetchError> {
        if self.state == state {
            Ok(())
        } else {
            Err(FetchError::UnexpectedEvent {
                state: self.state,
                event,
            })
        }
    }

    fn download(&mut self) -> FetchStep {
        self.report.identifier = None;
        self.state = FetchState::Downloading;
        FetchStep::Download {
            source: self.report.source.clone(),
        }
    }

    fn display(&mut self, file: PathBuf, content_type: String) -> FetchStep {
        self.obtained = Some((file.clone(), content_type));
        self.state = FetchState::Displaying;
        FetchStep::Display {
            file,
            base_address: base_address(&self.report.source),
        }
    }

    fn finish(&mut self) -> FetchStep {
        self.state = FetchState::Done;
        FetchStep::Finish(self.report.clone())
    }
}

/// Base address for rendering: the source's host, always with an `http://` prefix.
pub fn base_address(source: &str) -> String {
    let rest = source
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(source);
    let host = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    format!("http://{}", host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::{ProtocolOutcome, RetrievePayload, SearchResult};

    const SOURCE: &str = "http://example.com/index.html";

    fn policy(publish: bool, full_put: bool) -> FetchPolicy {
        FetchPolicy {
            hash_algorithm: "sha-256".into(),
            publish_on_success: publish,
            full_put,
        }
    }

    fn found(uri: &str) -> SearchOutcome {
        ProtocolOutcome::Ok(vec![SearchResult::new(uri)])
    }

    fn page() -> RetrieveOutcome {
        ProtocolOutcome::Ok(RetrievePayload {
            file: PathBuf::from("/tmp/page.html"),
            content_type: "text/html".into(),
        })
    }

    fn downloaded() -> DownloadedContent {
        DownloadedContent {
            file: PathBuf::from("/var/cache/netinf/ff00"),
            content_type: "text/html".into(),
            hash: "ff00".into(),
        }
    }

    fn download_source(step: &FetchStep) -> Option<&str> {
        match step {
            FetchStep::Download { source } => Some(source),
            _ => None,
        }
    }

    #[test]
    fn retrieve_success_displays_without_download() {
        let (mut m, step) = FetchMachine::start(SOURCE, policy(false, false));
        assert_eq!(
            step,
            FetchStep::Search {
                source: SOURCE.into()
            }
        );
        let step = m.on_searched(found("ni:///sha256;abc123")).unwrap();
        assert_eq!(
            step,
            FetchStep::Retrieve {
                identifier: ContentIdentifier::new("sha256", "abc123")
            }
        );
        let step = m.on_retrieved(page()).unwrap();
        assert_eq!(
            step,
            FetchStep::Display {
                file: PathBuf::from("/tmp/page.html"),
                base_address: "http://example.com".into(),
            }
        );
        let FetchStep::Finish(report) = m.on_displayed().unwrap() else {
            panic!("expected Finish");
        };
        assert_eq!(report.origin, Some(Origin::Retrieved));
        assert_eq!(report.retrieve, Some(Status::Ok));
        assert_eq!(report.publish, PublishStatus::Skipped);
        assert_eq!(m.state(), FetchState::Done);
    }

    #[test]
    fn search_failures_route_to_download_with_source() {
        let failures: Vec<SearchOutcome> = vec![
            ProtocolOutcome::Failed,
            ProtocolOutcome::NoContent,
            ProtocolOutcome::InvalidContent,
            ProtocolOutcome::Ok(vec![]),
            found("ni:///sha256-no-separator"),
        ];
        for outcome in failures {
            let (mut m, _) = FetchMachine::start(SOURCE, policy(true, false));
            let step = m.on_searched(outcome.clone()).unwrap();
            assert_eq!(download_source(&step), Some(SOURCE), "{outcome:?}");
            assert_eq!(m.state(), FetchState::Downloading);
        }
    }

    #[test]
    fn retrieve_failures_route_to_download() {
        for outcome in [
            ProtocolOutcome::Failed,
            ProtocolOutcome::NoContent,
            ProtocolOutcome::InvalidContent,
            ProtocolOutcome::NoFilePath,
            ProtocolOutcome::FileMissingOnDisk,
            ProtocolOutcome::NoContentType,
        ] {
            let (mut m, _) = FetchMachine::start(SOURCE, policy(false, false));
            m.on_searched(found("ni:///sha256;abc123")).unwrap();
            let status = outcome.status();
            let step = m.on_retrieved(outcome).unwrap();
            assert_eq!(download_source(&step), Some(SOURCE), "{status}");
        }
    }

    #[test]
    fn download_failure_notifies_once_and_never_publishes() {
        let (mut m, _) = FetchMachine::start(SOURCE, policy(true, true));
        m.on_searched(ProtocolOutcome::Failed).unwrap();
        let step = m.on_downloaded(None).unwrap();
        assert_eq!(
            step,
            FetchStep::Notify {
                message: DOWNLOAD_FAILED_MESSAGE.into()
            }
        );
        let FetchStep::Finish(report) = m.on_notified().unwrap() else {
            panic!("expected Finish");
        };
        assert!(!report.succeeded());
        assert_eq!(report.publish, PublishStatus::Skipped);
        assert!(m.on_notified().is_err());
    }

    #[test]
    fn downloaded_content_is_published_under_computed_hash() {
        let (mut m, _) = FetchMachine::start(SOURCE, policy(true, false));
        m.on_searched(ProtocolOutcome::Ok(vec![])).unwrap();
        let step = m.on_downloaded(Some(downloaded())).unwrap();
        assert!(matches!(step, FetchStep::Display { .. }));
        let FetchStep::Publish(plan) = m.on_displayed().unwrap() else {
            panic!("expected Publish");
        };
        assert_eq!(plan.identifier, ContentIdentifier::new("sha-256", "ff00"));
        assert_eq!(plan.source, SOURCE);
        assert!(!plan.full_put);

        let FetchStep::Finish(report) = m.on_published(Err("radio disabled".into())).unwrap()
        else {
            panic!("expected Finish");
        };
        assert_eq!(report.origin, Some(Origin::Downloaded));
        assert_eq!(report.publish, PublishStatus::Failed("radio disabled".into()));
    }

    #[test]
    fn retrieved_content_reuses_retrieve_hash_for_publish() {
        let (mut m, _) = FetchMachine::start(SOURCE, policy(true, true));
        m.on_searched(found("ni:///sha256;abc123?ct=text/html")).unwrap();
        m.on_retrieved(page()).unwrap();
        let FetchStep::Publish(plan) = m.on_displayed().unwrap() else {
            panic!("expected Publish");
        };
        assert_eq!(plan.identifier, ContentIdentifier::new("sha256", "abc123"));
        assert_eq!(plan.content_type, "text/html");
        assert!(plan.full_put);
        let FetchStep::Finish(report) = m.on_published(Ok(())).unwrap() else {
            panic!("expected Finish");
        };
        assert_eq!(report.publish, PublishStatus::Published);
    }

    #[test]
    fn out_of_order_events_are_rejected() {
        let (mut m, _) = FetchMachine::start(SOURCE, FetchPolicy::default());
        assert!(m.on_retrieved(page()).is_err());
        assert!(m.on_downloaded(None).is_err());
        assert!(m.on_displayed().is_err());
        assert_eq!(m.state(), FetchState::Searching);
    }

    #[test]
    fn publish_plan_builds_lite_and_full_descriptors() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let plan = PublishPlan {
            identifier: ContentIdentifier::new("sha-256", "ff00"),
            content_type: "text/html".into(),
            file: file.path().to_path_buf(),
            source: SOURCE.into(),
            full_put: false,
        };
        let lite = plan
            .descriptor(42, 1_700_000_000_000, [Locator::bluetooth("aa:bb")])
            .unwrap();
        let keys: Vec<&str> = lite.metadata.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["filesize", "filepath", "time", "url"]);
        assert_eq!(lite.metadata.get("filesize"), Some("42"));
        assert_eq!(lite.metadata.get("url"), Some(SOURCE));
        assert!(!lite.is_full());
        assert_eq!(lite.locators.len(), 1);

        let full = PublishPlan {
            full_put: true,
            ..plan.clone()
        }
        .descriptor(42, 0, [])
        .unwrap();
        assert_eq!(full.local_file_path(), Some(file.path()));

        let missing = PublishPlan {
            full_put: true,
            file: PathBuf::from("/no/such/file"),
            ..plan
        };
        assert!(matches!(
            missing.descriptor(0, 0, []),
            Err(PublishPlanError::Io(_))
        ));
    }

    #[test]
    fn base_address_prefixes_http() {
        assert_eq!(base_address("https://example.com/a?b"), "http://example.com");
        assert_eq!(base_address("example.com/page"), "http://example.com");
        assert_eq!(base_address("http://host:8080"), "http://host:8080");
    }
}
