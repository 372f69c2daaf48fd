//! NetInf node core: content naming, descriptors, the local content store, resolution
//! services and the fetch state machine.
//! Host-driven: no network I/O; the host feeds outcomes in and receives the next step.

pub mod descriptor;
pub mod fetch;
pub mod identifier;
pub mod identity;
pub mod integrity;
pub mod outcome;
pub mod protocol;
pub mod resolution;
pub mod store;
pub mod wire;

pub use descriptor::{ContentDescriptor, Locator, LocatorKind, Metadata, MetadataError};
pub use fetch::{
    DownloadedContent, FetchError, FetchMachine, FetchPolicy, FetchReport, FetchState,
    FetchStep, Origin, PublishPlan, PublishPlanError, PublishStatus,
};
pub use identifier::{ContentIdentifier, IdentifierParseError};
pub use identity::NodeId;
pub use outcome::{
    ProtocolOutcome, PublishOutcome, RetrieveKeys, RetrieveOutcome, RetrievePayload,
    SearchOutcome, SearchResult, Status,
};
pub use protocol::{Message, PeerRequest, PeerResponse, PROTOCOL_VERSION};
pub use resolution::{LocalResolutionService, ResolutionChain, ResolutionError, ResolutionService};
pub use store::{ContentStore, StoreError};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
