//! Peer wire protocol: discovery beacons and resolution requests/responses.

use serde::{Deserialize, Serialize};

use crate::descriptor::ContentDescriptor;
use crate::identifier::ContentIdentifier;
use crate::identity::NodeId;

/// Current protocol version. Carried in beacons; mismatching beacons are ignored.
pub const PROTOCOL_VERSION: u8 = 1;

/// All wire message types. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Discovery: advertise presence and the port the request server listens on.
    Beacon {
        protocol_version: u8,
        node_id: NodeId,
        listen_port: u16,
    },
    /// Unicast answer to a beacon.
    BeaconReply {
        protocol_version: u8,
        node_id: NodeId,
        listen_port: u16,
    },
    Request(PeerRequest),
    Response(PeerResponse),
}

/// Resolution request sent to a peer's request server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRequest {
    Get(ContentIdentifier),
    /// `content` is present for a full put.
    Put {
        descriptor: ContentDescriptor,
        content: Option<Vec<u8>>,
    },
    Delete(ContentIdentifier),
    ListVersions(ContentIdentifier),
}

/// Answer of a request server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerResponse {
    /// `content` is present when the serving node still holds the bytes.
    Found {
        descriptor: ContentDescriptor,
        content: Option<Vec<u8>>,
    },
    Stored,
    Deleted,
    Versions(Vec<ContentIdentifier>),
    NotFound,
    Error {
        message: String,
    },
}
