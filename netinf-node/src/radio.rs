//! Short-range radio capability. The LAN radio uses UDP multicast beacons: a scan
//! multicasts a beacon and collects the unicast replies heard during the scan window.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use netinf_core::wire::{decode_frame, encode_frame};
use netinf_core::{LocatorKind, Message, NodeId, PROTOCOL_VERSION};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 60);

/// A peer heard on the radio, reachable at `addr` (its request server).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub node_id: NodeId,
    pub addr: SocketAddr,
    pub last_seen: Instant,
}

#[async_trait]
pub trait Radio: Send + Sync {
    fn is_enabled(&self) -> bool;

    /// Address other nodes use to reach this node's request server.
    fn local_address(&self) -> Option<String>;

    fn locator_kind(&self) -> LocatorKind;

    async fn scan(&self) -> io::Result<Vec<PeerRecord>>;

    /// Enabled/disabled transitions.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

pub struct LanRadio {
    node_id: NodeId,
    socket: Arc<UdpSocket>,
    group: SocketAddr,
    peer_port: u16,
    scan_window: Duration,
    local_ip: Option<IpAddr>,
    enabled: watch::Sender<bool>,
    heard: Arc<Mutex<HashMap<NodeId, PeerRecord>>>,
    listener: JoinHandle<()>,
}

impl LanRadio {
    /// Join the discovery group and start answering beacons. Must be called inside a runtime.
    pub fn bind(
        node_id: NodeId,
        discovery_port: u16,
        peer_port: u16,
        scan_window: Duration,
    ) -> io::Result<Self> {
        let socket = Arc::new(make_multicast_socket(discovery_port)?);
        let (enabled, _) = watch::channel(true);
        let heard = Arc::new(Mutex::new(HashMap::new()));
        let listener = tokio::spawn(recv_loop(
            socket.clone(),
            node_id,
            peer_port,
            enabled.subscribe(),
            heard.clone(),
        ));
        let local_ip = detect_local_ip();
        info!(%node_id, discovery_port, ?local_ip, "lan radio up");
        Ok(Self {
            node_id,
            socket,
            group: SocketAddr::from((MULTICAST_GROUP, discovery_port)),
            peer_port,
            scan_window,
            local_ip,
            enabled,
            heard,
            listener,
        })
    }

    pub fn set_enabled(&self, on: bool) {
        let was = self.enabled.send_replace(on);
        if was != on {
            info!(enabled = on, "lan radio toggled");
        }
    }

    /// Flip the enabled flag; returns the new value.
    pub fn toggle(&self) -> bool {
        let on = !*self.enabled.borrow();
        self.set_enabled(on);
        on
    }
}

impl Drop for LanRadio {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

#[async_trait]
impl Radio for LanRadio {
    fn is_enabled(&self) -> bool {
        *self.enabled.borrow()
    }

    fn local_address(&self) -> Option<String> {
        self.local_ip
            .map(|ip| SocketAddr::new(ip, self.peer_port).to_string())
    }

    fn locator_kind(&self) -> LocatorKind {
        LocatorKind::Wifi
    }

    /// Everything heard since the previous scan, including the replies to this scan's beacon.
    async fn scan(&self) -> io::Result<Vec<PeerRecord>> {
        let beacon = encode_frame(&Message::Beacon {
            protocol_version: PROTOCOL_VERSION,
            node_id: self.node_id,
            listen_port: self.peer_port,
        })
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.socket.send_to(&beacon, self.group).await?;
        tokio::time::sleep(self.scan_window).await;
        Ok(self.heard.lock().drain().map(|(_, r)| r).collect())
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.enabled.subscribe()
    }
}

fn make_multicast_socket(discovery_port: u16) -> io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery_port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

/// Source address the kernel would pick for LAN multicast. Nothing is sent.
fn detect_local_ip() -> Option<IpAddr> {
    let s = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    s.connect((MULTICAST_GROUP, 9)).ok()?;
    let ip = s.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    me: NodeId,
    peer_port: u16,
    enabled: watch::Receiver<bool>,
    heard: Arc<Mutex<HashMap<NodeId, PeerRecord>>>,
) {
    let reply = match encode_frame(&Message::BeaconReply {
        protocol_version: PROTOCOL_VERSION,
        node_id: me,
        listen_port: peer_port,
    }) {
        Ok(f) => f,
        Err(e) => {
            warn!(error = %e, "cannot encode beacon reply");
            return;
        }
    };
    let mut buf = vec![0u8; 2048];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "discovery socket closed");
                return;
            }
        };
        if !*enabled.borrow() {
            continue;
        }
        if let Some((record, wants_reply)) = classify(me, &buf[..n], from) {
            debug!(peer = %record.node_id, addr = %record.addr, "heard peer");
            heard.lock().insert(record.node_id, record);
            if wants_reply {
                if let Err(e) = socket.send_to(&reply, from).await {
                    debug!(%from, error = %e, "beacon reply not sent");
                }
            }
        }
    }
}

/// Peer record carried by a datagram, and whether it is a beacon that wants a reply.
/// Own beacons, other protocol versions and non-discovery frames yield None.
fn classify(me: NodeId, datagram: &[u8], from: SocketAddr) -> Option<(PeerRecord, bool)> {
    let (msg, _) = decode_frame(datagram).ok()?;
    let (version, node_id, listen_port, wants_reply) = match msg {
        Message::Beacon {
            protocol_version,
            node_id,
            listen_port,
        } => (protocol_version, node_id, listen_port, true),
        Message::BeaconReply {
            protocol_version,
            node_id,
            listen_port,
        } => (protocol_version, node_id, listen_port, false),
        _ => return None,
    };
    if version != PROTOCOL_VERSION || node_id == me {
        return None;
    }
    let record = PeerRecord {
        node_id,
        addr: SocketAddr::new(from.ip(), listen_port),
        last_seen: Instant::now(),
    };
    Some((record, wants_reply))
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scriptable radio for tests.
    pub(crate) struct FakeRadio {
        enabled: watch::Sender<bool>,
        address: Option<String>,
        pub found: Mutex<Vec<PeerRecord>>,
        pub fail_scan: bool,
        scans: AtomicUsize,
    }

    impl FakeRadio {
        pub fn new(enabled: bool, address: Option<&str>) -> Self {
            Self {
                enabled: watch::channel(enabled).0,
                address: address.map(str::to_string),
                found: Mutex::new(Vec::new()),
                fail_scan: false,
                scans: AtomicUsize::new(0),
            }
        }

        pub fn set_enabled(&self, on: bool) {
            self.enabled.send_replace(on);
        }

        pub fn scans(&self) -> usize {
            self.scans.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Radio for FakeRadio {
        fn is_enabled(&self) -> bool {
            *self.enabled.borrow()
        }
        fn local_address(&self) -> Option<String> {
            self.address.clone()
        }
        fn locator_kind(&self) -> LocatorKind {
            LocatorKind::Wifi
        }
        async fn scan(&self) -> io::Result<Vec<PeerRecord>> {
            self.scans.fetch_add(1, Ordering::SeqCst);
            if self.fail_scan {
                return Err(io::Error::new(io::ErrorKind::Other, "scan failed"));
            }
            Ok(self.found.lock().clone())
        }
        fn subscribe(&self) -> watch::Receiver<bool> {
            self.enabled.subscribe()
        }
    }
}
