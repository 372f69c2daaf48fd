//! Periodic peer discovery: scan the radio on a ticker and maintain the discovered-peer set.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use netinf_core::NodeId;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::radio::{PeerRecord, Radio};

/// Peers heard recently, shared with the peer resolution service.
pub type PeerSet = Arc<RwLock<HashMap<NodeId, PeerRecord>>>;

/// Result of one discovery cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    NoRadio,
    Disabled,
    Scanned(usize),
    Failed,
}

pub struct Discovery {
    radio: Option<Arc<dyn Radio>>,
    peers: PeerSet,
    interval: Duration,
    expiry: Duration,
    no_radio_logged: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Discovery {
    pub fn new(
        radio: Option<Arc<dyn Radio>>,
        peers: PeerSet,
        interval: Duration,
        expiry: Duration,
    ) -> Self {
        Self {
            radio,
            peers,
            interval,
            expiry,
            no_radio_logged: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    pub fn peers(&self) -> &PeerSet {
        &self.peers
    }

    /// Start the ticker. No-op when already running.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let this = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let outcome = this.run_cycle().await;
                debug!(?outcome, "discovery cycle");
            }
        }));
        info!(interval = ?self.interval, "discovery started");
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            info!("discovery stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }

    /// One scan: upsert every heard peer, then drop records older than the expiry.
    pub async fn run_cycle(&self) -> CycleOutcome {
        let Some(radio) = &self.radio else {
            if !self.no_radio_logged.swap(true, Ordering::Relaxed) {
                info!("no radio capability; discovery stays dormant");
            }
            return CycleOutcome::NoRadio;
        };
        let outcome = if !radio.is_enabled() {
            CycleOutcome::Disabled
        } else {
            match radio.scan().await {
                Ok(found) => {
                    let n = found.len();
                    let mut peers = self.peers.write();
                    for record in found {
                        peers.insert(record.node_id, record);
                    }
                    CycleOutcome::Scanned(n)
                }
                Err(e) => {
                    warn!(error = %e, "radio scan failed");
                    CycleOutcome::Failed
                }
            }
        };
        self.prune(Instant::now());
        outcome
    }

    fn prune(&self, now: Instant) {
        let expiry = self.expiry;
        self.peers
            .write()
            .retain(|_, r| now.saturating_duration_since(r.last_seen) < expiry);
    }
}
