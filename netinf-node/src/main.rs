// NetInf node: NRS client, LAN peer discovery, request server and fetch driver.

mod collab;
mod config;
mod discovery;
mod fetch;
mod logging;
mod nrs;
mod peer;
mod radio;
mod retrieve;
mod server;
mod transport;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use netinf_core::{
    ContentStore, LocalResolutionService, NodeId, PublishStatus, ResolutionChain,
    ResolutionService,
};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::collab::{HttpDownloader, StderrNotifier, StdoutSink};
use crate::config::{Config, RetrieveSource};
use crate::discovery::{Discovery, PeerSet};
use crate::fetch::{Fetcher, FetcherParts};
use crate::nrs::NrsClient;
use crate::peer::{PeerResolutionService, PeerRetriever};
use crate::radio::{LanRadio, Radio};
use crate::retrieve::{LocalRetriever, RetrievalChain, Retriever};
use crate::server::RequestServer;

const VERSION: &str = env!("CARGO_PKG_VERSION");

struct Args {
    verbosity: u8,
    sources: Vec<String>,
}

/// None when the invocation was fully handled (e.g. `--version`).
fn parse_args(args: impl Iterator<Item = String>) -> anyhow::Result<Option<Args>> {
    let mut parsed = Args {
        verbosity: 0,
        sources: Vec::new(),
    };
    for arg in args {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("netinf-node {}", VERSION);
                return Ok(None);
            }
            "--verbose" => parsed.verbosity = parsed.verbosity.saturating_add(1),
            s if s.starts_with("-v") && s[1..].chars().all(|c| c == 'v') => {
                parsed.verbosity = parsed.verbosity.saturating_add((s.len() - 1) as u8);
            }
            s if s.starts_with('-') => anyhow::bail!("unknown option {s}"),
            _ => parsed.sources.push(arg),
        }
    }
    Ok(Some(parsed))
}

fn main() -> anyhow::Result<()> {
    let Some(args) = parse_args(std::env::args().skip(1))? else {
        return Ok(());
    };
    let cfg = config::load()?;
    logging::init(args.verbosity, cfg.log_filter.as_deref());

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg, args.sources))
}

async fn run(cfg: Config, sources: Vec<String>) -> anyhow::Result<()> {
    let store = Arc::new(
        ContentStore::open(&cfg.store_dir)
            .with_context(|| format!("opening store at {}", cfg.store_dir.display()))?,
    );
    let store_dir = std::fs::canonicalize(&cfg.store_dir)?;
    let local = Arc::new(LocalResolutionService::new(store.clone()));
    info!(store = %store_dir.display(), descriptors = store.len(), "store opened");

    let node_id = NodeId::generate();
    let radio = match LanRadio::bind(node_id, cfg.discovery_port, cfg.peer_port, cfg.scan_window())
    {
        Ok(r) => Some(Arc::new(r)),
        Err(e) => {
            warn!(error = %e, "lan radio unavailable; peer transport stays dormant");
            None
        }
    };
    let dyn_radio = radio.clone().map(|r| r as Arc<dyn Radio>);

    let peers = PeerSet::default();
    let discovery = Arc::new(Discovery::new(
        dyn_radio.clone(),
        peers.clone(),
        cfg.discovery_interval(),
        cfg.peer_expiry(),
    ));
    discovery.start();

    let server = Arc::new(RequestServer::new(
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, cfg.peer_port)),
        local.clone(),
        cfg.request_timeout(),
    ));
    if let Some(r) = &radio {
        tokio::spawn(follow_radio(r.subscribe(), server.clone()));
        #[cfg(unix)]
        tokio::spawn(toggle_on_sigusr1(r.clone()));
    }

    let nrs = Arc::new(NrsClient::new(
        &cfg.nrs,
        cfg.retrieve_keys(),
        cfg.request_timeout(),
    )?);
    let peer_service = Arc::new(PeerResolutionService::new(
        peers.clone(),
        cfg.request_timeout(),
    ));
    let retrieval_sources: Vec<Arc<dyn Retriever>> = cfg
        .retrieve_order
        .iter()
        .map(|source| -> Arc<dyn Retriever> {
            match source {
                RetrieveSource::Local => Arc::new(LocalRetriever::new(store.clone())),
                RetrieveSource::Nrs => nrs.clone(),
                RetrieveSource::Peer => Arc::new(PeerRetriever::new(
                    peer_service.clone(),
                    store_dir.join("peer-cache"),
                )),
            }
        })
        .collect();
    let publisher: Arc<dyn ResolutionService> = Arc::new(ResolutionChain::new(vec![
        local.clone() as Arc<dyn ResolutionService>,
        nrs.clone() as Arc<dyn ResolutionService>,
    ]));

    let fetcher = Arc::new(Fetcher::new(FetcherParts {
        searcher: nrs.clone(),
        retriever: Arc::new(RetrievalChain::new(
            retrieval_sources,
            cfg.request_timeout(),
            cfg.verify_retrieved,
        )),
        downloader: Arc::new(HttpDownloader::new(cfg.request_timeout())?),
        sink: Arc::new(StdoutSink),
        notifier: Arc::new(StderrNotifier),
        publisher,
        radio: dyn_radio,
        policy: cfg.policy(),
        download_dir: store_dir.join("downloads"),
        timeout: cfg.request_timeout(),
    }));

    if sources.is_empty() {
        info!(version = VERSION, %node_id, "serving; ctrl-c to stop");
        shutdown_signal().await?;
    } else {
        run_fetches(fetcher, sources).await;
    }

    info!(
        peers = discovery.peers().read().len(),
        request_server = server.is_alive(),
        "shutting down"
    );
    discovery.stop();
    server.stop();
    Ok(())
}

/// Fetches are independent and run concurrently.
async fn run_fetches(fetcher: Arc<Fetcher>, sources: Vec<String>) {
    let mut set = JoinSet::new();
    for source in sources {
        let fetcher = fetcher.clone();
        set.spawn(async move {
            let result = fetcher.fetch(&source).await;
            (source, result)
        });
    }
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((source, Ok(report))) => {
                info!(
                    %source,
                    origin = ?report.origin,
                    identifier = ?report.identifier.as_ref().map(ToString::to_string),
                    published = matches!(report.publish, PublishStatus::Published),
                    "fetch finished"
                );
            }
            Ok((source, Err(e))) => error!(%source, error = %e, "fetch aborted"),
            Err(e) => error!(error = %e, "fetch task panicked"),
        }
    }
}

/// Keep the request server in step with the radio's enabled flag.
async fn follow_radio(mut enabled: watch::Receiver<bool>, server: Arc<RequestServer>) {
    loop {
        let on = *enabled.borrow_and_update();
        if on {
            if let Err(e) = server.start().await {
                warn!(error = %e, "request server failed to start");
            }
        } else {
            server.stop();
        }
        if enabled.changed().await.is_err() {
            break;
        }
    }
}

#[cfg(unix)]
async fn toggle_on_sigusr1(radio: Arc<LanRadio>) {
    use tokio::signal::unix::{signal, SignalKind};
    let mut usr1 = match signal(SignalKind::user_defined1()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGUSR1");
            return;
        }
    };
    while usr1.recv().await.is_some() {
        radio.toggle();
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
