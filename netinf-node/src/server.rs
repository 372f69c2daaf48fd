//! Request server: answers framed peer requests against the local resolution service.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use netinf_core::{
    ContentDescriptor, LocalResolutionService, Message, PeerRequest, PeerResponse,
    ResolutionError, ResolutionService,
};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::transport::{read_message, write_message};

struct Running {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct RequestServer {
    bind: SocketAddr,
    local: Arc<LocalResolutionService>,
    /// How long a connection may sit without delivering a complete request.
    idle_timeout: Duration,
    running: Mutex<Option<Running>>,
}

impl RequestServer {
    pub fn new(
        bind: SocketAddr,
        local: Arc<LocalResolutionService>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            bind,
            local,
            idle_timeout,
            running: Mutex::new(None),
        }
    }

    /// Bind and begin accepting. Returns the bound address; a running server is left as is.
    pub async fn start(&self) -> io::Result<SocketAddr> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }
        let listener = TcpListener::bind(self.bind).await?;
        let addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);

        let mut running = self.running.lock();
        if let Some(r) = running.as_ref().filter(|r| !r.task.is_finished()) {
            // lost a concurrent start; the new listener is dropped
            return Ok(r.addr);
        }
        let task = tokio::spawn(accept_loop(
            listener,
            self.local.clone(),
            self.idle_timeout,
            shutdown_rx,
        ));
        *running = Some(Running {
            addr,
            shutdown,
            task,
        });
        info!(%addr, "request server listening");
        Ok(addr)
    }

    /// Close the listener. Open connections finish the request in hand and are then closed.
    pub fn stop(&self) {
        if let Some(r) = self.running.lock().take() {
            let _ = r.shutdown.send(true);
            info!(addr = %r.addr, "request server stopped");
        }
    }

    pub fn is_alive(&self) -> bool {
        self.local_addr().is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running
            .lock()
            .as_ref()
            .filter(|r| !r.task.is_finished())
            .map(|r| r.addr)
    }
}

impl Drop for RequestServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop(
    listener: TcpListener,
    local: Arc<LocalResolutionService>,
    idle_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let local = local.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        let served = serve_connection(stream, &local, idle_timeout, shutdown).await;
                        if let Err(e) = served {
                            debug!(%peer, error = %e, "peer connection ended");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            },
        }
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    local: &LocalResolutionService,
    idle_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    loop {
        let read = tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            read = tokio::time::timeout(idle_timeout, read_message(&mut stream)) => read,
        };
        let msg = match read {
            Ok(msg) => msg?,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "no complete request before the idle timeout",
                ))
            }
        };
        let Some(msg) = msg else {
            return Ok(());
        };
        let resp = match msg {
            Message::Request(req) => handle_request(local, req).await,
            _ => PeerResponse::Error {
                message: "expected a request".into(),
            },
        };
        write_message(&mut stream, &Message::Response(resp)).await?;
    }
}

/// Answer one request. Store failures become `Error` responses.
pub async fn handle_request(local: &LocalResolutionService, req: PeerRequest) -> PeerResponse {
    match req {
        PeerRequest::Get(id) => match local.get(&id).await {
            Ok(descriptor) => {
                // the recorded file may have disappeared since it was stored
                let content = match descriptor.local_file_path() {
                    Some(path) => tokio::fs::read(path).await.ok(),
                    None => None,
                };
                PeerResponse::Found {
                    descriptor,
                    content,
                }
            }
            Err(ResolutionError::NotFound(_)) => PeerResponse::NotFound,
            Err(e) => failure("get", e),
        },
        PeerRequest::Put {
            descriptor,
            content,
        } => match store_put(local, descriptor, content).await {
            Ok(()) => PeerResponse::Stored,
            Err(e) => failure("put", e),
        },
        PeerRequest::Delete(id) => match local.delete(&id).await {
            Ok(()) => PeerResponse::Deleted,
            Err(ResolutionError::NotFound(_)) => PeerResponse::NotFound,
            Err(e) => failure("delete", e),
        },
        PeerRequest::ListVersions(id) => match local.list_versions(&id).await {
            Ok(versions) => PeerResponse::Versions(versions),
            Err(e) => failure("list_versions", e),
        },
    }
}

/// Received bytes go to the store's content directory; a path recorded by the sender is
/// meaningless here and is dropped.
async fn store_put(
    local: &LocalResolutionService,
    descriptor: ContentDescriptor,
    content: Option<Vec<u8>>,
) -> Result<(), ResolutionError> {
    let target = local.store().content_path(descriptor.identifier());
    let descriptor = match (content, target) {
        (Some(bytes), Some(path)) => {
            tokio::fs::write(&path, &bytes).await?;
            descriptor.with_local_file(path)?
        }
        _ => descriptor.without_local_file(),
    };
    debug!(identifier = %descriptor.identifier(), full = descriptor.is_full(), "peer put");
    local.put(&descriptor).await
}

fn failure(operation: &str, e: ResolutionError) -> PeerResponse {
    warn!(operation, error = %e, "peer request failed");
    PeerResponse::Error {
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::exchange;
    use netinf_core::{ContentIdentifier, ContentStore};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn server_with_store(store: ContentStore) -> RequestServer {
        let local = Arc::new(LocalResolutionService::new(Arc::new(store)));
        RequestServer::new("127.0.0.1:0".parse().unwrap(), local, TIMEOUT)
    }

    fn descriptor() -> ContentDescriptor {
        ContentDescriptor::new(ContentIdentifier::new("sha-256", "abc123"), "text/html")
    }

    #[tokio::test]
    async fn full_put_then_get_returns_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let server = server_with_store(ContentStore::open(dir.path()).unwrap());
        let addr = server.start().await.unwrap();

        let put = PeerRequest::Put {
            descriptor: descriptor(),
            content: Some(b"<html>peer</html>".to_vec()),
        };
        assert_eq!(exchange(addr, put, TIMEOUT).await.unwrap(), PeerResponse::Stored);

        let get = PeerRequest::Get(descriptor().identifier().clone());
        match exchange(addr, get, TIMEOUT).await.unwrap() {
            PeerResponse::Found {
                descriptor: d,
                content,
            } => {
                assert!(d.is_full());
                assert_eq!(content.as_deref(), Some(&b"<html>peer</html>"[..]));
            }
            other => panic!("unexpected {other:?}"),
        }
        server.stop();
    }

    #[tokio::test]
    async fn get_missing_and_delete() {
        let server = server_with_store(ContentStore::in_memory());
        let addr = server.start().await.unwrap();
        let id = descriptor().identifier().clone();

        assert_eq!(
            exchange(addr, PeerRequest::Get(id.clone()), TIMEOUT).await.unwrap(),
            PeerResponse::NotFound
        );
        let put = PeerRequest::Put {
            descriptor: descriptor(),
            content: None,
        };
        assert_eq!(exchange(addr, put, TIMEOUT).await.unwrap(), PeerResponse::Stored);
        assert_eq!(
            exchange(addr, PeerRequest::ListVersions(id.clone()), TIMEOUT)
                .await
                .unwrap(),
            PeerResponse::Versions(vec![id.clone()])
        );
        assert_eq!(
            exchange(addr, PeerRequest::Delete(id.clone()), TIMEOUT)
                .await
                .unwrap(),
            PeerResponse::Deleted
        );
        assert_eq!(
            exchange(addr, PeerRequest::Delete(id), TIMEOUT).await.unwrap(),
            PeerResponse::NotFound
        );
    }

    #[tokio::test]
    async fn get_without_file_on_disk_is_descriptor_only() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("page.html");
        std::fs::write(&file, b"x").unwrap();
        let store = ContentStore::in_memory();
        store
            .put(descriptor().with_local_file(&file).unwrap())
            .unwrap();
        std::fs::remove_file(&file).unwrap();

        let local = LocalResolutionService::new(Arc::new(store));
        let resp = handle_request(&local, PeerRequest::Get(descriptor().identifier().clone())).await;
        assert!(matches!(resp, PeerResponse::Found { content: None, .. }));
    }

    #[tokio::test]
    async fn start_stop_idempotent() {
        let server = server_with_store(ContentStore::in_memory());
        assert!(!server.is_alive());
        let a = server.start().await.unwrap();
        let b = server.start().await.unwrap();
        assert_eq!(a, b);
        assert!(server.is_alive());
        server.stop();
        server.stop();
        assert!(!server.is_alive());
        let c = server.start().await.unwrap();
        assert!(server.is_alive());
        assert_eq!(server.local_addr(), Some(c));
        server.stop();
    }

    /// True once the server side has closed the connection.
    async fn closed_by_server(client: &mut TcpStream) -> bool {
        use tokio::io::AsyncReadExt;
        let mut buf = [0u8; 16];
        matches!(
            tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf)).await,
            Ok(Ok(0)) | Ok(Err(_))
        )
    }

    #[tokio::test]
    async fn silent_client_is_dropped_after_idle_timeout() {
        use tokio::io::AsyncWriteExt;
        let local = Arc::new(LocalResolutionService::new(Arc::new(ContentStore::in_memory())));
        let server = RequestServer::new(
            "127.0.0.1:0".parse().unwrap(),
            local,
            Duration::from_millis(100),
        );
        let addr = server.start().await.unwrap();

        let mut silent = TcpStream::connect(addr).await.unwrap();
        assert!(closed_by_server(&mut silent).await);

        // a length prefix with no payload behind it
        let mut stalled = TcpStream::connect(addr).await.unwrap();
        stalled.write_all(&1000u32.to_le_bytes()).await.unwrap();
        assert!(closed_by_server(&mut stalled).await);

        assert!(server.is_alive());
        server.stop();
    }

    #[tokio::test]
    async fn stop_closes_open_connections() {
        let server = server_with_store(ContentStore::in_memory());
        let addr = server.start().await.unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        // the connection still serves requests before stop
        let id = descriptor().identifier().clone();
        write_message(&mut client, &Message::Request(PeerRequest::Get(id)))
            .await
            .unwrap();
        assert!(matches!(
            read_message(&mut client).await.unwrap(),
            Some(Message::Response(PeerResponse::NotFound))
        ));

        server.stop();
        assert!(closed_by_server(&mut client).await);
    }
}
