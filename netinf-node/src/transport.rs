//! Peer transport: framed messages over TCP and one-shot request/response exchanges.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use netinf_core::wire::{decode_payload, encode_frame, payload_len, LEN_SIZE};
use netinf_core::{Message, PeerRequest, PeerResponse};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

const INITIAL_PAYLOAD_CAPACITY: usize = 64 * 1024;

fn invalid_data<E>(e: E) -> io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Read one frame. `Ok(None)` when the peer closed the stream between frames.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Message>> {
    let mut prefix = [0u8; LEN_SIZE];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = payload_len(prefix).map_err(invalid_data)?;
    // grow with what actually arrives rather than trusting the prefix up front
    let mut payload = Vec::with_capacity(len.min(INITIAL_PAYLOAD_CAPACITY));
    reader.take(len as u64).read_to_end(&mut payload).await?;
    if payload.len() < len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "stream closed inside a frame",
        ));
    }
    decode_payload(&payload).map(Some).map_err(invalid_data)
}

pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Message) -> io::Result<()> {
    let frame = encode_frame(msg).map_err(invalid_data)?;
    writer.write_all(&frame).await?;
    writer.flush().await
}

/// Connect, send one request and wait for its response. The whole exchange is bounded by `timeout`.
pub async fn exchange(
    addr: SocketAddr,
    request: PeerRequest,
    timeout: Duration,
) -> io::Result<PeerResponse> {
    let run = async {
        let mut stream = TcpStream::connect(addr).await?;
        write_message(&mut stream, &Message::Request(request)).await?;
        match read_message(&mut stream).await? {
            Some(Message::Response(resp)) => Ok(resp),
            Some(_) => Err(invalid_data("expected a response frame")),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed before responding",
            )),
        }
    };
    tokio::time::timeout(timeout, run)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "peer exchange timed out"))?
}
