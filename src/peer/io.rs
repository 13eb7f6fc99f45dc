//! The socket driver task.
//!
//! One driver runs per peer connection. It dials (for outbound peers),
//! exchanges the handshake, and then degenerates into a byte pump: complete
//! receive chunks go inward to the torrent task over a bounded channel, and
//! pre-encoded frames come outward over an unbounded one. The driver holds
//! no protocol state beyond the handshake; everything else is decided in
//! the scheduling domain.
//!
//! The inbound event channel being bounded is deliberate: when the domain
//! falls behind, drivers stop reading and TCP backpressure reaches the
//! remote peer.

use std::{net::SocketAddr, time::Duration};

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
    time::timeout,
};
use tokio_util::codec::Framed;

use crate::{
    error::{Error, Result},
    PeerKey,
};

use super::codec::{Handshake, HandshakeCodec};

/// The size of the pooled receive chunks. Large enough that a full PIECE
/// frame usually arrives in a handful of chunks.
const RECV_CHUNK_LEN: usize = 64 * 1024;

/// What a driver task reports to the torrent task.
#[derive(Debug)]
pub(crate) enum PeerEvent {
    /// The TCP connection is established (outbound peers only).
    Connected,
    /// Handshakes are exchanged and verified; the session is live.
    HandshakeDone(Handshake),
    /// A chunk of post-handshake bytes arrived.
    Data(Bytes),
    /// The connection ended. Carries the error if it didn't end cleanly.
    Closed(Option<Error>),
}

pub(crate) type EventSender = mpsc::Sender<(PeerKey, PeerEvent)>;
pub(crate) type EventReceiver = mpsc::Receiver<(PeerKey, PeerEvent)>;

/// Runs the driver for an outbound connection: dial, handshake, pump.
/// Always terminates by reporting `Closed`.
pub(crate) async fn run_outbound(
    key: PeerKey,
    addr: SocketAddr,
    handshake: Handshake,
    handshake_timeout: Duration,
    events: EventSender,
    outbound: mpsc::UnboundedReceiver<Bytes>,
) {
    let result =
        drive_outbound(key, addr, handshake, handshake_timeout, &events, outbound)
            .await;
    // the torrent may already be gone, in which case nobody cares
    let _ = events.send((key, PeerEvent::Closed(result.err()))).await;
}

/// Runs the driver for a connection whose handshake was already exchanged
/// (inbound peers, handshaken at the engine's listener). `leftover` is
/// whatever the handshake read buffered past the handshake itself.
pub(crate) async fn run_connected(
    key: PeerKey,
    socket: TcpStream,
    leftover: Bytes,
    events: EventSender,
    outbound: mpsc::UnboundedReceiver<Bytes>,
) {
    let result = pump(key, socket, leftover, &events, outbound).await;
    let _ = events.send((key, PeerEvent::Closed(result.err()))).await;
}

async fn drive_outbound(
    key: PeerKey,
    addr: SocketAddr,
    handshake: Handshake,
    handshake_timeout: Duration,
    events: &EventSender,
    outbound: mpsc::UnboundedReceiver<Bytes>,
) -> Result<()> {
    log::info!("Connecting to peer {}", addr);
    let socket = TcpStream::connect(addr).await?;
    log::info!("Connected to peer {}", addr);
    events
        .send((key, PeerEvent::Connected))
        .await
        .map_err(|_| Error::Channel)?;

    let mut socket = Framed::new(socket, HandshakeCodec);

    // this is an outbound connection, so we have to send the first
    // handshake
    let info_hash = handshake.info_hash;
    log::debug!("Sending handshake to peer {}", addr);
    socket.send(handshake).await?;

    log::debug!("Waiting for peer {} handshake", addr);
    let peer_handshake = match timeout(handshake_timeout, socket.next()).await
    {
        Err(_) => return Err(Error::HandshakeTimeout),
        Ok(None) => {
            return Err(Error::ProtocolViolation(
                "connection closed during handshake",
            ))
        }
        Ok(Some(handshake)) => handshake?,
    };

    // verify that the advertised torrent info hash is the same as ours
    if peer_handshake.info_hash != info_hash {
        log::info!("Peer {} handshake invalid info hash", addr);
        return Err(Error::InvalidPeerInfoHash);
    }
    events
        .send((key, PeerEvent::HandshakeDone(peer_handshake)))
        .await
        .map_err(|_| Error::Channel)?;

    // the handshake read may have buffered bytes of messages the peer sent
    // right after its handshake; those must reach the session first
    let parts = socket.into_parts();
    pump(key, parts.io, parts.read_buf.freeze(), events, outbound).await
}

/// The steady-state byte pump.
async fn pump(
    key: PeerKey,
    socket: TcpStream,
    leftover: Bytes,
    events: &EventSender,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
) -> Result<()> {
    if !leftover.is_empty() {
        events
            .send((key, PeerEvent::Data(leftover)))
            .await
            .map_err(|_| Error::Channel)?;
    }

    let (mut read_half, mut write_half) = socket.into_split();
    let mut read_buf = BytesMut::with_capacity(RECV_CHUNK_LEN);

    loop {
        tokio::select! {
            read = read_half.read_buf(&mut read_buf) => {
                if read? == 0 {
                    // clean EOF from the peer
                    return Ok(());
                }
                let chunk = read_buf.split().freeze();
                events
                    .send((key, PeerEvent::Data(chunk)))
                    .await
                    .map_err(|_| Error::Channel)?;
                read_buf.reserve(RECV_CHUNK_LEN);
            }
            frames = outbound.recv() => {
                match frames {
                    Some(frames) => write_half.write_all(&frames).await?,
                    // the torrent dropped the session: close the socket
                    None => return Ok(()),
                }
            }
        }
    }
}
