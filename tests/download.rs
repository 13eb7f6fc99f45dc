//! End-to-end download scenarios against a scripted peer.
//!
//! The fake seed at the bottom of this file speaks real BEP 3 over
//! loopback TCP: handshake, bitfield, unchoke, and piece serving, with a
//! couple of scripted misbehaviors (poisoned data, a choke/unchoke cycle).
//! The engine under test runs over the in-memory filesystem and session
//! store, so a whole download finishes in well under a second.

use std::{
    convert::TryInto,
    net::SocketAddr,
    path::Path,
    sync::Arc,
    time::Duration,
};

use sha1::{Digest, Sha1};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
    time::{sleep, timeout},
};

use spindrift::{
    conf::Conf,
    store::{MemoryStore, SessionStore},
    vfs::MemFs,
    AddMode, Engine, TorrentHandle, TorrentState,
};

const BLOCK_LEN: u32 = 0x4000;

// ---------------------------------------------------------------------
// scenarios
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_download_from_single_seed() {
    // 4 pieces of 2 blocks, with a short last piece (and a short tail
    // block inside it)
    let torrent = TestTorrent::new("single.bin", 2 * BLOCK_LEN, 3 * 2 * BLOCK_LEN as usize + 20_000);
    let seed = FakeSeed::start(torrent.pieces.clone(), SeedBehavior::Honest)
        .await;

    let fs = MemFs::new();
    let mut engine = test_engine(&fs, Arc::new(MemoryStore::new()));
    let handle = engine
        .add_torrent(&torrent.metainfo, AddMode::Active)
        .unwrap();
    engine.add_peers(handle, vec![seed.addr]).unwrap();

    let status = await_seeding(&engine, handle).await;
    assert_eq!(status.progress, 1.0);
    assert_eq!(status.downloaded, torrent.total_len() as u64);

    // the file on disk is byte for byte the torrent's data
    assert_eq!(
        fs.contents(Path::new("/downloads/single.bin")).unwrap(),
        torrent.data
    );

    seed.stop();
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_hash_mismatch_recovery() {
    // single-block pieces so a poisoned piece is attributable to exactly
    // one peer
    let torrent =
        TestTorrent::new("poisoned.bin", BLOCK_LEN, 7 * BLOCK_LEN as usize + 8_000);
    let honest =
        FakeSeed::start(torrent.pieces.clone(), SeedBehavior::Honest).await;
    // claims only piece 1 and serves zeroes for it
    let poisoner = FakeSeed::start(
        torrent.pieces.clone(),
        SeedBehavior::PoisonPiece(1),
    )
    .await;

    let fs = MemFs::new();
    let mut engine = test_engine(&fs, Arc::new(MemoryStore::new()));
    let handle = engine
        .add_torrent(&torrent.metainfo, AddMode::Active)
        .unwrap();
    engine
        .add_peers(handle, vec![poisoner.addr, honest.addr])
        .unwrap();

    // the download must complete despite the poisoner, and the data must
    // be the honest bytes
    let status = await_seeding(&engine, handle).await;
    assert_eq!(status.progress, 1.0);
    assert_eq!(
        fs.contents(Path::new("/downloads/poisoned.bin")).unwrap(),
        torrent.data
    );

    honest.stop();
    poisoner.stop();
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_resume_across_restart() {
    let torrent =
        TestTorrent::new("resume.bin", 2 * BLOCK_LEN, 4 * 2 * BLOCK_LEN as usize);
    let seed = FakeSeed::start(torrent.pieces.clone(), SeedBehavior::Honest)
        .await;

    let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
    let fs = MemFs::new();

    // first run: download to completion, then shut down
    let handle = {
        let mut engine = test_engine(&fs, Arc::clone(&store));
        let handle = engine
            .add_torrent(&torrent.metainfo, AddMode::Active)
            .unwrap();
        engine.add_peers(handle, vec![seed.addr]).unwrap();
        await_seeding(&engine, handle).await;
        engine.shutdown().await.unwrap();
        handle
    };
    seed.stop();

    // second run: restore from the store, with no peers anywhere
    let mut engine = test_engine(&fs, Arc::clone(&store));
    let restored = engine.restore_session().unwrap();
    assert_eq!(restored, vec![handle]);

    // the bitfield came back from the store: complete without downloading
    let status = await_seeding(&engine, handle).await;
    assert_eq!(status.progress, 1.0);
    assert_eq!(status.downloaded, torrent.total_len() as u64);
    assert_eq!(
        fs.contents(Path::new("/downloads/resume.bin")).unwrap(),
        torrent.data
    );
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_choke_cycle_recovery() {
    let torrent =
        TestTorrent::new("choked.bin", 2 * BLOCK_LEN, 4 * 2 * BLOCK_LEN as usize);
    // this seed chokes us right after our first request and unchokes
    // shortly after; the dropped request must be re-issued
    let seed = FakeSeed::start(
        torrent.pieces.clone(),
        SeedBehavior::ChokeCycle,
    )
    .await;

    let fs = MemFs::new();
    let mut engine = test_engine(&fs, Arc::new(MemoryStore::new()));
    let handle = engine
        .add_torrent(&torrent.metainfo, AddMode::Active)
        .unwrap();
    engine.add_peers(handle, vec![seed.addr]).unwrap();

    let status = await_seeding(&engine, handle).await;
    assert_eq!(status.progress, 1.0);
    assert_eq!(
        fs.contents(Path::new("/downloads/choked.bin")).unwrap(),
        torrent.data
    );

    seed.stop();
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_backpressure_under_slow_disk() {
    // every write sleeps, and only two writes may be pending, so piece
    // admission has to stall and recover repeatedly
    let torrent =
        TestTorrent::new("slow.bin", BLOCK_LEN, 16 * BLOCK_LEN as usize);
    let seed = FakeSeed::start(torrent.pieces.clone(), SeedBehavior::Honest)
        .await;

    let fs = MemFs::with_write_latency(Duration::from_millis(20));
    let mut conf = Conf::new("/downloads");
    conf.torrent.max_pending_disk_writes = 2;
    conf.torrent.disk_backlog_threshold = 2;
    let mut engine = Engine::with_adapters(
        conf,
        Arc::new(MemoryStore::new()),
        Arc::new(fs.clone()),
    );
    let handle = engine
        .add_torrent(&torrent.metainfo, AddMode::Active)
        .unwrap();
    engine.add_peers(handle, vec![seed.addr]).unwrap();

    let status = await_seeding(&engine, handle).await;
    assert_eq!(status.progress, 1.0);
    assert_eq!(
        fs.contents(Path::new("/downloads/slow.bin")).unwrap(),
        torrent.data
    );

    seed.stop();
    engine.shutdown().await.unwrap();
}

// ---------------------------------------------------------------------
// harness
// ---------------------------------------------------------------------

fn test_engine(fs: &MemFs, store: Arc<dyn SessionStore>) -> Engine {
    Engine::with_adapters(
        Conf::new("/downloads"),
        store,
        Arc::new(fs.clone()),
    )
}

/// Polls the torrent's status until it reports seeding.
async fn await_seeding(
    engine: &Engine,
    handle: TorrentHandle,
) -> spindrift::TorrentStatus {
    timeout(Duration::from_secs(30), async {
        loop {
            let status = engine.status(handle).await.unwrap();
            if status.state == TorrentState::Seeding {
                return status;
            }
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("download did not complete in time")
}

/// A torrent generated from deterministic bytes, with its bencoded
/// metainfo built by hand.
struct TestTorrent {
    metainfo: Vec<u8>,
    data: Vec<u8>,
    pieces: Arc<Vec<Vec<u8>>>,
}

impl TestTorrent {
    fn new(name: &str, piece_len: u32, total_len: usize) -> Self {
        let data: Vec<u8> =
            (0..total_len).map(|i| ((i * 7 + 13) % 251) as u8).collect();
        let pieces: Vec<Vec<u8>> = data
            .chunks(piece_len as usize)
            .map(|chunk| chunk.to_vec())
            .collect();

        let mut hashes = Vec::with_capacity(pieces.len() * 20);
        for piece in &pieces {
            hashes.extend_from_slice(&Sha1::digest(piece));
        }

        let mut metainfo = Vec::new();
        metainfo.extend_from_slice(b"d4:infod");
        metainfo
            .extend_from_slice(format!("6:lengthi{}e", total_len).as_bytes());
        metainfo.extend_from_slice(
            format!("4:name{}:{}", name.len(), name).as_bytes(),
        );
        metainfo.extend_from_slice(
            format!("12:piece lengthi{}e", piece_len).as_bytes(),
        );
        metainfo
            .extend_from_slice(format!("6:pieces{}:", hashes.len()).as_bytes());
        metainfo.extend_from_slice(&hashes);
        metainfo.extend_from_slice(b"ee");

        Self {
            metainfo,
            data,
            pieces: Arc::new(pieces),
        }
    }

    fn total_len(&self) -> usize {
        self.data.len()
    }
}

#[derive(Clone, Copy, Debug)]
enum SeedBehavior {
    /// Serves every piece faithfully.
    Honest,
    /// Claims to have only the given piece and serves zeroes for it.
    PoisonPiece(usize),
    /// Chokes immediately after the first request, unchokes shortly
    /// after, then serves faithfully.
    ChokeCycle,
}

/// A scripted remote peer listening on loopback.
struct FakeSeed {
    addr: SocketAddr,
    join_handle: JoinHandle<()>,
}

impl FakeSeed {
    async fn start(
        pieces: Arc<Vec<Vec<u8>>>,
        behavior: SeedBehavior,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let join_handle = tokio::spawn(async move {
            loop {
                let (socket, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                let pieces = Arc::clone(&pieces);
                tokio::spawn(async move {
                    let _ = serve_peer(socket, pieces, behavior).await;
                });
            }
        });
        Self { addr, join_handle }
    }

    fn stop(&self) {
        self.join_handle.abort();
    }
}

async fn serve_peer(
    mut socket: TcpStream,
    pieces: Arc<Vec<Vec<u8>>>,
    behavior: SeedBehavior,
) -> std::io::Result<()> {
    // handshake: read the client's, echo its info hash back with our own
    // peer id
    let mut handshake = [0u8; 68];
    socket.read_exact(&mut handshake).await?;
    assert_eq!(&handshake[1..20], b"BitTorrent protocol");
    let mut reply = [0u8; 68];
    reply[0] = 19;
    reply[1..20].copy_from_slice(b"BitTorrent protocol");
    // reserved bytes stay zero: no extensions
    reply[28..48].copy_from_slice(&handshake[28..48]);
    reply[48..68].copy_from_slice(b"-FS0001-seedseedseed");
    socket.write_all(&reply).await?;

    // bitfield: everything, or just the poisoned piece
    let mut bitfield = vec![0u8; (pieces.len() + 7) / 8];
    match behavior {
        SeedBehavior::PoisonPiece(index) => {
            bitfield[index / 8] |= 0x80 >> (index % 8);
        }
        _ => {
            for index in 0..pieces.len() {
                bitfield[index / 8] |= 0x80 >> (index % 8);
            }
        }
    }
    socket.write_all(&frame(5, &bitfield)).await?;
    socket.write_all(&frame(1, &[])).await?; // unchoke

    let mut seen_first_request = false;
    loop {
        let mut len_buf = [0u8; 4];
        if socket.read_exact(&mut len_buf).await.is_err() {
            return Ok(());
        }
        let frame_len = u32::from_be_bytes(len_buf) as usize;
        if frame_len == 0 {
            continue; // keepalive
        }
        let mut payload = vec![0u8; frame_len];
        socket.read_exact(&mut payload).await?;

        // only REQUEST (6) needs acting on; everything else is noise here
        if payload[0] != 6 {
            continue;
        }
        let index =
            u32::from_be_bytes(payload[1..5].try_into().unwrap()) as usize;
        let begin =
            u32::from_be_bytes(payload[5..9].try_into().unwrap()) as usize;
        let length =
            u32::from_be_bytes(payload[9..13].try_into().unwrap()) as usize;

        if let SeedBehavior::ChokeCycle = behavior {
            if !seen_first_request {
                // drop the request on the floor and yank the rug
                seen_first_request = true;
                socket.write_all(&frame(0, &[])).await?; // choke
                sleep(Duration::from_millis(100)).await;
                socket.write_all(&frame(1, &[])).await?; // unchoke
                continue;
            }
        }

        let data = match behavior {
            SeedBehavior::PoisonPiece(poisoned) if index == poisoned => {
                vec![0u8; length]
            }
            _ => pieces[index][begin..begin + length].to_vec(),
        };
        let mut piece_payload = Vec::with_capacity(9 + data.len());
        piece_payload.extend_from_slice(&(index as u32).to_be_bytes());
        piece_payload.extend_from_slice(&(begin as u32).to_be_bytes());
        piece_payload.extend_from_slice(&data);
        socket.write_all(&frame(7, &piece_payload)).await?;
    }
}

/// Builds a length-prefixed message frame.
fn frame(id: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(5 + payload.len());
    frame.extend_from_slice(&(1 + payload.len() as u32).to_be_bytes());
    frame.push(id);
    frame.extend_from_slice(payload);
    frame
}
