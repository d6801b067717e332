//! End-to-end exchanges against a real listener on an ephemeral loopback
//! port. The raw-socket tests walk the wire exchange packet by packet;
//! the rest drive the client entry points.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use tftpv::catalog::{backing_name, Catalog, VersionRow};
use tftpv::client;
use tftpv::root::RootDir;
use tftpv::server::Listener;
use tftpv::session::TftpSocket;
use tftpv::wire::{Message, Options};

struct TestServer {
    dir: TempDir,
    catalog: Catalog,
    ctx: CancellationToken,
    addr: SocketAddr,
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl TestServer {
    async fn start() -> TestServer {
        let dir = tempfile::tempdir().unwrap();
        let root = RootDir::open(dir.path()).unwrap();
        let catalog = Catalog::open(&dir.path().join("catalog.db"), root)
            .await
            .unwrap();
        let ctx = CancellationToken::new();
        let listener = Listener::bind(
            (Ipv4Addr::LOCALHOST, 0).into(),
            catalog.clone(),
            ctx.clone(),
        )
        .unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(listener.run());
        TestServer {
            dir,
            catalog,
            ctx,
            addr,
            task,
        }
    }

    /// Commits a version of `filename` directly through the catalog.
    async fn seed(&self, filename: &str, contents: &[u8]) {
        let (started, mut file) = self.catalog.prepare(filename).await.unwrap();
        file.write_all(contents).await.unwrap();
        file.flush().await.unwrap();
        drop(file);
        self.catalog.commit_upload(filename, started).await.unwrap();
    }

    async fn shutdown(self) -> (TempDir, Catalog) {
        self.ctx.cancel();
        let _ = self.task.await;
        (self.dir, self.catalog)
    }
}

fn raw_client() -> TftpSocket {
    TftpSocket::bind((Ipv4Addr::LOCALHOST, 0).into()).unwrap()
}

async fn recv(socket: &TftpSocket) -> (Message, SocketAddr) {
    let mut buf = [0u8; 65536];
    let (len, from) = timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for the server")
        .unwrap();
    (Message::decode(&buf[..len]).unwrap(), from)
}

async fn expect_silence(socket: &TftpSocket, wait: Duration) {
    let mut buf = [0u8; 65536];
    assert!(
        timeout(wait, socket.recv_from(&mut buf)).await.is_err(),
        "received a datagram while expecting silence"
    );
}

async fn wait_for<T>(mut condition: impl FnMut() -> Option<T>) -> T {
    for _ in 0..200 {
        if let Some(value) = condition() {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached in time");
}

fn options_of(pairs: &[(&str, &str)]) -> Options {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Scenario: plain download of a two byte file, no options. One data
/// block, one ack, both sides terminate.
#[tokio::test]
async fn download_without_options() {
    let server = TestServer::start().await;
    server.seed("hello.txt", b"hi").await;

    let client = raw_client();
    let request = Message::Read {
        filename: "hello.txt".to_string(),
        mode: "octet".to_string(),
        options: Options::new(),
    };
    client.send_to(&request.encode(), server.addr).await.unwrap();

    let (reply, session_addr) = recv(&client).await;
    assert_eq!(
        reply,
        Message::Data {
            block: 1,
            body: b"hi".to_vec(),
        }
    );
    client
        .send_to(&Message::Ack { block: 1 }.encode(), session_addr)
        .await
        .unwrap();

    let (_dir, catalog) = server.shutdown().await;
    let rows = catalog.versions("hello.txt").unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].consumers, 0);
}

/// Scenario: download with blksize 8 and tsize 0 on a ten byte file. The
/// server acknowledges both options, reports the size, and the transfer
/// takes two blocks.
#[tokio::test]
async fn download_negotiates_blksize_and_tsize() {
    let server = TestServer::start().await;
    server.seed("ten.bin", b"0123456789").await;

    let client = raw_client();
    let request = Message::Read {
        filename: "ten.bin".to_string(),
        mode: "octet".to_string(),
        options: options_of(&[("blksize", "8"), ("tsize", "0")]),
    };
    client.send_to(&request.encode(), server.addr).await.unwrap();

    let (reply, session_addr) = recv(&client).await;
    assert_eq!(
        reply,
        Message::OAck {
            options: options_of(&[("blksize", "8"), ("tsize", "10")]),
        }
    );
    client
        .send_to(&Message::Ack { block: 0 }.encode(), session_addr)
        .await
        .unwrap();

    let (first, _) = recv(&client).await;
    assert_eq!(
        first,
        Message::Data {
            block: 1,
            body: b"01234567".to_vec(),
        }
    );
    client
        .send_to(&Message::Ack { block: 1 }.encode(), session_addr)
        .await
        .unwrap();

    let (second, _) = recv(&client).await;
    assert_eq!(
        second,
        Message::Data {
            block: 2,
            body: b"89".to_vec(),
        }
    );
    client
        .send_to(&Message::Ack { block: 2 }.encode(), session_addr)
        .await
        .unwrap();

    server.shutdown().await;
}

/// Scenario: upload with blksize negotiation. Afterwards the catalog
/// holds exactly one committed row for the file and the backing file
/// carries the uploaded bytes.
#[tokio::test]
async fn upload_with_option_negotiation() {
    let server = TestServer::start().await;
    let scratch = tempfile::tempdir().unwrap();
    let source = scratch.path().join("payload.bin");
    let contents: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();
    tokio::fs::write(&source, &contents).await.unwrap();

    client::upload(
        CancellationToken::new(),
        server.addr,
        "x",
        options_of(&[("blksize", "1024")]),
        &source,
    )
    .await
    .unwrap();

    // the final ack reaches the client just before the server commits
    let catalog = server.catalog.clone();
    let row: VersionRow = wait_for(|| {
        let rows = catalog.versions("x").unwrap();
        match rows.as_slice() {
            [row] if row.upload_completed != 0 => Some(row.clone()),
            _ => None,
        }
    })
    .await;
    assert!(row.upload_completed > row.upload_started);
    assert!(row.upload_started > 0);

    let (dir, _catalog) = server.shutdown().await;
    let stored = std::fs::read(dir.path().join(backing_name("x", row.upload_started))).unwrap();
    assert_eq!(stored, contents);
}

/// Scenario: a reader that started before an overwrite keeps receiving
/// the old version to completion; once it releases, the old version is
/// reaped.
#[tokio::test]
async fn reader_survives_concurrent_overwrite() {
    let server = TestServer::start().await;
    let v1: Vec<u8> = vec![0xAA; 600];
    server.seed("f", &v1).await;

    // reader receives the first block and then stalls mid-transfer
    let reader = raw_client();
    let request = Message::Read {
        filename: "f".to_string(),
        mode: "octet".to_string(),
        options: Options::new(),
    };
    reader.send_to(&request.encode(), server.addr).await.unwrap();
    let (first, session_addr) = recv(&reader).await;
    assert_eq!(
        first,
        Message::Data {
            block: 1,
            body: v1[..512].to_vec(),
        }
    );

    // a full overwrite happens while the reader is stalled
    let scratch = tempfile::tempdir().unwrap();
    let v2_source = scratch.path().join("v2.bin");
    tokio::fs::write(&v2_source, b"fresh contents").await.unwrap();
    client::upload(
        CancellationToken::new(),
        server.addr,
        "f",
        Options::new(),
        &v2_source,
    )
    .await
    .unwrap();

    let catalog = server.catalog.clone();
    wait_for(|| {
        let rows = catalog.versions("f").unwrap();
        (rows.iter().filter(|r| r.upload_completed != 0).count() == 2).then_some(())
    })
    .await;

    // the stalled reader resumes and still gets v1 bytes
    reader
        .send_to(&Message::Ack { block: 1 }.encode(), session_addr)
        .await
        .unwrap();
    let (second, _) = recv(&reader).await;
    assert_eq!(
        second,
        Message::Data {
            block: 2,
            body: v1[512..].to_vec(),
        }
    );
    reader
        .send_to(&Message::Ack { block: 2 }.encode(), session_addr)
        .await
        .unwrap();

    // release makes v1 eligible and it disappears with its backing file
    let old = wait_for(|| {
        let rows = catalog.versions("f").unwrap();
        match rows.as_slice() {
            [row] => Some(row.upload_started),
            _ => None,
        }
    })
    .await;

    let (dir, catalog) = server.shutdown().await;
    let rows = catalog.versions("f").unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].upload_started, old);
    let mut backing = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|entry| {
            let name = entry.unwrap().file_name().into_string().unwrap();
            name.starts_with("f.").then_some(name)
        })
        .collect::<Vec<_>>();
    backing.sort();
    assert_eq!(backing, vec![backing_name("f", rows[0].upload_started)]);
}

/// Scenario: a duplicate ack for an already-acknowledged block changes
/// nothing; the server neither retransmits nor advances.
#[tokio::test]
async fn duplicate_ack_is_ignored() {
    let server = TestServer::start().await;
    let contents: Vec<u8> = vec![0x42; 600];
    server.seed("dup.bin", &contents).await;

    let client = raw_client();
    let request = Message::Read {
        filename: "dup.bin".to_string(),
        mode: "octet".to_string(),
        options: Options::new(),
    };
    client.send_to(&request.encode(), server.addr).await.unwrap();

    let (first, session_addr) = recv(&client).await;
    assert!(matches!(first, Message::Data { block: 1, .. }));
    client
        .send_to(&Message::Ack { block: 1 }.encode(), session_addr)
        .await
        .unwrap();

    let (second, _) = recv(&client).await;
    assert!(matches!(second, Message::Data { block: 2, .. }));

    // stale ack arrives after the server already advanced to block 2
    client
        .send_to(&Message::Ack { block: 1 }.encode(), session_addr)
        .await
        .unwrap();
    expect_silence(&client, Duration::from_millis(400)).await;

    client
        .send_to(&Message::Ack { block: 2 }.encode(), session_addr)
        .await
        .unwrap();
    server.shutdown().await;
}

/// A file of exactly one block ends with an explicit empty data message,
/// and the receiver still acknowledges it.
#[tokio::test]
async fn exact_multiple_ends_with_empty_block() {
    let server = TestServer::start().await;
    let contents = vec![0x5A; 512];
    server.seed("block.bin", &contents).await;

    let client = raw_client();
    let request = Message::Read {
        filename: "block.bin".to_string(),
        mode: "octet".to_string(),
        options: Options::new(),
    };
    client.send_to(&request.encode(), server.addr).await.unwrap();

    let (first, session_addr) = recv(&client).await;
    assert_eq!(
        first,
        Message::Data {
            block: 1,
            body: contents.clone(),
        }
    );
    client
        .send_to(&Message::Ack { block: 1 }.encode(), session_addr)
        .await
        .unwrap();

    let (last, _) = recv(&client).await;
    assert_eq!(
        last,
        Message::Data {
            block: 2,
            body: vec![],
        }
    );
    client
        .send_to(&Message::Ack { block: 2 }.encode(), session_addr)
        .await
        .unwrap();
    server.shutdown().await;
}

/// A request for a file that was never uploaded is answered with the
/// no-such-file error code.
#[tokio::test]
async fn missing_file_yields_error() {
    let server = TestServer::start().await;

    let client = raw_client();
    let request = Message::Read {
        filename: "nope.txt".to_string(),
        mode: "octet".to_string(),
        options: Options::new(),
    };
    client.send_to(&request.encode(), server.addr).await.unwrap();

    let (reply, _) = recv(&client).await;
    assert!(matches!(
        reply,
        Message::Error {
            code: tftpv::wire::ErrorCode::NoSuchFile,
            ..
        }
    ));
    server.shutdown().await;
}

/// Round trip through the public client entry points against a served
/// directory: upload then download, bytes preserved exactly.
#[tokio::test]
async fn client_round_trip() {
    let server = TestServer::start().await;
    let scratch = tempfile::tempdir().unwrap();
    let source = scratch.path().join("send.bin");
    let destination = scratch.path().join("fetched.bin");
    let contents: Vec<u8> = (0..2000u32).map(|i| (i % 199) as u8).collect();
    tokio::fs::write(&source, &contents).await.unwrap();

    client::upload(
        CancellationToken::new(),
        server.addr,
        "roundtrip.bin",
        Options::new(),
        &source,
    )
    .await
    .unwrap();

    let catalog = server.catalog.clone();
    wait_for(|| {
        let rows = catalog.versions("roundtrip.bin").unwrap();
        (!rows.is_empty() && rows[0].upload_completed != 0).then_some(())
    })
    .await;

    client::download(
        CancellationToken::new(),
        server.addr,
        "roundtrip.bin",
        options_of(&[("tsize", "0")]),
        &destination,
    )
    .await
    .unwrap();

    let fetched = tokio::fs::read(&destination).await.unwrap();
    assert_eq!(fetched, contents);
    server.shutdown().await;
}
