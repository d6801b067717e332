//! Per-transfer protocol engine.
//!
//! A [`Session`] owns one ephemeral UDP socket (its transfer identifier),
//! at most one open file, the negotiated options, and the current block
//! number, and drives a single TFTP exchange end to end. The server and
//! client directions of both transfer kinds are four roles of the same
//! struct, not four types; the lock-step send/receive loops are shared
//! between them.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::path::Path;
use std::time::Duration;

use async_io::Async;
use rand::Rng;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::catalog::{Catalog, CatalogError};
use crate::wire::{ErrorCode, Message, Options, WireError, OPCODE_DATA};

/// Opcode plus block number preceding the body of a data message.
pub const DATA_PREAMBLE_LEN: usize = 4;

const DEFAULT_BLOCK_SIZE: u16 = 512;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Consecutive receive timeouts tolerated (each one retransmits the last
/// sent datagram) before the peer is declared gone.
const MAX_CONSECUTIVE_TIMEOUTS: u32 = 10;

/// Unexpected-but-tolerable messages (duplicate acks, stale blocks, request
/// retransmissions) accepted within a single block before giving up.
const MAX_REJECTED_PER_BLOCK: u32 = 5;

const BIND_ATTEMPTS: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    ReadAsClient,
    WriteAsClient,
    ReadAsServer,
    WriteAsServer,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("malformed datagram: {0}")]
    Wire(#[from] WireError),
    #[error("peer reported: {0}")]
    Peer(String),
    #[error("peer changed ip/port mid-session")]
    TidMismatch,
    #[error("peer stopped responding")]
    PeerGone,
    #[error("too many unexpected messages, underlying network may be bad")]
    Unstable,
    #[error("block number out of sync")]
    OutOfSync,
    #[error("one or more options contain invalid values")]
    InvalidOptions,
    #[error("session must open with a read or write request")]
    IllegalOpen,
    #[error("unexpected message for the current protocol state")]
    UnexpectedMessage,
    #[error("shutting down")]
    Cancelled,
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("file error: {0}")]
    Io(#[from] io::Error),
}

/// Thin wrapper owning the session's UDP endpoint. Deals in raw bytes so
/// the codec stays free of I/O concerns.
pub struct TftpSocket {
    sock: Async<UdpSocket>,
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> io::Result<TftpSocket> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock.get_ref().local_addr()
    }

    pub async fn send_to(&self, buf: &[u8], peer: SocketAddr) -> io::Result<()> {
        let sent = self.sock.send_to(buf, peer).await?;
        if sent != buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "truncated network send",
            ));
        }
        Ok(())
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.sock.recv_from(buf).await
    }
}

/// Binds to a random high port, retrying on collisions. The chosen port is
/// this end's transfer identifier.
fn bind_ephemeral() -> io::Result<TftpSocket> {
    let mut rng = rand::thread_rng();
    let mut last = None;
    for _ in 0..BIND_ATTEMPTS {
        let port = rng.gen_range(1024..65535);
        match TftpSocket::bind((Ipv4Addr::UNSPECIFIED, port).into()) {
            Ok(socket) => return Ok(socket),
            Err(e) => last = Some(e),
        }
    }
    Err(last.unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrInUse, "no free port")))
}

pub struct Session {
    ctx: CancellationToken,
    socket: TftpSocket,
    peer: SocketAddr,
    role: Option<Role>,

    filename: String,
    mode: String,
    initial_options: Options,
    options: Options,

    block_size: u16,
    timeout: Duration,
    transfer_size: u64,
    block_number: u16,

    send_buf: Vec<u8>,
    recv_buf: Vec<u8>,
    file: Option<File>,
}

impl Session {
    /// Creates a session talking to `peer`. The role is fixed later, by
    /// [`Session::accept`] on the server or by the client entry points.
    pub fn new(ctx: CancellationToken, peer: SocketAddr) -> io::Result<Session> {
        let capacity = DATA_PREAMBLE_LEN + DEFAULT_BLOCK_SIZE as usize;
        Ok(Session {
            ctx,
            socket: bind_ephemeral()?,
            peer,
            role: None,
            filename: String::new(),
            mode: String::new(),
            initial_options: Options::new(),
            options: Options::new(),
            block_size: DEFAULT_BLOCK_SIZE,
            timeout: DEFAULT_TIMEOUT,
            transfer_size: 0,
            block_number: 0,
            send_buf: Vec::with_capacity(capacity),
            recv_buf: vec![0; capacity],
            file: None,
        })
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// The transfer mode the peer asked for. Recorded for logging only;
    /// transfers are byte-exact regardless.
    pub fn mode(&self) -> &str {
        &self.mode
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn transfer_size(&self) -> u64 {
        self.transfer_size
    }

    /// Interprets the datagram that opened the connection. Only read and
    /// write requests are legal openers.
    pub async fn accept(&mut self, datagram: &[u8]) -> Result<Role, SessionError> {
        let message = match Message::decode(datagram) {
            Ok(message) => message,
            Err(e) => {
                self.send_error(ErrorCode::Undefined, "could not understand opening request")
                    .await;
                return Err(e.into());
            }
        };

        let role = match message {
            Message::Read {
                filename,
                mode,
                options,
            } => {
                self.filename = filename;
                self.mode = mode;
                self.initial_options = options;
                Role::ReadAsServer
            }
            Message::Write {
                filename,
                mode,
                options,
            } => {
                self.filename = filename;
                self.mode = mode;
                self.initial_options = options;
                Role::WriteAsServer
            }
            _ => {
                self.send_error(
                    ErrorCode::IllegalOperation,
                    "session must open with a read or write request",
                )
                .await;
                return Err(SessionError::IllegalOpen);
            }
        };

        self.role = Some(role);
        Ok(role)
    }

    /// Full server-side download: reserve the current committed version,
    /// negotiate options, stream it block by block, release.
    pub async fn read_as_server(&mut self, catalog: &Catalog) -> Result<(), SessionError> {
        self.check_cancelled()?;
        let (upload_started, file) = match catalog.reserve(&self.filename).await {
            Ok(reserved) => reserved,
            Err(e @ CatalogError::NotFound(_)) => {
                let explanation = format!("{} does not exist", self.filename);
                self.send_error(ErrorCode::NoSuchFile, &explanation).await;
                return Err(e.into());
            }
            Err(e) => {
                self.send_error(ErrorCode::Undefined, "unable to open requested file")
                    .await;
                return Err(e.into());
            }
        };
        self.file = Some(file);

        let result = self.serve_read().await;

        // drop the handle before detaching the reservation
        self.file = None;
        if let Err(e) = catalog.release(&self.filename, upload_started).await {
            tracing::warn!(filename = %self.filename, error = %e, "release failed");
        }
        result
    }

    async fn serve_read(&mut self) -> Result<(), SessionError> {
        let proposed = std::mem::take(&mut self.initial_options);
        if let Err(e) = self.update_options(proposed).await {
            self.send_error(
                ErrorCode::Undefined,
                "one or more options contain invalid values",
            )
            .await;
            return Err(e);
        }

        if !self.options.is_empty() {
            let oack = Message::OAck {
                options: self.options.clone(),
            };
            self.send_message(&oack).await?;
            match self.receive().await? {
                Message::Ack { block: 0 } => {}
                Message::Error { explanation, .. } => return Err(SessionError::Peer(explanation)),
                _ => {
                    self.send_error(
                        ErrorCode::Undefined,
                        "expected acknowledgement of the option acknowledgement",
                    )
                    .await;
                    return Err(SessionError::UnexpectedMessage);
                }
            }
        }

        self.resize_buffers();
        self.block_number = 1;
        self.send_data_loop().await
    }

    /// Full server-side upload: negotiate options, acknowledge the
    /// request, prepare a fresh version, receive it, then commit. Any
    /// failure past prepare aborts the version.
    pub async fn write_as_server(&mut self, catalog: &Catalog) -> Result<(), SessionError> {
        self.check_cancelled()?;
        let proposed = std::mem::take(&mut self.initial_options);
        if let Err(e) = self.update_options(proposed).await {
            self.send_error(
                ErrorCode::Undefined,
                "one or more options contain invalid values",
            )
            .await;
            return Err(e);
        }

        if !self.options.is_empty() {
            let oack = Message::OAck {
                options: self.options.clone(),
            };
            self.send_message(&oack).await?;
        } else {
            self.send_message(&Message::Ack { block: 0 }).await?;
        }

        let (upload_started, file) = match catalog.prepare(&self.filename).await {
            Ok(prepared) => prepared,
            Err(e) => {
                self.send_error(ErrorCode::Undefined, "unable to create requested file")
                    .await;
                return Err(e.into());
            }
        };
        self.file = Some(file);
        self.resize_buffers();
        self.block_number = 1;

        let mut result = self.receive_data_loop(None).await;
        if result.is_ok() {
            result = self.flush_file().await;
        }
        self.file = None;

        match result {
            Ok(()) => {
                catalog.commit_upload(&self.filename, upload_started).await?;
                Ok(())
            }
            Err(e) => {
                if let Err(abort_err) = catalog.abort_upload(&self.filename, upload_started).await
                {
                    tracing::warn!(filename = %self.filename, error = %abort_err, "abort failed");
                }
                Err(e)
            }
        }
    }

    /// Client download of `filename` into `destination`. The first server
    /// reply rebinds the peer to the server's ephemeral port and may be
    /// either an option acknowledgement or the first data block.
    pub async fn read_as_client(
        &mut self,
        filename: &str,
        options: Options,
        destination: &Path,
    ) -> Result<(), SessionError> {
        self.role = Some(Role::ReadAsClient);
        self.filename = filename.to_string();
        self.mode = "octet".to_string();

        let request = Message::Read {
            filename: self.filename.clone(),
            mode: self.mode.clone(),
            options,
        };
        self.send_message(&request).await?;

        let mut held = None;
        match self.receive_first().await? {
            Message::OAck { options: accepted } => {
                if let Err(e) = self.update_options(accepted).await {
                    self.send_error(
                        ErrorCode::Undefined,
                        "one or more options contain invalid values",
                    )
                    .await;
                    return Err(e);
                }
                self.send_message(&Message::Ack { block: 0 }).await?;
            }
            // a server that accepted no options answers with data directly
            data @ Message::Data { .. } => held = Some(data),
            Message::Error { explanation, .. } => return Err(SessionError::Peer(explanation)),
            _ => {
                self.send_error(ErrorCode::Undefined, "unexpected reply to read request")
                    .await;
                return Err(SessionError::UnexpectedMessage);
            }
        }

        self.file = Some(File::create(destination).await?);
        self.resize_buffers();
        self.block_number = 1;

        let mut result = self.receive_data_loop(held).await;
        if result.is_ok() {
            result = self.flush_file().await;
        }
        self.file = None;
        result
    }

    /// Client upload of local `source` as `filename` on the server.
    pub async fn write_as_client(
        &mut self,
        filename: &str,
        options: Options,
        source: &Path,
    ) -> Result<(), SessionError> {
        self.role = Some(Role::WriteAsClient);
        self.filename = filename.to_string();
        self.mode = "octet".to_string();

        let request = Message::Write {
            filename: self.filename.clone(),
            mode: self.mode.clone(),
            options,
        };
        self.send_message(&request).await?;

        match self.receive_first().await? {
            Message::OAck { options: accepted } => {
                // accepting the options is implied by sending block 1
                if let Err(e) = self.update_options(accepted).await {
                    self.send_error(
                        ErrorCode::Undefined,
                        "one or more options contain invalid values",
                    )
                    .await;
                    return Err(e);
                }
            }
            Message::Ack { block: 0 } => {}
            Message::Error { explanation, .. } => return Err(SessionError::Peer(explanation)),
            _ => {
                self.send_error(ErrorCode::Undefined, "unexpected reply to write request")
                    .await;
                return Err(SessionError::UnexpectedMessage);
            }
        }

        self.file = Some(File::open(source).await?);
        self.resize_buffers();
        self.block_number = 1;
        let result = self.send_data_loop().await;
        self.file = None;
        result
    }

    /// Validates and installs proposed option values. Unknown and
    /// unsupported keys are dropped silently, as is an out-of-range
    /// `timeout`; an invalid value of any other recognized option fails
    /// the whole negotiation. What remains installed in `self.options` is
    /// the set a server echoes in its option acknowledgement.
    pub async fn update_options(&mut self, proposed: Options) -> Result<(), SessionError> {
        let mut accepted = Options::new();
        for (key, value) in proposed {
            match key.as_str() {
                "blksize" => {
                    let size = parse_option_value(&value)?;
                    if !(8..=65464).contains(&size) {
                        return Err(SessionError::InvalidOptions);
                    }
                    self.block_size = size as u16;
                    accepted.insert(key, value);
                }
                "timeout" => {
                    let seconds = parse_option_value(&value)?;
                    if (1..=255).contains(&seconds) {
                        self.timeout = Duration::from_secs(seconds as u64);
                        accepted.insert(key, value);
                    }
                }
                "tsize" => {
                    let mut size = parse_option_value(&value)?;
                    if size < 0 {
                        return Err(SessionError::InvalidOptions);
                    }
                    if size == 0 {
                        match self.role {
                            // zero asks the server to report the size
                            Some(Role::ReadAsServer) => match &self.file {
                                Some(file) => size = file.metadata().await?.len() as i64,
                                None => return Err(SessionError::InvalidOptions),
                            },
                            Some(Role::WriteAsServer) => {
                                return Err(SessionError::InvalidOptions);
                            }
                            _ => {}
                        }
                    }
                    self.transfer_size = size as u64;
                    accepted.insert(key, size.to_string());
                }
                // multicast and windowsize are recognized but unsupported
                _ => {}
            }
        }
        self.options = accepted;
        Ok(())
    }

    /// Streams the open file to the peer: one data block, one matching
    /// ack, until a block shorter than the negotiated size goes out.
    async fn send_data_loop(&mut self) -> Result<(), SessionError> {
        loop {
            let body_len = match self.read_block().await {
                Ok(len) => len,
                Err(e) => {
                    self.send_error(ErrorCode::Undefined, "failed to read from file")
                        .await;
                    return Err(e);
                }
            };
            self.send_raw().await?;
            self.await_ack().await?;
            if body_len < self.block_size as usize {
                return Ok(());
            }
            self.block_number = self.block_number.wrapping_add(1);
        }
    }

    /// Receives the peer's file: one data block, write, ack, until a
    /// short block arrives. `held` seeds the loop with a data message
    /// that arrived during the handshake.
    async fn receive_data_loop(&mut self, mut held: Option<Message>) -> Result<(), SessionError> {
        loop {
            let body = self.await_data(&mut held).await?;
            let last = body.len() < self.block_size as usize;
            if let Err(e) = self.write_block(&body).await {
                self.send_error(ErrorCode::Undefined, "failed to write to file")
                    .await;
                return Err(e);
            }
            self.send_message(&Message::Ack {
                block: self.block_number,
            })
            .await?;
            if last {
                return Ok(());
            }
            self.block_number = self.block_number.wrapping_add(1);
        }
    }

    /// Waits for the ack of the current block. Duplicate acks, stale
    /// blocks, and retransmitted requests are ignored a bounded number of
    /// times; an ack from the future means the exchange is beyond repair.
    async fn await_ack(&mut self) -> Result<(), SessionError> {
        let mut rejected = 0;
        loop {
            if rejected >= MAX_REJECTED_PER_BLOCK {
                return Err(SessionError::Unstable);
            }
            match self.receive().await? {
                Message::Ack { block } if block == self.block_number => return Ok(()),
                Message::Ack { block } if block > self.block_number => {
                    self.send_error(ErrorCode::Undefined, "block number out of sync")
                        .await;
                    return Err(SessionError::OutOfSync);
                }
                Message::Ack { .. } | Message::Read { .. } | Message::Write { .. } => {
                    rejected += 1;
                }
                Message::Error { explanation, .. } => return Err(SessionError::Peer(explanation)),
                _ => {
                    self.send_error(
                        ErrorCode::Undefined,
                        "unexpected message during established transfer",
                    )
                    .await;
                    return Err(SessionError::UnexpectedMessage);
                }
            }
        }
    }

    async fn await_data(&mut self, held: &mut Option<Message>) -> Result<Vec<u8>, SessionError> {
        let mut rejected = 0;
        loop {
            if rejected >= MAX_REJECTED_PER_BLOCK {
                return Err(SessionError::Unstable);
            }
            let message = match held.take() {
                Some(message) => message,
                None => self.receive().await?,
            };
            match message {
                Message::Data { block, body } if block == self.block_number => return Ok(body),
                Message::Data { block, .. } if block > self.block_number => {
                    self.send_error(ErrorCode::Undefined, "block number out of sync")
                        .await;
                    return Err(SessionError::OutOfSync);
                }
                Message::Data { .. } | Message::Read { .. } | Message::Write { .. } => {
                    rejected += 1;
                }
                Message::Error { explanation, .. } => return Err(SessionError::Peer(explanation)),
                _ => {
                    self.send_error(
                        ErrorCode::Undefined,
                        "unexpected message during established transfer",
                    )
                    .await;
                    return Err(SessionError::UnexpectedMessage);
                }
            }
        }
    }

    /// Builds the current data message in place: preamble first, then the
    /// file read lands directly in the send buffer. Returns the body
    /// length.
    async fn read_block(&mut self) -> Result<usize, SessionError> {
        self.check_cancelled()?;
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::other("no open file to read"))?;

        self.send_buf.clear();
        self.send_buf.extend_from_slice(&[0, OPCODE_DATA]);
        self.send_buf.extend_from_slice(&self.block_number.to_be_bytes());
        self.send_buf
            .resize(DATA_PREAMBLE_LEN + self.block_size as usize, 0);

        let mut filled = 0;
        loop {
            let n = file.read(&mut self.send_buf[DATA_PREAMBLE_LEN + filled..]).await?;
            filled += n;
            if n == 0 || DATA_PREAMBLE_LEN + filled == self.send_buf.len() {
                break;
            }
        }
        self.send_buf.truncate(DATA_PREAMBLE_LEN + filled);
        Ok(filled)
    }

    async fn write_block(&mut self, body: &[u8]) -> Result<(), SessionError> {
        self.check_cancelled()?;
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::other("no open file to write"))?;
        file.write_all(body).await?;
        Ok(())
    }

    async fn flush_file(&mut self) -> Result<(), SessionError> {
        if let Some(file) = self.file.as_mut() {
            file.flush().await?;
        }
        Ok(())
    }

    async fn send_message(&mut self, message: &Message) -> Result<(), SessionError> {
        self.check_cancelled()?;
        message.encode_into(&mut self.send_buf);
        self.socket.send_to(&self.send_buf, self.peer).await?;
        Ok(())
    }

    /// Sends the already-encoded contents of the send buffer.
    async fn send_raw(&mut self) -> Result<(), SessionError> {
        self.check_cancelled()?;
        self.socket.send_to(&self.send_buf, self.peer).await?;
        Ok(())
    }

    /// Error messages are a courtesy: never retransmitted, failures to
    /// send them ignored.
    async fn send_error(&mut self, code: ErrorCode, explanation: &str) {
        let message = Message::Error {
            code,
            explanation: explanation.to_string(),
        };
        message.encode_into(&mut self.send_buf);
        let _ = self.socket.send_to(&self.send_buf, self.peer).await;
    }

    /// Receives the next datagram from the pinned peer. Each timeout
    /// retransmits the last sent datagram before re-arming, up to the
    /// tolerated maximum; datagrams from any other source tuple kill the
    /// session without notifying their sender.
    async fn receive(&mut self) -> Result<Message, SessionError> {
        for attempt in 0..MAX_CONSECUTIVE_TIMEOUTS {
            if attempt > 0 {
                self.send_raw().await?;
            }
            let Some((len, from)) = self.receive_raw().await? else {
                continue;
            };
            if from != self.peer {
                return Err(SessionError::TidMismatch);
            }
            return self.decode_received(len).await;
        }
        Err(SessionError::PeerGone)
    }

    /// Like [`Session::receive`] but for a client's first reply: accepts
    /// any source and pins the peer to it. This is the TID rebinding rule;
    /// the server answers from a fresh port, not the well-known one.
    async fn receive_first(&mut self) -> Result<Message, SessionError> {
        for attempt in 0..MAX_CONSECUTIVE_TIMEOUTS {
            if attempt > 0 {
                self.send_raw().await?;
            }
            let Some((len, from)) = self.receive_raw().await? else {
                continue;
            };
            self.peer = from;
            return self.decode_received(len).await;
        }
        Err(SessionError::PeerGone)
    }

    /// One timed, cancellable receive. `None` means the deadline passed.
    async fn receive_raw(&mut self) -> Result<Option<(usize, SocketAddr)>, SessionError> {
        let received = tokio::select! {
            _ = self.ctx.cancelled() => return Err(SessionError::Cancelled),
            received = timeout(self.timeout, self.socket.recv_from(&mut self.recv_buf)) => received,
        };
        match received {
            Err(_elapsed) => Ok(None),
            Ok(Ok(pair)) => Ok(Some(pair)),
            Ok(Err(e)) => Err(e.into()),
        }
    }

    async fn decode_received(&mut self, len: usize) -> Result<Message, SessionError> {
        match Message::decode(&self.recv_buf[..len]) {
            Ok(message) => Ok(message),
            Err(e) => {
                self.send_error(ErrorCode::Undefined, &e.to_string()).await;
                Err(e.into())
            }
        }
    }

    fn resize_buffers(&mut self) {
        let capacity = DATA_PREAMBLE_LEN + self.block_size as usize;
        self.recv_buf.resize(capacity, 0);
        self.send_buf.reserve(capacity.saturating_sub(self.send_buf.capacity()));
    }

    fn check_cancelled(&self) -> Result<(), SessionError> {
        if self.ctx.is_cancelled() {
            return Err(SessionError::Cancelled);
        }
        Ok(())
    }
}

fn parse_option_value(value: &str) -> Result<i64, SessionError> {
    value
        .parse::<i64>()
        .map_err(|_| SessionError::InvalidOptions)
}
