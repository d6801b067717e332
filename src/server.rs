//! Listener: owns the well-known UDP socket, reads datagrams, and spawns
//! one session per opening request. It never interprets the bytes itself;
//! everything protocol-shaped happens inside the session task.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::catalog::Catalog;
use crate::session::{Role, Session, SessionError, TftpSocket};

/// Largest possible in-transit TFTP datagram.
const MAX_DATAGRAM: usize = 0xffff;

/// Receive deadline, so the termination token is polled between reads.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct Listener {
    socket: TftpSocket,
    catalog: Catalog,
    ctx: CancellationToken,
}

impl Listener {
    pub fn bind(addr: SocketAddr, catalog: Catalog, ctx: CancellationToken) -> io::Result<Listener> {
        Ok(Listener {
            socket: TftpSocket::bind(addr)?,
            catalog,
            ctx,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Accept loop. Returns when the shared token is cancelled (after all
    /// sessions have finished) or fails if the socket dies underneath us.
    pub async fn run(self) -> Result<()> {
        let mut incoming = vec![0u8; MAX_DATAGRAM];
        let mut sessions = JoinSet::new();
        info!(address = %self.local_addr()?, "server ready");

        let result = loop {
            if self.ctx.is_cancelled() {
                break Ok(());
            }

            let received = timeout(POLL_INTERVAL, self.socket.recv_from(&mut incoming)).await;

            // reap whatever finished since the last datagram
            while sessions.try_join_next().is_some() {}

            let (len, peer) = match received {
                Err(_elapsed) => continue,
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => {
                    error!(error = %e, "listener socket failed");
                    self.ctx.cancel();
                    break Err(e.into());
                }
            };

            let datagram = incoming[..len].to_vec();
            sessions.spawn(session_task(
                self.ctx.clone(),
                self.catalog.clone(),
                peer,
                datagram,
            ));
        };

        info!(active = sessions.len(), "waiting for sessions to finish");
        while sessions.join_next().await.is_some() {}
        result
    }
}

/// One complete server-side transfer, from opening datagram to catalog
/// cleanup. Errors stay local to the session; nothing here can take the
/// listener down.
async fn session_task(
    ctx: CancellationToken,
    catalog: Catalog,
    peer: SocketAddr,
    datagram: Vec<u8>,
) {
    let mut session = match Session::new(ctx, peer) {
        Ok(session) => session,
        Err(e) => {
            error!(%peer, error = %e, "unable to create session");
            return;
        }
    };

    let role = match session.accept(&datagram).await {
        Ok(role) => role,
        Err(e) => {
            error!(%peer, error = %e, "rejected opening request");
            return;
        }
    };

    let outcome = match role {
        Role::ReadAsServer => {
            info!(%peer, filename = %session.filename(), mode = %session.mode(), "client began download");
            session.read_as_server(&catalog).await
        }
        Role::WriteAsServer => {
            info!(%peer, filename = %session.filename(), mode = %session.mode(), "client began upload");
            session.write_as_server(&catalog).await
        }
        Role::ReadAsClient | Role::WriteAsClient => return,
    };

    match outcome {
        Ok(()) => {
            info!(%peer, filename = %session.filename(), "transfer complete");
        }
        Err(SessionError::Cancelled) => {
            info!(%peer, filename = %session.filename(), "session ended by shutdown");
        }
        Err(e) => {
            error!(%peer, filename = %session.filename(), error = %e, "transfer failed");
        }
    }
}
