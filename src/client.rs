//! Client entry points: one download or one upload per call, driven by
//! the same session engine the server uses.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::session::{Session, SessionError};
use crate::wire::Options;

/// Port the client assumes when the target names none. Matches the
/// server's default bind address.
pub const DEFAULT_PORT: u16 = 8173;

/// Splits `host[:port]/filename` into a resolved server address and the
/// remote filename.
pub fn parse_target(target: &str) -> Result<(SocketAddr, String)> {
    let (host, filename) = target
        .split_once('/')
        .with_context(|| format!("expected host[:port]/filename, got {target}"))?;
    if host.is_empty() || filename.is_empty() {
        bail!("expected host[:port]/filename, got {target}");
    }

    let authority = if host.contains(':') {
        host.to_string()
    } else {
        format!("{host}:{DEFAULT_PORT}")
    };
    let addr = authority
        .to_socket_addrs()
        .with_context(|| format!("unable to resolve {authority}"))?
        .next()
        .with_context(|| format!("{authority} resolved to no addresses"))?;

    Ok((addr, filename.to_string()))
}

/// Downloads `filename` from `server` into `destination`.
pub async fn download(
    ctx: CancellationToken,
    server: SocketAddr,
    filename: &str,
    options: Options,
    destination: &Path,
) -> Result<(), SessionError> {
    let mut session = Session::new(ctx, server)?;
    session.read_as_client(filename, options, destination).await?;
    info!(filename, size = session.transfer_size(), "download complete");
    Ok(())
}

/// Uploads local `source` to `server` under the name `filename`.
pub async fn upload(
    ctx: CancellationToken,
    server: SocketAddr,
    filename: &str,
    options: Options,
    source: &Path,
) -> Result<(), SessionError> {
    let mut session = Session::new(ctx, server)?;
    session.write_as_client(filename, options, source).await?;
    info!(filename, peer = %session.peer(), "upload complete");
    Ok(())
}
