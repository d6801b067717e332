//! tftpvd: TFTP daemon serving a rooted directory with atomic
//! multi-version overwrites.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use tftpv::catalog::Catalog;
use tftpv::exit;
use tftpv::logger::{self, LogConfig};
use tftpv::root::RootDir;
use tftpv::server::Listener;
use tftpv::sweeper;

const DEFAULT_ADDRESS: &str = "127.0.0.1:8173";

#[derive(Parser, Debug)]
#[command(
    name = "tftpvd",
    version,
    about = "TFTP daemon with atomic multi-version overwrites",
    after_help = "With no address argument the daemon binds to 127.0.0.1:8173."
)]
struct Args {
    /// Root directory of served files
    #[arg(long, default_value = ".")]
    directory: PathBuf,

    /// SQLite database holding the version catalog
    #[arg(long = "sqlite-db", default_value = "tftpvd.db")]
    sqlite_db: PathBuf,

    /// Append info and warn events to this file instead of stdout
    #[arg(long, value_name = "FILE")]
    normal_log: Option<PathBuf>,

    /// Append debug events to this file instead of stderr
    #[arg(long, value_name = "FILE")]
    debug_log: Option<PathBuf>,

    /// Append error events to this file instead of stderr
    #[arg(long, value_name = "FILE")]
    error_log: Option<PathBuf>,

    /// Log protocol-level detail
    #[arg(long)]
    debug: bool,

    /// Address to serve on
    #[arg(value_name = "HOST[:PORT]", default_value = DEFAULT_ADDRESS)]
    address: String,
}

fn resolve_address(address: &str) -> Result<SocketAddr> {
    let authority = if address.contains(':') {
        address.to_string()
    } else {
        format!("{address}:8173")
    };
    authority
        .to_socket_addrs()
        .with_context(|| format!("unable to resolve {authority}"))?
        .next()
        .with_context(|| format!("{authority} resolved to no addresses"))
}

#[tokio::main]
async fn main() {
    let code = run().await;
    std::process::exit(code);
}

async fn run() -> i32 {
    let args = Args::parse();

    let log_config = LogConfig {
        debug: args.debug,
        normal_log: args.normal_log.clone(),
        debug_log: args.debug_log.clone(),
        error_log: args.error_log.clone(),
    };
    let guards = match logger::init(&log_config) {
        Ok(guards) => guards,
        Err(e) => {
            eprintln!("logger setup failed: {e:#}");
            return exit::LOGGER_INIT;
        }
    };

    let address = match resolve_address(&args.address) {
        Ok(address) => address,
        Err(e) => {
            error!("bad listen address: {e:#}");
            return exit::CONFIG;
        }
    };
    let root = match RootDir::open(&args.directory) {
        Ok(root) => root,
        Err(e) => {
            error!(directory = %args.directory.display(), error = %e, "unable to open root directory");
            return exit::CONFIG;
        }
    };
    info!(directory = %root.path().display(), "ready to serve root directory");

    let catalog = match Catalog::open(&args.sqlite_db, root).await {
        Ok(catalog) => catalog,
        Err(e) => {
            error!(database = %args.sqlite_db.display(), error = %e, "catalog setup failed");
            return exit::CATALOG_INIT;
        }
    };
    info!(database = %args.sqlite_db.display(), "catalog ready for access");

    let ctx = CancellationToken::new();
    let listener = match Listener::bind(address, catalog.clone(), ctx.clone()) {
        Ok(listener) => listener,
        Err(e) => {
            error!(%address, error = %e, "unable to bind server socket");
            return exit::SERVER_INIT;
        }
    };

    let sweeper_task = tokio::spawn(sweeper::run(catalog, ctx.clone()));
    let mut listener_task = tokio::spawn(listener.run());
    println!("Press Control-C (^C) to exit!");

    let code = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            ctx.cancel();
            match (&mut listener_task).await {
                Ok(Ok(())) => exit::OK,
                Ok(Err(e)) => {
                    error!("listener failed during shutdown: {e:#}");
                    exit::LISTENER_FAILURE
                }
                Err(e) => {
                    error!(error = %e, "listener task died");
                    exit::LISTENER_FAILURE
                }
            }
        }
        joined = &mut listener_task => {
            ctx.cancel();
            match joined {
                Ok(Ok(())) => exit::OK,
                Ok(Err(e)) => {
                    error!("listener failed: {e:#}");
                    exit::LISTENER_FAILURE
                }
                Err(e) => {
                    error!(error = %e, "listener task died");
                    exit::LISTENER_FAILURE
                }
            }
        }
    };

    // sweeper runs its final pass once the token is cancelled
    let _ = sweeper_task.await;
    drop(guards);
    code
}
