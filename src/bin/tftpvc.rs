//! tftpvc: TFTP client. Downloads by default, uploads with --write.

use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::error;

use tftpv::client;
use tftpv::exit;
use tftpv::logger::{self, LogConfig};
use tftpv::wire::Options;

#[derive(Parser, Debug)]
#[command(
    name = "tftpvc",
    version,
    about = "TFTP client for servers with multi-version overwrites",
    after_help = "With no port in the target the client connects to port 8173."
)]
struct Args {
    /// Upload this local file instead of downloading
    #[arg(long, value_name = "FILE")]
    write: Option<PathBuf>,

    /// Log protocol-level detail
    #[arg(long)]
    debug: bool,

    /// Server and remote filename
    #[arg(value_name = "HOST[:PORT]/FILENAME")]
    target: String,
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
        ..LogConfig::default()
    };
    let guards = match logger::init(&log_config) {
        Ok(guards) => guards,
        Err(e) => {
            eprintln!("logger setup failed: {e:#}");
            return exit::LOGGER_INIT;
        }
    };

    let (server, filename) = match client::parse_target(&args.target) {
        Ok(parsed) => parsed,
        Err(e) => {
            error!("bad target: {e:#}");
            return exit::CONFIG;
        }
    };

    let ctx = CancellationToken::new();
    let interrupt = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let code = match args.write {
        Some(source) => {
            match client::upload(ctx, server, &filename, Options::new(), &source).await {
                Ok(()) => exit::OK,
                Err(e) => {
                    error!(%filename, error = %e, "upload failed");
                    exit::UPLOAD_FAILED
                }
            }
        }
        None => {
            // ask the server to report the transfer size up front
            let mut options = Options::new();
            options.insert("tsize".to_string(), "0".to_string());
            let destination = PathBuf::from(&filename);
            match client::download(ctx, server, &filename, options, &destination).await {
                Ok(()) => exit::OK,
                Err(e) => {
                    error!(%filename, error = %e, "download failed");
                    exit::DOWNLOAD_FAILED
                }
            }
        }
    };

    drop(guards);
    code
}
