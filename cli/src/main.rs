use std::{net::SocketAddr, path::PathBuf};

use anyhow::{Context, Result};
use bittorrent::{ClientConfig, MetaInfo, Role, Torrent, TorrentConfig};
use clap::{Parser, ValueEnum};

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum RoleArg {
    Seeder,
    Leecher,
}

impl From<RoleArg> for Role {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Seeder => Role::Seeder,
            RoleArg::Leecher => Role::Leecher,
        }
    }
}

/// Seed or leech a single torrent.
#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to the .torrent metainfo file.
    torrent: PathBuf,

    /// Address to listen for inbound peer connections on.
    #[arg(short, long, default_value = "0.0.0.0:6881")]
    listen: SocketAddr,

    /// Directory downloaded (or seeded) content is read from / written to.
    #[arg(short, long, default_value = "downloads")]
    output: PathBuf,

    /// Role to start in; a leecher flips to seeder automatically on completion.
    #[arg(short, long, value_enum, default_value_t = RoleArg::Leecher)]
    role: RoleArg,

    /// Informative-only download rate cap, in bytes/s.
    #[arg(long)]
    max_download: Option<u64>,

    /// Informative-only upload rate cap, in bytes/s.
    #[arg(long)]
    max_upload: Option<u64>,

    /// Enable verbose (debug-level) logging.
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    let subscriber = tracing_subscriber::fmt().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber).expect("failed to install logging subscriber");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let metainfo = MetaInfo::new(&args.torrent)
        .with_context(|| format!("failed to load torrent file {}", args.torrent.display()))?;

    let config = TorrentConfig {
        output_dir: args.output,
        listen_address: args.listen,
        max_download: args.max_download,
        max_upload: args.max_upload,
        role: args.role.into(),
        ..TorrentConfig::default()
    };

    let mut torrent = Torrent::new(metainfo, ClientConfig::generate(), config)
        .await
        .context("failed to initialize torrent")?;

    torrent.start().await.context("torrent session ended with an error")?;
    Ok(())
}
