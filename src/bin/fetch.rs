use clap::Parser;
use rustdash::client::Client;
use rustdash::transmit::diagnostic_marker;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::time::Instant;
use tracing::{info, warn};

/// Requests a sequence of segments from a rustdash server, one after the other.
#[derive(Parser, Debug)]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:9")]
    addr: SocketAddr,

    /// Segment sizes in bytes, comma separated
    #[arg(short, long, value_delimiter = ',', conflicts_with = "size_file")]
    sizes: Vec<u64>,

    /// File with one segment size in bytes per line
    #[arg(short = 'f', long)]
    size_file: Option<PathBuf>,
}

fn read_sizes(path: &Path) -> rustdash::Result<Vec<u64>> {
    let content = std::fs::read_to_string(path)?;

    let sizes = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.parse::<u64>()
                .map_err(|e| format!("invalid segment size {:?}: {}", line, e))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(sizes)
}

#[tokio::main]
async fn main() -> rustdash::Result<()> {
    tracing_subscriber::fmt().init();

    let args = Args::parse();
    let sizes = match &args.size_file {
        Some(path) => read_sizes(path)?,
        None => args.sizes,
    };

    let mut client = Client::connect(args.addr).await?;
    info!("Connected to {}", args.addr);

    for (index, size) in sizes.iter().enumerate() {
        let started = Instant::now();
        let segment = client.fetch(*size).await?;
        let elapsed = started.elapsed();

        let marker = diagnostic_marker(index as u64);
        if segment.iter().any(|&b| b != marker) {
            warn!("Segment {} does not carry marker {:#04x}", index, marker);
        }

        let kbps = (*size as f64 * 8.0) / elapsed.as_secs_f64().max(f64::EPSILON) / 1000.0;
        info!(
            "Segment {}: {} bytes in {:?} ({:.0} kbit/s)",
            index, size, elapsed, kbps
        );
    }

    client.close().await?;
    info!("Fetched {} segments", sizes.len());

    Ok(())
}
