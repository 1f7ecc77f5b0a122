use clap::Parser;
use rustdash::config::{Config, DEFAULT_PORT, DEFAULT_SEND_WINDOW};
use rustdash::codec::MAX_REQUEST_LEN;
use rustdash::{server, Error};
use std::net::IpAddr;

#[derive(Parser, Debug)]
struct Args {
    /// The port to listen on
    #[arg(short, long, env = "RUSTDASH_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Addresses to listen on [default: 0.0.0.0 and ::]
    #[arg(short, long)]
    bind: Vec<IpAddr>,

    /// Largest number of bytes handed to the socket in a single write
    #[arg(long, default_value_t = DEFAULT_SEND_WINDOW)]
    send_window: usize,

    /// Longest accepted request, in bytes
    #[arg(long, default_value_t = MAX_REQUEST_LEN)]
    max_request_len: usize,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    let mut config = Config::new(args.port)
        .send_window(args.send_window)
        .max_request_len(args.max_request_len);
    if !args.bind.is_empty() {
        config = config.bind(args.bind);
    }

    server::run(config).await
}
