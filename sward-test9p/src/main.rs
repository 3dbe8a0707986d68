//! Serves a small read-only demo tree over 9P2000, either on a TCP
//! address or on a socket in the per-user namespace directory.  Useful
//! for poking at the server with a real 9P client.

use std::collections::BTreeMap;
use std::process;
use std::sync::Arc;

use clap::Parser;

use sward_9p::listen;
use sward_9p::logger::{LogLevel, Logger, StderrLogger};
use sward_9p::staticfs::{open_bytes, Entry, Params, StaticFid, StaticFsys};

#[derive(Parser)]
#[command(name = "test9p", about = "serve a demo tree over 9P2000")]
struct Cli {
    /// TCP address to listen on instead of a namespace socket.
    #[arg(long, conflicts_with = "name")]
    addr: Option<String>,

    /// Socket name within the per-user namespace directory.
    #[arg(long, default_value = "test9p")]
    name: String,

    /// Increase logging; repeat for protocol traces.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn demo_tree() -> BTreeMap<String, Entry<Vec<u8>>> {
    BTreeMap::from([
        ("foo".to_owned(), Entry::file(b"bar".to_vec())),
        (
            "info".to_owned(),
            Entry::dir([
                ("version".to_owned(), Entry::file(b"something new".to_vec())),
                ("other".to_owned(), Entry::file(vec![b'a'; 1024 * 1024])),
            ]),
        ),
    ])
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => LogLevel::Error,
        1 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };
    let logger = Arc::new(StderrLogger::new(level)) as Arc<dyn Logger + Send + Sync>;
    let fs = StaticFsys::new(Params {
        root: demo_tree(),
        opener: Box::new(|f: &StaticFid<(), Vec<u8>>| Ok(open_bytes(f.content().clone()))),
        context_for_attach: Some(Box::new(|_, _| Ok(()))),
        uid: None,
        gid: None,
    })
    .unwrap_or_else(|e| {
        eprintln!("test9p: {}", e);
        process::exit(1);
    });
    let fs = Arc::new(fs);

    let result = match &cli.addr {
        Some(addr) => listen::serve_tcp(logger, fs, addr).await,
        None => serve_namespace(logger, fs, &cli.name).await,
    };
    if let Err(e) = result {
        eprintln!("test9p: serve failed: {}", e);
        process::exit(1);
    }
}

#[cfg(unix)]
async fn serve_namespace(
    logger: Arc<dyn Logger + Send + Sync>,
    fs: Arc<StaticFsys<(), Vec<u8>>>,
    name: &str,
) -> std::io::Result<()> {
    listen::serve_local(logger, fs, name).await
}

#[cfg(not(unix))]
async fn serve_namespace(
    _logger: Arc<dyn Logger + Send + Sync>,
    _fs: Arc<StaticFsys<(), Vec<u8>>>,
    _name: &str,
) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "namespace sockets need a Unix platform; use --addr",
    ))
}
