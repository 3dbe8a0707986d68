//! Accept-loop glue: serve a back-end to every connection on a listener.

use std::env;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;

use crate::error;
use crate::fsys::Fsys;
use crate::logger::Logger;
use crate::server::serve;

/// Serves `fs` to every connection accepted on the TCP address `addr`.
/// Runs until the listener fails.
pub async fn serve_tcp<FS: Fsys>(
    logger: Arc<dyn Logger + Send + Sync>,
    fs: Arc<FS>,
    addr: &str,
) -> io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    loop {
        let (conn, peer) = listener.accept().await?;
        let logger = logger.clone();
        let fs = fs.clone();
        tokio::spawn(async move {
            if let Err(e) = serve(logger.clone(), fs, conn).await {
                error!(logger, "9p: serve error on {}: {}", peer, e);
            }
        });
    }
}

/// Serves `fs` on a Unix-domain socket bound at `path`.
#[cfg(unix)]
pub async fn serve_unix<FS: Fsys>(
    logger: Arc<dyn Logger + Send + Sync>,
    fs: Arc<FS>,
    path: impl AsRef<Path>,
) -> io::Result<()> {
    let listener = UnixListener::bind(path)?;
    loop {
        let (conn, _) = listener.accept().await?;
        let logger = logger.clone();
        let fs = fs.clone();
        tokio::spawn(async move {
            if let Err(e) = serve(logger.clone(), fs, conn).await {
                error!(logger, "9p: serve error: {}", e);
            }
        });
    }
}

/// Serves `fs` on the socket `<namespace()>/<name>`, creating the
/// namespace directory if needed.
#[cfg(unix)]
pub async fn serve_local<FS: Fsys>(
    logger: Arc<dyn Logger + Send + Sync>,
    fs: Arc<FS>,
    name: &str,
) -> io::Result<()> {
    if name.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "9p server name is empty",
        ));
    }
    let dir = namespace();
    std::fs::create_dir_all(&dir)?;
    serve_unix(logger, fs, dir.join(name)).await
}

/// The per-user namespace directory: `$NAMESPACE` if set, otherwise
/// `/tmp/ns.$USER.$DISPLAY` following the plan9port convention.
pub fn namespace() -> PathBuf {
    if let Ok(ns) = env::var("NAMESPACE") {
        return PathBuf::from(ns);
    }
    let user = env::var("USER").unwrap_or_else(|_| "none".to_owned());
    let display = env::var("DISPLAY").unwrap_or_else(|_| ":0".to_owned());
    PathBuf::from(format!("/tmp/ns.{}.{}", user, display))
}
