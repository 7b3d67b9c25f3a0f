//! TCP endpoints: the accept loop and the dialer.

use crate::addr::resolve_addr;
use crate::error::{Error, Result};
use crate::stream::Stream;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::timeout;

/// Accept deadline; bounds how long a quit signal can go unobserved.
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(16);

/// Connect timeout for [`dial`].
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Listens on `address` and announces each accepted connection on
/// `clients`.
///
/// The quit channel is polled before every accept; the accept deadline
/// bounds the reaction latency. A fatal error is reported as one `Err` on
/// `clients` before the task returns.
pub async fn listen(
    address: String,
    clients: mpsc::Sender<Result<Stream>>,
    mut quit: mpsc::Receiver<()>,
) {
    let listener = match bind(&address).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("tcp listen error, {}", e);
            let _ = clients.send(Err(e)).await;
            return;
        }
    };

    loop {
        match quit.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => return,
            Err(TryRecvError::Empty) => {}
        }

        match timeout(ACCEPT_TIMEOUT, listener.accept()).await {
            Err(_) => continue,
            Ok(Err(e)) => {
                tracing::error!("tcp listen error, {}", e);
                let _ = clients.send(Err(e.into())).await;
                return;
            }
            Ok(Ok((stream, peer))) => {
                if clients.send(Ok(Stream::tcp(stream, peer))).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn bind(address: &str) -> Result<TcpListener> {
    let addr = resolve_addr(address).await?;
    Ok(TcpListener::bind(addr).await?)
}

/// Dials `address` with the connect timeout. Retrying is the caller's
/// policy.
pub async fn dial(address: &str) -> Result<Stream> {
    let addr = resolve_addr(address).await?;
    let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::DialTimeout)??;
    Ok(Stream::tcp(stream, addr))
}
