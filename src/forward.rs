//! The forwarding session: controller, launch dispatch, and the three mode
//! drivers.
//!
//! A session runs exactly one driver. Endpoint pairs are handed to the
//! splicer as they form; the drivers own the pairing policy, the reconnect
//! backoff, and the first-message priming of Conn<=>Conn.

use crate::cli::{Cli, Protocol, SockMethod, SockSpec};
use crate::error::{Error, Result};
use crate::splice::{self, COPY_BUFFER_SIZE};
use crate::stream::Stream;
use crate::{tcp, udp};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

/// Stop channel capacity: one external shutdown plus a self-initiated stop
/// from each listener-backed side.
const STOP_CAPACITY: usize = 3;

/// Backoff before retrying a failed dial in Conn<=>Conn.
const RETRY_BACKOFF: Duration = Duration::from_secs(16);

/// How long Listen<=>Listen holds an unpaired connection before giving up
/// on its partner.
const RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(120);

/// Launch configuration for one forwarding session.
#[derive(Debug, Clone)]
pub struct ForwardArgs {
    pub protocol: Protocol,
    pub sock1: SockSpec,
    pub sock2: SockSpec,
}

impl From<&Cli> for ForwardArgs {
    fn from(cli: &Cli) -> Self {
        Self {
            protocol: cli.proto,
            sock1: cli.sock1.clone(),
            sock2: cli.sock2.clone(),
        }
    }
}

/// Owns the session-wide stop channel and dispatches to the mode driver
/// selected by the arguments.
///
/// The same channel carries external [`shutdown`](Controller::shutdown)
/// requests and self-initiated stops from a driver that observed a fatal
/// endpoint failure. It is bounded and sends never block; a full channel
/// already carries the signal.
pub struct Controller {
    stop_tx: mpsc::Sender<()>,
    stop_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl Controller {
    pub fn new() -> Self {
        let (stop_tx, stop_rx) = mpsc::channel(STOP_CAPACITY);
        Self {
            stop_tx,
            stop_rx: Mutex::new(Some(stop_rx)),
        }
    }

    /// Requests termination of the active driver. Safe to call from any
    /// task, any number of times.
    pub fn shutdown(&self) {
        let _ = self.stop_tx.try_send(());
    }

    /// Runs the forwarding session to completion.
    pub async fn launch(&self, args: ForwardArgs) -> Result<()> {
        let stop_rx = self
            .stop_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| Error::Config("forwarder already launched".to_string()))?;
        let stop_tx = self.stop_tx.clone();

        let proto = args.protocol;
        match (args.sock1.method, args.sock2.method) {
            (SockMethod::Conn, SockMethod::Conn) => {
                conn_conn(proto, &args.sock1.addr, &args.sock2.addr, stop_rx).await
            }
            (SockMethod::Conn, SockMethod::Listen) => {
                listen_conn(proto, &args.sock2.addr, &args.sock1.addr, stop_tx, stop_rx).await
            }
            (SockMethod::Listen, SockMethod::Conn) => {
                listen_conn(proto, &args.sock1.addr, &args.sock2.addr, stop_tx, stop_rx).await
            }
            (SockMethod::Listen, SockMethod::Listen) => {
                listen_listen(proto, &args.sock1.addr, &args.sock2.addr, stop_tx, stop_rx).await
            }
        }
        Ok(())
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

async fn dial(proto: Protocol, address: &str) -> Result<Stream> {
    match proto {
        Protocol::Tcp => tcp::dial(address).await,
        Protocol::Udp => udp::dial(address).await,
    }
}

fn spawn_listener(
    proto: Protocol,
    address: String,
    clients: mpsc::Sender<Result<Stream>>,
    quit: mpsc::Receiver<()>,
) {
    match proto {
        Protocol::Tcp => {
            tokio::spawn(tcp::listen(address, clients, quit));
        }
        Protocol::Udp => {
            tokio::spawn(udp::listen(address, clients, quit));
        }
    }
}

/// "Conn<=>Conn" mode: dial both sides outward and splice.
///
/// B is dialed only after A has produced its first message, so a live A is
/// proven before the B-side connection is spent; the captured message is
/// replayed to B ahead of any other traffic.
async fn conn_conn(proto: Protocol, addr1: &str, addr2: &str, mut stop_rx: mpsc::Receiver<()>) {
    let mut id: u64 = 1;

    loop {
        if stop_rx.try_recv().is_ok() {
            return;
        }

        tracing::info!("dial A point with sock1 [{}]", addr1);
        let mut sock1 = match dial(proto, addr1).await {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("{}", e);
                sleep(RETRY_BACKOFF).await;
                continue;
            }
        };
        tracing::info!("A point(sock1) is ready");

        // Wait for the first message sent by the A point.
        let mut first = vec![0u8; COPY_BUFFER_SIZE];
        let n = match sock1.read(&mut first).await {
            Ok(0) => {
                tracing::error!("A point: {}", Error::Closed);
                continue;
            }
            Ok(n) => n,
            Err(e) => {
                tracing::error!("A point: {}", e);
                continue;
            }
        };

        tracing::info!("dial B point with sock2 [{}]", addr2);
        let mut sock2 = match dial(proto, addr2).await {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("{}", e);
                sleep(RETRY_BACKOFF).await;
                continue;
            }
        };
        tracing::info!("B point(sock2) is ready");

        // Replay the captured first message ahead of any other traffic.
        if let Err(e) = sock2.write(&first[..n]).await {
            tracing::error!("B point: {}", e);
            continue;
        }

        tokio::spawn(splice::splice(id, sock1, sock2));
        id += 1;
    }
}

/// "Listen<=>Conn" mode: accept on one side, dial the other per client.
async fn listen_conn(
    proto: Protocol,
    addr1: &str,
    addr2: &str,
    stop_tx: mpsc::Sender<()>,
    mut stop_rx: mpsc::Receiver<()>,
) {
    let (clients_tx, mut clients_rx) = mpsc::channel(1);
    let (quit_tx, quit_rx) = mpsc::channel(1);
    tracing::info!("listen A point with sock1 [{}]", addr1);
    spawn_listener(proto, addr1.to_string(), clients_tx, quit_rx);

    let mut listener_gone = false;
    let mut id: u64 = 1;

    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                let _ = quit_tx.try_send(());
                return;
            }
            event = clients_rx.recv(), if !listener_gone => {
                let sock1 = match event {
                    Some(Ok(s)) => s,
                    Some(Err(_)) => {
                        // Fatal endpoint failure; stop the whole session.
                        let _ = stop_tx.try_send(());
                        continue;
                    }
                    None => {
                        listener_gone = true;
                        let _ = stop_tx.try_send(());
                        continue;
                    }
                };
                tracing::info!("A point(link{}) [{}] is ready", id, sock1.remote_addr());

                tracing::info!("dial B point with sock2 [{}]", addr2);
                let sock2 = match dial(proto, addr2).await {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::error!("{}", e);
                        continue;
                    }
                };
                tracing::info!("B point(sock2) is ready");

                tokio::spawn(splice::splice(id, sock1, sock2));
                id += 1;
            }
        }
    }
}

/// "Listen<=>Listen" mode: accept on both sides independently and pair
/// arrivals in FIFO order.
///
/// An unpaired connection is held until its partner arrives; if none does
/// within the rendezvous window, both holders are released and the client
/// has to reconnect.
async fn listen_listen(
    proto: Protocol,
    addr1: &str,
    addr2: &str,
    stop_tx: mpsc::Sender<()>,
    mut stop_rx: mpsc::Receiver<()>,
) {
    let (clients1_tx, mut clients1_rx) = mpsc::channel(1);
    let (quit1_tx, quit1_rx) = mpsc::channel(1);
    tracing::info!("listen A point with sock1 [{}]", addr1);
    spawn_listener(proto, addr1.to_string(), clients1_tx, quit1_rx);

    let (clients2_tx, mut clients2_rx) = mpsc::channel(1);
    let (quit2_tx, quit2_rx) = mpsc::channel(1);
    tracing::info!("listen B point with sock2 [{}]", addr2);
    spawn_listener(proto, addr2.to_string(), clients2_tx, quit2_rx);

    let mut listener1_gone = false;
    let mut listener2_gone = false;
    let mut sock1: Option<Stream> = None;
    let mut sock2: Option<Stream> = None;
    let mut id: u64 = 1;

    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                let _ = quit1_tx.try_send(());
                let _ = quit2_tx.try_send(());
                return;
            }
            event = clients1_rx.recv(), if !listener1_gone => {
                match event {
                    Some(Ok(s)) => {
                        tracing::info!("A point(link{}) [{}] is ready", id, s.remote_addr());
                        sock1 = Some(s);
                    }
                    Some(Err(_)) => {
                        let _ = stop_tx.try_send(());
                        continue;
                    }
                    None => {
                        listener1_gone = true;
                        let _ = stop_tx.try_send(());
                        continue;
                    }
                }
            }
            event = clients2_rx.recv(), if !listener2_gone => {
                match event {
                    Some(Ok(s)) => {
                        tracing::info!("B point(link{}) [{}] is ready", id, s.remote_addr());
                        sock2 = Some(s);
                    }
                    Some(Err(_)) => {
                        let _ = stop_tx.try_send(());
                        continue;
                    }
                    None => {
                        listener2_gone = true;
                        let _ = stop_tx.try_send(());
                        continue;
                    }
                }
            }
            _ = sleep(RENDEZVOUS_TIMEOUT) => {
                // The partner never showed; release whatever is held.
                tracing::warn!("socket wait timeout, reset");
                sock1 = None;
                sock2 = None;
                continue;
            }
        }

        if sock1.is_some() && sock2.is_some() {
            if let (Some(s1), Some(s2)) = (sock1.take(), sock2.take()) {
                tokio::spawn(splice::splice(id, s1, s2));
                id += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_is_repeatable() {
        let controller = Controller::new();
        controller.shutdown();
        controller.shutdown();
        controller.shutdown();
        controller.shutdown();
    }

    #[tokio::test]
    async fn test_launch_twice_is_config_error() {
        let controller = Controller::new();
        controller.shutdown();

        let args = ForwardArgs {
            protocol: Protocol::Tcp,
            sock1: SockSpec {
                method: SockMethod::Conn,
                addr: "127.0.0.1:1".to_string(),
            },
            sock2: SockSpec {
                method: SockMethod::Conn,
                addr: "127.0.0.1:2".to_string(),
            },
        };

        // First launch observes the pending stop and returns cleanly.
        controller.launch(args.clone()).await.unwrap();
        assert!(matches!(
            controller.launch(args).await,
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_forward_args_from_cli() {
        use clap::Parser;

        let cli = Cli::try_parse_from([
            "portforward",
            "udp",
            "listen:127.0.0.1:5353",
            "conn:8.8.8.8:53",
        ])
        .unwrap();
        let args = ForwardArgs::from(&cli);
        assert_eq!(args.protocol, Protocol::Udp);
        assert_eq!(args.sock1.method, SockMethod::Listen);
        assert_eq!(args.sock2.addr, "8.8.8.8:53");
    }
}
