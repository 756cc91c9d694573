//! # Network Transports
//!
//! TCP services backing the Wi-Fi side of the probe: GDB RSP on port 2345
//! and raw UART passthrough on port 4444. Both are unauthenticated,
//! single-client, raw byte streams; framing belongs to the protocol cores.
//!
//! The GDB service claims the shared session on accept and refuses clients
//! while another transport holds it. Backpressure toward a fast debugger is
//! a 10 ms poll while the receive queue lacks room for a full RSP packet;
//! keepalive probes (5 s idle, 5 s interval, 3 retries) reap half-open
//! connections from dropped Wi-Fi links.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use thiserror::Error;

use crate::channel::GdbChannel;
use crate::session::GdbSession;
use crate::traits::{TransportTx, UartPort};
use crate::GDB_PACKET_SIZE;

const KEEPALIVE: Duration = Duration::from_secs(5);
const KEEPALIVE_RETRIES: u32 = 3;

/// Poll interval while the receive queue has no room for a full packet.
const BACKPRESSURE_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum NetError {
    #[error("failed to bind TCP port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },
}

/// Transmit sink for the currently connected TCP client, if any.
///
/// TCP needs no coalescing flush of its own; with `TCP_NODELAY` each send
/// goes out as written, so the flush flag is ignored. Sends while no client
/// is attached are discarded, matching a serial port with nothing listening.
pub struct NetTx {
    stream: Mutex<Option<TcpStream>>,
}

impl NetTx {
    pub fn new() -> Self {
        Self {
            stream: Mutex::new(None),
        }
    }

    fn attach(&self, stream: TcpStream) {
        *self.stream.lock().unwrap_or_else(PoisonError::into_inner) = Some(stream);
    }

    fn detach(&self) {
        *self.stream.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl Default for NetTx {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportTx for NetTx {
    fn send(&self, data: &[u8], _flush: bool) {
        let mut guard = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(stream) = guard.as_mut() {
            if let Err(err) = stream.write_all(data) {
                warn!("TCP send failed, detaching client: {err}");
                *guard = None;
            }
        }
    }
}

fn bind_listener(port: u16) -> Result<TcpListener, NetError> {
    let make = || -> io::Result<TcpListener> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        let addr: SocketAddr = ([0u8, 0, 0, 0], port).into();
        socket.bind(&addr.into())?;
        // Single debugger: one pending connection at most, the rest are
        // refused by the stack.
        socket.listen(1)?;
        Ok(socket.into())
    };
    make().map_err(|source| NetError::Bind { port, source })
}

fn tune_client(stream: &TcpStream) {
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE)
        .with_interval(KEEPALIVE)
        .with_retries(KEEPALIVE_RETRIES);
    if let Err(err) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        warn!("keepalive setup failed: {err}");
    }
    if let Err(err) = stream.set_nodelay(true) {
        warn!("TCP_NODELAY setup failed: {err}");
    }
}

/// TCP GDB RSP service. One client at a time, sharing the session with the
/// USB-CDC transport through the channel's tracker.
pub struct GdbServer {
    listener: TcpListener,
    channel: Arc<GdbChannel>,
    net_tx: Arc<NetTx>,
}

impl GdbServer {
    /// Bind the service and register its transmit sink with the channel.
    /// Pass port 0 to let the stack pick one (tests).
    pub fn bind(channel: Arc<GdbChannel>, port: u16) -> Result<Self, NetError> {
        let listener = bind_listener(port)?;
        let net_tx = Arc::new(NetTx::new());
        channel.set_net_tx(net_tx.clone());
        Ok(Self {
            listener,
            channel,
            net_tx,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop; runs on its own thread for the process lifetime.
    ///
    /// Single-threaded: the accepted client is served inline, so while a
    /// debugger is attached further clients sit in the OS listen backlog
    /// (one deep) and attach when the first disconnects. The activation CAS
    /// only fails for a client raced against an active USB session; that
    /// client gets an immediate close.
    pub fn serve(&self) {
        loop {
            let (stream, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!("GDB accept failed: {err}");
                    continue;
                }
            };
            if let Err(busy) = self
                .channel
                .session()
                .try_activate(GdbSession::ActiveOverNetwork)
            {
                warn!("GDB client {peer} refused, session {:?} active", busy.active);
                continue;
            }
            self.run_client(stream, peer);
        }
    }

    fn run_client(&self, mut stream: TcpStream, peer: SocketAddr) {
        info!("GDB client connected from {peer}");
        tune_client(&stream);
        match stream.try_clone() {
            Ok(writer) => self.net_tx.attach(writer),
            Err(err) => warn!("socket clone failed, rx only: {err}"),
        }

        let mut buf = [0u8; GDB_PACKET_SIZE];
        loop {
            // Backpressure: do not read from the socket until a whole
            // packet fits in the queue. TCP receive windows stall the
            // debugger for us.
            while !self.channel.can_receive() {
                thread::sleep(BACKPRESSURE_POLL);
            }
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => self.channel.receive_blocking(&buf[..n]),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!("GDB socket read failed: {err}");
                    break;
                }
            }
        }

        self.net_tx.detach();
        self.channel
            .session()
            .deactivate(GdbSession::ActiveOverNetwork);
        self.channel.wake_reader();
        info!("GDB client {peer} disconnected");
    }
}

/// TCP UART passthrough on its own port. No session exclusivity: the UART
/// is independent of the debug transports. Socket bytes go to the target
/// UART; the embedder routes target output into [`UartServer::tx`].
pub struct UartServer {
    listener: TcpListener,
    uart: Mutex<Box<dyn UartPort>>,
    tx: Arc<NetTx>,
}

impl UartServer {
    pub fn bind(uart: Box<dyn UartPort>, port: u16) -> Result<Self, NetError> {
        Ok(Self {
            listener: bind_listener(port)?,
            uart: Mutex::new(uart),
            tx: Arc::new(NetTx::new()),
        })
    }

    /// Sink for target-to-host UART bytes while a client is connected.
    pub fn tx(&self) -> Arc<NetTx> {
        self.tx.clone()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop; one client at a time.
    pub fn serve(&self) {
        loop {
            let (mut stream, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!("UART accept failed: {err}");
                    continue;
                }
            };
            info!("UART client connected from {peer}");
            tune_client(&stream);
            match stream.try_clone() {
                Ok(writer) => self.tx.attach(writer),
                Err(err) => {
                    warn!("socket clone failed, dropping client: {err}");
                    continue;
                }
            }

            let mut buf = [0u8; 512];
            loop {
                match stream.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => self
                        .uart
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .write(&buf[..n]),
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        debug!("UART socket read failed: {err}");
                        break;
                    }
                }
            }
            self.tx.detach();
            info!("UART client {peer} disconnected");
        }
    }
}
