//! Atomic byte-stream transport to a single downstream consumer.
//!
//! The listening socket is non-blocking so the accept worker never hangs;
//! the accepted client is blocking with an enlarged send buffer, which is
//! what makes [`TransportWriter::write_all`] deliver whole buffers under
//! back-pressure instead of partially completing. Disconnects surface as
//! [`TransportError::Disconnected`]; the listener stays open for the next
//! consumer.

use std::io::{ErrorKind, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::TransportError;

/// 256 KiB kernel send buffer to smooth bursts.
const SEND_BUFFER_BYTES: usize = 256 * 1024;
/// Accept poll cadence, chunked so stop is observed within ~10 ms.
const ACCEPT_POLL: Duration = Duration::from_millis(100);
const ACCEPT_POLL_CHUNK: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub enum Endpoint {
    Tcp { bind_host: String, port: u16 },
    Unix { path: PathBuf },
}

impl Endpoint {
    fn describe(&self) -> String {
        match self {
            Endpoint::Tcp { bind_host, port } => format!("tcp {bind_host}:{port}"),
            Endpoint::Unix { path } => format!("unix {}", path.display()),
        }
    }
}

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

enum Client {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Client {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Client::Tcp(stream) => stream.write(buf),
            Client::Unix(stream) => stream.write(buf),
        }
    }
}

struct Inner {
    endpoint: Endpoint,
    client: Mutex<Option<Client>>,
    connected: AtomicBool,
    stop_requested: AtomicBool,
}

pub struct TransportWriter {
    inner: Arc<Inner>,
    accept_join: Mutex<Option<JoinHandle<()>>>,
}

impl TransportWriter {
    /// Establishes the listening endpoint and spawns the accept worker.
    ///
    /// For local sockets a stale file is removed and the parent directory
    /// created first.
    pub fn start(endpoint: Endpoint, channel_id: i32) -> Result<Arc<Self>, TransportError> {
        let listener = match &endpoint {
            Endpoint::Tcp { bind_host, port } => {
                let listener = TcpListener::bind((bind_host.as_str(), *port))?;
                listener.set_nonblocking(true)?;
                Listener::Tcp(listener)
            }
            Endpoint::Unix { path } => {
                if path.exists() {
                    std::fs::remove_file(path)?;
                    debug!(path = %path.display(), "removed stale socket file");
                }
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                let listener = UnixListener::bind(path)?;
                listener.set_nonblocking(true)?;
                Listener::Unix(listener)
            }
        };
        info!(endpoint = %endpoint.describe(), channel_id, "transport listening");

        let inner = Arc::new(Inner {
            endpoint,
            client: Mutex::new(None),
            connected: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
        });

        let thread_inner = Arc::clone(&inner);
        let join = std::thread::Builder::new()
            .name(format!("kinocast-accept-{channel_id}"))
            .spawn(move || accept_loop(thread_inner, listener))
            .map_err(TransportError::Io)?;

        Ok(Arc::new(Self {
            inner,
            accept_join: Mutex::new(Some(join)),
        }))
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Blocks until every byte is delivered to the connected consumer, or
    /// fails. Interrupted writes are retried transparently; a broken pipe or
    /// reset closes the client and surfaces as `Disconnected`.
    pub fn write_all(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.inner.connected.load(Ordering::Acquire) {
            return Err(TransportError::NotConnected);
        }
        let mut guard = self
            .inner
            .client
            .lock()
            .expect("transport client mutex poisoned");
        let Some(client) = guard.as_mut() else {
            return Err(TransportError::NotConnected);
        };

        let mut remaining = bytes;
        while !remaining.is_empty() {
            match client.write(remaining) {
                Ok(0) => {
                    drop_client_locked(&self.inner, &mut guard);
                    return Err(TransportError::Disconnected);
                }
                Ok(written) => remaining = &remaining[written..],
                Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                Err(error)
                    if matches!(
                        error.kind(),
                        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset
                    ) =>
                {
                    info!("consumer disconnected during write");
                    drop_client_locked(&self.inner, &mut guard);
                    return Err(TransportError::Disconnected);
                }
                Err(error) => {
                    warn!(%error, "transport write failed");
                    drop_client_locked(&self.inner, &mut guard);
                    return Err(TransportError::Disconnected);
                }
            }
        }
        Ok(())
    }

    /// Closes the client (if any), then the listener, then removes the
    /// socket file if local. Idempotent.
    pub fn stop(&self) {
        if self.inner.stop_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut guard = self
                .inner
                .client
                .lock()
                .expect("transport client mutex poisoned");
            drop_client_locked(&self.inner, &mut guard);
        }
        if let Some(join) = self
            .accept_join
            .lock()
            .expect("transport join mutex poisoned")
            .take()
        {
            let _ = join.join();
        }
        {
            // A client accepted between the close above and the worker
            // observing stop is released here.
            let mut guard = self
                .inner
                .client
                .lock()
                .expect("transport client mutex poisoned");
            drop_client_locked(&self.inner, &mut guard);
        }
        if let Endpoint::Unix { path } = &self.inner.endpoint {
            if path.exists() {
                if let Err(error) = std::fs::remove_file(path) {
                    warn!(path = %path.display(), %error, "failed to unlink socket file");
                }
            }
        }
        debug!(endpoint = %self.inner.endpoint.describe(), "transport stopped");
    }
}

impl Drop for TransportWriter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn drop_client_locked(inner: &Inner, guard: &mut std::sync::MutexGuard<'_, Option<Client>>) {
    if guard.take().is_some() {
        inner.connected.store(false, Ordering::Release);
    }
}

fn accept_loop(inner: Arc<Inner>, listener: Listener) {
    while !inner.stop_requested.load(Ordering::Acquire) {
        try_accept(&inner, &listener);

        let mut remaining = ACCEPT_POLL;
        while remaining > Duration::ZERO && !inner.stop_requested.load(Ordering::Acquire) {
            let step = remaining.min(ACCEPT_POLL_CHUNK);
            std::thread::sleep(step);
            remaining = remaining.saturating_sub(step);
        }
    }
    // Listener drops here, after the client was already closed by stop().
}

fn try_accept(inner: &Arc<Inner>, listener: &Listener) {
    if inner.connected.load(Ordering::Acquire) {
        return;
    }
    let accepted = match listener {
        Listener::Tcp(listener) => match listener.accept() {
            Ok((stream, peer)) => {
                debug!(%peer, "consumer connected");
                configure_tcp_client(stream).map(Client::Tcp)
            }
            Err(error) if error.kind() == ErrorKind::WouldBlock => return,
            Err(error) => {
                warn!(%error, "accept failed");
                return;
            }
        },
        Listener::Unix(listener) => match listener.accept() {
            Ok((stream, _)) => {
                debug!("consumer connected on local socket");
                configure_unix_client(stream).map(Client::Unix)
            }
            Err(error) if error.kind() == ErrorKind::WouldBlock => return,
            Err(error) => {
                warn!(%error, "accept failed");
                return;
            }
        },
    };

    match accepted {
        Ok(client) => {
            let mut guard = inner.client.lock().expect("transport client mutex poisoned");
            *guard = Some(client);
            inner.connected.store(true, Ordering::Release);
            info!("consumer attached");
        }
        Err(error) => {
            warn!(%error, "failed to configure accepted client");
        }
    }
}

/// The accepted client is switched to blocking mode so `write_all` cannot
/// partially complete, and gets a larger send buffer.
fn configure_tcp_client(stream: TcpStream) -> std::io::Result<TcpStream> {
    stream.set_nonblocking(false)?;
    let socket = socket2::Socket::from(stream);
    if let Err(error) = socket.set_send_buffer_size(SEND_BUFFER_BYTES) {
        warn!(%error, "failed to enlarge send buffer");
    }
    Ok(socket.into())
}

fn configure_unix_client(stream: UnixStream) -> std::io::Result<UnixStream> {
    stream.set_nonblocking(false)?;
    let socket = socket2::Socket::from(stream);
    if let Err(error) = socket.set_send_buffer_size(SEND_BUFFER_BYTES) {
        warn!(%error, "failed to enlarge send buffer");
    }
    Ok(socket.into())
}
