//! Framed connections with a cooperating bulk-transfer mode.
//!
//! A [`Connection`] moves through `IDLE → RESOLVING → CONNECTING → ASYNC
//! ⇄ SYNC → IDLE`. In ASYNC mode the caller issues one framed read at a
//! time (message-terminated, byte-counted consume, or byte-counted
//! peek). SYNC mode streams a byte region in either direction under the
//! global rate buckets; the connection returns to ASYNC when the region
//! is done. Cancellation of a bulk transfer is done by aborting the task
//! driving it - the transfer functions are plain futures with no hidden
//! threads.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::TlsConnector;

use crate::error::{NetError, Result};
use crate::rate::{Bucket, RateCounter};
use crate::tls::TlsSetup;
use crate::{IDLE_TIMEOUT, KEEPALIVE_INTERVAL, MAX_READ_BUF, resolve};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// No socket.
    Idle,
    /// Resolving the remote name.
    Resolving,
    /// Dialing.
    Connecting,
    /// Framed mode.
    Async,
    /// Bulk transfer in progress.
    Sync,
    /// Teardown in progress.
    Disconnecting,
}

/// Options for establishing a connection.
#[derive(Clone, Default)]
pub struct ConnectOpts {
    /// Local bind address for IPv4 dials.
    pub local_v4: Option<std::net::Ipv4Addr>,
    /// Local bind address for IPv6 dials.
    pub local_v6: Option<std::net::Ipv6Addr>,
    /// Literal keep-alive message written after 120 s of read
    /// inactivity. `None` makes 30 s of inactivity fatal instead.
    pub keepalive: Option<Vec<u8>>,
    /// Global inbound bucket (shared across connections).
    pub in_bucket: Option<Bucket>,
    /// Global outbound bucket.
    pub out_bucket: Option<Bucket>,
}

enum Stream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    TlsServer(Box<tokio_rustls::server::TlsStream<TcpStream>>),
    /// Transitional placeholder during a TLS upgrade.
    Detached,
}

impl Stream {
    fn as_io(&mut self) -> Result<&mut (dyn AsyncReadWrite + Send)> {
        match self {
            Stream::Plain(s) => Ok(s),
            Stream::Tls(s) => Ok(&mut **s),
            Stream::TlsServer(s) => Ok(&mut **s),
            Stream::Detached => Err(NetError::conn("connection detached")),
        }
    }
}

/// Object-safe read+write bound for the stream variants.
trait AsyncReadWrite: AsyncRead + AsyncWrite + Unpin {}
impl<T: AsyncRead + AsyncWrite + Unpin> AsyncReadWrite for T {}

/// A framed TCP connection, optionally TLS.
pub struct Connection {
    stream: Stream,
    state: ConnState,
    rbuf: Vec<u8>,
    max_rbuf: usize,
    keepalive: Option<Vec<u8>>,
    in_bucket: Bucket,
    out_bucket: Bucket,
    in_rate: RateCounter,
    out_rate: RateCounter,
    peer: SocketAddr,
}

impl Connection {
    /// Resolve `host` and dial, trying each resolved address in order.
    ///
    /// # Errors
    ///
    /// [`NetError::Conn`] when resolution or every dial fails,
    /// [`NetError::Timeout`] when either phase exceeds 30 s.
    pub async fn connect(host: &str, port: u16, opts: ConnectOpts) -> Result<Self> {
        let addrs = tokio::time::timeout(IDLE_TIMEOUT, resolve::resolve(host, port))
            .await
            .map_err(|_| NetError::timeout("name resolution"))??;

        let mut last_err = NetError::conn("no addresses resolved");
        for addr in addrs {
            match Self::dial(addr, &opts).await {
                Ok(stream) => return Ok(Self::from_stream(stream, addr, opts)),
                Err(e) => {
                    tracing::debug!(%addr, error = %e, "dial attempt failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn dial(addr: SocketAddr, opts: &ConnectOpts) -> Result<TcpStream> {
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(|e| NetError::conn_io(&e))?;
        match (addr, opts.local_v4, opts.local_v6) {
            (SocketAddr::V4(_), Some(ip), _) => socket
                .bind(SocketAddr::new(ip.into(), 0))
                .map_err(|e| NetError::conn_io(&e))?,
            (SocketAddr::V6(_), _, Some(ip)) => socket
                .bind(SocketAddr::new(ip.into(), 0))
                .map_err(|e| NetError::conn_io(&e))?,
            _ => {}
        }
        tokio::time::timeout(IDLE_TIMEOUT, socket.connect(addr))
            .await
            .map_err(|_| NetError::timeout("connect"))?
            .map_err(|e| NetError::conn_io(&e))
    }

    /// Wrap an accepted incoming socket.
    ///
    /// # Errors
    ///
    /// [`NetError::Conn`] when the peer address cannot be read.
    pub fn from_accepted(stream: TcpStream, opts: ConnectOpts) -> Result<Self> {
        let peer = stream.peer_addr().map_err(|e| NetError::conn_io(&e))?;
        Ok(Self::from_stream(stream, peer, opts))
    }

    fn from_stream(stream: TcpStream, peer: SocketAddr, opts: ConnectOpts) -> Self {
        let _ = stream.set_nodelay(true);
        Self {
            stream: Stream::Plain(stream),
            state: ConnState::Async,
            rbuf: Vec::new(),
            max_rbuf: MAX_READ_BUF,
            keepalive: opts.keepalive,
            in_bucket: opts.in_bucket.unwrap_or_else(|| Bucket::new(0)),
            out_bucket: opts.out_bucket.unwrap_or_else(|| Bucket::new(0)),
            in_rate: RateCounter::new(),
            out_rate: RateCounter::new(),
            peer,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Remote address.
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Inbound throughput counter.
    #[must_use]
    pub fn in_rate(&self) -> &RateCounter {
        &self.in_rate
    }

    /// Outbound throughput counter.
    #[must_use]
    pub fn out_rate(&self) -> &RateCounter {
        &self.out_rate
    }

    /// Whether the stream is TLS.
    #[must_use]
    pub fn is_tls(&self) -> bool {
        matches!(self.stream, Stream::Tls(_) | Stream::TlsServer(_))
    }

    fn fail<T>(&mut self, err: NetError) -> Result<T> {
        self.state = ConnState::Idle;
        Err(err)
    }

    /// Upgrade to TLS as the client side.
    ///
    /// The read buffer must be empty (the protocols upgrade at a known
    /// quiet point). Returns the server certificate's SHA-256
    /// fingerprint.
    ///
    /// # Errors
    ///
    /// [`NetError::Conn`] on handshake failure or keyprint mismatch,
    /// [`NetError::Timeout`] after 30 s.
    pub async fn start_tls(
        &mut self,
        setup: &TlsSetup,
        server_name: &str,
        pin: Option<[u8; 32]>,
    ) -> Result<[u8; 32]> {
        if !self.rbuf.is_empty() {
            return self.fail(NetError::conn("read buffer not empty at TLS upgrade"));
        }
        let Stream::Plain(tcp) = std::mem::replace(&mut self.stream, Stream::Detached) else {
            return self.fail(NetError::conn("TLS already active"));
        };
        let (config, slot) = setup.client_config(pin)?;
        let name = rustls::pki_types::ServerName::try_from(server_name.to_owned())
            .map_err(|_| NetError::conn("invalid TLS server name"))?;
        let connector = TlsConnector::from(config);
        let handshake = tokio::time::timeout(IDLE_TIMEOUT, connector.connect(name, tcp)).await;
        match handshake {
            Ok(Ok(stream)) => {
                self.stream = Stream::Tls(Box::new(stream));
                let fp = slot.lock().ok().and_then(|s| *s);
                fp.ok_or(NetError::conn("no server certificate seen"))
                    .or_else(|e| self.fail(e))
            }
            Ok(Err(e)) => self.fail(NetError::Conn(format!("TLS handshake: {e}").into())),
            Err(_) => self.fail(NetError::timeout("TLS handshake")),
        }
    }

    /// Upgrade to TLS as the server side of an accepted connection.
    ///
    /// # Errors
    ///
    /// [`NetError::Conn`] on handshake failure, [`NetError::Timeout`]
    /// after 30 s.
    pub async fn accept_tls(&mut self, config: Arc<rustls::ServerConfig>) -> Result<()> {
        if !self.rbuf.is_empty() {
            return self.fail(NetError::conn("read buffer not empty at TLS upgrade"));
        }
        let Stream::Plain(tcp) = std::mem::replace(&mut self.stream, Stream::Detached) else {
            return self.fail(NetError::conn("TLS already active"));
        };
        let acceptor = tokio_rustls::TlsAcceptor::from(config);
        match tokio::time::timeout(IDLE_TIMEOUT, acceptor.accept(tcp)).await {
            Ok(Ok(stream)) => {
                self.stream = Stream::TlsServer(Box::new(stream));
                Ok(())
            }
            Ok(Err(e)) => self.fail(NetError::Conn(format!("TLS handshake: {e}").into())),
            Err(_) => self.fail(NetError::timeout("TLS handshake")),
        }
    }

    /// Append bytes to the wire, flushing before returning.
    ///
    /// # Errors
    ///
    /// [`NetError::Send`] on any write failure.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let res = async {
            let mut io = self.stream.as_io()?;
            io.write_all(bytes)
                .await
                .map_err(|e| NetError::send_io(&e))?;
            io.flush().await.map_err(|e| NetError::send_io(&e))
        }
        .await;
        match res {
            Ok(()) => {
                self.out_rate.add(bytes.len() as u64);
                self.out_bucket.record(bytes.len());
                Ok(())
            }
            Err(e) => self.fail(e),
        }
    }

    /// Read one chunk from the socket into the buffer, applying the
    /// keep-alive / inactivity policy.
    async fn fill_some(&mut self) -> Result<()> {
        loop {
            let wait = if self.keepalive.is_some() {
                KEEPALIVE_INTERVAL
            } else {
                IDLE_TIMEOUT
            };
            let mut chunk = [0u8; 16 * 1024];
            let read = {
                let mut io = self.stream.as_io()?;
                tokio::time::timeout(wait, io.read(&mut chunk)).await
            };
            match read {
                Ok(Ok(0)) => return Err(NetError::recv("connection closed by peer")),
                Ok(Ok(n)) => {
                    self.in_rate.add(n as u64);
                    self.in_bucket.record(n);
                    self.rbuf.extend_from_slice(&chunk[..n]);
                    return Ok(());
                }
                Ok(Err(e)) => return Err(NetError::recv_io(&e)),
                Err(_) => {
                    let Some(ka) = self.keepalive.clone() else {
                        return Err(NetError::timeout("no activity"));
                    };
                    tracing::trace!(peer = %self.peer, "idle, writing keep-alive");
                    let mut io = self.stream.as_io()?;
                    io.write_all(&ka).await.map_err(|e| NetError::send_io(&e))?;
                    io.flush().await.map_err(|e| NetError::send_io(&e))?;
                }
            }
        }
    }

    /// Read a message terminated by `eom`. The terminator is consumed
    /// but not returned.
    ///
    /// # Errors
    ///
    /// [`NetError::Recv`] on close, I/O failure, or an over-long
    /// message; [`NetError::Timeout`] per the inactivity policy.
    pub async fn read_msg(&mut self, eom: u8) -> Result<Vec<u8>> {
        let mut scanned = 0;
        loop {
            if let Some(pos) = self.rbuf[scanned..].iter().position(|&b| b == eom) {
                let end = scanned + pos;
                let msg = self.rbuf[..end].to_vec();
                self.rbuf.drain(..=end);
                return Ok(msg);
            }
            scanned = self.rbuf.len();
            if scanned >= self.max_rbuf {
                return self.fail(NetError::recv("message exceeds read buffer limit"));
            }
            if let Err(e) = self.fill_some().await {
                return self.fail(e);
            }
        }
    }

    /// Read exactly `n` bytes, consuming them.
    ///
    /// # Errors
    ///
    /// As [`Connection::read_msg`].
    pub async fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        if n > self.max_rbuf {
            return self.fail(NetError::recv("read larger than buffer limit"));
        }
        while self.rbuf.len() < n {
            if let Err(e) = self.fill_some().await {
                return self.fail(e);
            }
        }
        let out = self.rbuf[..n].to_vec();
        self.rbuf.drain(..n);
        Ok(out)
    }

    /// Read at least `n` bytes without consuming anything.
    ///
    /// # Errors
    ///
    /// As [`Connection::read_msg`].
    pub async fn peek_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        if n > self.max_rbuf {
            return self.fail(NetError::recv("peek larger than buffer limit"));
        }
        while self.rbuf.len() < n {
            if let Err(e) = self.fill_some().await {
                return self.fail(e);
            }
        }
        Ok(self.rbuf[..n].to_vec())
    }

    /// Stream `len` bytes from the socket to `sink` (bulk download).
    ///
    /// Data already in the framed buffer is delivered first. The sink
    /// returns `false` to cancel; the function then returns the byte
    /// count delivered so far with `cancelled = true`. Reads wait on
    /// the inbound bucket.
    ///
    /// # Errors
    ///
    /// [`NetError::Recv`] on close or I/O failure; [`NetError::Timeout`]
    /// after 30 s without progress.
    pub async fn recv_stream(
        &mut self,
        len: u64,
        mut sink: impl FnMut(&[u8]) -> bool,
    ) -> Result<BulkResult> {
        self.state = ConnState::Sync;
        let mut left = len;

        // Drain the framed buffer into the sink first.
        if !self.rbuf.is_empty() && left > 0 {
            let take = (self.rbuf.len() as u64).min(left) as usize;
            let head: Vec<u8> = self.rbuf.drain(..take).collect();
            left -= head.len() as u64;
            self.in_rate.add(head.len() as u64);
            if !sink(&head) {
                self.state = ConnState::Async;
                return Ok(BulkResult::cancelled(len - left));
            }
        }

        let mut chunk = vec![0u8; 64 * 1024];
        while left > 0 {
            let budget = self.in_bucket.take(chunk.len()).await;
            let want = (left.min(budget as u64)) as usize;
            let read = {
                let mut io = self.stream.as_io()?;
                tokio::time::timeout(IDLE_TIMEOUT, io.read(&mut chunk[..want])).await
            };
            let n = match read {
                Ok(Ok(0)) => return self.fail(NetError::recv("connection closed mid-transfer")),
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return self.fail(NetError::recv_io(&e)),
                Err(_) => return self.fail(NetError::timeout("transfer stalled")),
            };
            self.in_rate.add(n as u64);
            left -= n as u64;
            if !sink(&chunk[..n]) {
                self.state = ConnState::Async;
                return Ok(BulkResult::cancelled(len - left));
            }
        }
        self.state = ConnState::Async;
        Ok(BulkResult::complete(len))
    }

    /// Stream `len` bytes from `file` at its current position to the
    /// socket (bulk upload). Writes wait on the outbound bucket.
    ///
    /// # Errors
    ///
    /// [`NetError::Send`] on socket failure, [`NetError::Recv`] never;
    /// file I/O failures surface as [`NetError::Send`] with context.
    pub async fn send_file(&mut self, file: &mut tokio::fs::File, len: u64) -> Result<u64> {
        self.state = ConnState::Sync;
        let mut left = len;
        let mut chunk = vec![0u8; 64 * 1024];
        while left > 0 {
            let budget = self.out_bucket.take(chunk.len()).await;
            let want = (left.min(budget as u64)) as usize;
            let n = file
                .read(&mut chunk[..want])
                .await
                .map_err(|e| NetError::Send(format!("file read: {e}").into()))?;
            if n == 0 {
                return self.fail(NetError::send("file shorter than requested range"));
            }
            let write = {
                let mut io = self.stream.as_io()?;
                tokio::time::timeout(IDLE_TIMEOUT, io.write_all(&chunk[..n])).await
            };
            match write {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return self.fail(NetError::send_io(&e)),
                Err(_) => return self.fail(NetError::timeout("transfer stalled")),
            }
            self.out_rate.add(n as u64);
            left -= n as u64;
        }
        {
            let mut io = self.stream.as_io()?;
            if let Err(e) = io.flush().await {
                return self.fail(NetError::send_io(&e));
            }
        }
        self.state = ConnState::Async;
        Ok(len)
    }

    /// Tear down. Valid in every state; never blocks on in-flight work.
    pub fn disconnect(&mut self) {
        self.state = ConnState::Disconnecting;
        self.stream = Stream::Detached;
        self.rbuf.clear();
        self.state = ConnState::Idle;
    }
}

/// Outcome of a bulk receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkResult {
    /// Bytes moved before completion or cancellation.
    pub bytes: u64,
    /// Whether the sink cancelled the transfer.
    pub cancelled: bool,
}

impl BulkResult {
    fn complete(bytes: u64) -> Self {
        Self {
            bytes,
            cancelled: false,
        }
    }

    fn cancelled(bytes: u64) -> Self {
        Self {
            bytes,
            cancelled: true,
        }
    }
}

/// Drop a file's pages from the page cache after a bulk transfer.
///
/// Used when the corresponding `flush_file_cache` bit is set so large
/// transfers do not evict the rest of the cache.
pub fn advise_dontneed(file: &std::fs::File) {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        // Best-effort; ignored on failure.
        unsafe {
            libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_DONTNEED);
        }
    }
    #[cfg(not(unix))]
    let _ = file;
}
