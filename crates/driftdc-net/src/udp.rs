//! Dual-stack UDP with a shared outgoing queue.
//!
//! Search traffic is fire-and-forget datagrams. A [`UdpPair`] binds one
//! IPv4 and one IPv6 socket (either may be absent), drains a shared
//! outgoing queue from a background task, and hands received datagrams
//! to the owner through an inbound channel.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::error::{NetError, Result};

/// A datagram waiting to be sent.
#[derive(Debug)]
pub struct OutDatagram {
    /// Destination.
    pub to: SocketAddr,
    /// Payload.
    pub payload: Vec<u8>,
}

/// A received datagram.
#[derive(Debug)]
pub struct InDatagram {
    /// Sender address.
    pub from: SocketAddr,
    /// Payload.
    pub payload: Vec<u8>,
}

/// The pair of datagram sockets plus queue handles.
pub struct UdpPair {
    tx: mpsc::UnboundedSender<OutDatagram>,
    rx: mpsc::UnboundedReceiver<InDatagram>,
    local_v4: Option<SocketAddr>,
    local_v6: Option<SocketAddr>,
}

impl UdpPair {
    /// Bind both families on `port` (0 picks ephemeral ports). Either
    /// family may fail to bind without failing the pair, but at least
    /// one must succeed.
    ///
    /// # Errors
    ///
    /// [`NetError::Conn`] when neither family binds.
    pub async fn bind(port: u16, bind_v4: Option<Ipv4Addr>, bind_v6: Option<Ipv6Addr>) -> Result<Self> {
        let v4 = UdpSocket::bind(SocketAddr::new(
            bind_v4.unwrap_or(Ipv4Addr::UNSPECIFIED).into(),
            port,
        ))
        .await
        .ok();
        let v6 = UdpSocket::bind(SocketAddr::new(
            bind_v6.unwrap_or(Ipv6Addr::UNSPECIFIED).into(),
            port,
        ))
        .await
        .ok();
        if v4.is_none() && v6.is_none() {
            return Err(NetError::conn("could not bind UDP on either family"));
        }
        let local_v4 = v4.as_ref().and_then(|s| s.local_addr().ok());
        let local_v6 = v6.as_ref().and_then(|s| s.local_addr().ok());

        let (out_tx, out_rx) = mpsc::unbounded_channel::<OutDatagram>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<InDatagram>();

        let v4 = v4.map(Arc::new);
        let v6 = v6.map(Arc::new);

        // Sender task: drains the shared queue, picking the socket by
        // destination family. EAGAIN is retried by re-queueing at the
        // back after a short pause.
        {
            let v4 = v4.clone();
            let v6 = v6.clone();
            let out_tx = out_tx.clone();
            let mut out_rx = out_rx;
            tokio::spawn(async move {
                while let Some(dgram) = out_rx.recv().await {
                    let socket = match dgram.to {
                        SocketAddr::V4(_) => v4.as_ref(),
                        SocketAddr::V6(_) => v6.as_ref(),
                    };
                    let Some(socket) = socket else {
                        tracing::debug!(to = %dgram.to, "no socket for address family");
                        continue;
                    };
                    match socket.send_to(&dgram.payload, dgram.to).await {
                        Ok(_) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                            let _ = out_tx.send(dgram);
                        }
                        Err(e) => {
                            tracing::debug!(to = %dgram.to, error = %e, "UDP send failed");
                        }
                    }
                }
            });
        }

        // One receiver task per bound socket.
        for socket in [v4, v6].into_iter().flatten() {
            let in_tx = in_tx.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 64 * 1024];
                loop {
                    match socket.recv_from(&mut buf).await {
                        Ok((n, from)) => {
                            let dgram = InDatagram {
                                from,
                                payload: buf[..n].to_vec(),
                            };
                            if in_tx.send(dgram).is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "UDP receive failed");
                        }
                    }
                }
            });
        }

        Ok(Self {
            tx: out_tx,
            rx: in_rx,
            local_v4,
            local_v6,
        })
    }

    /// Queue a datagram for sending.
    pub fn send(&self, to: SocketAddr, payload: Vec<u8>) {
        let _ = self.tx.send(OutDatagram { to, payload });
    }

    /// A cloneable handle for queueing sends from other tasks.
    #[must_use]
    pub fn sender(&self) -> mpsc::UnboundedSender<OutDatagram> {
        self.tx.clone()
    }

    /// Receive the next inbound datagram.
    pub async fn recv(&mut self) -> Option<InDatagram> {
        self.rx.recv().await
    }

    /// Local IPv4 socket address, if bound.
    #[must_use]
    pub fn local_v4(&self) -> Option<SocketAddr> {
        self.local_v4
    }

    /// Local IPv6 socket address, if bound.
    #[must_use]
    pub fn local_v6(&self) -> Option<SocketAddr> {
        self.local_v6
    }
}
