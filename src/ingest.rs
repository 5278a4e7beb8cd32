//! UDP ingest
//!
//! Range instrumentation pushes raw datagrams over UDP. The listener feeds
//! every datagram to the producer; anything that does not decode is logged
//! and dropped without disturbing the stream.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::datagram::DATAGRAM_LEN;
use crate::producer::TspiProducer;

pub struct UdpIngest {
    socket: UdpSocket,
    producer: Arc<TspiProducer>,
}

impl UdpIngest {
    pub async fn bind(addr: SocketAddr, producer: Arc<TspiProducer>) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("binding udp ingest on {addr}"))?;
        info!(addr = %socket.local_addr()?, "UDP ingest listening");
        Ok(Self { socket, producer })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Receive until cancelled. Oversized packets are truncated by the
    /// receive buffer and rejected by the decoder like any other bad input.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut buf = [0u8; DATAGRAM_LEN * 2];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("UDP ingest stopping");
                    return Ok(());
                }
                received = self.socket.recv_from(&mut buf) => {
                    let (len, remote) = received.context("udp receive failed")?;
                    if let Err(err) = self.producer.ingest(&buf[..len]) {
                        warn!(remote = %remote, len, error = %err, "Datagram dropped");
                    }
                }
            }
        }
    }
}
