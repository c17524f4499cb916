//! Receiving statsd datagrams over UDP.

use std::io;
use std::net::{SocketAddr, UdpSocket};

use tally_common::UnixTimestamp;
use tally_metrics::Metric;
use tally_statsd::metric;
use tally_system::{Receiver, Service, ShutdownHandle};

use crate::ingest::Ingestor;
use crate::statsd::ServerCounters;

/// Service receiving statsd packets on a UDP socket.
///
/// Every packet may contain multiple lines. Lines that fail to parse are counted and skipped,
/// the remaining lines of the packet are still ingested. The listener stops on shutdown.
#[derive(Debug)]
pub struct StatsdListener {
    socket: UdpSocket,
    max_packet_size: usize,
    ingestor: Ingestor,
    shutdown: ShutdownHandle,
}

impl StatsdListener {
    /// Binds the UDP socket. Use port `0` to bind to an arbitrary free port.
    pub fn bind(
        addr: SocketAddr,
        max_packet_size: usize,
        ingestor: Ingestor,
        shutdown: ShutdownHandle,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;

        Ok(Self {
            socket,
            max_packet_size,
            ingestor,
            shutdown,
        })
    }
}

async fn handle_packet(ingestor: &Ingestor, packet: &[u8]) {
    metric!(counter(ServerCounters::PacketsReceived) += 1);

    for result in Metric::parse_all(packet, UnixTimestamp::now()) {
        match result {
            Ok(metric) => ingestor.ingest(metric).await,
            Err(error) => {
                tally_log::debug!(
                    error = &error as &dyn std::error::Error,
                    "dropping invalid statsd line"
                );
                metric!(
                    counter(ServerCounters::ParseFailed) += 1,
                    error = &error.to_string(),
                );
            }
        }
    }
}

impl Service for StatsdListener {
    type Interface = ();

    async fn run(self, _rx: Receiver<Self::Interface>) {
        let Self {
            socket,
            max_packet_size,
            ingestor,
            mut shutdown,
        } = self;

        let addr = socket.local_addr().map(|addr| addr.to_string());
        let socket = match tokio::net::UdpSocket::from_std(socket) {
            Ok(socket) => socket,
            Err(error) => {
                tally_log::error!(
                    error = &error as &dyn std::error::Error,
                    "failed to register statsd socket"
                );
                return;
            }
        };

        tally_log::info!(
            "listening for statsd on udp://{}",
            addr.as_deref().unwrap_or("unknown")
        );

        let mut buf = vec![0; max_packet_size];

        loop {
            tokio::select! {
                biased;

                _ = shutdown.notified() => break,
                result = socket.recv_from(&mut buf) => match result {
                    Ok((len, _)) => handle_packet(&ingestor, &buf[..len]).await,
                    Err(error) => tally_log::warn!(
                        error = &error as &dyn std::error::Error,
                        "failed to receive statsd packet"
                    ),
                },
            }
        }

        tally_log::info!("statsd listener stopped");
    }
}

#[cfg(test)]
impl StatsdListener {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}
