//! Runs a [MercuryNode] on a UDP socket.
//!
//! One task owns both the node and the socket, so every handler runs to completion before the
//! next datagram or timer is looked at.
use std::time::Duration;

use mercury_core::app::Application;
use mercury_core::message::HubId;
use mercury_core::pubsub::Event;
use mercury_core::range::NodeRange;
use mercury_core::Address;
use mercury_core::HubStatus;
use mercury_core::MercuryNode;
use mercury_core::Timestamp;
use tokio::net::UdpSocket;
use tokio::time::Instant;

use crate::config::Config;
use crate::error::Error;
use crate::error::Result;

/// Largest datagram accepted from the socket.
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Idle wake-up when no timer is pending.
const IDLE_TICK: Duration = Duration::from_secs(3600);

/// Writes every overlay callback to the log.
#[derive(Debug, Default)]
pub struct LoggingApp;

impl Application for LoggingApp {
    fn join_begin(&mut self, hub: HubId, successor: Address) {
        tracing::info!("hub {}: joining, successor {}", hub, successor);
    }

    fn join_end(&mut self, hub: HubId, successor: Address) {
        tracing::info!("hub {}: joined, successor {}", hub, successor);
    }

    fn join_failed(&mut self, hub: HubId, representative: Option<Address>) {
        tracing::error!("hub {}: join through {:?} failed", hub, representative);
    }

    fn leave_begin(&mut self, hub: HubId) {
        tracing::info!("hub {}: leaving", hub);
    }

    fn leave_end(&mut self, hub: HubId) {
        tracing::info!("hub {}: left", hub);
    }

    fn range_expanded(&mut self, hub: HubId, old: Option<NodeRange>, new: NodeRange) {
        tracing::info!("hub {}: range {:?} -> {}", hub, old, new);
    }

    fn range_contracted(&mut self, hub: HubId, old: NodeRange, new: NodeRange) {
        tracing::info!("hub {}: range {} -> {}", hub, old, new);
    }

    fn publication_received(&mut self, hub: HubId, event: &Event) {
        tracing::info!(
            "hub {}: publication {} from {} on {} ({} bytes)",
            hub,
            event.nonce,
            event.creator,
            event.constraint,
            event.payload.len()
        );
    }
}

/// A node bound to its socket.
pub struct Driver {
    node: MercuryNode,
    socket: UdpSocket,
    started: Instant,
}

impl Driver {
    /// Bind the socket and register the configured hubs. Without an `advertise` address the
    /// node is known by the address the socket actually got.
    pub async fn bind(config: &Config, app: impl Application + 'static) -> Result<Self> {
        config.validate()?;
        let socket = UdpSocket::bind(config.bind)
            .await
            .map_err(|e| Error::BindError(config.bind.to_string(), e))?;
        let address = match config.advertise {
            Some(a) => a,
            None => socket.local_addr()?,
        };
        tracing::info!("listening on {}, advertised as {}", socket.local_addr()?, address);
        let mut node = MercuryNode::new(address, config.parameters.clone(), app)?;
        if let Some(server) = config.bootstrap {
            node = node.with_bootstrap(server);
        }
        for hub in &config.hubs {
            node.add_hub(hub.clone())?;
        }
        Ok(Self {
            node,
            socket,
            started: Instant::now(),
        })
    }

    /// The node being driven.
    pub fn node(&self) -> &MercuryNode {
        &self.node
    }

    /// Address the node is known by.
    pub fn address(&self) -> Address {
        self.node.address()
    }

    fn now(&self) -> Timestamp {
        Timestamp::from_millis(self.started.elapsed().as_millis() as u64)
    }

    fn instant_of(&self, t: Timestamp) -> Instant {
        self.started + Duration::from_millis(t.as_millis())
    }

    /// Join the configured hubs and contact the bootstrap server.
    pub fn start(&mut self) -> Result<()> {
        let now = self.now();
        Ok(self.node.start(now)?)
    }

    async fn flush(&mut self) {
        while let Some(out) = self.node.poll_outgoing() {
            if let Err(e) = self.socket.send_to(&out.bytes, out.to).await {
                // Liveness checks notice the peer if this keeps failing.
                tracing::warn!("send {} bytes to {} failed: {}", out.bytes.len(), out.to, e);
            }
        }
    }

    /// Handle one datagram or one round of due timers, waiting at most until `limit`.
    async fn next_event(&mut self, buf: &mut [u8], limit: Instant) -> Result<()> {
        let wake = match self.node.next_deadline() {
            Some(t) => self.instant_of(t).min(limit),
            None => limit,
        };
        tokio::select! {
            res = self.socket.recv_from(buf) => {
                let (n, from) = res?;
                let now = self.now();
                if let Err(e) = self.node.handle_message(now, from, &buf[..n]) {
                    tracing::warn!("dropped datagram from {}: {}", from, e);
                }
            }
            _ = tokio::time::sleep_until(wake) => {
                let now = self.now();
                if let Err(e) = self.node.handle_timers(now) {
                    tracing::error!("node stopped: {}", e);
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Drive the node for `duration`.
    pub async fn run_for(&mut self, duration: Duration) -> Result<()> {
        let limit = Instant::now() + duration;
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        while Instant::now() < limit {
            self.flush().await;
            self.next_event(&mut buf, limit).await?;
        }
        self.flush().await;
        Ok(())
    }

    /// Leave every joined hub and send the goodbyes.
    pub async fn shutdown(&mut self) -> Result<()> {
        let now = self.now();
        for hub in self.node.hub_ids() {
            if self.node.status(hub) == Some(HubStatus::Joined) {
                if let Err(e) = self.node.leave(now, hub) {
                    tracing::warn!("hub {}: leave failed: {}", hub, e);
                }
            }
        }
        self.flush().await;
        Ok(())
    }

    /// Start, then run until ctrl-c or until the node hits an unrecoverable error.
    pub async fn run(mut self) -> Result<()> {
        self.start()?;
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            self.flush().await;
            tokio::select! {
                res = self.next_event(&mut buf, Instant::now() + IDLE_TICK) => {
                    if let Err(e) = res {
                        self.flush().await;
                        return Err(e);
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("interrupted, leaving");
                    return self.shutdown().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use mercury_core::bootstrap::HubInitInfo;
    use mercury_core::Range;

    use super::*;

    fn config(representative: Option<Address>) -> Config {
        let mut hub = HubInitInfo::new(0, "x", 0, 1000);
        hub.representative = representative;
        Config {
            bind: ([127, 0, 0, 1], 0).into(),
            advertise: None,
            bootstrap: None,
            hubs: vec![hub],
            parameters: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_two_nodes_split_the_domain() {
        let mut a = Driver::bind(&config(None), LoggingApp).await.unwrap();
        assert_ne!(a.address().port(), 0);
        let mut b = Driver::bind(&config(Some(a.address())), LoggingApp)
            .await
            .unwrap();
        a.start().unwrap();
        b.start().unwrap();

        let period = Duration::from_secs(4);
        let (ra, rb) = tokio::join!(a.run_for(period), b.run_for(period));
        ra.unwrap();
        rb.unwrap();

        assert_eq!(a.node().range(0), Some(Range::new(0, 0, 500)));
        assert_eq!(b.node().range(0), Some(Range::new(0, 500, 1000)));
        assert_eq!(a.node().successor(0), Some(b.address()));
        assert_eq!(b.node().status(0), Some(HubStatus::Joined));
    }

    #[tokio::test]
    async fn test_garbage_datagram_is_dropped() {
        let mut a = Driver::bind(&config(None), LoggingApp).await.unwrap();
        a.start().unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(&[0xee, 1, 2, 3], a.address()).await.unwrap();
        a.run_for(Duration::from_millis(200)).await.unwrap();
        assert_eq!(a.node().status(0), Some(HubStatus::Joined));
    }
}
