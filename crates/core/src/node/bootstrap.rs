//! Client side of the bootstrap protocol.
//!
//! The node asks the server for the hubs to join, retrying until it answers, then reports its
//! ranges periodically. The server's `AllJoined` broadcast is kept as a flag.

use super::MercuryNode;
use super::Timer;
use crate::error::Error;
use crate::error::Result;
use crate::message::AllJoined;
use crate::message::BootstrapRequest;
use crate::message::BootstrapResponse;
use crate::message::HeartBeat;
use crate::message::Message;
use crate::message::NODE_SCOPE;
use crate::params::Parameters;
use crate::peer::Address;
use crate::time::Timestamp;

#[derive(Debug)]
pub(crate) struct BootstrapClient {
    server: Address,
    attempts: u32,
    answered: bool,
    pub(crate) all_joined: bool,
}

impl BootstrapClient {
    pub(crate) fn new(server: Address) -> Self {
        Self {
            server,
            attempts: 0,
            answered: false,
            all_joined: false,
        }
    }
}

impl MercuryNode {
    pub(crate) fn handle_node_message(
        &mut self,
        now: Timestamp,
        from: Address,
        message: Message,
    ) -> Result<()> {
        let Some(server) = self.bootstrap.as_ref().map(|b| b.server) else {
            tracing::warn!("{} from {} but no bootstrap server configured", message.name(), from);
            return Ok(());
        };
        if from != server {
            tracing::warn!("{} from {} which is not the bootstrap server", message.name(), from);
            return Ok(());
        }
        match message {
            Message::BootstrapResponse(msg) => self.on_bootstrap_response(now, msg),
            Message::AllJoined(AllJoined) => {
                tracing::info!("bootstrap server reports every node joined");
                if let Some(b) = self.bootstrap.as_mut() {
                    b.all_joined = true;
                }
                Ok(())
            }
            other => {
                tracing::warn!("unexpected node scoped {} from {}", other.name(), from);
                Ok(())
            }
        }
    }

    fn on_bootstrap_response(&mut self, now: Timestamp, msg: BootstrapResponse) -> Result<()> {
        let Some(b) = self.bootstrap.as_mut() else {
            return Ok(());
        };
        if b.answered {
            tracing::debug!("duplicate bootstrap response ignored");
            return Ok(());
        }
        b.answered = true;
        tracing::info!("bootstrap server described {} hubs", msg.hubs.len());
        for info in msg.hubs {
            let (id, rep) = (info.id, info.representative);
            if self.hubs.contains_key(&id) {
                tracing::debug!("hub {} already registered, keeping local description", id);
                continue;
            }
            if let Err(e) = self.add_hub(info) {
                tracing::warn!("skipping hub {} from the bootstrap server: {}", id, e);
                continue;
            }
            if let Err(e) = self.join_hub(now, id, rep, None) {
                tracing::warn!("hub {} could not start joining: {}", id, e);
            }
        }
        self.scheduler.schedule(
            now + Parameters::ms(self.params.bootstrap_heartbeat_interval),
            Timer::BootstrapHeartbeat,
        );
        Ok(())
    }

    pub(crate) fn on_bootstrap_request(&mut self, now: Timestamp) -> Result<()> {
        let max = self.params.max_bootstrap_request_attempts;
        let Some(b) = self.bootstrap.as_mut() else {
            return Ok(());
        };
        if b.answered {
            return Ok(());
        }
        if b.attempts >= max {
            tracing::error!("bootstrap server {} unreachable", b.server);
            return Err(Error::BootstrapUnreachable(b.attempts));
        }
        b.attempts += 1;
        let server = b.server;
        tracing::debug!("bootstrap request #{} to {}", b.attempts, server);
        self.send_envelope(
            server,
            NODE_SCOPE,
            Message::BootstrapRequest(BootstrapRequest { addr: self.address }),
        )?;
        self.scheduler.schedule(
            now + Parameters::ms(self.params.bootstrap_request_timeout),
            Timer::BootstrapRequest,
        );
        Ok(())
    }

    pub(crate) fn on_bootstrap_heartbeat(&mut self, now: Timestamp) -> Result<()> {
        let Some(server) = self.bootstrap.as_ref().map(|b| b.server) else {
            return Ok(());
        };
        let beats: Vec<_> = self
            .hubs
            .values()
            .filter(|h| h.member.is_joined())
            .map(|h| (h.id(), h.member.range()))
            .collect();
        for (hub, range) in beats {
            self.send_envelope(
                server,
                hub,
                Message::HeartBeat(HeartBeat {
                    addr: self.address,
                    range,
                }),
            )?;
        }
        self.scheduler.schedule(
            now + Parameters::ms(self.params.bootstrap_heartbeat_interval),
            Timer::BootstrapHeartbeat,
        );
        Ok(())
    }
}
