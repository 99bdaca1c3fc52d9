//! Message Dispatch
//!
//! Maps command tags to handlers. The table is built once when the node
//! starts; dispatching never fails, undecodable traffic is logged and
//! dropped.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use super::codec::{BincodeCodec, PayloadCodec};
use super::command::Command;
use super::handlers;
use super::message::Outbound;
use crate::error::{Error, Result};
use crate::state::SystemContext;

/// A state transition for one decoded message
pub type Transition<M> = fn(&mut SystemContext, SocketAddr, M, Instant) -> Vec<Outbound>;

/// Decodes one command's datagrams and applies its transition
pub trait CommandHandler: Send + Sync {
    fn command(&self) -> Command;

    fn handle(
        &self,
        context: &mut SystemContext,
        sender: SocketAddr,
        bytes: &[u8],
        now: Instant,
    ) -> Result<Vec<Outbound>>;
}

/// Handler pairing a payload codec with a transition function
pub struct TransitionHandler<M> {
    codec: BincodeCodec<M>,
    transition: Transition<M>,
}

impl<M> TransitionHandler<M> {
    pub fn new(command: Command, transition: Transition<M>) -> Self {
        Self {
            codec: BincodeCodec::new(command),
            transition,
        }
    }
}

impl<M> CommandHandler for TransitionHandler<M>
where
    M: Serialize + DeserializeOwned,
{
    fn command(&self) -> Command {
        self.codec.command()
    }

    fn handle(
        &self,
        context: &mut SystemContext,
        sender: SocketAddr,
        bytes: &[u8],
        now: Instant,
    ) -> Result<Vec<Outbound>> {
        let message = self.codec.decode(bytes)?;
        Ok((self.transition)(context, sender, message, now))
    }
}

/// Tag to handler table
pub struct Dispatcher {
    handlers: HashMap<Command, Box<dyn CommandHandler>>,
}

impl Dispatcher {
    /// Empty table
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Table for the membership datagram channel
    pub fn membership() -> Self {
        let mut dispatcher = Self::new();
        dispatcher.register(TransitionHandler::new(Command::Start, handlers::on_start));
        dispatcher.register(TransitionHandler::new(Command::StartAck, handlers::on_start_ack));
        dispatcher.register(TransitionHandler::new(Command::Health, handlers::on_health));
        dispatcher.register(TransitionHandler::new(Command::HealthAck, handlers::on_health_ack));
        dispatcher.register(TransitionHandler::new(Command::Election, handlers::on_election));
        dispatcher.register(TransitionHandler::new(Command::LeaderInfo, handlers::on_leader_info));
        dispatcher.register(TransitionHandler::new(Command::Neighbour, handlers::on_neighbour));
        dispatcher
    }

    /// Register a handler, replacing any previous one for its command
    pub fn register<H: CommandHandler + 'static>(&mut self, handler: H) {
        self.handlers.insert(handler.command(), Box::new(handler));
    }

    /// Commands with a registered handler
    pub fn commands(&self) -> Vec<Command> {
        let mut commands: Vec<Command> = self.handlers.keys().copied().collect();
        commands.sort_by_key(|c| c.tag());
        commands
    }

    /// Route a datagram to its handler
    pub fn dispatch(
        &self,
        context: &mut SystemContext,
        sender: SocketAddr,
        bytes: &[u8],
        now: Instant,
    ) -> Vec<Outbound> {
        match self.try_dispatch(context, sender, bytes, now) {
            Ok(outbound) => outbound,
            Err(e) => {
                tracing::warn!("Dropping packet from {}: {}", sender, e);
                Vec::new()
            }
        }
    }

    fn try_dispatch(
        &self,
        context: &mut SystemContext,
        sender: SocketAddr,
        bytes: &[u8],
        now: Instant,
    ) -> Result<Vec<Outbound>> {
        let tag = *bytes.first().ok_or(Error::EmptyPacket)?;
        let command = Command::from_tag(tag)?;
        let handler = self
            .handlers
            .get(&command)
            .ok_or(Error::UnknownCommand(tag))?;

        tracing::trace!("{} from {} ({} bytes)", command, sender, bytes.len());
        handler.handle(context, sender, bytes, now)
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::membership()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{Packet, StartMessage};
    use crate::state::NodeAddress;

    fn addr(port: u16) -> NodeAddress {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn test_membership_table() {
        let dispatcher = Dispatcher::membership();
        assert_eq!(dispatcher.commands().len(), 7);
        assert!(!dispatcher.commands().contains(&Command::FileUpload));
    }

    #[test]
    fn test_dispatch_routes_by_tag() {
        let dispatcher = Dispatcher::membership();
        let mut context = SystemContext::new(addr(4711));
        context.act_as_leader();

        let bytes = Packet::Start(StartMessage { listen_port: 5000 }).encode().unwrap();
        let outbound = dispatcher.dispatch(&mut context, addr(5000).socket_addr(), &bytes, Instant::now());

        assert_eq!(outbound.len(), 1);
        assert_eq!(context.nodes(), &[addr(5000)]);
    }

    #[test]
    fn test_unknown_and_malformed_are_dropped() {
        let dispatcher = Dispatcher::membership();
        let mut context = SystemContext::new(addr(4711));
        context.act_as_leader();
        let sender = addr(5000).socket_addr();
        let now = Instant::now();

        assert!(dispatcher.dispatch(&mut context, sender, &[], now).is_empty());
        assert!(dispatcher.dispatch(&mut context, sender, &[42, 0, 0], now).is_empty());
        assert!(dispatcher.dispatch(&mut context, sender, &[Command::FileUpload.tag()], now).is_empty());
        assert!(dispatcher.dispatch(&mut context, sender, &[Command::Start.tag(), 1], now).is_empty());
        assert!(context.nodes().is_empty());
        assert!(context.is_leader());
    }
}
