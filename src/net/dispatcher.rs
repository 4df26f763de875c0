//! Command-string message routing via a handler registry
//!
//! Managers register handlers for the commands they own; the reactor looks
//! the handler up under a short critical section and invokes it outside the
//! lock. Handlers receive the message by reference, valid only for the
//! duration of the call — deferred use requires copying out what is needed.
//!
//! Unknown commands are no-ops. VERSION is deliberately absent from the
//! registry: it is consumed by the peer handshake before routing.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{trace, warn};

use super::message::{Message, commands};
use super::types::PeerId;

/// Handler signature: borrows the reactor context and the message, returns
/// success. Plain fn pointers keep registration `Send` while the context
/// stays exclusively borrowed during the call.
pub type MessageHandler<C> = fn(&mut C, PeerId, &Message) -> bool;

pub struct MessageDispatcher<C> {
    handlers: Mutex<HashMap<String, MessageHandler<C>>>,
}

impl<C> MessageDispatcher<C> {
    pub fn new() -> Self {
        Self { handlers: Mutex::new(HashMap::new()) }
    }

    /// Register a handler. Empty commands are rejected; re-registering a
    /// command replaces the previous handler.
    pub fn register(&self, command: &str, handler: MessageHandler<C>) {
        if command.is_empty() {
            warn!("rejecting handler registration for empty command");
            return;
        }
        self.handlers
            .lock()
            .expect("dispatcher lock poisoned")
            .insert(command.to_string(), handler);
    }

    pub fn unregister(&self, command: &str) {
        self.handlers
            .lock()
            .expect("dispatcher lock poisoned")
            .remove(command);
    }

    pub fn has_handler(&self, command: &str) -> bool {
        self.handlers
            .lock()
            .expect("dispatcher lock poisoned")
            .contains_key(command)
    }

    pub fn registered_commands(&self) -> Vec<String> {
        let mut commands: Vec<String> = self
            .handlers
            .lock()
            .expect("dispatcher lock poisoned")
            .keys()
            .cloned()
            .collect();
        commands.sort();
        commands
    }

    /// Route a message to its handler. The handler runs outside the lock so
    /// it may freely re-enter the dispatcher.
    pub fn dispatch(&self, ctx: &mut C, peer_id: PeerId, msg: &Message) -> bool {
        let command = msg.command();
        let handler = {
            let handlers = self.handlers.lock().expect("dispatcher lock poisoned");
            handlers.get(command).copied()
        };
        match handler {
            Some(handler) => handler(ctx, peer_id, msg),
            None => {
                if command != commands::VERSION {
                    trace!(peer = peer_id, command, "no handler registered, ignoring");
                }
                true
            }
        }
    }
}

impl<C> Default for MessageDispatcher<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ctx {
        calls: Vec<&'static str>,
    }

    fn ping_handler(ctx: &mut Ctx, _peer: PeerId, _msg: &Message) -> bool {
        ctx.calls.push("ping");
        true
    }

    fn failing_handler(ctx: &mut Ctx, _peer: PeerId, _msg: &Message) -> bool {
        ctx.calls.push("fail");
        false
    }

    #[test]
    fn test_dispatch_routes_to_handler() {
        let dispatcher = MessageDispatcher::<Ctx>::new();
        dispatcher.register("ping", ping_handler);

        let mut ctx = Ctx { calls: vec![] };
        assert!(dispatcher.dispatch(&mut ctx, 1, &Message::Ping(1)));
        assert_eq!(ctx.calls, vec!["ping"]);
    }

    #[test]
    fn test_unknown_command_is_noop() {
        let dispatcher = MessageDispatcher::<Ctx>::new();
        let mut ctx = Ctx { calls: vec![] };
        assert!(dispatcher.dispatch(&mut ctx, 1, &Message::Pong(1)));
        assert!(ctx.calls.is_empty());
    }

    #[test]
    fn test_handler_failure_propagates() {
        let dispatcher = MessageDispatcher::<Ctx>::new();
        dispatcher.register("pong", failing_handler);
        let mut ctx = Ctx { calls: vec![] };
        assert!(!dispatcher.dispatch(&mut ctx, 1, &Message::Pong(1)));
    }

    #[test]
    fn test_empty_command_rejected() {
        let dispatcher = MessageDispatcher::<Ctx>::new();
        dispatcher.register("", ping_handler);
        assert!(!dispatcher.has_handler(""));
    }

    #[test]
    fn test_unregister() {
        let dispatcher = MessageDispatcher::<Ctx>::new();
        dispatcher.register("ping", ping_handler);
        assert!(dispatcher.has_handler("ping"));
        dispatcher.unregister("ping");
        assert!(!dispatcher.has_handler("ping"));
        assert!(dispatcher.registered_commands().is_empty());
    }
}
