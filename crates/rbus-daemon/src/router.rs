//! The routing core of the daemon.
//!
//! One router task owns the connection table, the name registry and the
//! match registry. Peer tasks talk to it only through [`RouterEvent`]s, so
//! every state change happens on a single task in arrival order.
//!
//! # Routing
//!
//! ```text
//! message from peer
//!   ├─ peer has no unique name ── Hello? ─ yes ──> bus driver
//!   │                               └── no ───> AccessDenied
//!   ├─ sender := unique name
//!   ├─ destination = org.freedesktop.DBus ──> bus driver
//!   ├─ signal without destination ──> every peer with a matching rule
//!   └─ otherwise ──> owner of destination, or ServiceUnknown
//! ```
//!
//! # Invariants
//!
//! - The `sender` of every routed message is the unique name of the
//!   connection it came from; a client-supplied sender is overwritten.
//! - The reply to a bus driver call is queued before any signal the call
//!   triggers.
//! - When a peer goes away, every name it owned is released and announced
//!   before the peer is removed from the table.

use std::collections::HashMap;
use std::sync::Arc;

use rbus_core::bus::{errors, signals, BUS_INTERFACE, BUS_NAME, BUS_PATH};
use rbus_core::wire::{Flags, Message, MessageType, Value};
use tokio::sync::mpsc::Receiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::bus_driver::{self, DriverMethod};
use crate::connection_handler::ClientIdentity;
use crate::peer::{Outbox, PeerId, PushResult};
use crate::registry::{MatchRegistry, NameRegistry, Owner};

/// Input of the router.
pub enum RouterEvent {
    /// A peer finished authentication.
    Connected {
        /// Id assigned at accept time.
        peer: PeerId,
        /// Queue the router writes to.
        outbox: Arc<Outbox>,
        /// Authenticated identity.
        identity: ClientIdentity,
    },
    /// A peer sent a message.
    Message {
        /// Sending peer.
        peer: PeerId,
        /// The message, as decoded.
        message: Message,
    },
    /// A peer's socket closed.
    Disconnected {
        /// Peer that went away.
        peer: PeerId,
    },
}

/// A connection as the router sees it.
pub struct PeerState {
    pub(crate) outbox: Arc<Outbox>,
    pub(crate) identity: ClientIdentity,
    pub(crate) unique_name: Option<String>,
}

/// A message the bus driver wants sent once its reply is queued.
#[derive(Debug)]
pub enum Emit {
    /// To one peer.
    Unicast(PeerId, Message),
    /// To every named peer.
    Broadcast(Message),
}

/// Everything the router owns.
pub struct BusState {
    pub(crate) guid: String,
    pub(crate) peers: HashMap<PeerId, PeerState>,
    pub(crate) names: NameRegistry,
    pub(crate) matches: MatchRegistry,
    serial: u32,
}

impl BusState {
    fn new(guid: String) -> Self {
        Self {
            guid,
            peers: HashMap::new(),
            names: NameRegistry::new(),
            matches: MatchRegistry::new(),
            serial: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self::new(rbus_core::address::generate_guid())
    }

    fn next_serial(&mut self) -> u32 {
        self.serial = self.serial.wrapping_add(1);
        if self.serial == 0 {
            self.serial = 1;
        }
        self.serial
    }

    /// Unique name of `peer`, if it has sent `Hello`.
    pub(crate) fn unique_name(&self, peer: PeerId) -> Option<&str> {
        self.peers.get(&peer)?.unique_name.as_deref()
    }

    /// Builds a signal emitted by the bus itself.
    pub(crate) fn bus_signal(member: &str, body: Vec<Value>) -> Option<Message> {
        match Message::signal(BUS_PATH, BUS_INTERFACE, member).and_then(|m| m.with_body(body)) {
            Ok(signal) => Some(signal.with_sender(BUS_NAME)),
            Err(e) => {
                warn!(member, error = %e, "failed to build bus signal");
                None
            },
        }
    }

    /// Queues `message` for `peer`, stamping a daemon serial if it has none.
    ///
    /// A peer whose outbox is full is aborted; its reader then reports the
    /// disconnect like any other.
    fn deliver(&mut self, peer: PeerId, mut message: Message) {
        if message.serial() == 0 {
            message.set_serial(self.next_serial());
        }
        let Some(state) = self.peers.get(&peer) else {
            debug!(%peer, "dropping message for unknown peer");
            return;
        };
        match state.outbox.push(message) {
            PushResult::Queued => {},
            PushResult::Closed => debug!(%peer, "dropping message for closing peer"),
            PushResult::Full => {
                warn!(
                    %peer,
                    unique_name = ?state.unique_name,
                    limit = state.outbox.limit(),
                    "outbox full, disconnecting peer"
                );
                state.outbox.abort();
            },
        }
    }

    fn emit(&mut self, emit: Emit) {
        match emit {
            Emit::Unicast(peer, message) => self.deliver(peer, message),
            Emit::Broadcast(mut message) => {
                message.set_serial(self.next_serial());
                let named: Vec<PeerId> = self
                    .peers
                    .iter()
                    .filter(|(_, state)| state.unique_name.is_some())
                    .map(|(peer, _)| *peer)
                    .collect();
                for peer in named {
                    self.deliver(peer, message.clone());
                }
            },
        }
    }

    fn reply_error(&mut self, peer: PeerId, call: &Message, name: &str, text: impl Into<String>) {
        if call.flags().contains(Flags::NO_REPLY_EXPECTED) {
            return;
        }
        let mut error = Message::error(call, name, text).with_sender(BUS_NAME);
        // Without Hello the caller's sender field is its own claim.
        error.set_destination(self.unique_name(peer).map(str::to_string));
        self.deliver(peer, error);
    }
}

/// The routing actor.
pub struct Router {
    state: BusState,
    driver: HashMap<&'static str, DriverMethod>,
}

impl Router {
    /// Router for a bus identified by `guid`.
    #[must_use]
    pub fn new(guid: impl Into<String>) -> Self {
        Self {
            state: BusState::new(guid.into()),
            driver: bus_driver::methods(),
        }
    }

    /// Processes events until the channel closes or `shutdown` fires.
    pub async fn run(
        mut self,
        mut events: Receiver<RouterEvent>,
        shutdown: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                () = shutdown.cancelled() => break,
                event = events.recv() => event,
            };
            let Some(event) = event else {
                break;
            };
            self.handle(event);
        }
        info!(peers = self.state.peers.len(), "router stopping");
        for state in self.state.peers.values() {
            state.outbox.close();
        }
    }

    /// Applies one event.
    pub fn handle(&mut self, event: RouterEvent) {
        match event {
            RouterEvent::Connected {
                peer,
                outbox,
                identity,
            } => {
                debug!(%peer, uid = ?identity.uid, "peer connected");
                self.state.peers.insert(
                    peer,
                    PeerState {
                        outbox,
                        identity,
                        unique_name: None,
                    },
                );
            },
            RouterEvent::Message { peer, message } => self.route(peer, message),
            RouterEvent::Disconnected { peer } => self.disconnect(peer),
        }
    }

    /// Number of connected peers.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.state.peers.len()
    }

    fn route(&mut self, peer: PeerId, mut message: Message) {
        if !self.state.peers.contains_key(&peer) {
            debug!(%peer, "message from unknown peer");
            return;
        }
        trace!(%peer, %message, "routing");

        let Some(unique_name) = self.state.unique_name(peer).map(str::to_string) else {
            if is_hello(&message) {
                self.call_driver(peer, &message);
            } else {
                self.state.reply_error(
                    peer,
                    &message,
                    errors::ACCESS_DENIED,
                    "You must send a Hello message",
                );
            }
            return;
        };
        message.set_sender(Some(unique_name));

        match message.destination().map(str::to_string) {
            Some(destination) if destination == BUS_NAME => {
                if message.message_type() == MessageType::MethodCall {
                    self.call_driver(peer, &message);
                }
            },
            None if message.message_type() == MessageType::Signal => {
                for subscriber in self.state.matches.subscribers(&message) {
                    self.state.deliver(subscriber, message.clone());
                }
            },
            Some(destination) => match self.state.names.owner(&destination) {
                Some(Owner::Peer(owner)) => self.state.deliver(owner, message),
                Some(Owner::Bus) => {},
                None => {
                    if message.message_type() == MessageType::MethodCall {
                        self.state.reply_error(
                            peer,
                            &message,
                            errors::SERVICE_UNKNOWN,
                            format!("The name `{destination}' does not exist"),
                        );
                    } else {
                        debug!(%peer, %destination, "dropping message for unknown name");
                    }
                },
            },
            None => {
                if message.message_type() == MessageType::MethodCall {
                    self.state.reply_error(
                        peer,
                        &message,
                        errors::SERVICE_UNKNOWN,
                        "Method call without a destination",
                    );
                } else {
                    debug!(%peer, "dropping reply without a destination");
                }
            },
        }
    }

    fn call_driver(&mut self, peer: PeerId, call: &Message) {
        let member = call.member().unwrap_or_default();
        let outcome = bus_driver::dispatch(&self.driver, &mut self.state, peer, call);

        match outcome {
            Ok(outcome) => {
                if call.expects_reply() {
                    let reply = Message::method_return(call)
                        .with_sender(BUS_NAME)
                        .with_body(outcome.body);
                    match reply {
                        Ok(mut reply) => {
                            // Hello's caller had no name until now.
                            reply.set_destination(self.state.unique_name(peer).map(str::to_string));
                            self.state.deliver(peer, reply);
                        },
                        Err(e) => {
                            warn!(%member, error = %e, "failed to build driver reply");
                            self.state.reply_error(
                                peer,
                                call,
                                errors::GENERAL_ERROR,
                                format!("An error occurred while calling {member}"),
                            );
                        },
                    }
                }
                for emit in outcome.signals {
                    self.state.emit(emit);
                }
            },
            Err(e) => {
                debug!(%peer, %member, error = %e, "bus driver call failed");
                self.state.reply_error(peer, call, e.name, e.message);
            },
        }
    }

    fn disconnect(&mut self, peer: PeerId) {
        let Some(state) = self.state.peers.get(&peer) else {
            return;
        };
        state.outbox.close();
        let unique_name = state.unique_name.clone();

        let released = self.state.names.release_all(peer);
        if let Some(old_owner) = &unique_name {
            for name in released {
                if let Some(signal) = BusState::bus_signal(
                    signals::NAME_OWNER_CHANGED,
                    vec![name.into(), old_owner.as_str().into(), "".into()],
                ) {
                    self.state.emit(Emit::Broadcast(signal));
                }
            }
        }
        self.state.matches.remove_peer(peer);
        self.state.peers.remove(&peer);
        info!(%peer, unique_name = ?unique_name, "peer disconnected");
    }
}

fn is_hello(message: &Message) -> bool {
    message.message_type() == MessageType::MethodCall
        && message.destination() == Some(BUS_NAME)
        && message.member() == Some("Hello")
        && message.interface().map_or(true, |i| i == BUS_INTERFACE)
}

#[cfg(test)]
mod tests {
    use rbus_core::bus::RequestNameReply;
    use rbus_core::match_rule::MatchRule;

    use super::*;

    struct Harness {
        router: Router,
        outboxes: HashMap<PeerId, Arc<Outbox>>,
        serial: u32,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                router: Router::new("0123456789abcdef0123456789abcdef"),
                outboxes: HashMap::new(),
                serial: 0,
            }
        }

        fn connect(&mut self, id: u64) -> PeerId {
            self.connect_with_limit(id, 64)
        }

        fn connect_with_limit(&mut self, id: u64, limit: usize) -> PeerId {
            let peer = PeerId(id);
            let outbox = Outbox::new(4, limit);
            self.outboxes.insert(peer, Arc::clone(&outbox));
            self.router.handle(RouterEvent::Connected {
                peer,
                outbox,
                identity: ClientIdentity {
                    uid: Some(1000),
                    pid: Some(42),
                },
            });
            peer
        }

        fn send(&mut self, peer: PeerId, mut message: Message) -> u32 {
            self.serial += 1;
            message.set_serial(self.serial);
            self.router.handle(RouterEvent::Message { peer, message });
            self.serial
        }

        fn call(&mut self, peer: PeerId, member: &str, body: Vec<Value>) -> u32 {
            let call = Message::method_call(BUS_PATH, member)
                .unwrap()
                .with_interface(BUS_INTERFACE)
                .with_destination(BUS_NAME)
                .with_body(body)
                .unwrap();
            self.send(peer, call)
        }

        fn hello(&mut self, peer: PeerId) -> String {
            self.call(peer, "Hello", vec![]);
            let reply = self.take(peer).remove(0);
            reply.body()[0].as_str().unwrap().to_string()
        }

        fn take(&self, peer: PeerId) -> Vec<Message> {
            self.outboxes[&peer].take_all()
        }
    }

    fn members(messages: &[Message]) -> Vec<String> {
        messages
            .iter()
            .map(|m| {
                m.member()
                    .or(m.error_name())
                    .unwrap_or("reply")
                    .to_string()
            })
            .collect()
    }

    #[test]
    fn test_hello_assigns_name_and_announces() {
        let mut h = Harness::new();
        let a = h.connect(1);
        let serial = h.call(a, "Hello", vec![]);
        let out = h.take(a);
        assert_eq!(members(&out), ["reply", "NameAcquired", "NameOwnerChanged"]);
        assert_eq!(out[0].reply_serial(), Some(serial));
        assert_eq!(out[0].destination(), Some(":1.1"));
        assert_eq!(out[0].body(), &[Value::from(":1.1")]);
        assert_eq!(out[0].sender(), Some(BUS_NAME));
        assert_eq!(out[1].destination(), Some(":1.1"));
        assert_eq!(
            out[2].body(),
            &[Value::from(":1.1"), Value::from(""), Value::from(":1.1")]
        );

        h.call(a, "Hello", vec![]);
        let out = h.take(a);
        assert_eq!(out[0].error_name(), Some(errors::ACCESS_DENIED));
    }

    #[test]
    fn test_unnamed_peer_is_refused() {
        let mut h = Harness::new();
        let a = h.connect(1);
        h.call(a, "ListNames", vec![]);
        let out = h.take(a);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].error_name(), Some(errors::ACCESS_DENIED));
        assert_eq!(out[0].error_text(), Some("You must send a Hello message"));
        assert_eq!(out[0].destination(), None);

        // A claimed sender is not echoed back as the destination.
        let call = Message::method_call(BUS_PATH, "ListNames")
            .unwrap()
            .with_destination(BUS_NAME)
            .with_sender(":1.42");
        h.send(a, call);
        let out = h.take(a);
        assert_eq!(out[0].error_name(), Some(errors::ACCESS_DENIED));
        assert_eq!(out[0].destination(), None);
    }

    #[test]
    fn test_slow_subscriber_is_aborted() {
        let mut h = Harness::new();
        let a = h.connect(1);
        let slow = h.connect_with_limit(2, 3);
        h.hello(a);
        h.hello(slow);
        h.call(
            slow,
            "AddMatch",
            vec![MatchRule::signal("org.example.Iface", "Tick").to_string().into()],
        );
        h.take(a);
        h.take(slow);

        for _ in 0..4 {
            h.send(a, Message::signal("/obj", "org.example.Iface", "Tick").unwrap());
        }
        let outbox = &h.outboxes[&slow];
        assert!(outbox.is_closed());
        assert!(outbox.is_empty());

        // The peer task reports the disconnect; names go with it.
        h.router.handle(RouterEvent::Disconnected { peer: slow });
        assert_eq!(h.router.peer_count(), 1);
        assert_eq!(members(&h.take(a)), ["NameOwnerChanged"]);
        h.call(a, "NameHasOwner", vec![":1.2".into()]);
        assert_eq!(h.take(a)[0].body(), &[Value::from(false)]);
    }

    #[test]
    fn test_method_call_between_peers_overwrites_sender() {
        let mut h = Harness::new();
        let a = h.connect(1);
        let b = h.connect(2);
        h.hello(a);
        let b_name = h.hello(b);
        h.take(a);
        h.take(b);

        let call = Message::method_call("/obj", "Do")
            .unwrap()
            .with_destination(b_name)
            .with_sender(":1.99");
        h.send(a, call);
        let out = h.take(b);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].sender(), Some(":1.1"));
        assert_eq!(out[0].member(), Some("Do"));
    }

    #[test]
    fn test_unknown_destination() {
        let mut h = Harness::new();
        let a = h.connect(1);
        h.hello(a);
        h.take(a);
        let call = Message::method_call("/obj", "Do")
            .unwrap()
            .with_destination("org.example.Missing");
        h.send(a, call);
        let out = h.take(a);
        assert_eq!(out[0].error_name(), Some(errors::SERVICE_UNKNOWN));
        assert_eq!(
            out[0].error_text(),
            Some("The name `org.example.Missing' does not exist")
        );
    }

    #[test]
    fn test_signals_follow_match_rules() {
        let mut h = Harness::new();
        let a = h.connect(1);
        let b = h.connect(2);
        let c = h.connect(3);
        h.hello(a);
        h.hello(b);
        h.hello(c);
        h.call(
            b,
            "AddMatch",
            vec![MatchRule::signal("org.example.Iface", "Changed").to_string().into()],
        );
        for peer in [a, b, c] {
            h.take(peer);
        }

        h.send(a, Message::signal("/obj", "org.example.Iface", "Changed").unwrap());
        h.send(a, Message::signal("/obj", "org.example.Iface", "Other").unwrap());
        let out = h.take(b);
        assert_eq!(members(&out), ["Changed"]);
        assert_eq!(out[0].sender(), Some(":1.1"));
        assert!(h.take(c).is_empty());
        assert!(h.take(a).is_empty());
    }

    #[test]
    fn test_disconnect_releases_names() {
        let mut h = Harness::new();
        let a = h.connect(1);
        let b = h.connect(2);
        h.hello(a);
        h.hello(b);
        h.take(a);
        h.call(a, "RequestName", vec!["org.example.Svc".into(), 0u32.into()]);
        let out = h.take(a);
        assert_eq!(
            out[0].body()[0].as_u32(),
            Some(RequestNameReply::PrimaryOwner.as_u32())
        );
        h.take(b);

        h.router.handle(RouterEvent::Disconnected { peer: a });
        assert_eq!(h.router.peer_count(), 1);
        let out = h.take(b);
        let changed: Vec<_> = out.iter().map(|m| m.body()[0].as_str().unwrap()).collect();
        assert_eq!(changed, ["org.example.Svc", ":1.1"]);
        assert!(out
            .iter()
            .all(|m| m.body()[1].as_str() == Some(":1.1") && m.body()[2].as_str() == Some("")));

        h.call(b, "NameHasOwner", vec!["org.example.Svc".into()]);
        assert_eq!(h.take(b)[0].body(), &[Value::from(false)]);
    }
}
