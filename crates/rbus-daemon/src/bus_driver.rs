//! The `org.freedesktop.DBus` service implemented by the daemon itself.
//!
//! Each method is a plain function over [`BusState`]. It returns the reply
//! body plus the signals the call triggers; the router queues the reply
//! first and the signals after it.
//!
//! # Invariants
//!
//! - A method only runs when the call's signature equals the method's input
//!   signature; otherwise the caller gets `InvalidArgs`.
//! - Name changes are always announced with `NameOwnerChanged` to every
//!   connection that has sent `Hello`.

use std::collections::HashMap;
use std::fmt;

use rbus_core::bus::{
    errors, signals, StartServiceReply, BUS_INTERFACE, BUS_INTROSPECTION_XML, BUS_NAME,
    INTROSPECTABLE_INTERFACE, PEER_INTERFACE,
};
use rbus_core::match_rule::MatchRule;
use rbus_core::wire::{Message, Value};

use crate::peer::PeerId;
use crate::registry::{NameError, Owner};
use crate::router::{BusState, Emit};

/// Error reply of a bus driver method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverError {
    /// D-Bus error name.
    pub name: &'static str,
    /// Human readable text.
    pub message: String,
}

impl DriverError {
    /// Error named `name`.
    pub fn new(name: &'static str, message: impl Into<String>) -> Self {
        Self {
            name,
            message: message.into(),
        }
    }

    fn invalid_args(message: impl Into<String>) -> Self {
        Self::new(errors::INVALID_ARGS, message)
    }

    fn no_owner(name: &str) -> Self {
        Self::new(
            errors::NAME_HAS_NO_OWNER,
            format!("Could not get owner of name '{name}': no such name"),
        )
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for DriverError {}

impl From<NameError> for DriverError {
    fn from(e: NameError) -> Self {
        Self::invalid_args(e.to_string())
    }
}

/// Successful result of a bus driver method.
#[derive(Debug, Default)]
pub struct DriverOutcome {
    /// Reply body.
    pub body: Vec<Value>,
    /// Messages to send after the reply.
    pub signals: Vec<Emit>,
}

impl DriverOutcome {
    fn reply(body: Vec<Value>) -> Self {
        Self {
            body,
            signals: Vec::new(),
        }
    }

    fn empty() -> Self {
        Self::default()
    }
}

type DriverResult = Result<DriverOutcome, DriverError>;
type Handler = fn(&mut BusState, PeerId, &Message) -> DriverResult;

/// One entry of the method table.
#[derive(Clone, Copy)]
pub struct DriverMethod {
    interface: &'static str,
    signature: &'static str,
    handler: Handler,
}

impl DriverMethod {
    const fn new(interface: &'static str, signature: &'static str, handler: Handler) -> Self {
        Self {
            interface,
            signature,
            handler,
        }
    }
}

/// The method table, keyed by member name.
#[must_use]
pub fn methods() -> HashMap<&'static str, DriverMethod> {
    const fn bus(signature: &'static str, handler: Handler) -> DriverMethod {
        DriverMethod::new(BUS_INTERFACE, signature, handler)
    }
    HashMap::from([
        ("Hello", bus("", hello)),
        ("RequestName", bus("su", request_name)),
        ("ReleaseName", bus("s", release_name)),
        ("ListNames", bus("", list_names)),
        ("ListActivatableNames", bus("", list_activatable_names)),
        ("NameHasOwner", bus("s", name_has_owner)),
        ("GetNameOwner", bus("s", get_name_owner)),
        ("AddMatch", bus("s", add_match)),
        ("RemoveMatch", bus("s", remove_match)),
        ("GetConnectionUnixUser", bus("s", get_connection_unix_user)),
        ("GetConnectionUnixProcessID", bus("s", get_connection_unix_process_id)),
        ("ListQueuedOwners", bus("s", list_queued_owners)),
        ("StartServiceByName", bus("su", start_service_by_name)),
        ("ReloadConfig", bus("", reload_config)),
        ("GetId", bus("", get_id)),
        (
            "Introspect",
            DriverMethod::new(INTROSPECTABLE_INTERFACE, "", introspect),
        ),
        ("Ping", DriverMethod::new(PEER_INTERFACE, "", ping)),
    ])
}

/// Runs the method `call` names.
///
/// A call without an interface matches on member name alone.
pub fn dispatch(
    table: &HashMap<&'static str, DriverMethod>,
    state: &mut BusState,
    peer: PeerId,
    call: &Message,
) -> DriverResult {
    let member = call.member().unwrap_or_default();
    let method = table
        .get(member)
        .filter(|m| call.interface().map_or(true, |i| i == m.interface))
        .ok_or_else(|| {
            DriverError::new(
                errors::UNKNOWN_METHOD,
                format!("This service does not support {member}"),
            )
        })?;

    let signature = call.signature().as_str();
    if signature != method.signature {
        return Err(DriverError::invalid_args(format!(
            "Call to {member} has wrong args ({signature}, expected {})",
            method.signature
        )));
    }
    (method.handler)(state, peer, call)
}

// =============================================================================
// Helpers
// =============================================================================

fn str_arg(call: &Message, index: usize) -> Result<&str, DriverError> {
    call.body()
        .get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| DriverError::invalid_args(format!("argument {index} must be a string")))
}

fn signal(member: &str, body: Vec<Value>) -> Result<Message, DriverError> {
    BusState::bus_signal(member, body).ok_or_else(|| {
        DriverError::new(
            errors::GENERAL_ERROR,
            format!("failed to build {member} signal"),
        )
    })
}

fn owner_changed(name: &str, old: &str, new: &str) -> Result<Emit, DriverError> {
    signal(
        signals::NAME_OWNER_CHANGED,
        vec![name.into(), old.into(), new.into()],
    )
    .map(Emit::Broadcast)
}

fn to_caller(
    peer: PeerId,
    unique_name: &str,
    member: &str,
    name: &str,
) -> Result<Emit, DriverError> {
    signal(member, vec![name.into()])
        .map(|m| Emit::Unicast(peer, m.with_destination(unique_name)))
}

fn caller_name(state: &BusState, peer: PeerId) -> Result<String, DriverError> {
    state.unique_name(peer).map(str::to_string).ok_or_else(|| {
        DriverError::new(errors::ACCESS_DENIED, "You must send a Hello message")
    })
}

fn owning_peer(state: &BusState, name: &str) -> Result<Option<PeerId>, DriverError> {
    match state.names.owner(name) {
        Some(Owner::Bus) => Ok(None),
        Some(Owner::Peer(peer)) => Ok(Some(peer)),
        None => Err(DriverError::no_owner(name)),
    }
}

// =============================================================================
// Methods
// =============================================================================

fn hello(state: &mut BusState, peer: PeerId, _call: &Message) -> DriverResult {
    if state.unique_name(peer).is_some() {
        return Err(DriverError::new(
            errors::ACCESS_DENIED,
            "Connection has already sent a Hello message",
        ));
    }
    let unique_name = state.names.assign_unique(peer);
    if let Some(peer_state) = state.peers.get_mut(&peer) {
        peer_state.unique_name = Some(unique_name.clone());
    }
    Ok(DriverOutcome {
        body: vec![unique_name.as_str().into()],
        signals: vec![
            to_caller(peer, &unique_name, signals::NAME_ACQUIRED, &unique_name)?,
            owner_changed(&unique_name, "", &unique_name)?,
        ],
    })
}

fn request_name(state: &mut BusState, peer: PeerId, call: &Message) -> DriverResult {
    let name = str_arg(call, 0)?;
    let caller = caller_name(state, peer)?;
    let reply = state.names.request(name, peer)?;
    let mut outcome = DriverOutcome::reply(vec![reply.as_u32().into()]);
    if reply == rbus_core::bus::RequestNameReply::PrimaryOwner {
        outcome.signals = vec![
            to_caller(peer, &caller, signals::NAME_ACQUIRED, name)?,
            owner_changed(name, "", &caller)?,
        ];
    }
    Ok(outcome)
}

fn release_name(state: &mut BusState, peer: PeerId, call: &Message) -> DriverResult {
    let name = str_arg(call, 0)?;
    let caller = caller_name(state, peer)?;
    let reply = state.names.release(name, peer)?;
    let mut outcome = DriverOutcome::reply(vec![reply.as_u32().into()]);
    if reply == rbus_core::bus::ReleaseNameReply::Released {
        outcome.signals = vec![
            to_caller(peer, &caller, signals::NAME_LOST, name)?,
            owner_changed(name, &caller, "")?,
        ];
    }
    Ok(outcome)
}

fn list_names(state: &mut BusState, _peer: PeerId, _call: &Message) -> DriverResult {
    Ok(DriverOutcome::reply(vec![Value::string_array(
        state.names.names(),
    )]))
}

fn list_activatable_names(_state: &mut BusState, _peer: PeerId, _call: &Message) -> DriverResult {
    Ok(DriverOutcome::reply(vec![Value::string_array(
        std::iter::empty::<String>(),
    )]))
}

fn name_has_owner(state: &mut BusState, _peer: PeerId, call: &Message) -> DriverResult {
    let name = str_arg(call, 0)?;
    Ok(DriverOutcome::reply(vec![state
        .names
        .owner(name)
        .is_some()
        .into()]))
}

fn get_name_owner(state: &mut BusState, _peer: PeerId, call: &Message) -> DriverResult {
    let name = str_arg(call, 0)?;
    let owner = match owning_peer(state, name)? {
        None => BUS_NAME.to_string(),
        Some(owner) => state
            .unique_name(owner)
            .map(str::to_string)
            .ok_or_else(|| DriverError::no_owner(name))?,
    };
    Ok(DriverOutcome::reply(vec![owner.into()]))
}

fn add_match(state: &mut BusState, peer: PeerId, call: &Message) -> DriverResult {
    let text = str_arg(call, 0)?;
    let rule = MatchRule::parse(text)
        .map_err(|e| DriverError::new(errors::MATCH_RULE_INVALID, e.to_string()))?;
    state.matches.add(peer, rule);
    Ok(DriverOutcome::empty())
}

fn remove_match(state: &mut BusState, peer: PeerId, call: &Message) -> DriverResult {
    let text = str_arg(call, 0)?;
    let rule = MatchRule::parse(text)
        .map_err(|e| DriverError::new(errors::MATCH_RULE_INVALID, e.to_string()))?;
    if state.matches.remove(peer, &rule) {
        Ok(DriverOutcome::empty())
    } else {
        Err(DriverError::new(
            errors::MATCH_RULE_NOT_FOUND,
            format!("The given match rule wasn't found: {text}"),
        ))
    }
}

fn get_connection_unix_user(state: &mut BusState, _peer: PeerId, call: &Message) -> DriverResult {
    let name = str_arg(call, 0)?;
    let uid = match owning_peer(state, name)? {
        None => nix::unistd::getuid().as_raw(),
        Some(owner) => state
            .peers
            .get(&owner)
            .and_then(|p| p.identity.uid)
            .unwrap_or(0),
    };
    Ok(DriverOutcome::reply(vec![uid.into()]))
}

fn get_connection_unix_process_id(
    state: &mut BusState,
    _peer: PeerId,
    call: &Message,
) -> DriverResult {
    let name = str_arg(call, 0)?;
    let pid = match owning_peer(state, name)? {
        None => std::process::id(),
        Some(owner) => state
            .peers
            .get(&owner)
            .and_then(|p| p.identity.pid)
            .unwrap_or(0),
    };
    Ok(DriverOutcome::reply(vec![pid.into()]))
}

fn list_queued_owners(state: &mut BusState, peer: PeerId, call: &Message) -> DriverResult {
    let owner = get_name_owner(state, peer, call)?.body;
    let owners: Vec<String> = owner
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect();
    Ok(DriverOutcome::reply(vec![Value::string_array(owners)]))
}

fn start_service_by_name(state: &mut BusState, _peer: PeerId, call: &Message) -> DriverResult {
    let name = str_arg(call, 0)?;
    if state.names.owner(name).is_some() {
        return Ok(DriverOutcome::reply(vec![StartServiceReply::AlreadyRunning
            .as_u32()
            .into()]));
    }
    Err(DriverError::new(
        errors::SERVICE_UNKNOWN,
        format!("The name `{name}' was not provided by any .service files"),
    ))
}

fn reload_config(_state: &mut BusState, _peer: PeerId, _call: &Message) -> DriverResult {
    Ok(DriverOutcome::empty())
}

fn get_id(state: &mut BusState, _peer: PeerId, _call: &Message) -> DriverResult {
    Ok(DriverOutcome::reply(vec![state.guid.as_str().into()]))
}

fn introspect(_state: &mut BusState, _peer: PeerId, _call: &Message) -> DriverResult {
    Ok(DriverOutcome::reply(vec![BUS_INTROSPECTION_XML.into()]))
}

fn ping(_state: &mut BusState, _peer: PeerId, _call: &Message) -> DriverResult {
    Ok(DriverOutcome::empty())
}
