//! Exported objects and signal subscriptions.
//!
//! Inbound method calls are resolved against the [`ObjectRegistry`] while
//! holding its read lock, and the selected handler runs after the lock is
//! released:
//!
//! ```text
//! MethodCall ─> built-in (Peer / Introspectable)? ─> reply
//!           └─> path exported? ──no──> UnknownObject
//!                └─> (interface, member, signature) known? ──no──> UnknownMethod
//!                     └─> handler ─> MethodReturn | Error
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Write as _};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use thiserror::Error;

use crate::bus::{errors, INTROSPECTABLE_INTERFACE, PEER_INTERFACE};
use crate::error::{BusError, BusResult};
use crate::match_rule::MatchRule;
use crate::names;
use crate::wire::{Message, Signature, Value};

/// Handler for an exported method. Returns the reply body.
pub type MethodHandler =
    Arc<dyn Fn(&Message) -> Result<Vec<Value>, MethodError> + Send + Sync + 'static>;

/// Handler for a subscribed signal.
pub type SignalHandler = Arc<dyn Fn(&Message) + Send + Sync + 'static>;

/// Failure reported by a method handler.
///
/// Without an explicit name the caller receives
/// `org.freedesktop.DBus.Error.Failed` with the text
/// `Error Executing Method <interface>.<member>: <message>`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct MethodError {
    name: Option<String>,
    message: String,
}

impl MethodError {
    /// A generic failure.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            name: None,
            message: message.into(),
        }
    }

    /// A failure with a specific error name.
    #[must_use]
    pub fn named(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            message: message.into(),
        }
    }

    /// Explicit error name, if any.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Human-readable text.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for MethodError {
    fn from(message: String) -> Self {
        Self::failed(message)
    }
}

impl From<&str> for MethodError {
    fn from(message: &str) -> Self {
        Self::failed(message)
    }
}

struct MethodEntry {
    out_signature: String,
    handler: MethodHandler,
}

/// Registration table of one interface.
///
/// Methods are keyed by `(member, in-signature)`, so one member may be
/// overloaded on its argument types.
pub struct Interface {
    name: String,
    methods: BTreeMap<(String, String), MethodEntry>,
    signals: BTreeMap<String, String>,
}

impl fmt::Debug for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interface")
            .field("name", &self.name)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .field("signals", &self.signals)
            .finish()
    }
}

impl Interface {
    /// Empty interface.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: BTreeMap::new(),
            signals: BTreeMap::new(),
        }
    }

    /// Adds a method.
    #[must_use]
    pub fn with_method<F>(
        mut self,
        member: impl Into<String>,
        in_signature: impl Into<String>,
        out_signature: impl Into<String>,
        handler: F,
    ) -> Self
    where
        F: Fn(&Message) -> Result<Vec<Value>, MethodError> + Send + Sync + 'static,
    {
        self.methods.insert(
            (member.into(), in_signature.into()),
            MethodEntry {
                out_signature: out_signature.into(),
                handler: Arc::new(handler),
            },
        );
        self
    }

    /// Declares a signal for introspection.
    #[must_use]
    pub fn with_signal(mut self, member: impl Into<String>, signature: impl Into<String>) -> Self {
        self.signals.insert(member.into(), signature.into());
        self
    }

    /// Interface name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self) -> BusResult<()> {
        let export_error = |reason: String| BusError::Export { reason };
        if !names::is_valid_interface_name(&self.name) {
            return Err(export_error(format!("invalid interface name {:?}", self.name)));
        }
        let members = self
            .methods
            .iter()
            .map(|((member, in_sig), entry)| (member, [in_sig.as_str(), entry.out_signature.as_str()]))
            .chain(self.signals.iter().map(|(member, sig)| (member, [sig.as_str(), ""])));
        for (member, signatures) in members {
            if !names::is_valid_member_name(member) {
                return Err(export_error(format!("invalid member name {member:?}")));
            }
            for signature in signatures {
                Signature::new(signature).map_err(|e| {
                    export_error(format!("{}.{member}: {e}", self.name))
                })?;
            }
        }
        Ok(())
    }

    fn write_introspection(&self, xml: &mut String) {
        let _ = writeln!(xml, "  <interface name=\"{}\">", self.name);
        for ((member, in_sig), entry) in &self.methods {
            let _ = writeln!(xml, "    <method name=\"{member}\">");
            write_args(xml, in_sig, Some("in"));
            write_args(xml, &entry.out_signature, Some("out"));
            xml.push_str("    </method>\n");
        }
        for (member, signature) in &self.signals {
            let _ = writeln!(xml, "    <signal name=\"{member}\">");
            write_args(xml, signature, None);
            xml.push_str("    </signal>\n");
        }
        xml.push_str("  </interface>\n");
    }
}

fn write_args(xml: &mut String, signature: &str, direction: Option<&str>) {
    let Ok(signature) = Signature::new(signature) else {
        return;
    };
    for ty in signature.types() {
        match direction {
            Some(direction) => {
                let _ = writeln!(xml, "      <arg type=\"{ty}\" direction=\"{direction}\"/>");
            },
            None => {
                let _ = writeln!(xml, "      <arg type=\"{ty}\"/>");
            },
        }
    }
}

/// Objects exported on a connection, keyed by path then interface.
#[derive(Default)]
pub(crate) struct ObjectRegistry {
    objects: BTreeMap<String, BTreeMap<String, Interface>>,
}

/// Outcome of resolving an inbound call.
pub(crate) enum Resolved {
    /// The reply is already known.
    Reply(Message),
    /// A handler must run.
    Handler {
        handler: MethodHandler,
        interface: String,
        out_signature: String,
    },
}

impl ObjectRegistry {
    pub(crate) fn export(&mut self, path: &str, interface: Interface) -> BusResult<()> {
        if !names::is_valid_object_path(path) {
            return Err(BusError::Export {
                reason: format!("invalid object path {path:?}"),
            });
        }
        interface.validate()?;
        let interfaces = self.objects.entry(path.to_string()).or_default();
        if interfaces.contains_key(interface.name()) {
            return Err(BusError::Export {
                reason: format!("{} is already exported at {path}", interface.name()),
            });
        }
        interfaces.insert(interface.name().to_string(), interface);
        Ok(())
    }

    pub(crate) fn unexport(&mut self, path: &str) -> bool {
        self.objects.remove(path).is_some()
    }

    /// Finds what should answer `call`.
    pub(crate) fn resolve(&self, call: &Message) -> Resolved {
        let path = call.path().map_or("/", |p| p.as_str());
        let member = call.member().unwrap_or_default();
        let signature = call.signature().as_str();

        match (call.interface(), member) {
            (Some(PEER_INTERFACE) | None, "Ping") if signature.is_empty() => {
                return Resolved::Reply(Message::method_return(call));
            },
            (Some(INTROSPECTABLE_INTERFACE) | None, "Introspect")
                if signature.is_empty() && self.is_known_path(path) =>
            {
                let xml = self.introspect(path);
                return Resolved::Reply(reply_with(call, vec![Value::String(xml)]));
            },
            _ => {},
        }

        let Some(interfaces) = self.objects.get(path) else {
            return Resolved::Reply(Message::error(
                call,
                errors::UNKNOWN_OBJECT,
                format!("{path} is not an object provided by this process."),
            ));
        };
        let key = (member.to_string(), signature.to_string());
        let found = match call.interface() {
            Some(name) => interfaces
                .get(name)
                .and_then(|iface| iface.methods.get(&key).map(|m| (iface, m))),
            None => interfaces
                .values()
                .find_map(|iface| iface.methods.get(&key).map(|m| (iface, m))),
        };
        match found {
            Some((iface, entry)) => Resolved::Handler {
                handler: Arc::clone(&entry.handler),
                interface: iface.name.clone(),
                out_signature: entry.out_signature.clone(),
            },
            None => Resolved::Reply(Message::error(
                call,
                errors::UNKNOWN_METHOD,
                format!(
                    "The method `{}.{member}' does not exist on this object.",
                    call.interface().unwrap_or_default()
                ),
            )),
        }
    }

    fn is_known_path(&self, path: &str) -> bool {
        self.objects.contains_key(path) || !self.children(path).is_empty()
    }

    fn children(&self, path: &str) -> BTreeSet<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        self.objects
            .keys()
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter(|rest| !rest.is_empty())
            .filter_map(|rest| rest.split('/').next())
            .map(str::to_string)
            .collect()
    }

    /// Introspection XML for `path`.
    pub(crate) fn introspect(&self, path: &str) -> String {
        let mut xml = String::from(
            "<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\"\n\
             \"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">\n",
        );
        let _ = writeln!(xml, "<node name=\"{path}\">");
        xml.push_str(concat!(
            "  <interface name=\"org.freedesktop.DBus.Introspectable\">\n",
            "    <method name=\"Introspect\">\n",
            "      <arg type=\"s\" direction=\"out\"/>\n",
            "    </method>\n",
            "  </interface>\n",
            "  <interface name=\"org.freedesktop.DBus.Peer\">\n",
            "    <method name=\"Ping\"/>\n",
            "  </interface>\n",
        ));
        if let Some(interfaces) = self.objects.get(path) {
            for interface in interfaces.values() {
                interface.write_introspection(&mut xml);
            }
        }
        for child in self.children(path) {
            let _ = writeln!(xml, "  <node name=\"{child}\"/>");
        }
        xml.push_str("</node>\n");
        xml
    }
}

/// Runs a resolved handler and builds the reply.
pub(crate) fn run_handler(
    call: &Message,
    handler: &MethodHandler,
    interface: &str,
    out_signature: &str,
) -> Message {
    let member = call.member().unwrap_or_default();
    let failed = |text: &str| {
        Message::error(
            call,
            errors::FAILED,
            format!("Error Executing Method {interface}.{member}: {text}"),
        )
    };
    match catch_unwind(AssertUnwindSafe(|| handler(call))) {
        Ok(Ok(body)) => {
            let reply = match Message::method_return(call).with_body(body) {
                Ok(reply) => reply,
                Err(e) => return failed(&e.to_string()),
            };
            if reply.signature().as_str() == out_signature {
                reply
            } else {
                failed(&format!(
                    "reply signature \"{}\" does not match declared \"{out_signature}\"",
                    reply.signature()
                ))
            }
        },
        Ok(Err(error)) => match error.name() {
            Some(name) if names::is_valid_error_name(name) => {
                Message::error(call, name, error.message())
            },
            _ => failed(error.message()),
        },
        Err(_) => failed("handler panicked"),
    }
}

fn reply_with(call: &Message, body: Vec<Value>) -> Message {
    Message::method_return(call)
        .with_body(body)
        .unwrap_or_else(|_| Message::method_return(call))
}

/// Identifies a signal subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SignalHandlerId(u64);

/// Local signal subscriptions.
#[derive(Default)]
pub(crate) struct SignalRegistry {
    next_id: u64,
    handlers: Vec<(SignalHandlerId, MatchRule, SignalHandler)>,
}

impl SignalRegistry {
    pub(crate) fn add(&mut self, rule: MatchRule, handler: SignalHandler) -> SignalHandlerId {
        self.next_id += 1;
        let id = SignalHandlerId(self.next_id);
        self.handlers.push((id, rule, handler));
        id
    }

    pub(crate) fn remove(&mut self, id: SignalHandlerId) -> Option<MatchRule> {
        let index = self.handlers.iter().position(|(h, _, _)| *h == id)?;
        Some(self.handlers.remove(index).1)
    }

    /// Handlers whose rule matches `message`, in subscription order.
    pub(crate) fn matching(&self, message: &Message) -> Vec<SignalHandler> {
        self.handlers
            .iter()
            .filter(|(_, rule, _)| rule.matches(message))
            .map(|(_, _, handler)| Arc::clone(handler))
            .collect()
    }
}
