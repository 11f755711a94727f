//! Match rules.
//!
//! A match rule selects messages by header fields. Its textual form, as
//! passed to `AddMatch`, is a comma-separated list of `key='value'` pairs:
//!
//! ```text
//! type='signal',interface='org.example.Iface',member='Changed'
//! ```
//!
//! Every key is optional; an absent key matches anything. `argN` and
//! `eavesdrop` keys are accepted for compatibility but do not filter.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::names;
use crate::wire::{Message, MessageType};

/// Errors from parsing a match rule.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MatchRuleError {
    /// The rule text does not follow the `key='value'` grammar.
    #[error("malformed match rule {0:?}")]
    Malformed(String),

    /// The rule uses a key this implementation does not know.
    #[error("unknown match rule key {0:?}")]
    UnknownKey(String),

    /// A value is not valid for its key.
    #[error("invalid value {value:?} for match rule key {key}")]
    InvalidValue {
        /// Rule key.
        key: String,
        /// Offending value.
        value: String,
    },
}

/// A filter over message headers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct MatchRule {
    message_type: Option<MessageType>,
    sender: Option<String>,
    interface: Option<String>,
    member: Option<String>,
    path: Option<String>,
    path_namespace: Option<String>,
    destination: Option<String>,
}

impl MatchRule {
    /// A rule matching every message.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A rule matching signals with the given interface and member.
    #[must_use]
    pub fn signal(interface: impl Into<String>, member: impl Into<String>) -> Self {
        Self::new()
            .with_type(MessageType::Signal)
            .with_interface(interface)
            .with_member(member)
    }

    /// Restricts the message type.
    #[must_use]
    pub const fn with_type(mut self, message_type: MessageType) -> Self {
        self.message_type = Some(message_type);
        self
    }

    /// Restricts the sender.
    #[must_use]
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// Restricts the interface.
    #[must_use]
    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    /// Restricts the member.
    #[must_use]
    pub fn with_member(mut self, member: impl Into<String>) -> Self {
        self.member = Some(member.into());
        self
    }

    /// Restricts the object path.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Restricts to paths at or below `namespace`.
    #[must_use]
    pub fn with_path_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.path_namespace = Some(namespace.into());
        self
    }

    /// Restricts the destination.
    #[must_use]
    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Required sender, if any.
    #[must_use]
    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    /// Parses the textual form.
    pub fn parse(text: &str) -> Result<Self, MatchRuleError> {
        let mut rule = Self::new();
        for (key, value) in tokenize(text)? {
            rule.apply(&key, value)?;
        }
        Ok(rule)
    }

    fn apply(&mut self, key: &str, value: String) -> Result<(), MatchRuleError> {
        let invalid = |value: String| MatchRuleError::InvalidValue {
            key: key.to_string(),
            value,
        };
        match key {
            "type" => {
                self.message_type = Some(MessageType::from_name(&value).ok_or_else(|| invalid(value))?);
            },
            "sender" => {
                if !names::is_valid_bus_name(&value) {
                    return Err(invalid(value));
                }
                self.sender = Some(value);
            },
            "interface" => {
                if !names::is_valid_interface_name(&value) {
                    return Err(invalid(value));
                }
                self.interface = Some(value);
            },
            "member" => {
                if !names::is_valid_member_name(&value) {
                    return Err(invalid(value));
                }
                self.member = Some(value);
            },
            "path" | "path_namespace" => {
                if !names::is_valid_object_path(&value) {
                    return Err(invalid(value));
                }
                if key == "path" {
                    self.path = Some(value);
                } else {
                    self.path_namespace = Some(value);
                }
            },
            "destination" => {
                if !names::is_valid_bus_name(&value) {
                    return Err(invalid(value));
                }
                self.destination = Some(value);
            },
            "eavesdrop" => {},
            arg if is_arg_key(arg) => {},
            other => return Err(MatchRuleError::UnknownKey(other.to_string())),
        }
        Ok(())
    }

    /// Returns `true` if `message` satisfies every key of the rule.
    #[must_use]
    pub fn matches(&self, message: &Message) -> bool {
        if self
            .message_type
            .is_some_and(|ty| ty != message.message_type())
        {
            return false;
        }
        let field_matches = |expected: &Option<String>, actual: Option<&str>| {
            expected.as_deref().map_or(true, |e| actual == Some(e))
        };
        if !field_matches(&self.sender, message.sender())
            || !field_matches(&self.interface, message.interface())
            || !field_matches(&self.member, message.member())
            || !field_matches(&self.destination, message.destination())
            || !field_matches(&self.path, message.path().map(|p| p.as_str()))
        {
            return false;
        }
        if let Some(namespace) = &self.path_namespace {
            let Some(path) = message.path() else {
                return false;
            };
            let path = path.as_str();
            let inside = namespace == "/"
                || path == namespace
                || (path.starts_with(namespace.as_str())
                    && path.as_bytes().get(namespace.len()) == Some(&b'/'));
            if !inside {
                return false;
            }
        }
        true
    }
}

fn is_arg_key(key: &str) -> bool {
    let Some(rest) = key.strip_prefix("arg") else {
        return false;
    };
    let digits = rest.strip_suffix("path").unwrap_or(rest);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

fn tokenize(text: &str) -> Result<Vec<(String, String)>, MatchRuleError> {
    let malformed = || MatchRuleError::Malformed(text.to_string());
    let mut pairs = Vec::new();
    let mut rest = text.trim();
    while !rest.is_empty() {
        let (key, after_key) = rest.split_once('=').ok_or_else(malformed)?;
        let key = key.trim();
        if key.is_empty() {
            return Err(malformed());
        }
        let (value, after_value) = if let Some(quoted) = after_key.strip_prefix('\'') {
            let end = quoted.find('\'').ok_or_else(malformed)?;
            (&quoted[..end], &quoted[end + 1..])
        } else {
            let end = after_key.find(',').unwrap_or(after_key.len());
            (&after_key[..end], &after_key[end..])
        };
        pairs.push((key.to_string(), value.to_string()));
        rest = after_value.trim_start();
        if let Some(next) = rest.strip_prefix(',') {
            rest = next.trim_start();
            if rest.is_empty() {
                return Err(malformed());
            }
        } else if !rest.is_empty() {
            return Err(malformed());
        }
    }
    Ok(pairs)
}

impl fmt::Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = Vec::new();
        if let Some(ty) = self.message_type {
            parts.push(format!("type='{ty}'"));
        }
        let fields = [
            ("sender", &self.sender),
            ("interface", &self.interface),
            ("member", &self.member),
            ("path", &self.path),
            ("path_namespace", &self.path_namespace),
            ("destination", &self.destination),
        ];
        for (key, value) in fields {
            if let Some(value) = value {
                parts.push(format!("{key}='{value}'"));
            }
        }
        f.write_str(&parts.join(","))
    }
}

impl FromStr for MatchRule {
    type Err = MatchRuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Value;

    fn changed(path: &str, sender: &str) -> Message {
        Message::signal(path, "org.example.Iface", "Changed")
            .unwrap()
            .with_sender(sender)
            .with_body(vec![Value::from(1u32)])
            .unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        let rule =
            MatchRule::parse("type='signal', interface='org.example.Iface',member='Changed'")
                .unwrap();
        assert_eq!(
            rule,
            MatchRule::signal("org.example.Iface", "Changed")
        );
        assert_eq!(
            rule.to_string(),
            "type='signal',interface='org.example.Iface',member='Changed'"
        );
        assert_eq!(MatchRule::parse(&rule.to_string()).unwrap(), rule);
    }

    #[test]
    fn test_empty_rule_matches_everything() {
        let rule = MatchRule::parse("").unwrap();
        assert!(rule.matches(&changed("/a", ":1.1")));
    }

    #[test]
    fn test_filters_by_fields() {
        let rule = MatchRule::signal("org.example.Iface", "Changed").with_sender(":1.1");
        assert!(rule.matches(&changed("/a", ":1.1")));
        assert!(!rule.matches(&changed("/a", ":1.2")));
        assert!(!MatchRule::signal("org.example.Iface", "Removed").matches(&changed("/a", ":1.1")));
        assert!(!MatchRule::new()
            .with_type(MessageType::MethodCall)
            .matches(&changed("/a", ":1.1")));
    }

    #[test]
    fn test_path_namespace() {
        let rule = MatchRule::new().with_path_namespace("/org/example");
        assert!(rule.matches(&changed("/org/example", ":1.1")));
        assert!(rule.matches(&changed("/org/example/child", ":1.1")));
        assert!(!rule.matches(&changed("/org/examples", ":1.1")));
    }

    #[test]
    fn test_rejects_bad_rules() {
        assert!(matches!(
            MatchRule::parse("type='bogus'"),
            Err(MatchRuleError::InvalidValue { .. })
        ));
        assert!(matches!(
            MatchRule::parse("colour='red'"),
            Err(MatchRuleError::UnknownKey(_))
        ));
        assert!(matches!(
            MatchRule::parse("type='signal"),
            Err(MatchRuleError::Malformed(_))
        ));
        assert!(matches!(
            MatchRule::parse("type='signal',"),
            Err(MatchRuleError::Malformed(_))
        ));
    }

    #[test]
    fn test_arg_keys_are_accepted() {
        let rule = MatchRule::parse("type='signal',arg0='org.example',arg1path='/x',eavesdrop='true'")
            .unwrap();
        assert_eq!(rule, MatchRule::new().with_type(MessageType::Signal));
    }
}
