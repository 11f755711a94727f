//! Name ownership and match rules.
//!
//! Both registries are owned by the router task and are never shared, so
//! they need no locking.
//!
//! # Invariants
//!
//! - A name has at most one owner; there is no queue of waiting owners.
//! - `org.freedesktop.DBus` is owned by the daemon and is never released.
//! - Unique names are `:1.N` with `N` counting up from 1 and never reused.

use std::collections::{BTreeMap, HashMap};

use rbus_core::bus::{ReleaseNameReply, RequestNameReply, BUS_NAME};
use rbus_core::match_rule::MatchRule;
use rbus_core::names;
use rbus_core::wire::Message;

use crate::peer::PeerId;

/// Why a name cannot be requested or released.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    /// Not a valid well-known name.
    #[error("Requested bus name \"{0}\" is not valid")]
    Invalid(String),
    /// Unique names are assigned by the bus.
    #[error("Cannot acquire a service starting with ':' such as \"{0}\"")]
    Unique(String),
    /// Reserved for the bus itself.
    #[error("Connection is not allowed to own the service \"{0}\" because it is reserved for D-Bus' use only")]
    Reserved(String),
}

/// Owner of a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// The daemon itself.
    Bus,
    /// A connection.
    Peer(PeerId),
}

/// Which connection owns which name.
#[derive(Debug, Default)]
pub struct NameRegistry {
    names: BTreeMap<String, PeerId>,
    next_unique: u64,
}

impl NameRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns the next unique name to `peer`.
    pub fn assign_unique(&mut self, peer: PeerId) -> String {
        self.next_unique += 1;
        let name = format!(":1.{}", self.next_unique);
        self.names.insert(name.clone(), peer);
        name
    }

    fn check_requestable(name: &str) -> Result<(), NameError> {
        if name.starts_with(':') {
            return Err(NameError::Unique(name.to_string()));
        }
        if name == BUS_NAME {
            return Err(NameError::Reserved(name.to_string()));
        }
        if !names::is_valid_well_known_name(name) {
            return Err(NameError::Invalid(name.to_string()));
        }
        Ok(())
    }

    /// Gives `name` to `peer` if it is free.
    pub fn request(&mut self, name: &str, peer: PeerId) -> Result<RequestNameReply, NameError> {
        Self::check_requestable(name)?;
        Ok(match self.names.get(name) {
            Some(owner) if *owner == peer => RequestNameReply::AlreadyOwner,
            Some(_) => RequestNameReply::Exists,
            None => {
                self.names.insert(name.to_string(), peer);
                RequestNameReply::PrimaryOwner
            },
        })
    }

    /// Takes `name` away from `peer` if it owns it.
    pub fn release(&mut self, name: &str, peer: PeerId) -> Result<ReleaseNameReply, NameError> {
        Self::check_requestable(name)?;
        Ok(match self.names.get(name) {
            None => ReleaseNameReply::NonExistent,
            Some(owner) if *owner != peer => ReleaseNameReply::NotOwner,
            Some(_) => {
                self.names.remove(name);
                ReleaseNameReply::Released
            },
        })
    }

    /// Owner of `name`.
    #[must_use]
    pub fn owner(&self, name: &str) -> Option<Owner> {
        if name == BUS_NAME {
            return Some(Owner::Bus);
        }
        self.names.get(name).copied().map(Owner::Peer)
    }

    /// Every owned name, the bus first.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        std::iter::once(BUS_NAME.to_string())
            .chain(self.names.keys().cloned())
            .collect()
    }

    /// Names owned by `peer`, in sorted order.
    #[must_use]
    pub fn owned_by(&self, peer: PeerId) -> Vec<String> {
        self.names
            .iter()
            .filter(|(_, owner)| **owner == peer)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Releases every name `peer` owns, returning them.
    ///
    /// Well-known names come first and the unique name last.
    pub fn release_all(&mut self, peer: PeerId) -> Vec<String> {
        let mut released = self.owned_by(peer);
        released.sort_by_key(|name| name.starts_with(':'));
        for name in &released {
            self.names.remove(name);
        }
        released
    }
}

/// Match rules registered through `AddMatch`.
#[derive(Debug, Default)]
pub struct MatchRegistry {
    rules: HashMap<PeerId, Vec<MatchRule>>,
}

impl MatchRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a rule for `peer`. Duplicates are kept.
    pub fn add(&mut self, peer: PeerId, rule: MatchRule) {
        self.rules.entry(peer).or_default().push(rule);
    }

    /// Removes the first rule of `peer` equal to `rule`.
    pub fn remove(&mut self, peer: PeerId, rule: &MatchRule) -> bool {
        let Some(rules) = self.rules.get_mut(&peer) else {
            return false;
        };
        let Some(index) = rules.iter().position(|r| r == rule) else {
            return false;
        };
        rules.remove(index);
        if rules.is_empty() {
            self.rules.remove(&peer);
        }
        true
    }

    /// Drops every rule of `peer`.
    pub fn remove_peer(&mut self, peer: PeerId) {
        self.rules.remove(&peer);
    }

    /// Number of rules `peer` has.
    #[must_use]
    pub fn count(&self, peer: PeerId) -> usize {
        self.rules.get(&peer).map_or(0, Vec::len)
    }

    /// Peers with at least one rule matching `message`, each listed once.
    #[must_use]
    pub fn subscribers(&self, message: &Message) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .rules
            .iter()
            .filter(|(_, rules)| rules.iter().any(|rule| rule.matches(message)))
            .map(|(peer, _)| *peer)
            .collect();
        peers.sort_unstable();
        peers
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const A: PeerId = PeerId(1);
    const B: PeerId = PeerId(2);

    #[test]
    fn test_unique_names_count_up() {
        let mut registry = NameRegistry::new();
        assert_eq!(registry.assign_unique(A), ":1.1");
        assert_eq!(registry.assign_unique(B), ":1.2");
        assert_eq!(registry.owner(":1.2"), Some(Owner::Peer(B)));
        assert_eq!(registry.owner(BUS_NAME), Some(Owner::Bus));
    }

    #[test]
    fn test_request_without_queue() {
        let mut registry = NameRegistry::new();
        assert_eq!(
            registry.request("org.example.Svc", A),
            Ok(RequestNameReply::PrimaryOwner)
        );
        assert_eq!(
            registry.request("org.example.Svc", A),
            Ok(RequestNameReply::AlreadyOwner)
        );
        assert_eq!(
            registry.request("org.example.Svc", B),
            Ok(RequestNameReply::Exists)
        );
        assert_eq!(registry.owner("org.example.Svc"), Some(Owner::Peer(A)));
    }

    #[test]
    fn test_request_rejects_bad_names() {
        let mut registry = NameRegistry::new();
        assert!(matches!(registry.request(":1.9", A), Err(NameError::Unique(_))));
        assert!(matches!(registry.request(BUS_NAME, A), Err(NameError::Reserved(_))));
        assert!(matches!(registry.request("nodots", A), Err(NameError::Invalid(_))));
        assert!(matches!(registry.release("", A), Err(NameError::Invalid(_))));
    }

    #[test]
    fn test_release() {
        let mut registry = NameRegistry::new();
        registry.request("org.example.Svc", A).unwrap();
        assert_eq!(
            registry.release("org.example.Other", A),
            Ok(ReleaseNameReply::NonExistent)
        );
        assert_eq!(
            registry.release("org.example.Svc", B),
            Ok(ReleaseNameReply::NotOwner)
        );
        assert_eq!(
            registry.release("org.example.Svc", A),
            Ok(ReleaseNameReply::Released)
        );
        assert_eq!(registry.owner("org.example.Svc"), None);
    }

    #[test]
    fn test_release_all_puts_unique_name_last() {
        let mut registry = NameRegistry::new();
        let unique = registry.assign_unique(A);
        registry.request("org.example.B", A).unwrap();
        registry.request("org.example.A", A).unwrap();
        registry.request("org.example.Other", B).unwrap();

        assert_eq!(
            registry.release_all(A),
            vec!["org.example.A".to_string(), "org.example.B".to_string(), unique]
        );
        assert_eq!(
            registry.names(),
            vec![BUS_NAME.to_string(), "org.example.Other".to_string()]
        );
    }

    #[test]
    fn test_match_registry() {
        let mut matches = MatchRegistry::new();
        let rule = MatchRule::signal("org.example.Iface", "Changed");
        matches.add(A, rule.clone());
        matches.add(A, rule.clone());
        matches.add(B, MatchRule::signal("org.example.Iface", "Other"));

        let changed = Message::signal("/", "org.example.Iface", "Changed").unwrap();
        assert_eq!(matches.subscribers(&changed), vec![A]);

        assert!(matches.remove(A, &rule));
        assert_eq!(matches.count(A), 1);
        assert!(matches.remove(A, &rule));
        assert!(!matches.remove(A, &rule));
        assert!(matches.subscribers(&changed).is_empty());

        matches.remove_peer(B);
        assert_eq!(matches.count(B), 0);
    }

    proptest! {
        #[test]
        fn prop_single_owner_and_full_release(ops in proptest::collection::vec((0u64..4, 0u8..6), 0..60)) {
            let mut registry = NameRegistry::new();
            let mut owners: HashMap<String, PeerId> = HashMap::new();
            for (peer, name) in ops {
                let peer = PeerId(peer);
                let name = format!("org.example.N{name}");
                let reply = registry.request(&name, peer).unwrap();
                match owners.get(&name) {
                    None => {
                        prop_assert_eq!(reply, RequestNameReply::PrimaryOwner);
                        owners.insert(name, peer);
                    },
                    Some(owner) if *owner == peer => {
                        prop_assert_eq!(reply, RequestNameReply::AlreadyOwner);
                    },
                    Some(_) => prop_assert_eq!(reply, RequestNameReply::Exists),
                }
            }
            for (name, owner) in &owners {
                prop_assert_eq!(registry.owner(name), Some(Owner::Peer(*owner)));
            }
            for peer in 0..4 {
                registry.release_all(PeerId(peer));
            }
            prop_assert_eq!(registry.names(), vec![BUS_NAME.to_string()]);
        }
    }
}
