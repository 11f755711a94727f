//! The standard bus interface: well-known names, reply codes and error
//! names shared by the daemon and its clients.

/// Bus name owned by the daemon itself.
pub const BUS_NAME: &str = "org.freedesktop.DBus";

/// Object path of the daemon.
pub const BUS_PATH: &str = "/org/freedesktop/DBus";

/// Interface implemented by the daemon.
pub const BUS_INTERFACE: &str = "org.freedesktop.DBus";

/// Introspection interface available on every object.
pub const INTROSPECTABLE_INTERFACE: &str = "org.freedesktop.DBus.Introspectable";

/// Peer interface available on every object.
pub const PEER_INTERFACE: &str = "org.freedesktop.DBus.Peer";

/// Interface of locally synthesized messages (never sent on the wire).
pub const LOCAL_INTERFACE: &str = "org.freedesktop.DBus.Local";

/// Path of locally synthesized messages.
pub const LOCAL_PATH: &str = "/org/freedesktop/DBus/Local";

/// Signal names emitted by the daemon.
pub mod signals {
    /// `NameOwnerChanged(name, old_owner, new_owner)`, broadcast.
    pub const NAME_OWNER_CHANGED: &str = "NameOwnerChanged";
    /// `NameAcquired(name)`, sent to the new owner.
    pub const NAME_ACQUIRED: &str = "NameAcquired";
    /// `NameLost(name)`, sent to the previous owner.
    pub const NAME_LOST: &str = "NameLost";
    /// Local signal delivered when the connection closes.
    pub const DISCONNECTED: &str = "Disconnected";
}

/// Error names.
pub mod errors {
    /// Generic failure.
    pub const FAILED: &str = "org.freedesktop.DBus.Error.Failed";
    /// The daemon failed while executing a bus method.
    pub const GENERAL_ERROR: &str = "org.freedesktop.DBus.Error.GeneralError";
    /// The caller may not perform the operation.
    pub const ACCESS_DENIED: &str = "org.freedesktop.DBus.Error.AccessDenied";
    /// The destination name has no owner.
    pub const SERVICE_UNKNOWN: &str = "org.freedesktop.DBus.Error.ServiceUnknown";
    /// The queried name has no owner.
    pub const NAME_HAS_NO_OWNER: &str = "org.freedesktop.DBus.Error.NameHasNoOwner";
    /// The object exists but has no such method.
    pub const UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
    /// No object is exported at the path.
    pub const UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
    /// Arguments do not match the method.
    pub const INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
    /// A match rule could not be parsed.
    pub const MATCH_RULE_INVALID: &str = "org.freedesktop.DBus.Error.MatchRuleInvalid";
    /// `RemoveMatch` for a rule that was never added.
    pub const MATCH_RULE_NOT_FOUND: &str = "org.freedesktop.DBus.Error.MatchRuleNotFound";
    /// No reply arrived in time.
    pub const NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";
    /// A reply arrived that matches no outstanding call.
    pub const SPURIOUS_REPLY: &str = "org.freedesktop.DBus.Error.SpuriousReply";
    /// The connection closed; synthesized locally.
    pub const DISCONNECTED: &str = "org.freedesktop.DBus.Local.Disconnected";
}

/// `RequestName` flag: let another connection take the name over.
pub const NAME_FLAG_ALLOW_REPLACEMENT: u32 = 0x1;
/// `RequestName` flag: take the name over from its current owner.
pub const NAME_FLAG_REPLACE_EXISTING: u32 = 0x2;
/// `RequestName` flag: fail rather than queue.
pub const NAME_FLAG_DO_NOT_QUEUE: u32 = 0x4;

macro_rules! reply_code {
    (
        $(#[$meta:meta])*
        pub enum $name:ident { $($(#[$vmeta:meta])* $variant:ident = $value:literal,)* }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum $name {
            $($(#[$vmeta])* $variant = $value,)*
        }

        impl $name {
            /// Parses a reply code.
            #[must_use]
            pub const fn from_u32(code: u32) -> Option<Self> {
                match code {
                    $($value => Some(Self::$variant),)*
                    _ => None,
                }
            }

            /// Wire value of this code.
            #[must_use]
            pub const fn as_u32(self) -> u32 {
                self as u32
            }
        }
    };
}

reply_code! {
    /// Reply of `RequestName`.
    pub enum RequestNameReply {
        /// The caller now owns the name.
        PrimaryOwner = 1,
        /// The caller was queued for the name.
        InQueue = 2,
        /// Another connection owns the name.
        Exists = 3,
        /// The caller already owned the name.
        AlreadyOwner = 4,
    }
}

reply_code! {
    /// Reply of `ReleaseName`.
    pub enum ReleaseNameReply {
        /// The caller released the name.
        Released = 1,
        /// Nobody owns the name.
        NonExistent = 2,
        /// Somebody else owns the name.
        NotOwner = 3,
    }
}

reply_code! {
    /// Reply of `StartServiceByName`.
    pub enum StartServiceReply {
        /// The service was started.
        Success = 1,
        /// The service was already running.
        AlreadyRunning = 2,
    }
}

/// Introspection data returned by the daemon's `Introspect` method.
pub const BUS_INTROSPECTION_XML: &str = r#"<!DOCTYPE node PUBLIC "-//freedesktop//DTD D-BUS Object Introspection 1.0//EN"
"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd">
<node>
  <interface name="org.freedesktop.DBus.Introspectable">
    <method name="Introspect">
      <arg name="data" direction="out" type="s"/>
    </method>
  </interface>
  <interface name="org.freedesktop.DBus.Peer">
    <method name="Ping">
    </method>
  </interface>
  <interface name="org.freedesktop.DBus">
    <method name="Hello">
      <arg direction="out" type="s"/>
    </method>
    <method name="RequestName">
      <arg direction="in" type="s"/>
      <arg direction="in" type="u"/>
      <arg direction="out" type="u"/>
    </method>
    <method name="ReleaseName">
      <arg direction="in" type="s"/>
      <arg direction="out" type="u"/>
    </method>
    <method name="StartServiceByName">
      <arg direction="in" type="s"/>
      <arg direction="in" type="u"/>
      <arg direction="out" type="u"/>
    </method>
    <method name="NameHasOwner">
      <arg direction="in" type="s"/>
      <arg direction="out" type="b"/>
    </method>
    <method name="ListNames">
      <arg direction="out" type="as"/>
    </method>
    <method name="ListActivatableNames">
      <arg direction="out" type="as"/>
    </method>
    <method name="AddMatch">
      <arg direction="in" type="s"/>
    </method>
    <method name="RemoveMatch">
      <arg direction="in" type="s"/>
    </method>
    <method name="GetNameOwner">
      <arg direction="in" type="s"/>
      <arg direction="out" type="s"/>
    </method>
    <method name="ListQueuedOwners">
      <arg direction="in" type="s"/>
      <arg direction="out" type="as"/>
    </method>
    <method name="GetConnectionUnixUser">
      <arg direction="in" type="s"/>
      <arg direction="out" type="u"/>
    </method>
    <method name="GetConnectionUnixProcessID">
      <arg direction="in" type="s"/>
      <arg direction="out" type="u"/>
    </method>
    <method name="ReloadConfig">
    </method>
    <method name="GetId">
      <arg direction="out" type="s"/>
    </method>
    <signal name="NameOwnerChanged">
      <arg type="s"/>
      <arg type="s"/>
      <arg type="s"/>
    </signal>
    <signal name="NameLost">
      <arg type="s"/>
    </signal>
    <signal name="NameAcquired">
      <arg type="s"/>
    </signal>
  </interface>
</node>
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_codes() {
        assert_eq!(RequestNameReply::PrimaryOwner.as_u32(), 1);
        assert_eq!(RequestNameReply::from_u32(4), Some(RequestNameReply::AlreadyOwner));
        assert_eq!(RequestNameReply::from_u32(5), None);
        assert_eq!(ReleaseNameReply::from_u32(3), Some(ReleaseNameReply::NotOwner));
        assert_eq!(StartServiceReply::AlreadyRunning.as_u32(), 2);
    }
}
