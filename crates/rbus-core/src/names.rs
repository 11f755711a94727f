//! Name validation.
//!
//! Bus names come in two flavours: unique connection names assigned by the
//! daemon (`:1.42`) and well-known names chosen by applications
//! (`org.example.Service`). Interface and error names share the well-known
//! grammar; member names are a single element.

use std::sync::LazyLock;

use regex::Regex;

/// Maximum length of any bus, interface, member or error name.
pub const MAX_NAME_LENGTH: usize = 255;

static WELL_KNOWN_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[-_a-zA-Z][-_a-zA-Z0-9]*(\.[-_a-zA-Z][-_a-zA-Z0-9]*)+$").expect("name regex is valid")
});

static UNIQUE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^:[0-9]+\.[0-9]+$").expect("name regex is valid")
});

static INTERFACE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[_a-zA-Z][_a-zA-Z0-9]*(\.[_a-zA-Z][_a-zA-Z0-9]*)+$").expect("name regex is valid")
});

static MEMBER_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[_a-zA-Z][_a-zA-Z0-9]*$").expect("name regex is valid")
});

static OBJECT_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/([-_a-zA-Z0-9]+(/[-_a-zA-Z0-9]+)*)?$").expect("name regex is valid")
});

/// Returns `true` for a syntactically valid well-known name.
#[must_use]
pub fn is_valid_well_known_name(name: &str) -> bool {
    name.len() <= MAX_NAME_LENGTH && WELL_KNOWN_NAME.is_match(name)
}

/// Returns `true` for a daemon-assigned unique name such as `:1.7`.
#[must_use]
pub fn is_unique_name(name: &str) -> bool {
    name.len() <= MAX_NAME_LENGTH && UNIQUE_NAME.is_match(name)
}

/// Returns `true` for any valid bus name, unique or well-known.
#[must_use]
pub fn is_valid_bus_name(name: &str) -> bool {
    is_unique_name(name) || is_valid_well_known_name(name)
}

/// Returns `true` for a valid interface name.
#[must_use]
pub fn is_valid_interface_name(name: &str) -> bool {
    name.len() <= MAX_NAME_LENGTH && INTERFACE_NAME.is_match(name)
}

/// Returns `true` for a valid error name (same grammar as interfaces).
#[must_use]
pub fn is_valid_error_name(name: &str) -> bool {
    is_valid_interface_name(name)
}

/// Returns `true` for a valid member name.
#[must_use]
pub fn is_valid_member_name(name: &str) -> bool {
    name.len() <= MAX_NAME_LENGTH && MEMBER_NAME.is_match(name)
}

/// Returns `true` for a valid object path.
#[must_use]
pub fn is_valid_object_path(path: &str) -> bool {
    OBJECT_PATH.is_match(path)
}
