//! Fuzz harness for the text parsers: bus addresses, match rules and SASL
//! command lines.

#![no_main]
use libfuzzer_sys::fuzz_target;
use rbus_core::address::BusAddress;
use rbus_core::auth::Command;
use rbus_core::match_rule::MatchRule;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let _ = BusAddress::parse_list(text);
    if let Ok(rule) = MatchRule::parse(text) {
        let _ = rule.to_string();
    }
    let _ = Command::parse(text);
});
