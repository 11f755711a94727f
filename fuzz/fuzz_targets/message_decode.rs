//! Fuzz harness for `Message::decode`.
//!
//! Arbitrary bytes must decode to a message or an error, never a panic.
//! Anything that decodes and re-encodes must encode to the same bytes again.

#![no_main]
use libfuzzer_sys::fuzz_target;
use rbus_core::wire::Message;

fuzz_target!(|data: &[u8]| {
    let Ok(message) = Message::decode(data) else {
        return;
    };
    if let Ok(encoded) = message.encode() {
        let again = Message::decode(&encoded).expect("re-encoded message must decode");
        assert_eq!(again.encode().ok(), Some(encoded));
    }
});
