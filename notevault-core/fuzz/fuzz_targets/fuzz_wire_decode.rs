#![no_main]

use libfuzzer_sys::fuzz_target;
use notevault_core::core_broadcast::{ReplyEnvelope, Value};

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes must decode or fail cleanly, never panic or recurse unbounded
    if let Ok(value) = Value::decode(data) {
        // Anything that decodes re-encodes to the same bytes
        let encoded = value.encode().expect("decoded value re-encodes");
        assert_eq!(encoded, data);
    }

    if let Ok(envelope) = ReplyEnvelope::decode(data) {
        let encoded = envelope.encode().expect("decoded envelope re-encodes");
        let again = ReplyEnvelope::decode(&encoded).expect("re-encoded envelope decodes");
        assert_eq!(again, envelope);
    }
});
