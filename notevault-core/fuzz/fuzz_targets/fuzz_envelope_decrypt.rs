#![no_main]

use libfuzzer_sys::fuzz_target;
use notevault_core::core_crypto::{decrypt, decrypt_stream, encrypt, MasterKey};

fuzz_target!(|data: &[u8]| {
    let key = MasterKey::from_bytes([0x42; 32]);

    // Tampered or truncated envelopes must be rejected, not panic
    let buffered = decrypt(&key, data);
    let mut out = Vec::new();
    let streamed = decrypt_stream(&key, data, &mut out, 7);
    assert_eq!(buffered.is_ok(), streamed.is_ok());

    // Round trip with the input as plaintext, limited to keep runs fast
    if data.len() <= 1_000_000 {
        let sealed = encrypt(&key, data).expect("encrypt");
        assert_eq!(decrypt(&key, &sealed).expect("decrypt"), data);
    }
});
