//! Fuzz harness for `HmacTokenIssuer::verify`.
//!
//! Untrusted bearer strings must be rejected without panicking, and a
//! forged token must never verify.

#![no_main]
use libfuzzer_sys::fuzz_target;
use sessiongate::token::HmacTokenIssuer;

fuzz_target!(|data: &[u8]| {
    let Ok(issuer) = HmacTokenIssuer::new("fuzz-secret-key-0123", "sessiongate", "clients", 60)
    else {
        return;
    };
    let token = String::from_utf8_lossy(data);
    assert!(issuer.verify(&token).is_err());
});
