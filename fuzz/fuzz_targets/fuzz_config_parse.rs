//! Fuzz harness for `Config::from_toml_str`.
//!
//! Arbitrary bytes, lossily decoded, must parse or fail without panicking.
//! Whatever parses must also survive validation.

#![no_main]
use libfuzzer_sys::fuzz_target;
use sessiongate::Config;

fuzz_target!(|data: &[u8]| {
    let text = String::from_utf8_lossy(data);
    if let Ok(config) = Config::from_toml_str(&text) {
        let _ = config.validate();
        let _ = config.session.probe_timeout();
        let _ = config.handoff.ttl();
    }
});
