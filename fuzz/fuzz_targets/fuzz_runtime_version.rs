#![no_main]

use launch_readiness::RuntimeVersion;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Some(version) = RuntimeVersion::parse(s) {
            // Whatever parses must print back to something that parses the same.
            assert_eq!(RuntimeVersion::parse(&version.to_string()), Some(version));
        }
    }
});
