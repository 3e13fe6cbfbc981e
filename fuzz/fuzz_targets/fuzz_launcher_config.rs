#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Config files are user-edited; malformed input must error, never panic.
    if let Ok(s) = std::str::from_utf8(data) {
        let _ = launch_readiness::LauncherConfig::from_json_str(s);
    }

    let _ = serde_json::from_slice::<launch_readiness::SessionSignal>(data);
});
