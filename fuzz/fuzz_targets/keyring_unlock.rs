//! Fuzz target for Keyring::unlock
//!
//! Keyring files come from disk and may be truncated, corrupted or hostile.
//! Unlocking must fail with a structured error and never panic, whatever the
//! entry count or salt lengths claim.

#![no_main]

use fieldsec_crypto::Keyring;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(keyring) = Keyring::unlock(data, "fuzz") {
        // An unlocked keyring lists exactly the roles it holds
        assert_eq!(keyring.roles().count(), keyring.len());
    }
});
