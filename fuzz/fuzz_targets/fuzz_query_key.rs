//! Fuzz target for query key canonicalization.
//!
//! Feeds arbitrary bytes parsed as JSON into `QueryKey::from_json` and checks:
//! - No panic on any JSON shape
//! - The canonical hash survives a serialize/parse cycle
//! - Keys built from the same JSON compare equal
//!
//! # Running
//!
//! ```bash
//! cd fuzz
//! cargo +nightly fuzz run fuzz_query_key
//! ```

#![no_main]

use fanquery_core::QueryKey;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Limit input size to prevent deep recursion
    if data.len() > 4096 {
        return;
    }
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(data) else {
        return;
    };

    let key = QueryKey::from_json(value.clone());
    let again = QueryKey::from_json(value);
    assert_eq!(key, again);

    let reparsed: serde_json::Value = serde_json::from_str(key.hash_str()).unwrap();
    assert_eq!(QueryKey::from_json(reparsed).hash_str(), key.hash_str());
});
