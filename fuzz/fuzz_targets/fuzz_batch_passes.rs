//! Fuzz target for batch reconciliation.
//!
//! Runs arbitrary sequences of passes through an idle batch and checks:
//! - Accepted passes return one result per descriptor, in order
//! - Rejected passes leave the previous results untouched
//! - Dropping the batch releases every cache entry
//!
//! # Running
//!
//! ```bash
//! cd fuzz
//! cargo +nightly fuzz run fuzz_batch_passes
//! ```

#![no_main]

use arbitrary::Arbitrary;
use fanquery_core::{BatchConfig, FetchError, QueryBatch, QueryCache, QueryDescriptor, QueryKey};
use libfuzzer_sys::fuzz_target;
use serde_json::json;

#[derive(Arbitrary, Debug)]
struct Slot {
    id: u8,
    skip: bool,
    empty: bool,
}

#[derive(Arbitrary, Debug)]
struct PassesInput {
    passes: Vec<Vec<Slot>>,
}

fn descriptor(slot: &Slot) -> QueryDescriptor {
    let key = if slot.empty {
        QueryKey::new(Vec::<serde_json::Value>::new())
    } else {
        QueryKey::new([json!("k"), json!(slot.id % 16)])
    };
    if slot.skip {
        QueryDescriptor::skipped(key)
    } else {
        QueryDescriptor::fetching(key, |_ctx| async { Ok::<_, FetchError>(json!(null)) })
    }
}

fuzz_target!(|input: PassesInput| {
    let cache = QueryCache::default();
    let batch = QueryBatch::new(cache.clone(), BatchConfig { max_queries: Some(64) });

    for pass in input.passes.iter().take(32) {
        let descriptors: Vec<_> = pass.iter().map(descriptor).collect();
        let before = batch.results();
        match batch.run(descriptors.clone()) {
            Ok(results) => {
                assert_eq!(results.len(), descriptors.len());
                for (result, descriptor) in results.iter().zip(&descriptors) {
                    assert_eq!(&result.key, descriptor.key());
                }
            }
            Err(err) => {
                assert!(err.is_configuration());
                assert_eq!(batch.results(), before);
            }
        }
    }

    drop(batch);
    assert!(cache.is_empty());
});
