//! Uniqueness and ordering of generated identities under concurrent callers.

use extiot_core::{IdentityGenerator, IdentityParts, SnowflakeGenerator};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

#[test]
fn test_identities_strictly_increase_in_call_order() {
    let generator = SnowflakeGenerator::new(3).unwrap();
    let mut previous = generator.generate().unwrap();
    for _ in 0..10_000 {
        let next = generator.generate().unwrap();
        assert!(next > previous, "{} not after {}", next, previous);
        previous = next;
    }
    assert_eq!(IdentityParts::of(previous).node_id, 3);
}

#[test]
fn test_concurrent_callers_get_unique_identities() {
    let generator = Arc::new(SnowflakeGenerator::new(7).unwrap());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let generator = generator.clone();
            thread::spawn(move || {
                (0..2_000)
                    .map(|_| generator.generate().unwrap())
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        let ids = handle.join().unwrap();
        // Each thread observes its own calls in increasing order.
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        for id in ids {
            assert!(seen.insert(id), "duplicate identity {}", id);
        }
    }
    assert_eq!(seen.len(), 16_000);
}
