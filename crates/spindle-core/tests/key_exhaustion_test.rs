//! Key table exhaustion, isolated in its own process because it consumes
//! every slot in the global registry.

use spindle_core::error::Error;
use spindle_core::key::{self, KEYS_MAX};

#[test]
fn registry_exhausts_and_recovers() {
    let mut keys = Vec::new();
    loop {
        match key::create(None) {
            Ok(key) => keys.push(key),
            Err(error) => {
                assert_eq!(error, Error::NoResources);
                break;
            }
        }
    }
    assert_eq!(keys.len(), KEYS_MAX);

    // Values remain independently addressable at full occupancy.
    key::set(keys[0], 1).unwrap();
    key::set(keys[KEYS_MAX - 1], 2).unwrap();
    assert_eq!(key::get(keys[0]), 1);
    assert_eq!(key::get(keys[KEYS_MAX - 1]), 2);

    for key in keys.drain(..) {
        key::delete(key).unwrap();
    }

    // Freed slots are reissued.
    let again = key::create(None).unwrap();
    assert_eq!(key::get(again), 0);
    key::delete(again).unwrap();
}
