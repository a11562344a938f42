//! Fuzz test for geohash encoding
//!
//! Arbitrary coordinates and precisions: invalid input must be rejected with
//! an error, valid input must produce a cell that contains the point.
//!
//! Run with: cargo +nightly fuzz run geohash_encode_fuzz -- -max_total_time=60

#![no_main]

use ballast_geo::{decode_bounds, encode};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|input: (f64, f64, u8)| {
    let (lat, lng, precision) = input;
    let precision = usize::from(precision % 16);

    let Ok(hash) = encode(lat, lng, precision) else {
        return;
    };

    assert_eq!(hash.len(), precision);
    let bounds = decode_bounds(&hash).expect("encoded hash decodes");
    assert!(
        bounds.contains(lat, lng),
        "cell {} must contain ({}, {})",
        hash,
        lat,
        lng
    );
});
