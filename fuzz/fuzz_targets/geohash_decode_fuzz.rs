//! Fuzz test for geohash decoding
//!
//! Feeds arbitrary strings to the decoder and neighbor lookup. Neither may
//! panic, and any hash that decodes must re-encode to itself from the
//! center of its cell.
//!
//! Run with: cargo +nightly fuzz run geohash_decode_fuzz -- -max_total_time=60

#![no_main]

use ballast_geo::{decode_bounds, encode, neighbors, MAX_PRECISION};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(hash) = std::str::from_utf8(data) else {
        return;
    };

    let Ok(bounds) = decode_bounds(hash) else {
        return;
    };

    let (lat, lng) = bounds.center();
    assert!(bounds.contains(lat, lng), "cell center must lie inside the cell");

    if !hash.is_empty() && hash.len() <= MAX_PRECISION {
        let reencoded = encode(lat, lng, hash.len()).expect("center of a valid cell encodes");
        assert_eq!(reencoded, hash.to_ascii_lowercase());

        if let Ok(cells) = neighbors(hash) {
            assert!(cells.len() <= 8, "a cell has at most eight neighbors");
            for cell in &cells {
                assert_eq!(cell.len(), hash.len());
            }
        }
    }
});
