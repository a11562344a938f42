//! Geohash codec.
//!
//! A geohash interleaves longitude and latitude bisection bits (longitude
//! first) and spells them five at a time in a 32-symbol alphabet. Every
//! prefix names a rectangle that contains all longer hashes sharing it, so a
//! fixed precision partitions the globe into a grid of equal-angle cells.

use ballast_core::GeoError;
use serde::Serialize;

const BASE32: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// Longest hash accepted (roughly 37mm x 19mm cells).
pub const MAX_PRECISION: usize = 12;

/// Latitude/longitude rectangle covered by a geohash.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GeoBounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl GeoBounds {
    fn world() -> Self {
        Self {
            min_lat: -90.0,
            max_lat: 90.0,
            min_lng: -180.0,
            max_lng: 180.0,
        }
    }

    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lng + self.max_lng) / 2.0,
        )
    }

    /// Height in degrees of latitude.
    pub fn lat_span(&self) -> f64 {
        self.max_lat - self.min_lat
    }

    /// Width in degrees of longitude.
    pub fn lng_span(&self) -> f64 {
        self.max_lng - self.min_lng
    }

    /// Inclusive on every edge.
    pub fn contains(&self, lat: f64, lng: f64) -> bool {
        (self.min_lat..=self.max_lat).contains(&lat) && (self.min_lng..=self.max_lng).contains(&lng)
    }
}

pub fn validate_coordinate(lat: f64, lng: f64) -> Result<(), GeoError> {
    if (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lng) {
        Ok(())
    } else {
        Err(GeoError::InvalidCoordinate { lat, lng })
    }
}

pub fn validate_precision(precision: usize) -> Result<(), GeoError> {
    if (1..=MAX_PRECISION).contains(&precision) {
        Ok(())
    } else {
        Err(GeoError::InvalidPrecision { precision })
    }
}

/// Encode a coordinate at the given precision.
pub fn encode(lat: f64, lng: f64, precision: usize) -> Result<String, GeoError> {
    validate_precision(precision)?;
    validate_coordinate(lat, lng)?;

    let mut bounds = GeoBounds::world();
    let mut hash = String::with_capacity(precision);
    let mut lng_bit = true;
    let mut symbol = 0usize;
    let mut bits = 0;

    while hash.len() < precision {
        symbol <<= 1;
        if lng_bit {
            let mid = (bounds.min_lng + bounds.max_lng) / 2.0;
            if lng >= mid {
                symbol |= 1;
                bounds.min_lng = mid;
            } else {
                bounds.max_lng = mid;
            }
        } else {
            let mid = (bounds.min_lat + bounds.max_lat) / 2.0;
            if lat >= mid {
                symbol |= 1;
                bounds.min_lat = mid;
            } else {
                bounds.max_lat = mid;
            }
        }
        lng_bit = !lng_bit;

        bits += 1;
        if bits == 5 {
            hash.push(char::from(BASE32[symbol]));
            symbol = 0;
            bits = 0;
        }
    }

    Ok(hash)
}

fn symbol_value(c: char) -> Option<usize> {
    let c = c.to_ascii_lowercase();
    BASE32.iter().position(|&b| char::from(b) == c)
}

/// Rectangle named by `hash`. Upper-case input is accepted.
pub fn decode_bounds(hash: &str) -> Result<GeoBounds, GeoError> {
    let invalid = || GeoError::InvalidGeohash {
        hash: hash.to_string(),
    };
    if hash.is_empty() || hash.len() > MAX_PRECISION {
        return Err(invalid());
    }

    let mut bounds = GeoBounds::world();
    let mut lng_bit = true;
    for c in hash.chars() {
        let value = symbol_value(c).ok_or_else(invalid)?;
        for shift in (0..5).rev() {
            let set = (value >> shift) & 1 == 1;
            if lng_bit {
                let mid = (bounds.min_lng + bounds.max_lng) / 2.0;
                if set {
                    bounds.min_lng = mid;
                } else {
                    bounds.max_lng = mid;
                }
            } else {
                let mid = (bounds.min_lat + bounds.max_lat) / 2.0;
                if set {
                    bounds.min_lat = mid;
                } else {
                    bounds.max_lat = mid;
                }
            }
            lng_bit = !lng_bit;
        }
    }

    Ok(bounds)
}

/// Center point of the cell named by `hash`.
pub fn decode(hash: &str) -> Result<(f64, f64), GeoError> {
    decode_bounds(hash).map(|bounds| bounds.center())
}

fn wrap_lng(lng: f64) -> f64 {
    (lng + 180.0).rem_euclid(360.0) - 180.0
}

/// Cell `d_lat` rows north and `d_lng` columns east of the cell described by
/// `bounds`. Longitude wraps at the antimeridian; rows past a pole are `None`.
fn offset_cell(bounds: &GeoBounds, precision: usize, d_lat: i64, d_lng: i64) -> Option<String> {
    let (lat, lng) = bounds.center();
    let lat = lat + d_lat as f64 * bounds.lat_span();
    if !(-90.0..=90.0).contains(&lat) {
        return None;
    }
    let lng = wrap_lng(lng + d_lng as f64 * bounds.lng_span());
    encode(lat, lng, precision).ok()
}

/// Adjacent cell in one step of `d_lat`/`d_lng`, each in `-1..=1`.
pub fn neighbor(hash: &str, d_lat: i8, d_lng: i8) -> Result<Option<String>, GeoError> {
    let bounds = decode_bounds(hash)?;
    Ok(offset_cell(
        &bounds,
        hash.len(),
        i64::from(d_lat.signum()),
        i64::from(d_lng.signum()),
    ))
}

/// The up to eight cells surrounding `hash`, without duplicates.
pub fn neighbors(hash: &str) -> Result<Vec<String>, GeoError> {
    ring(hash, 1)
}

/// Cells at Chebyshev distance exactly `ring` from `hash` in grid steps.
///
/// Ring 0 is the cell itself. Cells that would fall past a pole are skipped
/// and cells reached twice through longitude wrap-around are listed once.
pub fn ring(hash: &str, ring: u32) -> Result<Vec<String>, GeoError> {
    let bounds = decode_bounds(hash)?;
    Ok(ring_cells(&bounds, hash.len(), ring))
}

pub(crate) fn ring_cells(bounds: &GeoBounds, precision: usize, ring: u32) -> Vec<String> {
    let r = i64::from(ring);
    let mut cells: Vec<String> = Vec::with_capacity((8 * ring.max(1)) as usize);
    for d_lat in -r..=r {
        for d_lng in -r..=r {
            if d_lat.abs().max(d_lng.abs()) != r {
                continue;
            }
            if let Some(cell) = offset_cell(bounds, precision, d_lat, d_lng) {
                if !cells.contains(&cell) {
                    cells.push(cell);
                }
            }
        }
    }
    cells
}
