//! BALLAST Geo - Proximity search over moving entities
//!
//! A geohash codec, great-circle distance, and an in-memory index that keeps
//! each entity in exactly one geohash cell so radius queries only look at
//! nearby cells.

pub mod distance;
pub mod geohash;
pub mod index;

pub use distance::{haversine_km, KM_PER_DEGREE};
pub use geohash::{decode, decode_bounds, encode, neighbors, GeoBounds, MAX_PRECISION};
pub use index::{NearbyEntity, SpatialConfig, SpatialEntry, SpatialIndex, SpatialStats};
