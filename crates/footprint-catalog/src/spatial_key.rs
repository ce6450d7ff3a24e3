//! Hilbert-curve locality keys.
//!
//! A row is placed on the curve by its representative point (geometry
//! centroid, or bbox center when only the bbox is known). Coordinates are
//! normalized over the whole WGS84 extent (lon −180..180, lat −90..90) and
//! quantized to [`HILBERT_ORDER`] bits per axis, so a key fits a `u32`.
//!
//! Locality is approximate: nearby points usually get nearby keys, but curve
//! quadrant boundaries can separate close neighbours.

use geo_types::Geometry;

use crate::geometry::{BBox, representative_point};

/// Bits per axis.
pub const HILBERT_ORDER: u32 = 16;

const GRID: u64 = 1 << HILBERT_ORDER;

/// Scalar locality key of a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpatialKey(u32);

impl SpatialKey {
    /// Computes the key of a longitude/latitude pair.
    ///
    /// Out-of-range coordinates are clamped to the global extent. Returns
    /// `None` for NaN or infinite input.
    #[must_use]
    pub fn from_lon_lat(lon: f64, lat: f64) -> Option<Self> {
        if !lon.is_finite() || !lat.is_finite() {
            return None;
        }
        let x = quantize(lon, -180.0, 180.0);
        let y = quantize(lat, -90.0, 90.0);
        // GRID² - 1 == u32::MAX
        #[allow(clippy::cast_possible_truncation)]
        let key = hilbert_index(GRID, x, y) as u32;
        Some(Self(key))
    }

    /// Computes the key of a geometry from its representative point.
    #[must_use]
    pub fn from_geometry(geom: &Geometry<f64>) -> Option<Self> {
        let (x, y) = representative_point(geom)?;
        Self::from_lon_lat(x, y)
    }

    /// Computes the key of a bbox from its center.
    #[must_use]
    pub fn from_bbox(bbox: &BBox) -> Option<Self> {
        let (x, y) = bbox.center();
        Self::from_lon_lat(x, y)
    }

    /// Returns the raw curve index.
    #[must_use]
    pub const fn value(&self) -> u32 {
        self.0
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn quantize(v: f64, min: f64, max: f64) -> u64 {
    let unit = ((v - min) / (max - min)).clamp(0.0, 1.0);
    ((unit * GRID as f64) as u64).min(GRID - 1)
}

/// Maps cell `(x, y)` of an `n × n` grid (`n` a power of two) to its
/// distance along the Hilbert curve.
#[must_use]
pub fn hilbert_index(n: u64, mut x: u64, mut y: u64) -> u64 {
    let mut d = 0;
    let mut s = n / 2;
    while s > 0 {
        let rx = u64::from(x & s > 0);
        let ry = u64::from(y & s > 0);
        d += s * s * ((3 * rx) ^ ry);
        if ry == 0 {
            if rx == 1 {
                x = n - 1 - x;
                y = n - 1 - y;
            }
            std::mem::swap(&mut x, &mut y);
        }
        s /= 2;
    }
    d
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Inverse of [`hilbert_index`], used to check the mapping is a bijection.
    fn hilbert_point(n: u64, d: u64) -> (u64, u64) {
        let (mut x, mut y) = (0, 0);
        let mut t = d;
        let mut s = 1;
        while s < n {
            let rx = 1 & (t / 2);
            let ry = 1 & (t ^ rx);
            if ry == 0 {
                if rx == 1 {
                    x = s - 1 - x;
                    y = s - 1 - y;
                }
                std::mem::swap(&mut x, &mut y);
            }
            x += s * rx;
            y += s * ry;
            t /= 4;
            s *= 2;
        }
        (x, y)
    }

    #[test]
    fn order_one_curve_visits_quadrants_in_u_shape() {
        assert_eq!(hilbert_index(2, 0, 0), 0);
        assert_eq!(hilbert_index(2, 0, 1), 1);
        assert_eq!(hilbert_index(2, 1, 1), 2);
        assert_eq!(hilbert_index(2, 1, 0), 3);
    }

    #[test]
    fn small_grid_is_a_bijection_with_unit_steps() {
        let n = 16;
        let mut seen = vec![false; (n * n) as usize];
        for x in 0..n {
            for y in 0..n {
                let d = hilbert_index(n, x, y);
                assert!(!seen[d as usize], "duplicate index {d}");
                seen[d as usize] = true;
                assert_eq!(hilbert_point(n, d), (x, y));
            }
        }
        for d in 1..n * n {
            let (x0, y0) = hilbert_point(n, d - 1);
            let (x1, y1) = hilbert_point(n, d);
            assert_eq!(x0.abs_diff(x1) + y0.abs_diff(y1), 1, "curve must be continuous");
        }
    }

    #[test]
    fn corners_of_the_world() {
        let sw = SpatialKey::from_lon_lat(-180.0, -90.0).expect("key");
        assert_eq!(sw.value(), 0);
        let se = SpatialKey::from_lon_lat(180.0, -90.0).expect("key");
        assert_eq!(se.value(), u32::MAX);
    }

    #[test]
    fn non_finite_coordinates_have_no_key() {
        assert!(SpatialKey::from_lon_lat(f64::NAN, 0.0).is_none());
        assert!(SpatialKey::from_lon_lat(0.0, f64::INFINITY).is_none());
    }

    #[test]
    fn out_of_range_coordinates_are_clamped() {
        assert_eq!(
            SpatialKey::from_lon_lat(200.0, 95.0),
            SpatialKey::from_lon_lat(180.0, 90.0)
        );
    }

    #[test]
    fn bbox_key_uses_center() {
        let bbox = BBox::new(10.0, 10.0, 12.0, 14.0);
        assert_eq!(
            SpatialKey::from_bbox(&bbox),
            SpatialKey::from_lon_lat(11.0, 12.0)
        );
    }

    #[test]
    fn nearby_cities_cluster_before_distant_ones() {
        let a = SpatialKey::from_lon_lat(2.352_2, 48.856_6).expect("paris");
        let b = SpatialKey::from_lon_lat(2.352_200_1, 48.856_600_1).expect("paris, same block");
        let far = SpatialKey::from_lon_lat(151.2093, -33.8688).expect("sydney");
        assert!(a.value().abs_diff(b.value()) < a.value().abs_diff(far.value()));
    }

    proptest! {
        #[test]
        fn key_stays_in_range(lon in -180.0_f64..=180.0, lat in -90.0_f64..=90.0) {
            let key = SpatialKey::from_lon_lat(lon, lat).expect("finite");
            let (x, y) = hilbert_point(GRID, u64::from(key.value()));
            prop_assert!(x < GRID && y < GRID);
        }

        #[test]
        fn index_inverts(x in 0_u64..GRID, y in 0_u64..GRID) {
            let d = hilbert_index(GRID, x, y);
            prop_assert_eq!(hilbert_point(GRID, d), (x, y));
        }
    }
}
