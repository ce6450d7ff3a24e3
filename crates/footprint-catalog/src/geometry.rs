//! Geometry decoding and covering-bbox computation.
//!
//! GeoParquet stores geometries as WKB. This module decodes the 2D part of
//! ISO and extended (PostGIS) WKB into `geo_types` geometries, encodes them
//! back (little-endian ISO WKB), and derives the covering bbox and the
//! representative point used for spatial ordering.
//!
//! Z and M ordinates are read and discarded; the catalog is strictly 2D.

use geo::{BoundingRect, Centroid};
use geo_types::{
    Coord, Geometry, GeometryCollection, LineString, MultiLineString, MultiPoint, MultiPolygon,
    Point, Polygon,
};
use serde::{Deserialize, Serialize};

/// Tolerance used when comparing a stored bbox with a recomputed one.
pub const BBOX_TOLERANCE: f64 = 1e-9;

const EWKB_Z: u32 = 0x8000_0000;
const EWKB_M: u32 = 0x4000_0000;
const EWKB_SRID: u32 = 0x2000_0000;

/// Recursion limit for nested collections.
const MAX_DEPTH: usize = 32;

/// Axis-aligned covering bbox of a geometry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    /// Minimum longitude.
    pub xmin: f64,
    /// Minimum latitude.
    pub ymin: f64,
    /// Maximum longitude.
    pub xmax: f64,
    /// Maximum latitude.
    pub ymax: f64,
}

impl BBox {
    /// Creates a bbox from its four edges.
    #[must_use]
    pub const fn new(xmin: f64, ymin: f64, xmax: f64, ymax: f64) -> Self {
        Self {
            xmin,
            ymin,
            xmax,
            ymax,
        }
    }

    /// Computes the extent of a geometry. `None` for empty geometries.
    #[must_use]
    pub fn from_geometry(geom: &Geometry<f64>) -> Option<Self> {
        let rect = geom.bounding_rect()?;
        let bbox = Self::new(rect.min().x, rect.min().y, rect.max().x, rect.max().y);
        bbox.is_finite().then_some(bbox)
    }

    /// Returns the center point `(x, y)`.
    #[must_use]
    pub fn center(&self) -> (f64, f64) {
        (
            (self.xmin + self.xmax) / 2.0,
            (self.ymin + self.ymax) / 2.0,
        )
    }

    /// Returns true if all edges are finite numbers.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.xmin.is_finite() && self.ymin.is_finite() && self.xmax.is_finite() && self.ymax.is_finite()
    }

    /// Compares two boxes edge by edge within `tolerance`.
    #[must_use]
    pub fn approx_eq(&self, other: &Self, tolerance: f64) -> bool {
        (self.xmin - other.xmin).abs() <= tolerance
            && (self.ymin - other.ymin).abs() <= tolerance
            && (self.xmax - other.xmax).abs() <= tolerance
            && (self.ymax - other.ymax).abs() <= tolerance
    }
}

/// Error raised for malformed WKB payloads.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid WKB at byte {offset}: {message}")]
pub struct WkbError {
    /// Byte offset where decoding failed.
    pub offset: usize,
    /// What was wrong.
    pub message: String,
}

#[derive(Clone, Copy)]
enum ByteOrder {
    Big,
    Little,
}

struct WkbReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WkbReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn error(&self, message: impl Into<String>) -> WkbError {
        WkbError {
            offset: self.pos,
            message: message.into(),
        }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], WkbError> {
        let end = self.pos + N;
        let slice = self
            .buf
            .get(self.pos..end)
            .ok_or_else(|| self.error(format!("unexpected end of input (need {N} bytes)")))?;
        let mut out = [0_u8; N];
        out.copy_from_slice(slice);
        self.pos = end;
        Ok(out)
    }

    fn byte_order(&mut self) -> Result<ByteOrder, WkbError> {
        match self.take::<1>()?[0] {
            0 => Ok(ByteOrder::Big),
            1 => Ok(ByteOrder::Little),
            other => Err(self.error(format!("invalid byte order marker {other}"))),
        }
    }

    fn u32(&mut self, order: ByteOrder) -> Result<u32, WkbError> {
        let raw = self.take::<4>()?;
        Ok(match order {
            ByteOrder::Big => u32::from_be_bytes(raw),
            ByteOrder::Little => u32::from_le_bytes(raw),
        })
    }

    fn f64(&mut self, order: ByteOrder) -> Result<f64, WkbError> {
        let raw = self.take::<8>()?;
        Ok(match order {
            ByteOrder::Big => f64::from_be_bytes(raw),
            ByteOrder::Little => f64::from_le_bytes(raw),
        })
    }

    fn count(&mut self, order: ByteOrder, min_item_bytes: usize) -> Result<usize, WkbError> {
        let n = self.u32(order)? as usize;
        let remaining = self.buf.len().saturating_sub(self.pos);
        if n.saturating_mul(min_item_bytes) > remaining {
            return Err(self.error(format!("count {n} exceeds remaining {remaining} bytes")));
        }
        Ok(n)
    }
}

#[derive(Clone, Copy)]
struct Header {
    order: ByteOrder,
    kind: u32,
    dims: usize,
}

fn read_header(r: &mut WkbReader<'_>) -> Result<Header, WkbError> {
    let order = r.byte_order()?;
    let raw = r.u32(order)?;

    let mut dims = 2;
    if raw & EWKB_Z != 0 {
        dims += 1;
    }
    if raw & EWKB_M != 0 {
        dims += 1;
    }
    if raw & EWKB_SRID != 0 {
        let _srid = r.u32(order)?;
    }

    let iso = raw & 0x0FFF_FFFF;
    let kind = iso % 1000;
    dims += match iso / 1000 {
        0 => 0,
        1 | 2 => 1,
        3 => 2,
        other => return Err(r.error(format!("unsupported dimension flag {other}"))),
    };

    Ok(Header { order, kind, dims })
}

fn read_coord(r: &mut WkbReader<'_>, h: Header) -> Result<Coord<f64>, WkbError> {
    let x = r.f64(h.order)?;
    let y = r.f64(h.order)?;
    for _ in 2..h.dims {
        let _ = r.f64(h.order)?;
    }
    Ok(Coord { x, y })
}

fn read_line(r: &mut WkbReader<'_>, h: Header) -> Result<LineString<f64>, WkbError> {
    let n = r.count(h.order, 16)?;
    let coords = (0..n)
        .map(|_| read_coord(r, h))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(LineString::new(coords))
}

fn read_polygon(r: &mut WkbReader<'_>, h: Header) -> Result<Polygon<f64>, WkbError> {
    let rings = r.count(h.order, 4)?;
    if rings == 0 {
        return Ok(Polygon::new(LineString::new(Vec::new()), Vec::new()));
    }
    let exterior = read_line(r, h)?;
    let interiors = (1..rings)
        .map(|_| read_line(r, h))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Polygon::new(exterior, interiors))
}

fn read_members<T>(
    r: &mut WkbReader<'_>,
    h: Header,
    depth: usize,
    pick: impl Fn(Geometry<f64>) -> Option<T>,
    what: &str,
) -> Result<Vec<T>, WkbError> {
    let n = r.count(h.order, 5)?;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        let member = read_geometry(r, depth + 1)?;
        out.push(pick(member).ok_or_else(|| r.error(format!("{what} member has wrong type")))?);
    }
    Ok(out)
}

fn read_geometry(r: &mut WkbReader<'_>, depth: usize) -> Result<Geometry<f64>, WkbError> {
    if depth > MAX_DEPTH {
        return Err(r.error("geometry nesting too deep"));
    }
    let h = read_header(r)?;
    let geom = match h.kind {
        1 => Geometry::Point(Point::from(read_coord(r, h)?)),
        2 => Geometry::LineString(read_line(r, h)?),
        3 => Geometry::Polygon(read_polygon(r, h)?),
        4 => {
            let points = read_members(
                r,
                h,
                depth,
                |g| match g {
                    Geometry::Point(p) => Some(p),
                    _ => None,
                },
                "MultiPoint",
            )?;
            // Empty points are encoded as NaN coordinates.
            let points = points.into_iter().filter(|p| !p.x().is_nan()).collect();
            Geometry::MultiPoint(MultiPoint(points))
        }
        5 => Geometry::MultiLineString(MultiLineString(read_members(
            r,
            h,
            depth,
            |g| match g {
                Geometry::LineString(l) => Some(l),
                _ => None,
            },
            "MultiLineString",
        )?)),
        6 => Geometry::MultiPolygon(MultiPolygon(read_members(
            r,
            h,
            depth,
            |g| match g {
                Geometry::Polygon(p) => Some(p),
                _ => None,
            },
            "MultiPolygon",
        )?)),
        7 => Geometry::GeometryCollection(GeometryCollection(read_members(
            r,
            h,
            depth,
            Some,
            "GeometryCollection",
        )?)),
        other => return Err(r.error(format!("unsupported geometry type {other}"))),
    };
    Ok(geom)
}

/// Decodes a WKB (ISO or EWKB) payload into a 2D geometry.
///
/// # Errors
///
/// Returns [`WkbError`] if the payload is truncated, uses an unknown geometry
/// type, or has trailing bytes.
pub fn decode_wkb(bytes: &[u8]) -> Result<Geometry<f64>, WkbError> {
    let mut reader = WkbReader::new(bytes);
    let geom = read_geometry(&mut reader, 0)?;
    if reader.pos != bytes.len() {
        return Err(reader.error("trailing bytes after geometry"));
    }
    Ok(geom)
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_len(out: &mut Vec<u8>, n: usize) {
    put_u32(out, u32::try_from(n).unwrap_or(u32::MAX));
}

fn put_coord(out: &mut Vec<u8>, c: Coord<f64>) {
    out.extend_from_slice(&c.x.to_le_bytes());
    out.extend_from_slice(&c.y.to_le_bytes());
}

fn put_header(out: &mut Vec<u8>, kind: u32) {
    out.push(1);
    put_u32(out, kind);
}

fn put_line_body(out: &mut Vec<u8>, line: &LineString<f64>) {
    put_len(out, line.0.len());
    for c in &line.0 {
        put_coord(out, *c);
    }
}

fn put_polygon_body(out: &mut Vec<u8>, poly: &Polygon<f64>) {
    if poly.exterior().0.is_empty() {
        put_u32(out, 0);
        return;
    }
    put_len(out, 1 + poly.interiors().len());
    put_line_body(out, poly.exterior());
    for ring in poly.interiors() {
        put_line_body(out, ring);
    }
}

fn write_geometry(out: &mut Vec<u8>, geom: &Geometry<f64>) {
    match geom {
        Geometry::Point(p) => {
            put_header(out, 1);
            put_coord(out, p.0);
        }
        Geometry::Line(l) => write_geometry(out, &Geometry::LineString(LineString::from(*l))),
        Geometry::LineString(l) => {
            put_header(out, 2);
            put_line_body(out, l);
        }
        Geometry::Polygon(p) => {
            put_header(out, 3);
            put_polygon_body(out, p);
        }
        Geometry::Rect(r) => write_geometry(out, &Geometry::Polygon(r.to_polygon())),
        Geometry::Triangle(t) => write_geometry(out, &Geometry::Polygon(t.to_polygon())),
        Geometry::MultiPoint(mp) => {
            put_header(out, 4);
            put_len(out, mp.0.len());
            for p in &mp.0 {
                write_geometry(out, &Geometry::Point(*p));
            }
        }
        Geometry::MultiLineString(ml) => {
            put_header(out, 5);
            put_len(out, ml.0.len());
            for l in &ml.0 {
                put_header(out, 2);
                put_line_body(out, l);
            }
        }
        Geometry::MultiPolygon(mp) => {
            put_header(out, 6);
            put_len(out, mp.0.len());
            for p in &mp.0 {
                put_header(out, 3);
                put_polygon_body(out, p);
            }
        }
        Geometry::GeometryCollection(gc) => {
            put_header(out, 7);
            put_len(out, gc.0.len());
            for g in &gc.0 {
                write_geometry(out, g);
            }
        }
    }
}

/// Encodes a geometry as little-endian 2D ISO WKB.
#[must_use]
pub fn encode_wkb(geom: &Geometry<f64>) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    write_geometry(&mut out, geom);
    out
}

/// Returns the point used to place a geometry on the space-filling curve.
///
/// The centroid when it exists, else the center of the extent.
#[must_use]
pub fn representative_point(geom: &Geometry<f64>) -> Option<(f64, f64)> {
    geom.centroid()
        .map(|c| (c.x(), c.y()))
        .filter(|(x, y)| x.is_finite() && y.is_finite())
        .or_else(|| BBox::from_geometry(geom).map(|b| b.center()))
}
