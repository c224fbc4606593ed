//! GeoJSON geometry model plus sanitization and centroid derivation.
//!
//! [`sanitize`] is total: any input yields either a valid geometry or `None`.

use serde::{Deserialize, Serialize};

pub type Position = Vec<f64>;

const AREA_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Geometry {
    Point { coordinates: Position },
    MultiPoint { coordinates: Vec<Position> },
    LineString { coordinates: Vec<Position> },
    MultiLineString { coordinates: Vec<Vec<Position>> },
    Polygon { coordinates: Vec<Vec<Position>> },
    MultiPolygon { coordinates: Vec<Vec<Vec<Position>>> },
    GeometryCollection { geometries: Vec<Geometry> },
}

impl Geometry {
    pub fn point(x: f64, y: f64) -> Self {
        Geometry::Point {
            coordinates: vec![x, y],
        }
    }

    /// Polygon spanning a west/south/east/north box; collapses to a point when
    /// the box has no extent.
    pub fn bbox(west: f64, south: f64, east: f64, north: f64) -> Option<Self> {
        if ![west, south, east, north].iter().all(|v| v.is_finite()) {
            return None;
        }
        if west == east && south == north {
            return Some(Geometry::point(west, south));
        }
        Some(Geometry::Polygon {
            coordinates: vec![vec![
                vec![west, south],
                vec![east, south],
                vec![east, north],
                vec![west, north],
                vec![west, south],
            ]],
        })
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Geometry::Point { .. } => "Point",
            Geometry::MultiPoint { .. } => "MultiPoint",
            Geometry::LineString { .. } => "LineString",
            Geometry::MultiLineString { .. } => "MultiLineString",
            Geometry::Polygon { .. } => "Polygon",
            Geometry::MultiPolygon { .. } => "MultiPolygon",
            Geometry::GeometryCollection { .. } => "GeometryCollection",
        }
    }

    fn positions(&self) -> Vec<&Position> {
        match self {
            Geometry::Point { coordinates } => vec![coordinates],
            Geometry::MultiPoint { coordinates } | Geometry::LineString { coordinates } => {
                coordinates.iter().collect()
            }
            Geometry::MultiLineString { coordinates } | Geometry::Polygon { coordinates } => {
                coordinates.iter().flatten().collect()
            }
            Geometry::MultiPolygon { coordinates } => coordinates.iter().flatten().flatten().collect(),
            Geometry::GeometryCollection { geometries } => {
                geometries.iter().flat_map(|g| g.positions()).collect()
            }
        }
    }
}

/// Outcome of a successful [`sanitize`] call.
#[derive(Debug, Clone, PartialEq)]
pub struct Sanitized {
    pub geometry: Geometry,
    /// At least one ring had its winding order reversed.
    pub flipped: bool,
}

pub fn sanitize(geometry: &Geometry) -> Option<Sanitized> {
    let mut flipped = false;
    let geometry = match geometry {
        Geometry::Point { coordinates } => Geometry::Point {
            coordinates: valid_position(coordinates)?,
        },
        Geometry::MultiPoint { coordinates } => Geometry::MultiPoint {
            coordinates: non_empty(valid_positions(coordinates)?)?,
        },
        Geometry::LineString { coordinates } => Geometry::LineString {
            coordinates: valid_line(coordinates)?,
        },
        Geometry::MultiLineString { coordinates } => Geometry::MultiLineString {
            coordinates: non_empty(
                coordinates
                    .iter()
                    .map(|line| valid_line(line))
                    .collect::<Option<Vec<_>>>()?,
            )?,
        },
        Geometry::Polygon { coordinates } => {
            let (rings, f) = sanitize_polygon(coordinates)?;
            flipped |= f;
            Geometry::Polygon { coordinates: rings }
        }
        Geometry::MultiPolygon { coordinates } => {
            let mut polygons = Vec::with_capacity(coordinates.len());
            for polygon in coordinates {
                let (rings, f) = sanitize_polygon(polygon)?;
                flipped |= f;
                polygons.push(rings);
            }
            Geometry::MultiPolygon {
                coordinates: non_empty(polygons)?,
            }
        }
        Geometry::GeometryCollection { geometries } => {
            let mut members = Vec::with_capacity(geometries.len());
            for member in geometries {
                let sanitized = sanitize(member)?;
                flipped |= sanitized.flipped;
                members.push(sanitized.geometry);
            }
            Geometry::GeometryCollection {
                geometries: non_empty(members)?,
            }
        }
    };
    Some(Sanitized { geometry, flipped })
}

/// Area-weighted centroid for polygons, arithmetic mean of all positions for
/// everything else.
pub fn centroid(geometry: &Geometry) -> Option<Geometry> {
    let (x, y) = match geometry {
        Geometry::Point { coordinates } => (*coordinates.first()?, *coordinates.get(1)?),
        Geometry::Polygon { coordinates } => polygon_centroid(coordinates)?,
        Geometry::MultiPolygon { coordinates } => {
            let mut weighted = (0.0, 0.0, 0.0);
            for polygon in coordinates {
                let Some(exterior) = polygon.first() else {
                    continue;
                };
                let area = signed_area(exterior).abs();
                let Some((cx, cy)) = polygon_centroid(polygon) else {
                    continue;
                };
                weighted.0 += cx * area;
                weighted.1 += cy * area;
                weighted.2 += area;
            }
            if weighted.2 > AREA_EPSILON {
                (weighted.0 / weighted.2, weighted.1 / weighted.2)
            } else {
                mean_position(&geometry.positions())?
            }
        }
        _ => mean_position(&geometry.positions())?,
    };
    if x.is_finite() && y.is_finite() {
        Some(Geometry::point(x, y))
    } else {
        None
    }
}

/// Envelope of every position, as a [`Geometry::bbox`].
pub fn bounding_box(geometry: &Geometry) -> Option<Geometry> {
    let positions = geometry.positions();
    let first = positions.first()?;
    let mut env = (*first.first()?, *first.get(1)?, *first.first()?, *first.get(1)?);
    for p in &positions {
        let (x, y) = (*p.first()?, *p.get(1)?);
        env = (env.0.min(x), env.1.min(y), env.2.max(x), env.3.max(y));
    }
    Geometry::bbox(env.0, env.1, env.2, env.3)
}

fn polygon_centroid(rings: &[Vec<Position>]) -> Option<(f64, f64)> {
    let exterior = rings.first()?;
    let area = signed_area(exterior);
    if area.abs() <= AREA_EPSILON {
        return mean_position(&exterior.iter().collect::<Vec<_>>());
    }
    let (mut cx, mut cy) = (0.0, 0.0);
    for pair in exterior.windows(2) {
        let (x0, y0) = (pair[0][0], pair[0][1]);
        let (x1, y1) = (pair[1][0], pair[1][1]);
        let cross = x0 * y1 - x1 * y0;
        cx += (x0 + x1) * cross;
        cy += (y0 + y1) * cross;
    }
    Some((cx / (6.0 * area), cy / (6.0 * area)))
}

fn mean_position(positions: &[&Position]) -> Option<(f64, f64)> {
    if positions.is_empty() {
        return None;
    }
    let mut sum = (0.0, 0.0);
    for p in positions {
        sum.0 += *p.first()?;
        sum.1 += *p.get(1)?;
    }
    let n = positions.len() as f64;
    Some((sum.0 / n, sum.1 / n))
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

fn valid_position(position: &Position) -> Option<Position> {
    if position.len() < 2 || position.iter().any(|v| !v.is_finite()) {
        return None;
    }
    Some(position.clone())
}

fn valid_positions(positions: &[Position]) -> Option<Vec<Position>> {
    positions.iter().map(valid_position).collect()
}

fn valid_line(line: &[Position]) -> Option<Vec<Position>> {
    let line = dedup_consecutive(valid_positions(line)?);
    if line.len() < 2 {
        return None;
    }
    Some(line)
}

fn dedup_consecutive(mut positions: Vec<Position>) -> Vec<Position> {
    positions.dedup_by(|a, b| a[0] == b[0] && a[1] == b[1]);
    positions
}

fn sanitize_polygon(rings: &[Vec<Position>]) -> Option<(Vec<Vec<Position>>, bool)> {
    if rings.is_empty() {
        return None;
    }
    let mut flipped = false;
    let mut out = Vec::with_capacity(rings.len());
    for (index, ring) in rings.iter().enumerate() {
        let (ring, f) = sanitize_ring(ring, index == 0)?;
        flipped |= f;
        out.push(ring);
    }
    Some((out, flipped))
}

fn sanitize_ring(ring: &[Position], exterior: bool) -> Option<(Vec<Position>, bool)> {
    let mut ring = dedup_consecutive(valid_positions(ring)?);
    let (first, last) = (ring.first()?.clone(), ring.last()?.clone());
    if first[0] != last[0] || first[1] != last[1] {
        ring.push(first);
    }
    if ring.len() < 4 {
        return None;
    }
    let area = signed_area(&ring);
    if area.abs() <= AREA_EPSILON || self_intersects(&ring) {
        return None;
    }
    // RFC 7946: exterior rings counter-clockwise, holes clockwise.
    let wrong = if exterior { area < 0.0 } else { area > 0.0 };
    if wrong {
        ring.reverse();
    }
    Some((ring, wrong))
}

/// Shoelace formula; positive for counter-clockwise rings.
fn signed_area(ring: &[Position]) -> f64 {
    ring.windows(2)
        .map(|pair| pair[0][0] * pair[1][1] - pair[1][0] * pair[0][1])
        .sum::<f64>()
        / 2.0
}

fn self_intersects(ring: &[Position]) -> bool {
    // ring is closed: segment i runs from ring[i] to ring[i + 1]
    let segments = ring.len() - 1;
    for i in 0..segments {
        for j in (i + 1)..segments {
            let adjacent = j == i + 1 || (i == 0 && j == segments - 1);
            if adjacent {
                continue;
            }
            if segments_intersect(&ring[i], &ring[i + 1], &ring[j], &ring[j + 1]) {
                return true;
            }
        }
    }
    false
}

fn orientation(a: &Position, b: &Position, c: &Position) -> f64 {
    (b[0] - a[0]) * (c[1] - a[1]) - (b[1] - a[1]) * (c[0] - a[0])
}

fn on_segment(a: &Position, b: &Position, p: &Position) -> bool {
    p[0] >= a[0].min(b[0]) && p[0] <= a[0].max(b[0]) && p[1] >= a[1].min(b[1]) && p[1] <= a[1].max(b[1])
}

fn segments_intersect(p1: &Position, p2: &Position, q1: &Position, q2: &Position) -> bool {
    let d1 = orientation(q1, q2, p1);
    let d2 = orientation(q1, q2, p2);
    let d3 = orientation(p1, p2, q1);
    let d4 = orientation(p1, p2, q2);
    if ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0)) && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0)) {
        return true;
    }
    (d1 == 0.0 && on_segment(q1, q2, p1))
        || (d2 == 0.0 && on_segment(q1, q2, p2))
        || (d3 == 0.0 && on_segment(p1, p2, q1))
        || (d4 == 0.0 && on_segment(p1, p2, q2))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_ccw() -> Vec<Vec<Position>> {
        vec![vec![
            vec![0.0, 0.0],
            vec![1.0, 0.0],
            vec![1.0, 1.0],
            vec![0.0, 1.0],
            vec![0.0, 0.0],
        ]]
    }

    #[test]
    fn forwards_polygon_is_unchanged() {
        let input = Geometry::Polygon {
            coordinates: square_ccw(),
        };
        let out = sanitize(&input).expect("valid");
        assert!(!out.flipped);
        assert_eq!(out.geometry, input);
    }

    #[test]
    fn backwards_polygon_is_flipped_and_flagged() {
        let mut rings = square_ccw();
        rings[0].reverse();
        let out = sanitize(&Geometry::Polygon { coordinates: rings }).expect("valid");
        assert!(out.flipped);
        assert_eq!(
            out.geometry,
            Geometry::Polygon {
                coordinates: square_ccw()
            }
        );
    }

    #[test]
    fn holes_are_oriented_clockwise() {
        let mut rings = square_ccw();
        rings[0] = vec![
            vec![0.0, 0.0],
            vec![10.0, 0.0],
            vec![10.0, 10.0],
            vec![0.0, 10.0],
            vec![0.0, 0.0],
        ];
        rings.push(vec![
            vec![2.0, 2.0],
            vec![4.0, 2.0],
            vec![4.0, 4.0],
            vec![2.0, 4.0],
            vec![2.0, 2.0],
        ]);
        let out = sanitize(&Geometry::Polygon { coordinates: rings }).expect("valid");
        assert!(out.flipped);
        let Geometry::Polygon { coordinates } = out.geometry else {
            panic!("polygon expected");
        };
        assert!(signed_area(&coordinates[1]) < 0.0);
    }

    #[test]
    fn open_ring_is_closed() {
        let rings = vec![vec![vec![0.0, 0.0], vec![1.0, 0.0], vec![1.0, 1.0], vec![0.0, 1.0]]];
        let out = sanitize(&Geometry::Polygon { coordinates: rings }).expect("valid");
        let Geometry::Polygon { coordinates } = out.geometry else {
            panic!("polygon expected");
        };
        assert_eq!(coordinates[0].len(), 5);
        assert_eq!(coordinates[0].first(), coordinates[0].last());
    }

    #[test]
    fn self_intersecting_polygon_is_rejected() {
        let bowtie = vec![vec![
            vec![0.0, 0.0],
            vec![1.0, 1.0],
            vec![1.0, 0.0],
            vec![0.0, 1.0],
            vec![0.0, 0.0],
        ]];
        assert!(sanitize(&Geometry::Polygon { coordinates: bowtie }).is_none());
    }

    #[test]
    fn degenerate_inputs_are_rejected() {
        let collinear = vec![vec![vec![0.0, 0.0], vec![1.0, 1.0], vec![2.0, 2.0], vec![0.0, 0.0]]];
        assert!(sanitize(&Geometry::Polygon { coordinates: collinear }).is_none());
        assert!(sanitize(&Geometry::Point { coordinates: vec![f64::NAN, 1.0] }).is_none());
        assert!(sanitize(&Geometry::Point { coordinates: vec![1.0] }).is_none());
        assert!(sanitize(&Geometry::MultiPolygon { coordinates: vec![] }).is_none());
        assert!(sanitize(&Geometry::LineString { coordinates: vec![vec![1.0, 1.0], vec![1.0, 1.0]] }).is_none());
    }

    #[test]
    fn centroid_of_square_and_points() {
        let square = Geometry::Polygon {
            coordinates: square_ccw(),
        };
        assert_eq!(centroid(&square), Some(Geometry::point(0.5, 0.5)));
        let line = Geometry::LineString {
            coordinates: vec![vec![0.0, 0.0], vec![2.0, 4.0]],
        };
        assert_eq!(centroid(&line), Some(Geometry::point(1.0, 2.0)));
        assert_eq!(centroid(&Geometry::point(7.0, 52.0)), Some(Geometry::point(7.0, 52.0)));
    }

    #[test]
    fn bounding_box_spans_all_positions() {
        let line = Geometry::LineString {
            coordinates: vec![vec![9.9, 53.6], vec![10.1, 53.5], vec![10.0, 53.55]],
        };
        assert_eq!(bounding_box(&line), Geometry::bbox(9.9, 53.5, 10.1, 53.6));
    }

    #[test]
    fn bbox_builds_polygon_or_point() {
        let poly = Geometry::bbox(9.0, 53.0, 10.0, 54.0).unwrap();
        assert_eq!(poly.type_name(), "Polygon");
        assert!(!sanitize(&poly).unwrap().flipped);
        assert_eq!(Geometry::bbox(9.0, 53.0, 9.0, 53.0), Some(Geometry::point(9.0, 53.0)));
        assert!(Geometry::bbox(f64::NAN, 53.0, 9.0, 53.0).is_none());
    }

    #[test]
    fn geojson_wire_shape() {
        let parsed: Geometry =
            serde_json::from_value(serde_json::json!({"type": "Point", "coordinates": [7, 52]})).unwrap();
        assert_eq!(parsed, Geometry::point(7.0, 52.0));
    }
}
