//! GML 3.2 geometry reader.
//!
//! Coordinates are taken as longitude/latitude. `EPSG:4326` given in URN form
//! is latitude-first and gets swapped; projected reference systems are not
//! reprojected and yield `None`.

use harvester_core::geometry::Position;
use harvester_core::Geometry;
use roxmltree::Node;

use crate::xml;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AxisOrder {
    LonLat,
    LatLon,
}

fn axis_order(srs_name: Option<&str>) -> Option<AxisOrder> {
    let Some(srs) = srs_name.map(str::to_ascii_lowercase) else {
        return Some(AxisOrder::LonLat);
    };
    if srs.contains("crs84") {
        Some(AxisOrder::LonLat)
    } else if srs.contains("4326") {
        if srs.starts_with("urn:") || srs.contains("/def/crs/") {
            Some(AxisOrder::LatLon)
        } else {
            Some(AxisOrder::LonLat)
        }
    } else {
        None
    }
}

fn inherited_srs(node: Node<'_, '_>) -> Option<String> {
    node.ancestors()
        .filter(|n| n.is_element())
        .find_map(|n| xml::attr_of(n, "srsName"))
}

fn parse_positions(text: &str, dims: usize, order: AxisOrder) -> Option<Vec<Position>> {
    let values = text
        .split_whitespace()
        .map(|v| v.parse::<f64>().ok())
        .collect::<Option<Vec<_>>>()?;
    if values.is_empty() || values.len() % dims != 0 {
        return None;
    }
    Some(
        values
            .chunks(dims)
            .map(|c| match order {
                AxisOrder::LonLat => vec![c[0], c[1]],
                AxisOrder::LatLon => vec![c[1], c[0]],
            })
            .collect(),
    )
}

fn dims_of(node: Node<'_, '_>) -> usize {
    node.ancestors()
        .filter(|n| n.is_element())
        .find_map(|n| xml::attr_of(n, "srsDimension"))
        .and_then(|d| d.parse::<usize>().ok())
        .filter(|d| *d >= 2)
        .unwrap_or(2)
}

fn ring(node: Node<'_, '_>, order: AxisOrder) -> Option<Vec<Position>> {
    let linear = xml::first(node, "LinearRing")?;
    if let Some(pos_list) = xml::first(linear, "posList") {
        return parse_positions(&xml::node_text(pos_list)?, dims_of(pos_list), order);
    }
    let positions = xml::texts(linear, "pos")
        .iter()
        .map(|p| parse_positions(p, 2, order).and_then(|mut v| v.pop()))
        .collect::<Option<Vec<_>>>()?;
    (!positions.is_empty()).then_some(positions)
}

fn polygon(node: Node<'_, '_>, order: AxisOrder) -> Option<Vec<Vec<Position>>> {
    // GML 2 names the rings outerBoundaryIs/innerBoundaryIs.
    let exterior = xml::first(node, "exterior").or_else(|| xml::first(node, "outerBoundaryIs"))?;
    let mut rings = vec![ring(exterior, order)?];
    let interiors = xml::nodes(node, "interior").into_iter().chain(xml::nodes(node, "innerBoundaryIs"));
    for interior in interiors {
        rings.push(ring(interior, order)?);
    }
    Some(rings)
}

/// Reads the first GML geometry at or below `node`.
pub(crate) fn read_geometry(node: Node<'_, '_>) -> Option<Geometry> {
    let geometry = node.descendants().find(|n| {
        n.is_element()
            && matches!(
                n.tag_name().name(),
                "Point" | "Polygon" | "MultiSurface" | "MultiPolygon" | "Envelope" | "LineString"
            )
    })?;
    let order = axis_order(inherited_srs(geometry).as_deref())?;

    match geometry.tag_name().name() {
        "Point" => {
            let pos = xml::text(geometry, "pos").or_else(|| xml::text(geometry, "coordinates"))?;
            let mut positions = parse_positions(&pos.replace(',', " "), 2, order)?;
            let coordinates = positions.pop()?;
            Some(Geometry::Point { coordinates })
        }
        "LineString" => {
            let list = xml::first(geometry, "posList")?;
            Some(Geometry::LineString {
                coordinates: parse_positions(&xml::node_text(list)?, dims_of(list), order)?,
            })
        }
        "Polygon" => Some(Geometry::Polygon {
            coordinates: polygon(geometry, order)?,
        }),
        "MultiSurface" | "MultiPolygon" => {
            let polygons = xml::descendants(geometry, "Polygon")
                .map(|p| polygon(p, order))
                .collect::<Option<Vec<_>>>()?;
            match polygons.len() {
                0 => None,
                1 => polygons.into_iter().next().map(|coordinates| Geometry::Polygon { coordinates }),
                _ => Some(Geometry::MultiPolygon { coordinates: polygons }),
            }
        }
        "Envelope" => envelope(geometry, order),
        _ => None,
    }
}

fn envelope(node: Node<'_, '_>, order: AxisOrder) -> Option<Geometry> {
    let lower = parse_positions(&xml::text(node, "lowerCorner")?, 2, order)?.pop()?;
    let upper = parse_positions(&xml::text(node, "upperCorner")?, 2, order)?.pop()?;
    Geometry::bbox(lower[0], lower[1], upper[0], upper[1])
}

/// Bounding box of a feature, from `gml:boundedBy/gml:Envelope`.
pub(crate) fn bounded_by(node: Node<'_, '_>) -> Option<Geometry> {
    let env = xml::first(node, "boundedBy/Envelope")?;
    let order = axis_order(inherited_srs(env).as_deref())?;
    envelope(env, order)
}
