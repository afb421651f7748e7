use crate::codec::{AttributeValues, PointBuffer};
use crate::octree::aabb::Aabb;
use crate::octree::point_attributes::AttributeKind;
use glam::{DVec3, U8Vec4};

/// A single point in world space, with the attributes renderers usually need.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PointData {
    pub position: DVec3,
    pub color: Option<U8Vec4>,
    pub intensity: Option<u16>,
    pub classification: Option<u8>,
}

/// Iterates over the points of a buffer, mapping positions out of the unit cube of `bounding_box`.
pub fn world_points<'a>(buffer: &'a PointBuffer, bounding_box: &'a Aabb) -> impl Iterator<Item = PointData> + 'a {
    let colors = match buffer.attribute(AttributeKind::Color).map(|a| (&a.values, a.stride)) {
        Some((AttributeValues::U8(values), 4)) => Some(values.as_slice()),
        _ => None,
    };
    let intensities = match buffer.attribute(AttributeKind::Intensity).map(|a| &a.values) {
        Some(AttributeValues::U16(values)) => Some(values.as_slice()),
        _ => None,
    };
    let classes = match buffer.attribute(AttributeKind::Classification).map(|a| &a.values) {
        Some(AttributeValues::U8(values)) => Some(values.as_slice()),
        _ => None,
    };

    (0..buffer.num_points()).map(move |i| {
        let [x, y, z] = buffer.position(i);
        PointData {
            position: bounding_box.denormalize(DVec3::new(x as f64, y as f64, z as f64)),
            color: colors.map(|c| U8Vec4::new(c[i * 4], c[i * 4 + 1], c[i * 4 + 2], c[i * 4 + 3])),
            intensity: intensities.map(|v| v[i]),
            classification: classes.map(|v| v[i]),
        }
    })
}
