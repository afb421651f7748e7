//! Octant partitioning of decoded points, and the inheritance of a parent's
//! points by its children.

use crate::codec::buffer::{OctantRanges, PointBuffer};
use crate::codec::CodecError;
use crate::octree::aabb::{octant_of, octant_origin};

/// Groups the points by the child octant they fall into.
///
/// Counting sort over the 8 octants: a counting pass, an exclusive prefix sum
/// and a scatter pass. Points keep their relative order inside each octant.
pub fn partition_by_octant(buffer: &mut PointBuffer) -> OctantRanges {
    let num_points = buffer.num_points();
    let mut codes = Vec::with_capacity(num_points);
    let mut counts = [0u32; 8];
    for i in 0..num_points {
        let octant = octant_of(buffer.position(i));
        counts[octant] += 1;
        codes.push(octant as u8);
    }

    let mut offsets = [0u32; 8];
    let mut running = 0;
    for octant in 0..8 {
        offsets[octant] = running;
        running += counts[octant];
    }

    let mut cursor = offsets;
    let mut order = vec![0u32; num_points];
    for (src, &octant) in codes.iter().enumerate() {
        let dst = &mut cursor[octant as usize];
        order[*dst as usize] = src as u32;
        *dst += 1;
    }

    let ranges = OctantRanges { offsets, counts };
    buffer.reorder(&order, Some(ranges));
    ranges
}

/// The parent's points lying in `octant`, rescaled into the child's unit cube.
/// Returns `None` when the parent was never partitioned.
pub fn inherited_points(parent: &PointBuffer, octant: usize) -> Option<PointBuffer> {
    let ranges = parent.octant_ranges()?;
    let mut slice = parent.select(ranges.range(octant));
    let origin = octant_origin(octant);
    slice.map_positions(|p| {
        [
            (p[0] - origin[0]) * 2.0,
            (p[1] - origin[1]) * 2.0,
            (p[2] - origin[2]) * 2.0,
        ]
    });
    Some(slice)
}

/// Final payload of a node: its own points followed by the inherited ones,
/// partitioned for its own children.
pub fn assemble_node_points(
    mut own: PointBuffer,
    inherited: Option<&PointBuffer>,
) -> Result<PointBuffer, CodecError> {
    if let Some(inherited) = inherited {
        own.append(inherited)?;
    }
    partition_by_octant(&mut own);
    Ok(own)
}
