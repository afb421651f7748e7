use crate::codec::CodecError;
use crate::octree::point_attributes::AttributeKind;
use std::ops::Range;

/// Typed storage of one attribute for all points of a buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValues {
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

macro_rules! map_values {
    ($values:expr, $v:ident => $body:expr) => {
        match $values {
            AttributeValues::U8($v) => AttributeValues::U8($body),
            AttributeValues::U16($v) => AttributeValues::U16($body),
            AttributeValues::U32($v) => AttributeValues::U32($body),
            AttributeValues::F32($v) => AttributeValues::F32($body),
            AttributeValues::F64($v) => AttributeValues::F64($body),
        }
    };
}

impl AttributeValues {
    pub fn len(&self) -> usize {
        match self {
            AttributeValues::U8(v) => v.len(),
            AttributeValues::U16(v) => v.len(),
            AttributeValues::U32(v) => v.len(),
            AttributeValues::F32(v) => v.len(),
            AttributeValues::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn element_size(&self) -> usize {
        match self {
            AttributeValues::U8(_) => 1,
            AttributeValues::U16(_) => 2,
            AttributeValues::U32(_) | AttributeValues::F32(_) => 4,
            AttributeValues::F64(_) => 8,
        }
    }

    fn slice(&self, range: Range<usize>) -> Self {
        map_values!(self, v => v[range].to_vec())
    }

    fn gather(&self, order: &[u32], stride: usize) -> Self {
        map_values!(self, v => gather(v, order, stride))
    }

    fn extend(&mut self, other: &AttributeValues) -> bool {
        match (self, other) {
            (AttributeValues::U8(a), AttributeValues::U8(b)) => a.extend_from_slice(b),
            (AttributeValues::U16(a), AttributeValues::U16(b)) => a.extend_from_slice(b),
            (AttributeValues::U32(a), AttributeValues::U32(b)) => a.extend_from_slice(b),
            (AttributeValues::F32(a), AttributeValues::F32(b)) => a.extend_from_slice(b),
            (AttributeValues::F64(a), AttributeValues::F64(b)) => a.extend_from_slice(b),
            _ => return false,
        }
        true
    }
}

fn gather<T: Copy>(values: &[T], order: &[u32], stride: usize) -> Vec<T> {
    let mut out = Vec::with_capacity(values.len());
    for &src in order {
        let start = src as usize * stride;
        out.extend_from_slice(&values[start..start + stride]);
    }
    out
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttributeArray {
    pub kind: AttributeKind,
    /// Values per point.
    pub stride: usize,
    pub values: AttributeValues,
}

impl AttributeArray {
    pub fn new(kind: AttributeKind, stride: usize, values: AttributeValues) -> Self {
        Self {
            kind,
            stride,
            values,
        }
    }

    pub fn num_points(&self) -> usize {
        if self.stride == 0 {
            0
        } else {
            self.values.len() / self.stride
        }
    }
}

/// Start offset and length of each octant's run inside a partitioned buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OctantRanges {
    pub offsets: [u32; 8],
    pub counts: [u32; 8],
}

impl OctantRanges {
    pub fn range(&self, octant: usize) -> Range<usize> {
        let start = self.offsets[octant] as usize;
        start..start + self.counts[octant] as usize
    }
}

/// Decoded points of one node, stored attribute by attribute.
///
/// Positions are normalized into the node's box, `[0,1]^3`. Every attribute
/// array holds exactly `num_points * stride` values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointBuffer {
    num_points: usize,
    positions: Vec<f32>,
    attributes: Vec<AttributeArray>,
    octants: Option<OctantRanges>,
}

impl PointBuffer {
    pub fn new(positions: Vec<f32>, attributes: Vec<AttributeArray>) -> Result<Self, CodecError> {
        if positions.len() % 3 != 0 {
            return Err(CodecError::SchemaMismatch(format!(
                "{} position values is not a multiple of 3",
                positions.len()
            )));
        }
        let num_points = positions.len() / 3;
        for attribute in &attributes {
            if attribute.values.len() != num_points * attribute.stride {
                return Err(CodecError::SchemaMismatch(format!(
                    "{:?} holds {} values, expected {}",
                    attribute.kind,
                    attribute.values.len(),
                    num_points * attribute.stride
                )));
            }
        }
        Ok(Self {
            num_points,
            positions,
            attributes,
            octants: None,
        })
    }

    pub fn num_points(&self) -> usize {
        self.num_points
    }

    pub fn is_empty(&self) -> bool {
        self.num_points == 0
    }

    pub fn positions(&self) -> &[f32] {
        &self.positions
    }

    pub fn position(&self, index: usize) -> [f32; 3] {
        let p = &self.positions[index * 3..index * 3 + 3];
        [p[0], p[1], p[2]]
    }

    pub fn attributes(&self) -> &[AttributeArray] {
        &self.attributes
    }

    pub fn attribute(&self, kind: AttributeKind) -> Option<&AttributeArray> {
        self.attributes.iter().find(|a| a.kind == kind)
    }

    pub fn octant_ranges(&self) -> Option<&OctantRanges> {
        self.octants.as_ref()
    }

    /// Memory held by the buffer's arrays.
    pub fn byte_size(&self) -> usize {
        self.positions.len() * 4
            + self
                .attributes
                .iter()
                .map(|a| a.values.len() * a.values.element_size())
                .sum::<usize>()
    }

    /// Appends `other`'s points. Both buffers must carry the same attributes.
    /// Any octant partition is dropped.
    pub fn append(&mut self, other: &PointBuffer) -> Result<(), CodecError> {
        if self.num_points == 0 && self.attributes.is_empty() {
            *self = other.clone();
            self.octants = None;
            return Ok(());
        }
        if other.num_points == 0 {
            return Ok(());
        }
        if self.attributes.len() != other.attributes.len() {
            return Err(CodecError::SchemaMismatch(
                "appended buffer carries different attributes".to_string(),
            ));
        }
        for (mine, theirs) in self.attributes.iter_mut().zip(&other.attributes) {
            if mine.kind != theirs.kind || mine.stride != theirs.stride || !mine.values.extend(&theirs.values) {
                return Err(CodecError::SchemaMismatch(format!(
                    "cannot append {:?} to {:?}",
                    theirs.kind, mine.kind
                )));
            }
        }
        self.positions.extend_from_slice(&other.positions);
        self.num_points += other.num_points;
        self.octants = None;
        Ok(())
    }

    /// Copies the points in `range`.
    pub fn select(&self, range: Range<usize>) -> PointBuffer {
        let positions = self.positions[range.start * 3..range.end * 3].to_vec();
        let attributes = self
            .attributes
            .iter()
            .map(|a| AttributeArray {
                kind: a.kind,
                stride: a.stride,
                values: a.values.slice(range.start * a.stride..range.end * a.stride),
            })
            .collect();
        PointBuffer {
            num_points: range.len(),
            positions,
            attributes,
            octants: None,
        }
    }

    pub fn map_positions(&mut self, mut f: impl FnMut([f32; 3]) -> [f32; 3]) {
        for p in self.positions.chunks_exact_mut(3) {
            let [x, y, z] = f([p[0], p[1], p[2]]);
            p[0] = x;
            p[1] = y;
            p[2] = z;
        }
    }

    /// Reorders points so that the point at `order[i]` moves to `i`.
    pub(crate) fn reorder(&mut self, order: &[u32], octants: Option<OctantRanges>) {
        debug_assert_eq!(order.len(), self.num_points);
        self.positions = gather(&self.positions, order, 3);
        for attribute in &mut self.attributes {
            attribute.values = attribute.values.gather(order, attribute.stride);
        }
        self.octants = octants;
    }
}
