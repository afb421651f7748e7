use crate::codec::buffer::{AttributeArray, AttributeValues, PointBuffer};
use crate::codec::{CodecError, DecodeTarget, PointDecoder, PositionEncoding};
use crate::octree::point_attributes::{AttributeKind, PointSchema};
use byteorder::{ByteOrder, LittleEndian};
use glam::DVec3;

/// Decoder of fixed-stride packed records.
pub struct PackedDecoder {
    schema: PointSchema,
    position: PositionEncoding,
    size: DVec3,
    pending: Vec<u8>,
    points: PointBuffer,
}

impl PackedDecoder {
    pub fn new(schema: PointSchema, position: PositionEncoding, target: DecodeTarget) -> Self {
        Self {
            schema,
            position,
            size: target.bounding_box.size(),
            pending: Vec::new(),
            points: PointBuffer::default(),
        }
    }
}

impl PointDecoder for PackedDecoder {
    fn push(&mut self, piece: &[u8]) -> Result<(), CodecError> {
        let stride = self.schema.byte_size;
        if stride == 0 {
            return Err(CodecError::MalformedHeader("point schema is empty".to_string()));
        }

        self.pending.extend_from_slice(piece);
        let whole = self.pending.len() / stride * stride;
        if whole > 0 {
            let block = decode_records(&self.pending[..whole], &self.schema, self.position, self.size)?;
            self.points.append(&block)?;
            self.pending.drain(..whole);
        }
        Ok(())
    }

    fn decoded_points(&self) -> usize {
        self.points.num_points()
    }

    fn finish(self: Box<Self>) -> Result<PointBuffer, CodecError> {
        // the stream ended cleanly, so a partial record means the file does not match the schema
        if !self.pending.is_empty() {
            return Err(CodecError::SchemaMismatch(format!(
                "{} trailing bytes after {} records of {} bytes",
                self.pending.len(),
                self.points.num_points(),
                self.schema.byte_size
            )));
        }
        Ok(self.points)
    }
}

fn fields<'a>(bytes: &'a [u8], stride: usize, offset: usize) -> impl Iterator<Item = &'a [u8]> {
    bytes.chunks_exact(stride).map(move |record| &record[offset..])
}

/// Decodes whole records. `bytes.len()` must be a multiple of the schema's stride.
pub fn decode_records(
    bytes: &[u8],
    schema: &PointSchema,
    position: PositionEncoding,
    size: DVec3,
) -> Result<PointBuffer, CodecError> {
    let stride = schema.byte_size;
    let num_points = bytes.len() / stride;
    let mut positions = None;
    let mut attributes = Vec::with_capacity(schema.attributes.len());

    for (offset, attribute) in schema.offsets() {
        let records = fields(bytes, stride, offset);
        let array = match attribute.kind {
            AttributeKind::Position => {
                let mut values = Vec::with_capacity(num_points * 3);
                for r in records {
                    let raw = match position {
                        PositionEncoding::ScaledLocal { scale } => [
                            LittleEndian::read_u32(&r[0..4]) as f64 * scale,
                            LittleEndian::read_u32(&r[4..8]) as f64 * scale,
                            LittleEndian::read_u32(&r[8..12]) as f64 * scale,
                        ],
                        PositionEncoding::FloatLocal => [
                            LittleEndian::read_f32(&r[0..4]) as f64,
                            LittleEndian::read_f32(&r[4..8]) as f64,
                            LittleEndian::read_f32(&r[8..12]) as f64,
                        ],
                    };
                    values.push((raw[0] / size.x) as f32);
                    values.push((raw[1] / size.y) as f32);
                    values.push((raw[2] / size.z) as f32);
                }
                positions = Some(values);
                continue;
            }
            AttributeKind::Color => AttributeArray::new(
                AttributeKind::Color,
                4,
                AttributeValues::U8(records.flat_map(|r| r[0..4].iter().copied()).collect()),
            ),
            AttributeKind::Intensity | AttributeKind::SourceId => AttributeArray::new(
                attribute.kind,
                1,
                AttributeValues::U16(records.map(LittleEndian::read_u16).collect()),
            ),
            AttributeKind::Classification
            | AttributeKind::ReturnNumber
            | AttributeKind::NumberOfReturns => AttributeArray::new(
                attribute.kind,
                1,
                AttributeValues::U8(records.map(|r| r[0]).collect()),
            ),
            AttributeKind::GpsTime => AttributeArray::new(
                attribute.kind,
                1,
                AttributeValues::F64(records.map(LittleEndian::read_f64).collect()),
            ),
            AttributeKind::Spacing => AttributeArray::new(
                attribute.kind,
                1,
                AttributeValues::F32(records.map(LittleEndian::read_f32).collect()),
            ),
            AttributeKind::Indices => AttributeArray::new(
                attribute.kind,
                1,
                AttributeValues::U32(records.map(LittleEndian::read_u32).collect()),
            ),
            AttributeKind::Normal => AttributeArray::new(
                AttributeKind::Normal,
                3,
                AttributeValues::F32(
                    records
                        .flat_map(|r| {
                            [
                                LittleEndian::read_f32(&r[0..4]),
                                LittleEndian::read_f32(&r[4..8]),
                                LittleEndian::read_f32(&r[8..12]),
                            ]
                        })
                        .collect(),
                ),
            ),
            AttributeKind::NormalOct16 => AttributeArray::new(
                AttributeKind::Normal,
                3,
                AttributeValues::F32(records.flat_map(|r| decode_oct16(r[0], r[1])).collect()),
            ),
            AttributeKind::NormalSphereMapped => AttributeArray::new(
                AttributeKind::Normal,
                3,
                AttributeValues::F32(records.flat_map(|r| decode_sphere_mapped(r[0], r[1])).collect()),
            ),
        };
        attributes.push(array);
    }

    let positions = positions.ok_or_else(|| {
        CodecError::SchemaMismatch("schema has no POSITION_CARTESIAN".to_string())
    })?;
    PointBuffer::new(positions, attributes)
}

/// Octahedral normal from two bytes.
pub fn decode_oct16(bx: u8, by: u8) -> [f32; 3] {
    let u = (bx as f32 / 255.0) * 2.0 - 1.0;
    let v = (by as f32 / 255.0) * 2.0 - 1.0;

    let z = 1.0 - u.abs() - v.abs();
    let (x, y) = if z >= 0.0 {
        (u, v)
    } else {
        ((1.0 - v.abs()) * u.signum(), (1.0 - u.abs()) * v.signum())
    };

    let length = (x * x + y * y + z * z).sqrt();
    [x / length, y / length, z / length]
}

/// Sphere-mapped normal from two bytes.
pub fn decode_sphere_mapped(bx: u8, by: u8) -> [f32; 3] {
    let mut nx = (bx as f32 / 255.0) * 2.0 - 1.0;
    let mut ny = (by as f32 / 255.0) * 2.0 - 1.0;

    let l = 1.0 - nx * nx - ny * ny;
    let root = l.max(0.0).sqrt();
    nx *= root;
    ny *= root;

    [nx * 2.0, ny * 2.0, l * 2.0 - 1.0]
}

/// Encodes points as packed records with `ScaledLocal` positions.
pub fn encode_records(
    schema: &PointSchema,
    scale: f64,
    size: DVec3,
    buffer: &PointBuffer,
) -> Result<Vec<u8>, CodecError> {
    let mut out = vec![0u8; buffer.num_points() * schema.byte_size];
    for (offset, attribute) in schema.offsets() {
        let records = out.chunks_exact_mut(schema.byte_size).map(|r| &mut r[offset..]);
        match attribute.kind {
            AttributeKind::Position => {
                for (i, r) in records.enumerate() {
                    let p = buffer.position(i);
                    for axis in 0..3 {
                        let local = p[axis] as f64 * size[axis];
                        LittleEndian::write_u32(&mut r[axis * 4..axis * 4 + 4], (local / scale).round() as u32);
                    }
                }
            }
            kind => {
                let array = buffer.attribute(kind).ok_or_else(|| {
                    CodecError::SchemaMismatch(format!("buffer has no {:?}", kind))
                })?;
                match &array.values {
                    AttributeValues::U8(values) => {
                        for (r, v) in records.zip(values.chunks_exact(array.stride)) {
                            r[..array.stride].copy_from_slice(v);
                        }
                    }
                    AttributeValues::U16(values) => {
                        for (r, v) in records.zip(values) {
                            LittleEndian::write_u16(r, *v);
                        }
                    }
                    AttributeValues::U32(values) => {
                        for (r, v) in records.zip(values) {
                            LittleEndian::write_u32(r, *v);
                        }
                    }
                    AttributeValues::F32(values) => {
                        for (r, v) in records.zip(values.chunks_exact(array.stride)) {
                            for (k, value) in v.iter().enumerate() {
                                LittleEndian::write_f32(&mut r[k * 4..k * 4 + 4], *value);
                            }
                        }
                    }
                    AttributeValues::F64(values) => {
                        for (r, v) in records.zip(values) {
                            LittleEndian::write_f64(r, *v);
                        }
                    }
                }
            }
        }
    }
    Ok(out)
}
