//! LAS container: public header block, variable length records and point records.

use crate::codec::buffer::{AttributeArray, AttributeValues, PointBuffer};
use crate::codec::CodecError;
use crate::octree::aabb::Aabb;
use crate::octree::point_attributes::AttributeKind;
use binrw::{binrw, BinReaderExt, BinWrite};
use byteorder::{ByteOrder, LittleEndian};
use laz::LazVlr;
use std::io::Cursor;

pub const HEADER_SIZE_1_2: usize = 227;
pub const HEADER_SIZE_1_4: usize = 375;
pub const VLR_HEADER_SIZE: usize = 54;

pub const LASZIP_USER_ID: &[u8] = b"laszip encoded";
pub const LASZIP_RECORD_ID: u16 = 22204;

#[binrw]
#[brw(little, magic = b"LASF")]
#[derive(Debug, Clone, PartialEq)]
pub struct LasHeader {
    pub file_source_id: u16,
    pub global_encoding: u16,
    pub project_id: [u8; 16],
    pub version_major: u8,
    pub version_minor: u8,
    pub system_identifier: [u8; 32],
    pub generating_software: [u8; 32],
    pub creation_day: u16,
    pub creation_year: u16,
    pub header_size: u16,
    pub offset_to_point_data: u32,
    pub number_of_vlrs: u32,
    pub point_data_format: u8,
    pub point_data_record_length: u16,
    pub legacy_point_count: u32,
    pub legacy_points_by_return: [u32; 5],
    pub scale: [f64; 3],
    pub offset: [f64; 3],
    pub max_x: f64,
    pub min_x: f64,
    pub max_y: f64,
    pub min_y: f64,
    pub max_z: f64,
    pub min_z: f64,
    #[br(if(version_minor >= 4))]
    pub extended: Option<ExtendedHeader>,
}

/// Fields added by LAS 1.4.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq)]
pub struct ExtendedHeader {
    pub start_of_waveform_data: u64,
    pub start_of_first_evlr: u64,
    pub number_of_evlrs: u32,
    pub point_count: u64,
    pub points_by_return: [u64; 15],
}

impl LasHeader {
    pub fn is_compressed(&self) -> bool {
        self.point_data_format & 0xC0 != 0
    }

    pub fn format(&self) -> u8 {
        self.point_data_format & 0x3F
    }

    pub fn point_count(&self) -> u64 {
        match &self.extended {
            Some(extended) if self.legacy_point_count == 0 => extended.point_count,
            _ => self.legacy_point_count as u64,
        }
    }

    /// Box declared by the header, in absolute coordinates.
    pub fn bounds(&self) -> Aabb {
        Aabb::new(
            glam::DVec3::new(self.min_x, self.min_y, self.min_z),
            glam::DVec3::new(self.max_x, self.max_y, self.max_z),
        )
    }
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq)]
pub struct VlrHeader {
    pub reserved: u16,
    pub user_id: [u8; 16],
    pub record_id: u16,
    pub record_length_after_header: u16,
    pub description: [u8; 32],
}

impl VlrHeader {
    pub fn is_laszip(&self) -> bool {
        self.record_id == LASZIP_RECORD_ID && self.user_id.starts_with(LASZIP_USER_ID)
    }
}

/// Byte layout of point formats 0 to 3, plus trailing extra bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointLayout {
    pub format: u8,
    pub record_length: usize,
    pub gps_time_offset: Option<usize>,
    pub color_offset: Option<usize>,
    pub base_length: usize,
}

/// Record length of a point format without extra bytes.
pub fn base_length(format: u8) -> Result<usize, CodecError> {
    match format {
        0 => Ok(20),
        1 => Ok(28),
        2 => Ok(26),
        3 => Ok(34),
        other => Err(CodecError::Unsupported(format!("LAS point format {}", other))),
    }
}

impl PointLayout {
    pub fn new(format: u8, record_length: usize) -> Result<Self, CodecError> {
        let base_length = base_length(format)?;
        let (gps_time_offset, color_offset) = match format {
            1 => (Some(20), None),
            2 => (None, Some(20)),
            3 => (Some(20), Some(28)),
            _ => (None, None),
        };
        if record_length < base_length {
            return Err(CodecError::MalformedHeader(format!(
                "record length {} is shorter than point format {} ({} bytes)",
                record_length, format, base_length
            )));
        }
        Ok(Self {
            format,
            record_length,
            gps_time_offset,
            color_offset,
            base_length,
        })
    }
}

/// Parsed container preamble: everything before the point block.
#[derive(Debug, Clone)]
pub struct LasPreamble {
    pub header: LasHeader,
    pub layout: PointLayout,
    pub laszip: Option<LazVlr>,
}

/// Parses the header and VLRs. Returns `Ok(None)` while `bytes` does not yet
/// reach the start of the point block.
pub fn parse_preamble(bytes: &[u8]) -> Result<Option<LasPreamble>, CodecError> {
    if bytes.len() < HEADER_SIZE_1_2 {
        return Ok(None);
    }
    if &bytes[0..4] != b"LASF" {
        return Err(CodecError::MalformedHeader("missing LASF signature".to_string()));
    }
    if bytes[25] >= 4 && bytes.len() < HEADER_SIZE_1_4 {
        return Ok(None);
    }

    let header: LasHeader = Cursor::new(bytes).read_le()?;
    let offset_to_point_data = header.offset_to_point_data as usize;
    if (header.header_size as usize) < HEADER_SIZE_1_2 || offset_to_point_data < header.header_size as usize {
        return Err(CodecError::MalformedHeader(format!(
            "header size {} / point data offset {}",
            header.header_size, header.offset_to_point_data
        )));
    }
    if bytes.len() < offset_to_point_data {
        return Ok(None);
    }

    let layout = PointLayout::new(header.format(), header.point_data_record_length as usize)?;

    let mut laszip = None;
    let mut position = header.header_size as usize;
    for _ in 0..header.number_of_vlrs {
        if position + VLR_HEADER_SIZE > offset_to_point_data {
            return Err(CodecError::MalformedHeader("VLRs overlap the point block".to_string()));
        }
        let vlr: VlrHeader = Cursor::new(&bytes[position..]).read_le()?;
        let body = position + VLR_HEADER_SIZE;
        let end = body + vlr.record_length_after_header as usize;
        if end > offset_to_point_data {
            return Err(CodecError::MalformedHeader("VLR overlaps the point block".to_string()));
        }
        if vlr.is_laszip() {
            laszip = Some(LazVlr::from_buffer(&bytes[body..end])?);
        }
        position = end;
    }

    if header.is_compressed() {
        let Some(record) = &laszip else {
            return Err(CodecError::MalformedHeader(
                "compressed point format without a laszip VLR".to_string(),
            ));
        };
        let item_bytes = record.items_size() as usize;
        if item_bytes != layout.record_length {
            return Err(CodecError::MalformedHeader(format!(
                "items cover {} bytes of a {} byte record",
                item_bytes, layout.record_length
            )));
        }
    }

    Ok(Some(LasPreamble {
        header,
        layout,
        laszip,
    }))
}

/// Fields of one point record, formats 0 to 3.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LasPoint {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub intensity: u16,
    pub return_number: u8,
    pub number_of_returns: u8,
    pub classification: u8,
    pub point_source_id: u16,
    pub gps_time: f64,
    pub color: [u16; 3],
}

impl LasPoint {
    pub fn write_record(&self, layout: &PointLayout, out: &mut Vec<u8>) {
        let start = out.len();
        out.resize(start + layout.record_length, 0);
        let r = &mut out[start..];
        LittleEndian::write_i32(&mut r[0..4], self.x);
        LittleEndian::write_i32(&mut r[4..8], self.y);
        LittleEndian::write_i32(&mut r[8..12], self.z);
        LittleEndian::write_u16(&mut r[12..14], self.intensity);
        r[14] = (self.return_number & 0b111) | ((self.number_of_returns & 0b111) << 3);
        r[15] = self.classification;
        LittleEndian::write_u16(&mut r[18..20], self.point_source_id);
        if let Some(offset) = layout.gps_time_offset {
            LittleEndian::write_f64(&mut r[offset..offset + 8], self.gps_time);
        }
        if let Some(offset) = layout.color_offset {
            for (k, c) in self.color.iter().enumerate() {
                LittleEndian::write_u16(&mut r[offset + k * 2..offset + k * 2 + 2], *c);
            }
        }
    }
}

/// Converts raw records into a buffer with positions normalized into `target`.
///
/// Colors are kept as raw 16-bit triplets, see [`finalize_colors`].
pub fn records_to_buffer(
    records: &[u8],
    layout: &PointLayout,
    header: &LasHeader,
    target: &Aabb,
) -> Result<PointBuffer, CodecError> {
    let num_points = records.len() / layout.record_length;
    let size = target.size();
    let mut positions = Vec::with_capacity(num_points * 3);
    let mut intensity = Vec::with_capacity(num_points);
    let mut return_number = Vec::with_capacity(num_points);
    let mut number_of_returns = Vec::with_capacity(num_points);
    let mut classification = Vec::with_capacity(num_points);
    let mut source_id = Vec::with_capacity(num_points);
    let mut gps_time = Vec::new();
    let mut color = Vec::new();

    for r in records.chunks_exact(layout.record_length) {
        for axis in 0..3 {
            let raw = LittleEndian::read_i32(&r[axis * 4..axis * 4 + 4]) as f64;
            let world = raw * header.scale[axis] + header.offset[axis];
            positions.push(((world - target.min[axis]) / size[axis]) as f32);
        }
        intensity.push(LittleEndian::read_u16(&r[12..14]));
        return_number.push(r[14] & 0b111);
        number_of_returns.push((r[14] >> 3) & 0b111);
        classification.push(r[15]);
        source_id.push(LittleEndian::read_u16(&r[18..20]));
        if let Some(offset) = layout.gps_time_offset {
            gps_time.push(LittleEndian::read_f64(&r[offset..offset + 8]));
        }
        if let Some(offset) = layout.color_offset {
            for k in 0..3 {
                color.push(LittleEndian::read_u16(&r[offset + k * 2..offset + k * 2 + 2]));
            }
        }
    }

    let mut attributes = vec![
        AttributeArray::new(AttributeKind::Intensity, 1, AttributeValues::U16(intensity)),
        AttributeArray::new(AttributeKind::ReturnNumber, 1, AttributeValues::U8(return_number)),
        AttributeArray::new(AttributeKind::NumberOfReturns, 1, AttributeValues::U8(number_of_returns)),
        AttributeArray::new(AttributeKind::Classification, 1, AttributeValues::U8(classification)),
        AttributeArray::new(AttributeKind::SourceId, 1, AttributeValues::U16(source_id)),
    ];
    if layout.gps_time_offset.is_some() {
        attributes.push(AttributeArray::new(AttributeKind::GpsTime, 1, AttributeValues::F64(gps_time)));
    }
    if layout.color_offset.is_some() {
        attributes.push(AttributeArray::new(AttributeKind::Color, 3, AttributeValues::U16(color)));
    }

    PointBuffer::new(positions, attributes)
}

/// Replaces raw 16-bit colors by RGBA bytes. Colors are treated as 16-bit
/// when any channel exceeds 255, 8-bit otherwise.
pub fn finalize_colors(buffer: PointBuffer) -> Result<PointBuffer, CodecError> {
    let Some(raw) = buffer.attribute(AttributeKind::Color) else {
        return Ok(buffer);
    };
    let AttributeValues::U16(values) = &raw.values else {
        return Ok(buffer);
    };

    let two_byte = values.iter().any(|&c| c > 255);
    let mut rgba = Vec::with_capacity(values.len() / 3 * 4);
    for rgb in values.chunks_exact(3) {
        for &c in rgb {
            rgba.push(if two_byte { (c / 256) as u8 } else { c as u8 });
        }
        rgba.push(255);
    }

    let attributes = buffer
        .attributes()
        .iter()
        .map(|a| {
            if a.kind == AttributeKind::Color {
                AttributeArray::new(AttributeKind::Color, 4, AttributeValues::U8(rgba.clone()))
            } else {
                a.clone()
            }
        })
        .collect();
    PointBuffer::new(buffer.positions().to_vec(), attributes)
}

/// Writes a header block, with `vlrs` serialized right after it.
pub fn write_preamble(header: &LasHeader, vlrs: &[(VlrHeader, Vec<u8>)]) -> Result<Vec<u8>, CodecError> {
    let mut out = Cursor::new(Vec::new());
    header
        .write_le(&mut out)
        .map_err(|e| CodecError::MalformedHeader(e.to_string()))?;
    for (vlr, body) in vlrs {
        vlr.write_le(&mut out)
            .map_err(|e| CodecError::MalformedHeader(e.to_string()))?;
        out.get_mut().extend_from_slice(body);
        out.set_position(out.get_ref().len() as u64);
    }
    Ok(out.into_inner())
}
