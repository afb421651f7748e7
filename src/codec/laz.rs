//! Incremental decoding of LAS point blocks, compressed or not.
//!
//! Uncompressed records are decoded as soon as they arrive. A LASzip block is
//! buffered until the stream ends, since chunk boundaries are only known from
//! the chunk table at its end, and is then decompressed one chunk at a time.

use crate::codec::buffer::PointBuffer;
use crate::codec::las::{
    base_length, finalize_colors, parse_preamble, records_to_buffer, write_preamble, LasHeader, LasPoint,
    LasPreamble, PointLayout, VlrHeader, HEADER_SIZE_1_2, LASZIP_RECORD_ID, LASZIP_USER_ID, VLR_HEADER_SIZE,
};
use crate::codec::{CodecError, DecodeTarget, PointDecoder};
use laz::{LasZipCompressor, LasZipDecompressor, LazVlrBuilder};
use std::io::{Cursor, ErrorKind};
use tracing::trace;

/// Streaming decoder of a LAS container.
pub struct LasStreamDecoder {
    target: DecodeTarget,
    pending: Vec<u8>,
    preamble: Option<LasPreamble>,
    decoded: u64,
    points: PointBuffer,
}

impl LasStreamDecoder {
    pub fn new(target: DecodeTarget) -> Self {
        Self {
            target,
            pending: Vec::new(),
            preamble: None,
            decoded: 0,
            points: PointBuffer::default(),
        }
    }

    fn total_points(&self) -> u64 {
        self.preamble.as_ref().map(|p| p.header.point_count()).unwrap_or(0)
    }

    fn append_records(&mut self, records: &[u8]) -> Result<(), CodecError> {
        let Some(preamble) = &self.preamble else {
            return Ok(());
        };
        let block = records_to_buffer(records, &preamble.layout, &preamble.header, &self.target.bounding_box)?;
        self.decoded += block.num_points() as u64;
        self.points.append(&block)
    }

    /// Decodes as much of `pending` as forms complete records.
    fn advance(&mut self) -> Result<(), CodecError> {
        if self.preamble.is_none() {
            let Some(preamble) = parse_preamble(&self.pending)? else {
                return Ok(());
            };
            trace!(
                points = preamble.header.point_count(),
                format = preamble.layout.format,
                compressed = preamble.header.is_compressed(),
                "parsed LAS preamble"
            );
            self.pending.drain(..preamble.header.offset_to_point_data as usize);
            self.preamble = Some(preamble);
        }

        let Some(preamble) = &self.preamble else {
            return Ok(());
        };
        if preamble.header.is_compressed() {
            return Ok(());
        }

        let record_length = preamble.layout.record_length;
        let remaining = self.total_points() - self.decoded;
        let n = ((self.pending.len() / record_length) as u64).min(remaining) as usize;
        if n > 0 {
            let records: Vec<u8> = self.pending.drain(..n * record_length).collect();
            self.append_records(&records)?;
        }
        if self.decoded == self.total_points() {
            self.pending.clear();
        }
        Ok(())
    }

    /// Decompresses the buffered LASzip block chunk by chunk.
    fn decompress(&mut self) -> Result<(), CodecError> {
        let Some(preamble) = &self.preamble else {
            return Ok(());
        };
        let Some(vlr) = preamble.laszip.clone() else {
            return Ok(());
        };
        let total = preamble.header.point_count();
        let record_length = preamble.layout.record_length;
        if total == 0 {
            return Ok(());
        }

        let block = std::mem::take(&mut self.pending);
        // the block opens with the chunk table offset
        if block.len() < 8 {
            return Err(CodecError::Truncated {
                expected: total,
                decoded: 0,
            });
        }
        let chunk_size = (vlr.chunk_size() as u64).max(1);
        let mut decompressor =
            LasZipDecompressor::new(Cursor::new(block.as_slice()), vlr).map_err(|error| match error {
                laz::LasZipError::IoError(io) if io.kind() == ErrorKind::UnexpectedEof => CodecError::Truncated {
                    expected: total,
                    decoded: 0,
                },
                other => CodecError::from(other),
            })?;

        let mut records = Vec::new();
        while self.decoded < total {
            let n = chunk_size.min(total - self.decoded) as usize;
            records.resize(n * record_length, 0);
            decompressor.decompress_many(&mut records).map_err(|error| {
                if error.kind() == ErrorKind::UnexpectedEof {
                    CodecError::Truncated {
                        expected: total,
                        decoded: self.decoded,
                    }
                } else {
                    CodecError::DecoderFault(error.to_string())
                }
            })?;
            self.append_records(&records)?;
        }
        Ok(())
    }
}

impl PointDecoder for LasStreamDecoder {
    fn push(&mut self, piece: &[u8]) -> Result<(), CodecError> {
        self.pending.extend_from_slice(piece);
        self.advance()
    }

    fn decoded_points(&self) -> usize {
        self.decoded as usize
    }

    fn finish(mut self: Box<Self>) -> Result<PointBuffer, CodecError> {
        if self.preamble.is_none() {
            return Err(CodecError::Truncated {
                expected: 0,
                decoded: 0,
            });
        }
        self.decompress()?;
        let expected = self.total_points();
        if self.decoded < expected {
            return Err(CodecError::Truncated {
                expected,
                decoded: self.decoded,
            });
        }
        finalize_colors(self.points)
    }
}

fn write_fault(error: std::io::Error) -> CodecError {
    CodecError::DecoderFault(error.to_string())
}

/// Writes LAS containers, optionally with a compressed point block.
#[derive(Debug, Clone)]
pub struct LasWriter {
    pub format: u8,
    pub extra_bytes: usize,
    pub scale: [f64; 3],
    pub offset: [f64; 3],
    /// Points per chunk, `None` for an uncompressed point block.
    pub chunk_size: Option<u32>,
}

impl LasWriter {
    pub fn new(format: u8, scale: [f64; 3], offset: [f64; 3]) -> Self {
        Self {
            format,
            extra_bytes: 0,
            scale,
            offset,
            chunk_size: None,
        }
    }

    pub fn compressed(mut self, chunk_size: u32) -> Self {
        self.chunk_size = Some(chunk_size.max(1));
        self
    }

    pub fn write(&self, points: &[LasPoint]) -> Result<Vec<u8>, CodecError> {
        let layout = PointLayout::new(self.format, base_length(self.format)? + self.extra_bytes)?;

        let mut records = Vec::with_capacity(points.len() * layout.record_length);
        for point in points {
            point.write_record(&layout, &mut records);
        }

        let mut min = [f64::MAX; 3];
        let mut max = [f64::MIN; 3];
        for point in points {
            let raw = [point.x, point.y, point.z];
            for axis in 0..3 {
                let v = raw[axis] as f64 * self.scale[axis] + self.offset[axis];
                min[axis] = min[axis].min(v);
                max[axis] = max[axis].max(v);
            }
        }
        if points.is_empty() {
            min = [0.0; 3];
            max = [0.0; 3];
        }

        let laszip = match self.chunk_size {
            Some(chunk_size) => Some(
                LazVlrBuilder::default()
                    .with_point_format(self.format, self.extra_bytes as u16)?
                    .with_fixed_chunk_size(chunk_size)
                    .build(),
            ),
            None => None,
        };

        let mut vlrs = Vec::new();
        if let Some(record) = &laszip {
            let mut body = Vec::new();
            record
                .write_to(&mut body)
                .map_err(|e| CodecError::MalformedHeader(e.to_string()))?;
            let mut user_id = [0u8; 16];
            user_id[..LASZIP_USER_ID.len()].copy_from_slice(LASZIP_USER_ID);
            vlrs.push((
                VlrHeader {
                    reserved: 0,
                    user_id,
                    record_id: LASZIP_RECORD_ID,
                    record_length_after_header: body.len() as u16,
                    description: [0; 32],
                },
                body,
            ));
        }
        let vlr_bytes: usize = vlrs.iter().map(|(_, body)| VLR_HEADER_SIZE + body.len()).sum();

        let header = LasHeader {
            file_source_id: 0,
            global_encoding: 0,
            project_id: [0; 16],
            version_major: 1,
            version_minor: 2,
            system_identifier: [0; 32],
            generating_software: [0; 32],
            creation_day: 1,
            creation_year: 2024,
            header_size: HEADER_SIZE_1_2 as u16,
            offset_to_point_data: (HEADER_SIZE_1_2 + vlr_bytes) as u32,
            number_of_vlrs: vlrs.len() as u32,
            point_data_format: if self.chunk_size.is_some() {
                self.format | 0x80
            } else {
                self.format
            },
            point_data_record_length: layout.record_length as u16,
            legacy_point_count: points.len() as u32,
            legacy_points_by_return: [0; 5],
            scale: self.scale,
            offset: self.offset,
            max_x: max[0],
            min_x: min[0],
            max_y: max[1],
            min_y: min[1],
            max_z: max[2],
            min_z: min[2],
            extended: None,
        };

        let mut out = write_preamble(&header, &vlrs)?;
        let Some(record) = laszip else {
            out.extend(records);
            return Ok(out);
        };

        let mut cursor = Cursor::new(out);
        cursor.set_position(cursor.get_ref().len() as u64);
        let mut compressor = LasZipCompressor::new(cursor, record)?;
        compressor.compress_many(&records).map_err(write_fault)?;
        compressor.done().map_err(write_fault)?;
        Ok(compressor.into_inner().into_inner())
    }
}
