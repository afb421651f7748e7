//! Decoding of node payloads into [`PointBuffer`]s.
//!
//! Two wire formats are supported: packed fixed-stride records described by a
//! [`PointSchema`], and LAS containers whose point block may be compressed.
//! Decoders are fed incrementally with whatever bytes have arrived so far.

pub mod binary;
pub mod buffer;
pub mod las;
pub mod laz;
pub mod partition;

pub use buffer::{AttributeArray, AttributeValues, OctantRanges, PointBuffer};

use crate::octree::aabb::Aabb;
use crate::octree::point_attributes::PointSchema;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("Malformed header: {0}")]
    MalformedHeader(String),

    #[error("Unsupported encoding: {0}")]
    Unsupported(String),

    #[error("Stream ended after {decoded} of {expected} points")]
    Truncated { expected: u64, decoded: u64 },

    #[error("Decoder fault: {0}")]
    DecoderFault(String),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),
}

impl From<::laz::LasZipError> for CodecError {
    fn from(error: ::laz::LasZipError) -> Self {
        CodecError::MalformedHeader(error.to_string())
    }
}

impl From<binrw::Error> for CodecError {
    fn from(error: binrw::Error) -> Self {
        CodecError::MalformedHeader(error.to_string())
    }
}

/// How packed records store `POSITION_CARTESIAN`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PositionEncoding {
    /// Unsigned integers times `scale`, relative to the node's min corner.
    ScaledLocal { scale: f64 },
    /// Floats relative to the node's min corner.
    FloatLocal,
}

#[derive(Debug, Clone)]
pub enum PointFormat {
    Packed {
        schema: PointSchema,
        position: PositionEncoding,
    },
    /// LAS container, compressed or not. Positions are absolute.
    Laz,
}

/// What a decoder needs to know about the node it decodes.
#[derive(Debug, Clone, Copy)]
pub struct DecodeTarget {
    /// The node's box in the coordinate frame of the stored positions.
    pub bounding_box: Aabb,
}

/// Incremental decoder of one node payload.
pub trait PointDecoder: Send {
    /// Consumes the next piece of the stream. Complete blocks are decoded
    /// right away, partial ones are kept until more bytes arrive.
    fn push(&mut self, piece: &[u8]) -> Result<(), CodecError>;

    /// Points decoded so far.
    fn decoded_points(&self) -> usize;

    /// Ends the stream. Fails with [`CodecError::Truncated`] if it stopped mid-block.
    fn finish(self: Box<Self>) -> Result<PointBuffer, CodecError>;
}

pub fn decoder_for(format: &PointFormat, target: DecodeTarget) -> Box<dyn PointDecoder> {
    match format {
        PointFormat::Packed { schema, position } => Box::new(binary::PackedDecoder::new(
            schema.clone(),
            *position,
            target,
        )),
        PointFormat::Laz => Box::new(laz::LasStreamDecoder::new(target)),
    }
}

/// Decodes a complete payload in one go.
pub fn decode_points(
    format: &PointFormat,
    target: DecodeTarget,
    bytes: &[u8],
) -> Result<PointBuffer, CodecError> {
    let mut decoder = decoder_for(format, target);
    decoder.push(bytes)?;
    decoder.finish()
}
