use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeDataType {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Float,
    Double,
}

impl AttributeDataType {
    pub const fn size(self) -> u16 {
        match self {
            AttributeDataType::Int8 | AttributeDataType::UInt8 => 1,
            AttributeDataType::Int16 | AttributeDataType::UInt16 => 2,
            AttributeDataType::Int32 | AttributeDataType::UInt32 | AttributeDataType::Float => 4,
            AttributeDataType::Double => 8,
        }
    }
}

/// What an attribute means, independent of how it is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeKind {
    Position,
    Color,
    Intensity,
    Classification,
    ReturnNumber,
    NumberOfReturns,
    SourceId,
    GpsTime,
    NormalSphereMapped,
    NormalOct16,
    Normal,
    Spacing,
    Indices,
}

#[derive(Debug)]
pub struct PointAttribute {
    pub ordinal: usize,
    pub name: &'static str,
    pub kind: AttributeKind,
    pub data_type: AttributeDataType,
    pub num_elements: u16,
    pub byte_size: u16,
}

macro_rules! create_point_attribute {
    ($const_name:ident, $ord:expr, $name:expr, $kind:ident, $type:ident, $num:expr) => {
        pub static $const_name: PointAttribute = PointAttribute {
            ordinal: $ord,
            name: $name,
            kind: AttributeKind::$kind,
            data_type: AttributeDataType::$type,
            num_elements: $num,
            byte_size: AttributeDataType::$type.size() * $num,
        };
    };
}

create_point_attribute!(POSITION_CARTESIAN, 0, "POSITION_CARTESIAN", Position, Int32, 3);
create_point_attribute!(COLOR_PACKED, 1, "COLOR_PACKED", Color, UInt8, 4);
create_point_attribute!(INTENSITY, 2, "INTENSITY", Intensity, UInt16, 1);
create_point_attribute!(CLASSIFICATION, 3, "CLASSIFICATION", Classification, UInt8, 1);
create_point_attribute!(RETURN_NUMBER, 4, "RETURN_NUMBER", ReturnNumber, UInt8, 1);
create_point_attribute!(NUMBER_OF_RETURNS, 5, "NUMBER_OF_RETURNS", NumberOfReturns, UInt8, 1);
create_point_attribute!(SOURCE_ID, 6, "SOURCE_ID", SourceId, UInt16, 1);
create_point_attribute!(GPS_TIME, 7, "GPS_TIME", GpsTime, Double, 1);
create_point_attribute!(NORMAL_SPHEREMAPPED, 8, "NORMAL_SPHEREMAPPED", NormalSphereMapped, UInt8, 2);
create_point_attribute!(NORMAL_OCT16, 9, "NORMAL_OCT16", NormalOct16, UInt8, 2);
create_point_attribute!(NORMAL, 10, "NORMAL", Normal, Float, 3);
create_point_attribute!(SPACING, 11, "SPACING", Spacing, Float, 1);
create_point_attribute!(INDICES, 12, "INDICES", Indices, UInt32, 1);

pub const POINT_ATTRIBUTES: &[&PointAttribute] = &[
    &POSITION_CARTESIAN,
    &COLOR_PACKED,
    &INTENSITY,
    &CLASSIFICATION,
    &RETURN_NUMBER,
    &NUMBER_OF_RETURNS,
    &SOURCE_ID,
    &GPS_TIME,
    &NORMAL_SPHEREMAPPED,
    &NORMAL_OCT16,
    &NORMAL,
    &SPACING,
    &INDICES,
];

#[derive(Error, Debug, Clone, PartialEq)]
#[error("Unknown point attribute: {0}")]
pub struct UnknownAttribute(pub String);

pub fn find_attribute(name: &str) -> Option<&'static PointAttribute> {
    // older clouds name float normals NORMAL_FLOATS
    let name = if name == "NORMAL_FLOATS" { "NORMAL" } else { name };
    POINT_ATTRIBUTES.iter().copied().find(|a| a.name == name)
}

/// Record layout of a packed point file: attributes in file order.
#[derive(Debug, Clone)]
pub struct PointSchema {
    pub attributes: Vec<&'static PointAttribute>,
    pub byte_size: usize,
}

impl PointSchema {
    pub fn new(attributes: Vec<&'static PointAttribute>) -> Self {
        let byte_size = attributes.iter().map(|a| a.byte_size as usize).sum();
        Self {
            attributes,
            byte_size,
        }
    }

    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, UnknownAttribute> {
        let attributes = names
            .iter()
            .map(|name| {
                find_attribute(name.as_ref()).ok_or_else(|| UnknownAttribute(name.as_ref().to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(attributes))
    }

    /// Attributes paired with their byte offset inside a record.
    pub fn offsets(&self) -> impl Iterator<Item = (usize, &'static PointAttribute)> + '_ {
        self.attributes.iter().scan(0usize, |offset, attribute| {
            let current = *offset;
            *offset += attribute.byte_size as usize;
            Some((current, *attribute))
        })
    }

    pub fn offset_of(&self, kind: AttributeKind) -> Option<usize> {
        self.offsets()
            .find(|(_, attribute)| attribute.kind == kind)
            .map(|(offset, _)| offset)
    }
}
