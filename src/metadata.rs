use crate::codec::{PointFormat, PositionEncoding};
use crate::octree::aabb::Aabb;
use crate::octree::address::NodeAddressing;
use crate::octree::node::OctreeNode;
use crate::octree::point_attributes::{PointSchema, UnknownAttribute};
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// `major.minor` schema version of a cloud, ordered numerically.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(try_from = "String")]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("Invalid version string: {0:?}")]
pub struct InvalidVersion(pub String);

impl FromStr for Version {
    type Err = InvalidVersion;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidVersion(s.to_string());
        let mut parts = s.trim().split('.');
        let major = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(invalid)?;
        let minor = match parts.next() {
            Some(p) => p.parse().map_err(|_| invalid())?,
            None => 0,
        };
        Ok(Self { major, minor })
    }
}

impl TryFrom<String> for Version {
    type Error = InvalidVersion;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Error, Debug)]
pub enum ReadMetadataError {
    #[error("Invalid json: {0}")]
    JsonError(#[from] serde_json::error::Error),

    #[error("Resource error: {0}")]
    ResourceError(#[from] crate::resource::ResourceError),

    #[error(transparent)]
    UnknownAttribute(#[from] UnknownAttribute),
}

/// `cloud.js` of a Potree 1.x cloud.
#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub version: Version,
    pub octree_dir: String,
    #[serde(default)]
    pub projection: String,
    #[serde(default)]
    pub points: u64,
    pub bounding_box: BoundingBox,
    pub tight_bounding_box: Option<BoundingBox>,
    pub point_attributes: PointAttributesMetadata,
    pub spacing: f64,
    pub scale: f64,
    #[serde(default = "default_hierarchy_step_size")]
    pub hierarchy_step_size: u32,
}

fn default_hierarchy_step_size() -> u32 {
    5
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum PointAttributesMetadata {
    /// Either a packed record layout, by attribute name.
    List(Vec<String>),
    /// Or a container format name, `"LAZ"` or `"LAS"`.
    Named(String),
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub lx: f64,
    pub ly: f64,
    pub lz: f64,
    pub ux: f64,
    pub uy: f64,
    pub uz: f64,
}

impl From<BoundingBox> for Aabb {
    fn from(b: BoundingBox) -> Self {
        Aabb::new(
            glam::DVec3::new(b.lx, b.ly, b.lz),
            glam::DVec3::new(b.ux, b.uy, b.uz),
        )
    }
}

impl Metadata {
    pub fn from_json(bytes: &[u8]) -> Result<Self, ReadMetadataError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn is_compressed(&self) -> bool {
        matches!(&self.point_attributes, PointAttributesMetadata::Named(name) if name.eq_ignore_ascii_case("LAZ") || name.eq_ignore_ascii_case("LAS"))
    }

    /// World position of the octree's local origin: the min corner of the bounding box.
    pub fn offset(&self) -> glam::DVec3 {
        Aabb::from(self.bounding_box).min
    }

    /// Bounding box in octree-local coordinates, i.e. shifted so that its min corner is the origin.
    pub fn local_bounding_box(&self) -> Aabb {
        let world = Aabb::from(self.bounding_box);
        Aabb::new(glam::DVec3::ZERO, world.max - world.min)
    }

    pub fn addressing(&self) -> NodeAddressing {
        NodeAddressing {
            octree_dir: self.octree_dir.clone(),
            version: self.version,
            hierarchy_step_size: self.hierarchy_step_size,
            compressed: self.is_compressed(),
        }
    }

    pub fn point_format(&self) -> Result<PointFormat, ReadMetadataError> {
        match &self.point_attributes {
            PointAttributesMetadata::Named(_) => Ok(PointFormat::Laz),
            PointAttributesMetadata::List(names) => {
                let schema = PointSchema::from_names(names)?;
                let position = if self.version >= Version::new(1, 4) {
                    PositionEncoding::ScaledLocal { scale: self.scale }
                } else {
                    PositionEncoding::FloatLocal
                };
                Ok(PointFormat::Packed { schema, position })
            }
        }
    }

    pub(crate) fn create_root_node(&self) -> OctreeNode {
        OctreeNode {
            name: "r".to_string(),
            bounding_box: self.local_bounding_box(),
            spacing: self.spacing,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::DVec3;

    const CLOUD_JS: &str = r#"{
        "version": "1.7",
        "octreeDir": "data",
        "projection": "",
        "points": 1234,
        "boundingBox": {"lx": 10.0, "ly": 20.0, "lz": 30.0, "ux": 26.0, "uy": 36.0, "uz": 46.0},
        "tightBoundingBox": {"lx": 10.0, "ly": 20.0, "lz": 30.0, "ux": 25.0, "uy": 31.0, "uz": 33.0},
        "pointAttributes": ["POSITION_CARTESIAN", "COLOR_PACKED", "INTENSITY"],
        "spacing": 0.5,
        "scale": 0.001,
        "hierarchyStepSize": 4
    }"#;

    #[test]
    fn test_parse_cloud_js() {
        let metadata = Metadata::from_json(CLOUD_JS.as_bytes()).unwrap();
        assert_eq!(metadata.version, Version::new(1, 7));
        assert_eq!(metadata.hierarchy_step_size, 4);
        assert_eq!(metadata.offset(), DVec3::new(10.0, 20.0, 30.0));
        assert_eq!(metadata.local_bounding_box().max, DVec3::splat(16.0));
        assert!(!metadata.is_compressed());

        match metadata.point_format().unwrap() {
            PointFormat::Packed { schema, position } => {
                assert_eq!(schema.byte_size, 12 + 4 + 2);
                assert_eq!(position, PositionEncoding::ScaledLocal { scale: 0.001 });
            }
            PointFormat::Laz => panic!("expected packed format"),
        }
    }

    #[test]
    fn test_parse_laz_cloud_js() {
        let json = CLOUD_JS.replace(
            r#"["POSITION_CARTESIAN", "COLOR_PACKED", "INTENSITY"]"#,
            r#""LAZ""#,
        );
        let metadata = Metadata::from_json(json.as_bytes()).unwrap();
        assert!(metadata.is_compressed());
        assert!(matches!(metadata.point_format().unwrap(), PointFormat::Laz));
        assert!(metadata.addressing().points_url("r").ends_with("r.laz"));
    }

    #[test]
    fn test_versions_compare_numerically() {
        assert!("1.10".parse::<Version>().unwrap() > "1.9".parse::<Version>().unwrap());
        assert_eq!("2".parse::<Version>().unwrap(), Version::new(2, 0));
        assert!("one.two".parse::<Version>().is_err());
    }

    #[test]
    fn test_unknown_attribute_is_rejected() {
        let json = CLOUD_JS.replace("INTENSITY", "WHATEVER");
        let metadata = Metadata::from_json(json.as_bytes()).unwrap();
        assert!(matches!(
            metadata.point_format(),
            Err(ReadMetadataError::UnknownAttribute(_))
        ));
    }
}
