//! Where node files live relative to the cloud's octree directory.
//!
//! Layouts by schema version:
//!  - `>= 1.5`: nodes are grouped in directories of `hierarchy_step_size` levels,
//!    `<octree_dir>/r/<digits group>/.../<name>`
//!  - `1.4`: flat, `<octree_dir>/<name>.bin`
//!  - older: flat, `<octree_dir>/<name>`
//!
//! LAZ clouds always use the `.laz` suffix. Hierarchy chunks share the node's
//! directory with an `.hrc` suffix.

use crate::metadata::Version;

#[derive(Clone, Debug)]
pub struct NodeAddressing {
    pub octree_dir: String,
    pub version: Version,
    pub hierarchy_step_size: u32,
    pub compressed: bool,
}

impl NodeAddressing {
    /// Directory path (relative to the octree dir) that holds `name`.
    pub fn hierarchy_path(&self, name: &str) -> String {
        hierarchy_path(name, self.hierarchy_step_size)
    }

    fn node_base(&self, name: &str) -> String {
        if self.version >= Version::new(1, 5) {
            format!("{}/{}/{}", self.octree_dir, self.hierarchy_path(name), name)
        } else {
            format!("{}/{}", self.octree_dir, name)
        }
    }

    pub fn points_url(&self, name: &str) -> String {
        let base = self.node_base(name);
        if self.compressed {
            format!("{}.laz", base)
        } else if self.version >= Version::new(1, 4) {
            format!("{}.bin", base)
        } else {
            base
        }
    }

    pub fn hierarchy_url(&self, name: &str) -> String {
        format!("{}.hrc", self.node_base(name))
    }
}

/// `r/` followed by the name's digits cut into groups of `step` digits.
/// Only complete groups form directories, the trailing slash is dropped.
pub fn hierarchy_path(name: &str, step: u32) -> String {
    let step = step.max(1) as usize;
    let digits = name.get(1..).unwrap_or_default();
    let num_parts = digits.len() / step;

    let mut path = String::from("r/");
    for part in 0..num_parts {
        path.push_str(&digits[part * step..(part + 1) * step]);
        path.push('/');
    }
    path.pop();

    path
}
