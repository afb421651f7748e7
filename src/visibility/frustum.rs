//! Plane-set culling volumes: view frusta and oriented clip boxes.

use crate::octree::aabb::Aabb;
use glam::{DMat4, DVec3, DVec4};

/// A plane defined by normal and distance from origin
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Plane {
    pub normal: DVec3,
    pub distance: f64,
}

impl Plane {
    pub fn new(normal: DVec3, distance: f64) -> Self {
        Self { normal, distance }
    }

    /// Plane through `point`, facing `normal`.
    pub fn from_normal_and_point(normal: DVec3, point: DVec3) -> Self {
        let normal = normal.normalize();
        Self {
            normal,
            distance: -normal.dot(point),
        }
    }

    /// Signed distance from point to plane (positive = in front)
    pub fn distance_to_point(&self, point: DVec3) -> f64 {
        self.normal.dot(point) + self.distance
    }
}

/// Convex volume bounded by six inward-facing planes.
#[derive(Clone, Copy, Debug)]
pub struct Frustum {
    pub planes: [Plane; 6],
}

impl Frustum {
    /// Extract frustum planes from view-projection matrix
    pub fn from_view_projection(vp: &DMat4) -> Self {
        let m = vp.to_cols_array_2d();
        let row = |i: usize| DVec4::new(m[0][i], m[1][i], m[2][i], m[3][i]);
        let (r0, r1, r2, r3) = (row(0), row(1), row(2), row(3));

        let left = Self::normalize_plane(r3 + r0);
        let right = Self::normalize_plane(r3 - r0);
        let bottom = Self::normalize_plane(r3 + r1);
        let top = Self::normalize_plane(r3 - r1);
        let near = Self::normalize_plane(r3 + r2);
        let far = Self::normalize_plane(r3 - r2);

        Self {
            planes: [near, far, left, right, top, bottom],
        }
    }

    /// The volume of the unit box `[-0.5, 0.5]^3` mapped through `transform`.
    pub fn from_box_transform(transform: &DMat4) -> Self {
        let center = transform.transform_point3(DVec3::ZERO);
        let mut planes = [Plane::new(DVec3::Z, 0.0); 6];
        for axis in 0..3 {
            for (side, sign) in [1.0, -1.0].into_iter().enumerate() {
                let mut local = DVec3::ZERO;
                local[axis] = 0.5 * sign;
                let face = transform.transform_point3(local);
                planes[axis * 2 + side] = Plane::from_normal_and_point(center - face, face);
            }
        }
        Self { planes }
    }

    fn normalize_plane(plane: DVec4) -> Plane {
        let normal = plane.truncate();
        let len = normal.length();
        Plane {
            normal: normal / len,
            distance: plane.w / len,
        }
    }

    /// Check if point is inside frustum
    pub fn contains_point(&self, point: DVec3) -> bool {
        self.planes
            .iter()
            .all(|plane| plane.distance_to_point(point) >= 0.0)
    }

    /// Check if AABB intersects frustum (conservative test)
    pub fn intersects_aabb(&self, aabb: &Aabb) -> bool {
        for plane in &self.planes {
            // Find the corner most aligned with plane normal (p-vertex)
            let p = DVec3::new(
                if plane.normal.x >= 0.0 { aabb.max.x } else { aabb.min.x },
                if plane.normal.y >= 0.0 { aabb.max.y } else { aabb.min.y },
                if plane.normal.z >= 0.0 { aabb.max.z } else { aabb.min.z },
            );

            // If p-vertex is outside, AABB is completely outside
            if plane.distance_to_point(p) < 0.0 {
                return false;
            }
        }
        true
    }

    pub fn contains_aabb(&self, aabb: &Aabb) -> bool {
        aabb.corners().iter().all(|&corner| self.contains_point(corner))
    }
}
