use glam::DVec3;

/// Axis aligned box. Octree boxes are cubes.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Aabb {
    pub min: DVec3,
    pub max: DVec3,
}

impl Aabb {
    pub fn new(min: DVec3, max: DVec3) -> Self {
        Self { min, max }
    }

    pub fn size(&self) -> DVec3 {
        self.max - self.min
    }

    pub fn center(&self) -> DVec3 {
        (self.min + self.max) * 0.5
    }

    pub fn diagonal(&self) -> f64 {
        self.size().length()
    }

    /// Sphere enclosing the box, as `(center, radius)`.
    pub fn bounding_sphere(&self) -> (DVec3, f64) {
        (self.center(), self.diagonal() * 0.5)
    }

    pub fn contains_point(&self, point: DVec3) -> bool {
        point.cmpge(self.min).all() && point.cmple(self.max).all()
    }

    pub fn corners(&self) -> [DVec3; 8] {
        let (min, max) = (self.min, self.max);
        std::array::from_fn(|i| {
            DVec3::new(
                if i & 0b001 != 0 { max.x } else { min.x },
                if i & 0b010 != 0 { max.y } else { min.y },
                if i & 0b100 != 0 { max.z } else { min.z },
            )
        })
    }

    /// Maps a point into the box's unit cube: `min -> 0`, `max -> 1`.
    pub fn normalize(&self, point: DVec3) -> DVec3 {
        (point - self.min) / self.size()
    }

    /// Inverse of [`Aabb::normalize`].
    pub fn denormalize(&self, local: DVec3) -> DVec3 {
        self.min + local * self.size()
    }
}

/// Octant convention used by every part of the crate:
/// bit 0 selects the upper half on X, bit 1 on Y, bit 2 on Z.
pub const OCTANT_X: usize = 0b001;
pub const OCTANT_Y: usize = 0b010;
pub const OCTANT_Z: usize = 0b100;

/// Octant of a point given in the parent's normalized `[0,1]^3` space.
/// Values on the midplane belong to the upper half.
#[inline]
pub fn octant_of(local: [f32; 3]) -> usize {
    let mut index = 0;
    if local[0] >= 0.5 {
        index |= OCTANT_X;
    }
    if local[1] >= 0.5 {
        index |= OCTANT_Y;
    }
    if local[2] >= 0.5 {
        index |= OCTANT_Z;
    }
    index
}

/// Offset of the child octant's origin inside the parent's unit cube.
#[inline]
pub fn octant_origin(index: usize) -> [f32; 3] {
    [
        if index & OCTANT_X != 0 { 0.5 } else { 0.0 },
        if index & OCTANT_Y != 0 { 0.5 } else { 0.0 },
        if index & OCTANT_Z != 0 { 0.5 } else { 0.0 },
    ]
}

pub fn create_child_aabb(aabb: &Aabb, index: usize) -> Aabb {
    let mut min = aabb.min;
    let mut max = aabb.max;
    let size = (max - min) * 0.5;

    if (index & OCTANT_X) > 0 {
        min.x += size.x;
    } else {
        max.x -= size.x;
    }
    if (index & OCTANT_Y) > 0 {
        min.y += size.y;
    } else {
        max.y -= size.y;
    }
    if (index & OCTANT_Z) > 0 {
        min.z += size.z;
    } else {
        max.z -= size.z;
    }

    Aabb::new(min, max)
}
