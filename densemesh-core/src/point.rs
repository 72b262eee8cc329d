//! Point and vector types

use nalgebra::{Point3, Vector3};

/// A 3D point with double precision coordinates
pub type Point3d = Point3<f64>;

/// A 3D vector with double precision components
pub type Vector3d = Vector3<f64>;

/// An RGB color with channels in `[0, 1]`
pub type Color = Vector3<f64>;

/// Axis-aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min: Point3d,
    pub max: Point3d,
}

impl BoundingBox {
    /// Bounding box of a set of points, `None` when the set is empty
    pub fn from_points<'a, I>(points: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a Point3d>,
    {
        let mut iter = points.into_iter();
        let first = *iter.next()?;
        let mut bbox = Self {
            min: first,
            max: first,
        };
        for p in iter {
            bbox.min = bbox.min.inf(p);
            bbox.max = bbox.max.sup(p);
        }
        Some(bbox)
    }

    /// Edge lengths along each axis
    pub fn extent(&self) -> Vector3d {
        self.max - self.min
    }

    /// Length of the longest edge
    pub fn max_extent(&self) -> f64 {
        self.extent().max()
    }

    pub fn center(&self) -> Point3d {
        nalgebra::center(&self.min, &self.max)
    }
}
