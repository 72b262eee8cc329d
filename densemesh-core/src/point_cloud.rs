//! Point cloud data structures and functionality

use crate::error::{Error, Result};
use crate::point::*;
use serde::{Deserialize, Serialize};
use std::ops::Index;

/// A point cloud stored as parallel attribute arrays.
///
/// `normals` and `colors`, when present, hold exactly one entry per point.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointCloud {
    pub points: Vec<Point3d>,
    pub normals: Option<Vec<Vector3d>>,
    pub colors: Option<Vec<Color>>,
}

impl PointCloud {
    /// Create a new empty point cloud
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new point cloud with specified capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            points: Vec::with_capacity(capacity),
            normals: None,
            colors: None,
        }
    }

    /// Create a point cloud from a vector of points
    pub fn from_points(points: Vec<Point3d>) -> Self {
        Self {
            points,
            normals: None,
            colors: None,
        }
    }

    /// Attach per-point normals
    pub fn with_normals(mut self, normals: Vec<Vector3d>) -> Result<Self> {
        self.set_normals(normals)?;
        Ok(self)
    }

    /// Attach per-point colors
    pub fn with_colors(mut self, colors: Vec<Color>) -> Result<Self> {
        self.set_colors(colors)?;
        Ok(self)
    }

    /// Replace the normals, checking that there is one per point
    pub fn set_normals(&mut self, normals: Vec<Vector3d>) -> Result<()> {
        check_attribute_len("normals", normals.len(), self.points.len())?;
        self.normals = Some(normals);
        Ok(())
    }

    /// Replace the colors, checking that there is one per point
    pub fn set_colors(&mut self, colors: Vec<Color>) -> Result<()> {
        check_attribute_len("colors", colors.len(), self.points.len())?;
        self.colors = Some(colors);
        Ok(())
    }

    /// Get the number of points in the cloud
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Check if the point cloud is empty
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn has_normals(&self) -> bool {
        self.normals.is_some()
    }

    pub fn has_colors(&self) -> bool {
        self.colors.is_some()
    }

    /// Add a bare point to the cloud.
    ///
    /// Drops the normal and color arrays, which would otherwise lose their
    /// one-per-point invariant.
    pub fn push(&mut self, point: Point3d) {
        self.points.push(point);
        self.normals = None;
        self.colors = None;
    }

    /// Get an iterator over the points
    pub fn iter(&self) -> std::slice::Iter<'_, Point3d> {
        self.points.iter()
    }

    /// Bounding box of the points, `None` for an empty cloud
    pub fn bounding_box(&self) -> Option<BoundingBox> {
        BoundingBox::from_points(&self.points)
    }

    /// Build a new cloud holding the points at `indices`, in that order,
    /// together with their attributes.
    pub fn select_by_index(&self, indices: &[usize]) -> Result<Self> {
        if let Some(&bad) = indices.iter().find(|&&i| i >= self.points.len()) {
            return Err(Error::InvalidData(format!(
                "index {} out of range for cloud of {} points",
                bad,
                self.points.len()
            )));
        }
        Ok(Self {
            points: indices.iter().map(|&i| self.points[i]).collect(),
            normals: self
                .normals
                .as_ref()
                .map(|n| indices.iter().map(|&i| n[i]).collect()),
            colors: self
                .colors
                .as_ref()
                .map(|c| indices.iter().map(|&i| c[i]).collect()),
        })
    }

    /// Check the attribute length invariant and finiteness of positions
    pub fn validate(&self) -> Result<()> {
        if let Some(normals) = &self.normals {
            check_attribute_len("normals", normals.len(), self.points.len())?;
        }
        if let Some(colors) = &self.colors {
            check_attribute_len("colors", colors.len(), self.points.len())?;
        }
        if let Some(i) = self
            .points
            .iter()
            .position(|p| !p.coords.iter().all(|c| c.is_finite()))
        {
            return Err(Error::InvalidData(format!(
                "point {} has a non-finite coordinate",
                i
            )));
        }
        Ok(())
    }
}

fn check_attribute_len(name: &str, len: usize, points: usize) -> Result<()> {
    if len != points {
        return Err(Error::InvalidData(format!(
            "{} has {} entries but the cloud has {} points",
            name, len, points
        )));
    }
    Ok(())
}

impl Index<usize> for PointCloud {
    type Output = Point3d;

    fn index(&self, index: usize) -> &Self::Output {
        &self.points[index]
    }
}

impl<'a> IntoIterator for &'a PointCloud {
    type Item = &'a Point3d;
    type IntoIter = std::slice::Iter<'a, Point3d>;

    fn into_iter(self) -> Self::IntoIter {
        self.points.iter()
    }
}

impl FromIterator<Point3d> for PointCloud {
    fn from_iter<I: IntoIterator<Item = Point3d>>(iter: I) -> Self {
        Self::from_points(Vec::from_iter(iter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_cloud() -> PointCloud {
        PointCloud::from_points(vec![
            Point3d::new(0.0, 0.0, 0.0),
            Point3d::new(1.0, 0.0, 0.0),
            Point3d::new(0.0, 1.0, 0.0),
        ])
    }

    #[test]
    fn test_with_normals_length_checked() {
        let cloud = sample_cloud();
        assert!(cloud.clone().with_normals(vec![Vector3d::z(); 2]).is_err());

        let cloud = cloud.with_normals(vec![Vector3d::z(); 3]).unwrap();
        assert!(cloud.has_normals());
        assert!(cloud.validate().is_ok());
    }

    #[test]
    fn test_select_by_index_keeps_attributes() {
        let cloud = sample_cloud()
            .with_normals(vec![Vector3d::x(), Vector3d::y(), Vector3d::z()])
            .unwrap()
            .with_colors(vec![Color::new(1.0, 0.0, 0.0); 3])
            .unwrap();

        let selected = cloud.select_by_index(&[2, 0]).unwrap();
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0], Point3d::new(0.0, 1.0, 0.0));
        assert_eq!(selected.normals.as_ref().unwrap()[0], Vector3d::z());
        assert_eq!(selected.normals.as_ref().unwrap()[1], Vector3d::x());
        assert_eq!(selected.colors.as_ref().unwrap().len(), 2);

        assert!(cloud.select_by_index(&[3]).is_err());
    }

    #[test]
    fn test_push_drops_attributes() {
        let mut cloud = sample_cloud().with_normals(vec![Vector3d::z(); 3]).unwrap();
        cloud.push(Point3d::new(2.0, 2.0, 2.0));
        assert_eq!(cloud.len(), 4);
        assert!(!cloud.has_normals());
    }

    #[test]
    fn test_validate_rejects_nan() {
        let mut cloud = sample_cloud();
        cloud.points[1].y = f64::NAN;
        assert!(matches!(cloud.validate(), Err(Error::InvalidData(_))));
    }

    #[test]
    fn test_from_iterator() {
        let cloud: PointCloud = (0..5).map(|i| Point3d::new(i as f64, 0.0, 0.0)).collect();
        assert_eq!(cloud.len(), 5);
        assert_eq!(cloud.bounding_box().unwrap().max.x, 4.0);
    }
}
