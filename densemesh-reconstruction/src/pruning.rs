//! Density-based trimming of reconstructed surfaces

use crate::cleanup::compact_vertices;
use densemesh_core::{DensityMesh, Error, Result, TriangleMesh};
use tracing::info;

/// Linearly interpolated `q`-quantile of `values` at position `q * (n - 1)`
pub fn density_quantile(values: &[f64], q: f64) -> Result<f64> {
    if !(0.0..=1.0).contains(&q) {
        return Err(Error::invalid_parameter(
            "quantile",
            format!("must be in [0, 1], got {}", q),
        ));
    }
    if values.is_empty() {
        return Err(Error::InvalidData("quantile of an empty set".to_string()));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(Error::InvalidData("densities must be finite".to_string()));
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let position = q * (sorted.len() - 1) as f64;
    let lo = position.floor() as usize;
    let hi = position.ceil() as usize;
    Ok(sorted[lo] + (sorted[hi] - sorted[lo]) * (position - lo as f64))
}

/// Removes poorly supported vertices from a reconstructed surface
#[derive(Debug, Clone, PartialEq)]
pub struct DensityPruner {
    quantile: f64,
}

impl Default for DensityPruner {
    fn default() -> Self {
        Self { quantile: 0.01 }
    }
}

impl DensityPruner {
    pub fn new(quantile: f64) -> Self {
        Self { quantile }
    }

    pub fn quantile(&self) -> f64 {
        self.quantile
    }

    /// Drop every vertex whose density is strictly below the configured
    /// quantile, along with the faces using it. The densities are consumed
    /// with the surface.
    ///
    /// Fails with [`Error::EmptyMesh`] when no face survives.
    pub fn apply(&self, input: DensityMesh) -> Result<TriangleMesh> {
        let DensityMesh { mesh, densities } = input;
        if densities.len() != mesh.vertices.len() {
            return Err(Error::InvalidData(format!(
                "{} densities for {} vertices",
                densities.len(),
                mesh.vertices.len()
            )));
        }
        let threshold = density_quantile(&densities, self.quantile)?;

        let keep: Vec<bool> = densities.iter().map(|d| *d >= threshold).collect();
        let pruned = compact_vertices(&mesh, &keep);
        if pruned.faces.is_empty() {
            return Err(Error::EmptyMesh(format!(
                "density pruning at quantile {} removed every face",
                self.quantile
            )));
        }

        info!(
            "Density pruning (q={}, threshold {:.4e}): {} -> {} vertices, {} -> {} faces",
            self.quantile,
            threshold,
            mesh.vertex_count(),
            pruned.vertex_count(),
            mesh.face_count(),
            pruned.face_count()
        );
        Ok(pruned)
    }
}
