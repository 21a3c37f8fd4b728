//! Camera-to-world extrinsic transforms.

use nalgebra::{Matrix3, Matrix4, Vector3};
use serde::{Deserialize, Serialize};

/// Fixed rigid transform from one camera frame into the world frame.
///
/// Stored as a homogeneous 4x4 matrix; (de)serialized as 16 row-major
/// values so calibration output can be pasted into the config as-is.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 16]", into = "[f64; 16]")]
pub struct ExtrinsicTransform {
    matrix: Matrix4<f64>,
}

impl ExtrinsicTransform {
    pub fn identity() -> Self {
        Self {
            matrix: Matrix4::identity(),
        }
    }

    pub fn from_matrix(matrix: Matrix4<f64>) -> Self {
        Self { matrix }
    }

    pub fn from_row_major(values: [f64; 16]) -> Self {
        Self {
            matrix: Matrix4::from_row_slice(&values),
        }
    }

    pub fn to_row_major(&self) -> [f64; 16] {
        let mut out = [0.0; 16];
        for (i, value) in out.iter_mut().enumerate() {
            *value = self.matrix[(i / 4, i % 4)];
        }
        out
    }

    pub fn matrix(&self) -> &Matrix4<f64> {
        &self.matrix
    }

    /// Upper-left 3x3 block.
    pub fn rotation(&self) -> Matrix3<f64> {
        self.matrix.fixed_view::<3, 3>(0, 0).into_owned()
    }

    /// First three rows of the last column.
    pub fn translation(&self) -> Vector3<f64> {
        self.matrix.fixed_view::<3, 1>(0, 3).into_owned()
    }

    /// `R * tvec + T`. The bottom row of the matrix is ignored.
    pub fn apply(&self, tvec: &Vector3<f64>) -> Vector3<f64> {
        self.rotation() * tvec + self.translation()
    }
}

impl Default for ExtrinsicTransform {
    fn default() -> Self {
        Self::identity()
    }
}

impl From<[f64; 16]> for ExtrinsicTransform {
    fn from(values: [f64; 16]) -> Self {
        Self::from_row_major(values)
    }
}

impl From<ExtrinsicTransform> for [f64; 16] {
    fn from(t: ExtrinsicTransform) -> Self {
        t.to_row_major()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    // 90 degrees about z, then shift by (1, 2, 3).
    fn quarter_turn() -> ExtrinsicTransform {
        ExtrinsicTransform::from_row_major([
            0.0, -1.0, 0.0, 1.0, //
            1.0, 0.0, 0.0, 2.0, //
            0.0, 0.0, 1.0, 3.0, //
            0.0, 0.0, 0.0, 1.0,
        ])
    }

    #[test]
    fn identity_passes_vector_through() {
        let v = Vector3::new(4.0, -5.0, 6.5);
        assert_eq!(ExtrinsicTransform::identity().apply(&v), v);
    }

    #[test]
    fn apply_rotates_then_translates() {
        let out = quarter_turn().apply(&Vector3::new(1.0, 0.0, 0.0));
        assert_relative_eq!(out, Vector3::new(1.0, 3.0, 3.0));
    }

    #[test]
    fn row_major_layout_is_preserved() {
        let t = quarter_turn();
        assert_eq!(t.translation(), Vector3::new(1.0, 2.0, 3.0));
        assert_eq!(t.rotation()[(0, 1)], -1.0);
        assert_eq!(ExtrinsicTransform::from(t.to_row_major()), t);
    }

    #[test]
    fn deserializes_from_flat_array() {
        let json = "[1,0,0,10, 0,1,0,20, 0,0,1,30, 0,0,0,1]";
        let t: ExtrinsicTransform = serde_json::from_str(json).expect("deserialize");
        assert_eq!(t.translation(), Vector3::new(10.0, 20.0, 30.0));
        assert_eq!(t.rotation(), Matrix3::identity());
    }

    #[test]
    fn ignores_bottom_row() {
        let mut values = quarter_turn().to_row_major();
        values[12] = 9.0;
        values[15] = 0.0;
        let out = ExtrinsicTransform::from_row_major(values).apply(&Vector3::new(1.0, 0.0, 0.0));
        assert_relative_eq!(out, Vector3::new(1.0, 3.0, 3.0));
    }
}
