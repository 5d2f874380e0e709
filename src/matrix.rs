//! 4x4 homogeneous affine matrix, column-major.
//!
//! Mirrors the shape of the original `TMatrix44`: a thin wrapper around a
//! linear-algebra backend (here `nalgebra::Matrix4<f64>`) that exposes
//! named composition operators instead of raw matrix multiplies, each one
//! taking an explicit [`MultiplySide`] rather than an implicit convention.

use nalgebra as na;

/// Which side an incremental transform is composed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiplySide {
    Left,
    Right,
}

bitflags::bitflags! {
    /// Coarse classification of what a matrix actually does, within a tolerance.
    pub struct MatrixAnalysis: u32 {
        const HAS_NO_TRANSFORM   = 0x0000;
        const HAS_INT_TRANSLATE  = 0x0001;
        const HAS_TRANSLATION    = 0x0002;
        const HAS_SHEARING       = 0x0010;
        const HAS_INT_SCALING    = 0x0100;
        const HAS_SCALING        = 0x0200;
        const HAS_ORTHO          = 0x1000;
        const HAS_SYMMETRY       = 0x2000;
        const HAS_ROTATION       = 0x4000;
    }
}

impl MatrixAnalysis {
    pub fn is_identity(self) -> bool {
        self == MatrixAnalysis::HAS_NO_TRANSFORM
    }

    pub fn is_orthogonal(self) -> bool {
        self.contains(MatrixAnalysis::HAS_ORTHO)
            || !self.intersects(MatrixAnalysis::HAS_ROTATION | MatrixAnalysis::HAS_SYMMETRY)
    }
}

/// A 4x4 homogeneous transform, column-major.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineMatrix {
    m: na::Matrix4<f64>,
}

impl Default for AffineMatrix {
    fn default() -> Self {
        Self::identity()
    }
}

impl AffineMatrix {
    pub fn identity() -> Self {
        Self {
            m: na::Matrix4::identity(),
        }
    }

    pub fn from_translation(x: f64, y: f64, z: f64) -> Self {
        let mut m = Self::identity();
        m.set_translation(x, y, z);
        m
    }

    /// Builds the matrix from precession/nutation/spin Euler angles (radians),
    /// applied in that order: precession around Z, nutation around X, spin around Z.
    pub fn from_euler_angles(precession: f64, nutation: f64, spin: f64) -> Self {
        let mut m = Self::identity();
        m.rotate_z(precession, MultiplySide::Right);
        m.rotate_x(nutation, MultiplySide::Right);
        m.rotate_z(spin, MultiplySide::Right);
        m
    }

    pub fn as_matrix4(&self) -> &na::Matrix4<f64> {
        &self.m
    }

    /// Column-major flat storage, matching the on-disk/matrix-file layout.
    pub fn to_column_major(&self) -> [f64; 16] {
        let mut out = [0f64; 16];
        out.copy_from_slice(self.m.as_slice());
        out
    }

    pub fn from_column_major(v: &[f64; 16]) -> Self {
        Self {
            m: na::Matrix4::from_column_slice(v),
        }
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.m[(row, col)]
    }

    pub fn set(&mut self, row: usize, col: usize, v: f64) {
        self.m[(row, col)] = v;
    }

    pub fn get_translation(&self) -> (f64, f64, f64) {
        (self.m[(0, 3)], self.m[(1, 3)], self.m[(2, 3)])
    }

    pub fn set_translation(&mut self, x: f64, y: f64, z: f64) {
        self.m[(0, 3)] = x;
        self.m[(1, 3)] = y;
        self.m[(2, 3)] = z;
    }

    pub fn has_translation(&self) -> bool {
        let (x, y, z) = self.get_translation();
        x != 0.0 || y != 0.0 || z != 0.0
    }

    fn multiply(&mut self, other: &na::Matrix4<f64>, side: MultiplySide) {
        self.m = match side {
            MultiplySide::Left => other * self.m,
            MultiplySide::Right => self.m * other,
        };
    }

    pub fn compose(&mut self, other: &AffineMatrix, side: MultiplySide) {
        self.multiply(&other.m, side);
    }

    pub fn translate(&mut self, x: f64, y: f64, z: f64, side: MultiplySide) {
        let mut t = na::Matrix4::identity();
        t[(0, 3)] = x;
        t[(1, 3)] = y;
        t[(2, 3)] = z;
        self.multiply(&t, side);
    }

    pub fn translate_x(&mut self, x: f64, side: MultiplySide) {
        self.translate(x, 0.0, 0.0, side);
    }
    pub fn translate_y(&mut self, y: f64, side: MultiplySide) {
        self.translate(0.0, y, 0.0, side);
    }
    pub fn translate_z(&mut self, z: f64, side: MultiplySide) {
        self.translate(0.0, 0.0, z, side);
    }

    pub fn scale(&mut self, x: f64, y: f64, z: f64, side: MultiplySide) {
        let mut s = na::Matrix4::identity();
        s[(0, 0)] = x;
        s[(1, 1)] = y;
        s[(2, 2)] = z;
        self.multiply(&s, side);
    }

    pub fn scale_uniform(&mut self, s: f64, side: MultiplySide) {
        self.scale(s, s, s, side);
    }

    pub fn rotate_x(&mut self, angle: f64, side: MultiplySide) {
        let (s, c) = angle.sin_cos();
        let mut r = na::Matrix4::identity();
        r[(1, 1)] = c;
        r[(1, 2)] = -s;
        r[(2, 1)] = s;
        r[(2, 2)] = c;
        self.multiply(&r, side);
    }

    pub fn rotate_y(&mut self, angle: f64, side: MultiplySide) {
        let (s, c) = angle.sin_cos();
        let mut r = na::Matrix4::identity();
        r[(0, 0)] = c;
        r[(0, 2)] = s;
        r[(2, 0)] = -s;
        r[(2, 2)] = c;
        self.multiply(&r, side);
    }

    pub fn rotate_z(&mut self, angle: f64, side: MultiplySide) {
        let (s, c) = angle.sin_cos();
        let mut r = na::Matrix4::identity();
        r[(0, 0)] = c;
        r[(0, 1)] = -s;
        r[(1, 0)] = s;
        r[(1, 1)] = c;
        self.multiply(&r, side);
    }

    /// Rotates around X, then Y, then Z, in that order.
    pub fn rotate_xyz(&mut self, ax: f64, ay: f64, az: f64, side: MultiplySide) {
        self.rotate_x(ax, side);
        self.rotate_y(ay, side);
        self.rotate_z(az, side);
    }

    /// Two shear factors: X->Y and X->Z.
    pub fn shear_x(&mut self, sy: f64, sz: f64, side: MultiplySide) {
        let mut sh = na::Matrix4::identity();
        sh[(1, 0)] = sy;
        sh[(2, 0)] = sz;
        self.multiply(&sh, side);
    }

    /// Two shear factors: Y->X and Y->Z.
    pub fn shear_y(&mut self, sx: f64, sz: f64, side: MultiplySide) {
        let mut sh = na::Matrix4::identity();
        sh[(0, 1)] = sx;
        sh[(2, 1)] = sz;
        self.multiply(&sh, side);
    }

    /// Two shear factors: Z->X and Z->Y.
    pub fn shear_z(&mut self, sx: f64, sy: f64, side: MultiplySide) {
        let mut sh = na::Matrix4::identity();
        sh[(0, 2)] = sx;
        sh[(1, 2)] = sy;
        self.multiply(&sh, side);
    }

    pub fn determinant(&self) -> f64 {
        self.m.determinant()
    }

    pub fn invert(&self) -> Option<AffineMatrix> {
        self.m.try_inverse().map(|m| AffineMatrix { m })
    }

    pub fn apply_point(&self, p: (f64, f64, f64)) -> (f64, f64, f64) {
        let v = na::Vector4::new(p.0, p.1, p.2, 1.0);
        let r = self.m * v;
        (r.x, r.y, r.z)
    }

    pub fn apply_vector(&self, p: (f64, f64, f64)) -> (f64, f64, f64) {
        let v = na::Vector4::new(p.0, p.1, p.2, 0.0);
        let r = self.m * v;
        (r.x, r.y, r.z)
    }

    pub fn is_identity(&self, epsilon: f64) -> bool {
        self.m
            .iter()
            .zip(na::Matrix4::<f64>::identity().iter())
            .all(|(a, b)| (a - b).abs() <= epsilon)
    }

    pub fn is_translation(&self, epsilon: f64) -> bool {
        for col in 0..3 {
            for row in 0..3 {
                let expect = if row == col { 1.0 } else { 0.0 };
                if (self.m[(row, col)] - expect).abs() > epsilon {
                    return false;
                }
            }
        }
        true
    }

    fn is_orthogonal_linear(&self, epsilon: f64) -> bool {
        let lin = self.m.fixed_view::<3, 3>(0, 0).clone_owned();
        let should_be_identity = lin.transpose() * lin;
        should_be_identity
            .iter()
            .zip(na::Matrix3::<f64>::identity().iter())
            .all(|(a, b)| (a - b).abs() <= epsilon)
    }

    /// Classifies the transform to within `epsilon`.
    pub fn analyze(&self, epsilon: f64) -> MatrixAnalysis {
        let mut flags = MatrixAnalysis::HAS_NO_TRANSFORM;

        if self.has_translation() {
            flags |= MatrixAnalysis::HAS_TRANSLATION;
            let (x, y, z) = self.get_translation();
            if x.fract() == 0.0 && y.fract() == 0.0 && z.fract() == 0.0 {
                flags |= MatrixAnalysis::HAS_INT_TRANSLATE;
            }
        }

        if !self.is_translation(epsilon) {
            let lin = self.m.fixed_view::<3, 3>(0, 0).clone_owned();
            let diag_only = (0..3).all(|r| {
                (0..3).all(|c| r == c || lin[(r, c)].abs() <= epsilon)
            });

            if diag_only {
                let sx = lin[(0, 0)];
                let sy = lin[(1, 1)];
                let sz = lin[(2, 2)];
                if (sx - 1.0).abs() > epsilon
                    || (sy - 1.0).abs() > epsilon
                    || (sz - 1.0).abs() > epsilon
                {
                    flags |= MatrixAnalysis::HAS_SCALING;
                    if sx.fract() == 0.0 && sy.fract() == 0.0 && sz.fract() == 0.0 {
                        flags |= MatrixAnalysis::HAS_INT_SCALING;
                    }
                }
            } else if self.is_orthogonal_linear(epsilon) {
                flags |= MatrixAnalysis::HAS_ROTATION;
                if self.determinant() < 0.0 {
                    flags |= MatrixAnalysis::HAS_SYMMETRY;
                }
            } else {
                flags |= MatrixAnalysis::HAS_SHEARING;
            }
        }

        flags
    }

    /// Row-major text matrix file: 4 rows, space separated, as in §6.
    pub fn write_text(&self) -> String {
        let mut s = String::new();
        for row in 0..4 {
            let vals: Vec<String> = (0..4).map(|col| format!("{:.9}", self.get(row, col))).collect();
            s.push_str(&vals.join(" "));
            s.push('\n');
        }
        s
    }

    pub fn read_text(content: &str) -> Option<AffineMatrix> {
        let mut m = AffineMatrix::identity();
        let mut row = 0;
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let vals: Vec<f64> = line
                .split_whitespace()
                .filter_map(|t| t.parse::<f64>().ok())
                .collect();
            if vals.len() != 4 || row >= 4 {
                return None;
            }
            for (col, v) in vals.into_iter().enumerate() {
                m.set(row, col, v);
            }
            row += 1;
        }
        (row == 4).then_some(m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_inverts_to_identity() {
        let m = AffineMatrix::identity();
        let inv = m.invert().unwrap();
        assert!(inv.is_identity(1e-9));
        assert!(m.analyze(1e-9).is_identity());
    }

    #[test]
    fn inverse_round_trip() {
        let mut m = AffineMatrix::identity();
        m.rotate_xyz(0.3, -0.2, 0.7, MultiplySide::Right);
        m.translate(1.0, -2.0, 3.5, MultiplySide::Right);
        m.scale(1.1, 0.9, 1.05, MultiplySide::Right);
        let inv = m.invert().expect("nonzero determinant");
        let mut product = m;
        product.compose(&inv, MultiplySide::Right);
        assert!(product.is_identity(1e-9));
    }

    #[test]
    fn pure_translation_roundtrips_vector() {
        let m = AffineMatrix::from_translation(3.0, -1.5, 2.0);
        assert!(m.is_translation(1e-12));
        assert_eq!(m.get_translation(), (3.0, -1.5, 2.0));
    }

    #[test]
    fn text_round_trip() {
        let mut m = AffineMatrix::identity();
        m.translate(1.0, 2.0, 3.0, MultiplySide::Right);
        let text = m.write_text();
        let back = AffineMatrix::read_text(&text).unwrap();
        assert!((m.get_translation().0 - back.get_translation().0).abs() < 1e-6);
    }
}
