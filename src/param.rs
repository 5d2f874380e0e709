//! Parameterized geometric transform pipeline (C2).
//!
//! A [`ParameterModel`] holds an ordered list of groups, each an ordered
//! list of dimensions keyed by [`ParameterId`]. `transform` applies the
//! fixed pipeline order from the component design: nonlinear squeeze,
//! nonlinear shape modifiers, shear, scale, rotation, translation.

use crate::matrix::{AffineMatrix, MultiplySide};
use std::collections::HashMap;

/// Every geometric operation the optimizer can compose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParameterId {
    Scale,
    ScaleX,
    ScaleY,
    ScaleZ,
    RotationX,
    RotationY,
    RotationZ,
    TranslationX,
    TranslationY,
    TranslationZ,

    PinchXtoY,
    PinchXtoZ,
    PinchYtoX,
    PinchYtoZ,
    PinchZtoX,
    PinchZtoY,

    ShearYtoX,
    ShearZtoX,
    ShearXtoY,
    ShearZtoY,
    ShearXtoZ,
    ShearYtoZ,

    SinusPinchXtoY,
    SinusPinchXtoZ,
    SinusPinchYtoX,
    SinusPinchYtoZ,

    TopBumpX,
    TopBumpY,
    TopLateralBumpX,
    TopLateralBumpY,

    FlattenXPos,
    FlattenXNeg,
    FlattenYPos,
    FlattenYNeg,
    FlattenZPos,
    FlattenZNeg,

    InflateLowZtoX,
    InflateLowZtoYPos,
    InflateLowZtoYPosHollow,
    InflateLowZtoYNeg,
    InflateLowZtoYNegHollow,
    DeflateLowZtoXYPos,
    DeflateLowZtoXYNeg,

    RotationPrecession,
    RotationNutation,
    RotationRotation,

    FitVolumeFromIntensityRescale,
    FitVolumeShearShiftX,
    FitVolumeShearShiftY,
    FitVolumeShearShiftZ,
    FitVolumeNormCenterRotateX,
    FitVolumeNormCenterRotateZ,
    FitVolumeShearXtoY,
    FitVolumeShearXtoZ,
    FitVolumeShearYtoX,
    FitVolumeShearYtoZ,
    FitVolumeShearZtoX,
    FitVolumeShearZtoY,
}

#[derive(Debug, Clone, Copy)]
pub struct Dimension {
    pub min: f64,
    pub max: f64,
    pub value: f64,
    pub assigned: bool,
}

impl Dimension {
    fn new(min: f64, max: f64) -> Self {
        Self {
            min,
            max,
            value: (min + max) / 2.0,
            assigned: false,
        }
    }

    pub fn half_range(&self) -> f64 {
        (self.max - self.min).abs() / 2.0
    }
}

/// An ordered list of groups of dimensions, the optimizer's search space.
#[derive(Debug, Clone, Default)]
pub struct ParameterModel {
    groups: Vec<Vec<ParameterId>>,
    dims: HashMap<ParameterId, Dimension>,
}

impl ParameterModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_group(&mut self) -> usize {
        self.groups.push(Vec::new());
        self.groups.len() - 1
    }

    pub fn add_dim(&mut self, group: usize, id: ParameterId, min: f64, max: f64) {
        self.groups[group].push(id);
        self.dims.insert(id, Dimension::new(min, max));
    }

    pub fn groups(&self) -> &[Vec<ParameterId>] {
        &self.groups
    }

    pub fn ids(&self) -> impl Iterator<Item = ParameterId> + '_ {
        self.dims.keys().copied()
    }

    pub fn has_value(&self, id: ParameterId) -> bool {
        self.dims.get(&id).map(|d| d.assigned).unwrap_or(false)
    }

    pub fn get_value(&self, id: ParameterId) -> f64 {
        self.dims.get(&id).map(|d| d.value).unwrap_or(0.0)
    }

    pub fn set_value(&mut self, id: ParameterId, v: f64) {
        if let Some(d) = self.dims.get_mut(&id) {
            d.value = v;
            d.assigned = true;
        }
    }

    pub fn dimension(&self, id: ParameterId) -> Option<&Dimension> {
        self.dims.get(&id)
    }

    pub fn dimension_mut(&mut self, id: ParameterId) -> Option<&mut Dimension> {
        self.dims.get_mut(&id)
    }

    fn get_or_zero(&self, id: ParameterId) -> f64 {
        if self.has_value(id) {
            self.get_value(id)
        } else {
            0.0
        }
    }

    /// Nonlinear squeeze of one axis as a function of another, continuous through the origin.
    fn pinch(coord_driving: f64, factor: f64) -> f64 {
        factor * coord_driving.abs() * coord_driving.signum()
    }

    fn sinus_pinch(coord_driving: f64, factor: f64, extent: f64) -> f64 {
        if extent <= 0.0 {
            return 0.0;
        }
        factor * (std::f64::consts::PI * coord_driving / extent).sin()
    }

    /// Applies the fixed C2 pipeline to a point, omitting unset parameters.
    pub fn transform(&self, p: (f64, f64, f64)) -> (f64, f64, f64) {
        let (mut x, mut y, mut z) = p;

        // 1. SinusPinch*, Pinch*
        if self.has_value(ParameterId::PinchXtoY) {
            y += Self::pinch(x, self.get_value(ParameterId::PinchXtoY));
        }
        if self.has_value(ParameterId::PinchXtoZ) {
            z += Self::pinch(x, self.get_value(ParameterId::PinchXtoZ));
        }
        if self.has_value(ParameterId::PinchYtoX) {
            x += Self::pinch(y, self.get_value(ParameterId::PinchYtoX));
        }
        if self.has_value(ParameterId::PinchYtoZ) {
            z += Self::pinch(y, self.get_value(ParameterId::PinchYtoZ));
        }
        if self.has_value(ParameterId::PinchZtoX) {
            x += Self::pinch(z, self.get_value(ParameterId::PinchZtoX));
        }
        if self.has_value(ParameterId::PinchZtoY) {
            y += Self::pinch(z, self.get_value(ParameterId::PinchZtoY));
        }
        if self.has_value(ParameterId::SinusPinchXtoY) {
            y += Self::sinus_pinch(x, self.get_value(ParameterId::SinusPinchXtoY), 100.0);
        }
        if self.has_value(ParameterId::SinusPinchXtoZ) {
            z += Self::sinus_pinch(x, self.get_value(ParameterId::SinusPinchXtoZ), 100.0);
        }
        if self.has_value(ParameterId::SinusPinchYtoX) {
            x += Self::sinus_pinch(y, self.get_value(ParameterId::SinusPinchYtoX), 100.0);
        }
        if self.has_value(ParameterId::SinusPinchYtoZ) {
            z += Self::sinus_pinch(y, self.get_value(ParameterId::SinusPinchYtoZ), 100.0);
        }

        // 2. Flatten*, TopBump*, TopLateralBump*, InflateLowZ*, DeflateLowZ*
        for (id, axis) in [
            (ParameterId::FlattenXPos, 0),
            (ParameterId::FlattenXNeg, 0),
            (ParameterId::FlattenYPos, 1),
            (ParameterId::FlattenYNeg, 1),
            (ParameterId::FlattenZPos, 2),
            (ParameterId::FlattenZNeg, 2),
        ] {
            if self.has_value(id) {
                let amount = self.get_value(id);
                let coord = match axis {
                    0 => &mut x,
                    1 => &mut y,
                    _ => &mut z,
                };
                let positive = matches!(
                    id,
                    ParameterId::FlattenXPos | ParameterId::FlattenYPos | ParameterId::FlattenZPos
                );
                if positive && *coord > amount {
                    *coord = amount;
                } else if !positive && *coord < -amount {
                    *coord = -amount;
                }
            }
        }
        if self.has_value(ParameterId::TopBumpX) {
            let a = self.get_value(ParameterId::TopBumpX);
            if z > 0.0 {
                x += a * (-((x * x) / 2000.0)).exp() * z;
            }
        }
        if self.has_value(ParameterId::TopBumpY) {
            let a = self.get_value(ParameterId::TopBumpY);
            if z > 0.0 {
                y += a * (-((y * y) / 2000.0)).exp() * z;
            }
        }
        if self.has_value(ParameterId::TopLateralBumpX) {
            let a = self.get_value(ParameterId::TopLateralBumpX);
            if z > 0.0 && x.abs() > 0.0 {
                x += a * x.signum() * (-((z - 50.0).powi(2)) / 2000.0).exp();
            }
        }
        if self.has_value(ParameterId::TopLateralBumpY) {
            let a = self.get_value(ParameterId::TopLateralBumpY);
            if z > 0.0 && y.abs() > 0.0 {
                y += a * y.signum() * (-((z - 50.0).powi(2)) / 2000.0).exp();
            }
        }
        if self.has_value(ParameterId::InflateLowZtoX) {
            let a = self.get_value(ParameterId::InflateLowZtoX);
            if z < 0.0 {
                x += a * (-z).sqrt().copysign(x);
            }
        }
        for (id, positive) in [
            (ParameterId::InflateLowZtoYPos, true),
            (ParameterId::InflateLowZtoYPosHollow, true),
            (ParameterId::InflateLowZtoYNeg, false),
            (ParameterId::InflateLowZtoYNegHollow, false),
        ] {
            if self.has_value(id) {
                let a = self.get_value(id);
                if z < 0.0 && (positive && y > 0.0 || !positive && y < 0.0) {
                    y += a * (-z).sqrt() * y.signum();
                }
            }
        }
        if self.has_value(ParameterId::DeflateLowZtoXYPos) {
            let a = self.get_value(ParameterId::DeflateLowZtoXYPos);
            if z < 0.0 && y > 0.0 {
                let s = 1.0 - a * (-z).sqrt().min(1.0);
                x *= s;
                y *= s;
            }
        }
        if self.has_value(ParameterId::DeflateLowZtoXYNeg) {
            let a = self.get_value(ParameterId::DeflateLowZtoXYNeg);
            if z < 0.0 && y < 0.0 {
                let s = 1.0 - a * (-z).sqrt().min(1.0);
                x *= s;
                y *= s;
            }
        }

        // 3. Shear{A->B}: adds s*A to B
        if self.has_value(ParameterId::ShearXtoY) {
            y += self.get_value(ParameterId::ShearXtoY) * x;
        }
        if self.has_value(ParameterId::ShearXtoZ) {
            z += self.get_value(ParameterId::ShearXtoZ) * x;
        }
        if self.has_value(ParameterId::ShearYtoX) {
            x += self.get_value(ParameterId::ShearYtoX) * y;
        }
        if self.has_value(ParameterId::ShearYtoZ) {
            z += self.get_value(ParameterId::ShearYtoZ) * y;
        }
        if self.has_value(ParameterId::ShearZtoX) {
            x += self.get_value(ParameterId::ShearZtoX) * z;
        }
        if self.has_value(ParameterId::ShearZtoY) {
            y += self.get_value(ParameterId::ShearZtoY) * z;
        }

        // 4. Scale
        if self.has_value(ParameterId::Scale) {
            let s = self.get_value(ParameterId::Scale);
            x *= s;
            y *= s;
            z *= s;
        }
        if self.has_value(ParameterId::ScaleX) {
            x *= self.get_value(ParameterId::ScaleX);
        }
        if self.has_value(ParameterId::ScaleY) {
            y *= self.get_value(ParameterId::ScaleY);
        }
        if self.has_value(ParameterId::ScaleZ) {
            z *= self.get_value(ParameterId::ScaleZ);
        }

        // 5. Rotation
        if self.has_value(ParameterId::RotationPrecession)
            || self.has_value(ParameterId::RotationNutation)
            || self.has_value(ParameterId::RotationRotation)
        {
            let mut m = AffineMatrix::from_euler_angles(
                self.get_or_zero(ParameterId::RotationPrecession),
                self.get_or_zero(ParameterId::RotationNutation),
                self.get_or_zero(ParameterId::RotationRotation),
            );
            m.set_translation(0.0, 0.0, 0.0);
            let (nx, ny, nz) = m.apply_vector((x, y, z));
            x = nx;
            y = ny;
            z = nz;
        } else if self.has_value(ParameterId::RotationX)
            || self.has_value(ParameterId::RotationY)
            || self.has_value(ParameterId::RotationZ)
        {
            let mut m = AffineMatrix::identity();
            m.rotate_xyz(
                self.get_or_zero(ParameterId::RotationX),
                self.get_or_zero(ParameterId::RotationY),
                self.get_or_zero(ParameterId::RotationZ),
                MultiplySide::Right,
            );
            let (nx, ny, nz) = m.apply_vector((x, y, z));
            x = nx;
            y = ny;
            z = nz;
        }

        // 6. Translation
        if self.has_value(ParameterId::TranslationX) {
            x += self.get_value(ParameterId::TranslationX);
        }
        if self.has_value(ParameterId::TranslationY) {
            y += self.get_value(ParameterId::TranslationY);
        }
        if self.has_value(ParameterId::TranslationZ) {
            z += self.get_value(ParameterId::TranslationZ);
        }

        (x, y, z)
    }

    /// Returns a unit-ball-normalized image of `p`: the point is first
    /// re-centered on the model's translation (its center in the original
    /// space), then the affine linear part (shear/scale/rotation) is
    /// applied, then the result is divided by `radius`. Only the affine
    /// branch is invertible; the nonlinear modes (pinch/flatten/bump/
    /// inflate/deflate) are assumed unset on this path.
    pub fn spherize(&self, p: (f64, f64, f64), radius: f64) -> (f64, f64, f64) {
        let centered = (
            p.0 - self.get_or_zero(ParameterId::TranslationX),
            p.1 - self.get_or_zero(ParameterId::TranslationY),
            p.2 - self.get_or_zero(ParameterId::TranslationZ),
        );
        let linear = self.affine_matrix(false);
        let (x, y, z) = linear.apply_vector(centered);
        if radius <= 0.0 {
            return (x, y, z);
        }
        (x / radius, y / radius, z / radius)
    }

    /// Inverts the affine linear part and, if `translate`, restores the
    /// model's center (its translation) to return to the original frame.
    pub fn unspherize(&self, p: (f64, f64, f64), radius: f64, translate: bool) -> (f64, f64, f64) {
        let (sx, sy, sz) = if radius > 0.0 {
            (p.0 * radius, p.1 * radius, p.2 * radius)
        } else {
            p
        };

        let linear = self.affine_matrix(false);
        let inv = linear.invert().unwrap_or_else(AffineMatrix::identity);
        let (mut x, mut y, mut z) = inv.apply_vector((sx, sy, sz));

        if translate {
            x += self.get_or_zero(ParameterId::TranslationX);
            y += self.get_or_zero(ParameterId::TranslationY);
            z += self.get_or_zero(ParameterId::TranslationZ);
        }
        (x, y, z)
    }

    /// Builds the affine-only (shear, scale, rotation[, translation]) matrix
    /// for the currently assigned parameters, composing in pipeline order.
    ///
    /// Shear is built first (innermost: applied to the point first), then
    /// each following block is left-multiplied on so it lands outermost,
    /// matching `transform()`'s sequential shear-then-scale-then-rotate-
    /// then-translate application instead of reversing it.
    pub fn affine_matrix(&self, include_translation: bool) -> AffineMatrix {
        let mut m = AffineMatrix::identity();

        if self.has_value(ParameterId::ShearXtoY) || self.has_value(ParameterId::ShearXtoZ) {
            m.shear_x(
                self.get_or_zero(ParameterId::ShearXtoY),
                self.get_or_zero(ParameterId::ShearXtoZ),
                MultiplySide::Right,
            );
        }
        if self.has_value(ParameterId::ShearYtoX) || self.has_value(ParameterId::ShearYtoZ) {
            m.shear_y(
                self.get_or_zero(ParameterId::ShearYtoX),
                self.get_or_zero(ParameterId::ShearYtoZ),
                MultiplySide::Right,
            );
        }
        if self.has_value(ParameterId::ShearZtoX) || self.has_value(ParameterId::ShearZtoY) {
            m.shear_z(
                self.get_or_zero(ParameterId::ShearZtoX),
                self.get_or_zero(ParameterId::ShearZtoY),
                MultiplySide::Right,
            );
        }

        if self.has_value(ParameterId::Scale) {
            m.scale_uniform(self.get_value(ParameterId::Scale), MultiplySide::Left);
        }
        if self.has_value(ParameterId::ScaleX)
            || self.has_value(ParameterId::ScaleY)
            || self.has_value(ParameterId::ScaleZ)
        {
            m.scale(
                if self.has_value(ParameterId::ScaleX) {
                    self.get_value(ParameterId::ScaleX)
                } else {
                    1.0
                },
                if self.has_value(ParameterId::ScaleY) {
                    self.get_value(ParameterId::ScaleY)
                } else {
                    1.0
                },
                if self.has_value(ParameterId::ScaleZ) {
                    self.get_value(ParameterId::ScaleZ)
                } else {
                    1.0
                },
                MultiplySide::Left,
            );
        }

        // Built as its own fresh matrix (same construction `transform()`
        // uses for its local rotation) and left-composed as one block, so
        // the X,Y,Z internal order isn't disturbed by the outer ordering fix.
        if self.has_value(ParameterId::RotationPrecession)
            || self.has_value(ParameterId::RotationNutation)
            || self.has_value(ParameterId::RotationRotation)
        {
            let rot = AffineMatrix::from_euler_angles(
                self.get_or_zero(ParameterId::RotationPrecession),
                self.get_or_zero(ParameterId::RotationNutation),
                self.get_or_zero(ParameterId::RotationRotation),
            );
            m.compose(&rot, MultiplySide::Left);
        } else {
            let mut rot = AffineMatrix::identity();
            rot.rotate_xyz(
                self.get_or_zero(ParameterId::RotationX),
                self.get_or_zero(ParameterId::RotationY),
                self.get_or_zero(ParameterId::RotationZ),
                MultiplySide::Right,
            );
            m.compose(&rot, MultiplySide::Left);
        }

        if include_translation {
            m.translate(
                self.get_or_zero(ParameterId::TranslationX),
                self.get_or_zero(ParameterId::TranslationY),
                self.get_or_zero(ParameterId::TranslationZ),
                MultiplySide::Left,
            );
        }
        m
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translation_only() {
        let mut model = ParameterModel::new();
        let g = model.add_group();
        model.add_dim(g, ParameterId::TranslationX, -10.0, 10.0);
        model.set_value(ParameterId::TranslationX, 3.0);
        model.add_dim(g, ParameterId::TranslationY, -10.0, 10.0);
        model.set_value(ParameterId::TranslationY, -4.0);
        let (x, y, z) = model.transform((1.0, 1.0, 1.0));
        assert_eq!((x, y, z), (4.0, -3.0, 1.0));
    }

    #[test]
    fn scale_then_translate_not_reverse() {
        let mut model = ParameterModel::new();
        let g = model.add_group();
        model.add_dim(g, ParameterId::Scale, 0.1, 10.0);
        model.set_value(ParameterId::Scale, 2.0);
        model.add_dim(g, ParameterId::TranslationX, -10.0, 10.0);
        model.set_value(ParameterId::TranslationX, 5.0);
        let (x, _, _) = model.transform((1.0, 0.0, 0.0));
        // scale-then-translate: 1*2 + 5 = 7, not (1+5)*2 = 12
        assert_eq!(x, 7.0);
    }

    #[test]
    fn spherize_unspherize_round_trip() {
        let mut model = ParameterModel::new();
        let g = model.add_group();
        model.add_dim(g, ParameterId::ScaleX, 0.1, 10.0);
        model.set_value(ParameterId::ScaleX, 1.3);
        model.add_dim(g, ParameterId::RotationZ, -1.0, 1.0);
        model.set_value(ParameterId::RotationZ, 0.4);
        model.add_dim(g, ParameterId::TranslationX, -50.0, 50.0);
        model.set_value(ParameterId::TranslationX, 12.0);

        let p = (10.0, -4.0, 3.0);
        let radius = 50.0;
        let s = model.spherize(p, radius);
        let back = model.unspherize(s, radius, true);
        assert!((back.0 - p.0).abs() < 1e-4);
        assert!((back.1 - p.1).abs() < 1e-4);
        assert!((back.2 - p.2).abs() < 1e-4);
    }
}
