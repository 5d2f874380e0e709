//! Point-domain cost evaluators (C4): surface fitting, single-set
//! geometric analysis, and point-to-point coregistration.

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use crate::matrix::AffineMatrix;
use crate::optimizer::{EasyStats, Evaluable};
use crate::param::ParameterModel;
use crate::Result;

pub type Point3 = (f64, f64, f64);

/// Ordered sequence of 3D points with a cached bounding box and center.
#[derive(Debug, Clone, Default)]
pub struct PointSet {
    pub points: Vec<Point3>,
    pub names: Vec<String>,
}

impl PointSet {
    pub fn new(points: Vec<Point3>) -> Self {
        Self { points, names: Vec::new() }
    }

    pub fn with_names(points: Vec<Point3>, names: Vec<String>) -> Self {
        Self { points, names }
    }

    fn name_for(&self, i: usize) -> String {
        self.names.get(i).cloned().unwrap_or_else(|| format!("sp{i}"))
    }

    /// Text solution-points file: one labeled point per line, `name x y z`.
    pub fn write_text(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut f = File::create(path)?;
        for (i, p) in self.points.iter().enumerate() {
            writeln!(f, "{} {:.6} {:.6} {:.6}", self.name_for(i), p.0, p.1, p.2)?;
        }
        Ok(())
    }

    pub fn read_text(path: impl AsRef<Path>) -> Result<PointSet> {
        let file = File::open(path)?;
        let mut points = Vec::new();
        let mut names = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() < 4 {
                continue;
            }
            let x: f64 = tokens[1].parse().unwrap_or(0.0);
            let y: f64 = tokens[2].parse().unwrap_or(0.0);
            let z: f64 = tokens[3].parse().unwrap_or(0.0);
            names.push(tokens[0].to_string());
            points.push((x, y, z));
        }
        Ok(PointSet::with_names(points, names))
    }

    pub fn center(&self) -> Point3 {
        if self.points.is_empty() {
            return (0.0, 0.0, 0.0);
        }
        let n = self.points.len() as f64;
        let (sx, sy, sz) = self
            .points
            .iter()
            .fold((0.0, 0.0, 0.0), |a, p| (a.0 + p.0, a.1 + p.1, a.2 + p.2));
        (sx / n, sy / n, sz / n)
    }

    pub fn bounding_radius(&self) -> f64 {
        let c = self.center();
        self.points
            .iter()
            .map(|p| {
                let d = (p.0 - c.0, p.1 - c.1, p.2 - c.2);
                (d.0 * d.0 + d.1 * d.1 + d.2 * d.2).sqrt()
            })
            .fold(0.0, f64::max)
    }

    pub fn transform(&self, model: &ParameterModel) -> PointSet {
        PointSet::with_names(
            self.points.iter().map(|&p| model.transform(p)).collect(),
            self.names.clone(),
        )
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// How a parametric surface relates to the point set it is fit against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitModelDistance {
    Norm1,
    WeightedNorm1,
    Norm2,
    WeightedNorm2,
    ContainNorm1,
    ContainNorm2,
}

/// Fits a parametric surface (the C2 pipeline applied to a unit sphere
/// primitive) to a target point set.
pub struct FitModelOnPoints {
    pub model: ParameterModel,
    pub points: PointSet,
    pub center: Point3,
    pub how: FitModelDistance,
    surface_samples: usize,
}

impl FitModelOnPoints {
    pub fn new(points: PointSet, how: FitModelDistance) -> Self {
        let center = points.center();
        Self {
            model: ParameterModel::new(),
            points,
            center,
            how,
            surface_samples: 64,
        }
    }

    pub fn max_radius(&self) -> f64 {
        self.points
            .points
            .iter()
            .map(|p| {
                let d = (p.0 - self.center.0, p.1 - self.center.1, p.2 - self.center.2);
                (d.0 * d.0 + d.1 * d.1 + d.2 * d.2).sqrt()
            })
            .fold(0.0, f64::max)
    }

    pub fn mean_radius(&self) -> f64 {
        if self.points.is_empty() {
            return 0.0;
        }
        let n = self.points.len() as f64;
        self.points
            .points
            .iter()
            .map(|p| {
                let d = (p.0 - self.center.0, p.1 - self.center.1, p.2 - self.center.2);
                (d.0 * d.0 + d.1 * d.1 + d.2 * d.2).sqrt()
            })
            .sum::<f64>()
            / n
    }

    /// Unit-sphere sample points, transformed by the model.
    fn surface(&self) -> Vec<Point3> {
        let n = self.surface_samples;
        (0..n)
            .map(|i| {
                // Fibonacci sphere sampling.
                let phi = (1.0 + 5f64.sqrt()) / 2.0;
                let z = 1.0 - 2.0 * (i as f64 + 0.5) / n as f64;
                let r = (1.0 - z * z).max(0.0).sqrt();
                let theta = 2.0 * std::f64::consts::PI * (i as f64) / phi;
                let (x, y) = (r * theta.cos(), r * theta.sin());
                self.model.transform((x, y, z))
            })
            .collect()
    }

    fn closest_surface_distance(&self, surface: &[Point3], p: Point3) -> f64 {
        surface
            .iter()
            .map(|s| {
                let d = (s.0 - p.0, s.1 - p.1, s.2 - p.2);
                (d.0 * d.0 + d.1 * d.1 + d.2 * d.2).sqrt()
            })
            .fold(f64::INFINITY, f64::min)
    }
}

impl Evaluable for FitModelOnPoints {
    fn model(&self) -> &ParameterModel {
        &self.model
    }
    fn model_mut(&mut self) -> &mut ParameterModel {
        &mut self.model
    }
    fn evaluate(&mut self, stats: Option<&mut EasyStats>) -> f64 {
        let surface = self.surface();
        let mean_r = self.mean_radius().max(1e-9);

        let mut total = 0.0;
        for &p in &self.points.points {
            let dist = self.closest_surface_distance(&surface, p);
            let d = (p.0 - self.center.0, p.1 - self.center.1, p.2 - self.center.2);
            let r = (d.0 * d.0 + d.1 * d.1 + d.2 * d.2).sqrt();

            let contrib = match self.how {
                FitModelDistance::Norm1 => dist,
                FitModelDistance::Norm2 => dist * dist,
                FitModelDistance::WeightedNorm1 => dist / (1.0 + (r - mean_r).abs() / mean_r),
                FitModelDistance::WeightedNorm2 => {
                    (dist * dist) / (1.0 + (r - mean_r).abs() / mean_r)
                }
                // Containment: only points outside the surface (farther
                // from center than the nearest surface sample) penalize.
                FitModelDistance::ContainNorm1 => {
                    if r > mean_r {
                        dist
                    } else {
                        0.0
                    }
                }
                FitModelDistance::ContainNorm2 => {
                    if r > mean_r {
                        dist * dist
                    } else {
                        0.0
                    }
                }
            };
            if let Some(s) = stats.as_ref() {
                let _ = s;
            }
            total += contrib;
        }
        if let Some(s) = stats {
            for &p in &self.points.points {
                s.push(self.closest_surface_distance(&surface, p));
            }
        }
        total / self.points.len().max(1) as f64
    }
}

/// Single-set geometric analysis (symmetry, axis alignment, up-axis).
pub struct PointsProperties {
    pub model: ParameterModel,
    pub points: PointSet,
    pub mode: PointsAnalysisMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointsAnalysisMode {
    Sagittal,
    Transverse,
    ReorientTop,
}

impl PointsProperties {
    pub fn new(points: PointSet, mode: PointsAnalysisMode) -> Self {
        Self {
            model: ParameterModel::new(),
            points,
            mode,
        }
    }

    fn evaluate_sagittal(&self) -> f64 {
        let transformed = self.points.transform(&self.model);
        let n = transformed.len().max(1) as f64;
        transformed
            .points
            .iter()
            .map(|p| {
                let mirrored = (-p.0, p.1, p.2);
                let nearest = transformed
                    .points
                    .iter()
                    .map(|q| {
                        let d = (q.0 - mirrored.0, q.1 - mirrored.1, q.2 - mirrored.2);
                        d.0 * d.0 + d.1 * d.1 + d.2 * d.2
                    })
                    .fold(f64::INFINITY, f64::min);
                nearest
            })
            .sum::<f64>()
            / n
    }

    fn evaluate_transverse(&self) -> f64 {
        let transformed = self.points.transform(&self.model);
        // Penalize spread of the points' Z coordinate relative to the
        // principal axis: a well-aligned transverse plane minimizes the
        // variance of Z once rotated flat.
        let n = transformed.len().max(1) as f64;
        let mean_z = transformed.points.iter().map(|p| p.2).sum::<f64>() / n;
        transformed
            .points
            .iter()
            .map(|p| (p.2 - mean_z).abs())
            .sum::<f64>()
            / n
    }

    fn evaluate_to_top(&self) -> f64 {
        let transformed = self.points.transform(&self.model);
        let n = transformed.len().max(1) as f64;
        // Alignment with +Z: average horizontal displacement of the upper
        // half, penalized.
        transformed
            .points
            .iter()
            .filter(|p| p.2 > 0.0)
            .map(|p| (p.0 * p.0 + p.1 * p.1).sqrt())
            .sum::<f64>()
            / n
    }

    /// Flips the set if the upper-half centroid is behind the lower-half
    /// centroid (a proxy for occiput vs forehead orientation).
    pub fn resolve_front_back_orientation(points: &mut PointSet) {
        let center = points.center();
        let (mut upper_y, mut upper_n, mut lower_y, mut lower_n) = (0.0, 0usize, 0.0, 0usize);
        for p in &points.points {
            if p.2 > center.2 {
                upper_y += p.1;
                upper_n += 1;
            } else {
                lower_y += p.1;
                lower_n += 1;
            }
        }
        if upper_n == 0 || lower_n == 0 {
            return;
        }
        let upper_mean = upper_y / upper_n as f64;
        let lower_mean = lower_y / lower_n as f64;
        if upper_mean < lower_mean {
            for p in points.points.iter_mut() {
                p.1 = -p.1;
            }
        }
    }
}

impl Evaluable for PointsProperties {
    fn model(&self) -> &ParameterModel {
        &self.model
    }
    fn model_mut(&mut self) -> &mut ParameterModel {
        &mut self.model
    }
    fn evaluate(&mut self, _stats: Option<&mut EasyStats>) -> f64 {
        match self.mode {
            PointsAnalysisMode::Sagittal => self.evaluate_sagittal(),
            PointsAnalysisMode::Transverse => self.evaluate_transverse(),
            PointsAnalysisMode::ReorientTop => self.evaluate_to_top(),
        }
    }
}

/// How `FitPointsOnPoints` matches the two sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointMatchMode {
    ClosestPoints,
    MatchingPairs,
}

/// Registers `from_points` onto `to_points`, with an optional guillotine
/// clipping plane excluding target points below it.
pub struct FitPointsOnPoints {
    pub model: ParameterModel,
    pub from_points: PointSet,
    pub to_points: PointSet,
    pub mode: PointMatchMode,
    pub mri_abs_to_guillotine: Option<AffineMatrix>,
}

impl FitPointsOnPoints {
    pub fn new(
        from_points: PointSet,
        to_points: PointSet,
        mode: PointMatchMode,
        mri_abs_to_guillotine: Option<AffineMatrix>,
    ) -> Self {
        Self {
            model: ParameterModel::new(),
            from_points,
            to_points,
            mode,
            mri_abs_to_guillotine,
        }
    }

    fn clipped_to_points(&self) -> Vec<Point3> {
        match &self.mri_abs_to_guillotine {
            None => self.to_points.points.clone(),
            Some(g) => self
                .to_points
                .points
                .iter()
                .filter(|&&p| g.apply_point(p).2 >= 0.0)
                .copied()
                .collect(),
        }
    }

    pub fn closest_point(&self, p: Point3, candidates: &[Point3]) -> f64 {
        candidates
            .iter()
            .map(|q| {
                let d = (q.0 - p.0, q.1 - p.1, q.2 - p.2);
                (d.0 * d.0 + d.1 * d.1 + d.2 * d.2).sqrt()
            })
            .fold(f64::INFINITY, f64::min)
    }
}

impl Evaluable for FitPointsOnPoints {
    fn model(&self) -> &ParameterModel {
        &self.model
    }
    fn model_mut(&mut self) -> &mut ParameterModel {
        &mut self.model
    }
    fn evaluate(&mut self, stats: Option<&mut EasyStats>) -> f64 {
        let transformed = self.from_points.transform(&self.model);
        let targets = self.clipped_to_points();

        let residuals: Vec<f64> = match self.mode {
            PointMatchMode::ClosestPoints => transformed
                .points
                .iter()
                .map(|&p| self.closest_point(p, &targets))
                .collect(),
            PointMatchMode::MatchingPairs => transformed
                .points
                .iter()
                .zip(targets.iter())
                .map(|(&p, &q)| {
                    let d = (p.0 - q.0, p.1 - q.1, p.2 - q.2);
                    (d.0 * d.0 + d.1 * d.1 + d.2 * d.2).sqrt()
                })
                .collect(),
        };

        if let Some(s) = stats {
            for &r in &residuals {
                s.push(r);
            }
        }

        if residuals.is_empty() {
            0.0
        } else {
            residuals.iter().sum::<f64>() / residuals.len() as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::{GlobalOptimize, GoMethod};
    use crate::param::ParameterId;

    fn sphere_points(radius: f64, n: usize) -> PointSet {
        let phi = (1.0 + 5f64.sqrt()) / 2.0;
        PointSet::new(
            (0..n)
                .map(|i| {
                    let z = 1.0 - 2.0 * (i as f64 + 0.5) / n as f64;
                    let r = (1.0 - z * z).max(0.0).sqrt();
                    let theta = 2.0 * std::f64::consts::PI * (i as f64) / phi;
                    (radius * r * theta.cos(), radius * r * theta.sin(), radius * z)
                })
                .collect(),
        )
    }

    #[test]
    fn fit_model_converges_on_sphere_radius() {
        let points = sphere_points(10.0, 40);
        let mut fit = FitModelOnPoints::new(points, FitModelDistance::Norm1);
        let g = fit.model.add_group();
        fit.model.add_dim(g, ParameterId::Scale, 0.1, 50.0);
        fit.model.set_value(ParameterId::Scale, 1.0);
        let cost = GlobalOptimize::get_solution(&mut fit, GoMethod::GlobalNelderMead, 1e-5, None);
        assert!(cost < 1.0);
        assert!((fit.model.get_value(ParameterId::Scale) - 10.0).abs() < 0.5);
    }

    #[test]
    fn text_round_trip_preserves_points_and_names() {
        let points = PointSet::with_names(
            vec![(1.0, 2.0, 3.0), (-4.5, 0.0, 9.25)],
            vec!["sp0".to_string(), "sp1".to_string()],
        );
        let dir = std::env::temp_dir().join(format!("geonorm_points_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("points.txt");

        points.write_text(&path).unwrap();
        let back = PointSet::read_text(&path).unwrap();
        assert_eq!(back.names, points.names);
        for (a, b) in points.points.iter().zip(back.points.iter()) {
            assert!((a.0 - b.0).abs() < 1e-5);
            assert!((a.1 - b.1).abs() < 1e-5);
            assert!((a.2 - b.2).abs() < 1e-5);
        }

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn front_back_orientation_flips_when_needed() {
        let mut points = PointSet::new(vec![(0.0, -5.0, 5.0), (0.0, 5.0, -5.0)]);
        PointsProperties::resolve_front_back_orientation(&mut points);
        // upper half (z>0) centroid.y was -5, lower half (z<0) was +5: flipped.
        assert!(points.points[0].1 > 0.0);
    }
}
