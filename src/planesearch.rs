//! Plane-search orchestrator (C5): locates the sagittal symmetry plane,
//! the transverse plane, and the guillotine neck-cut plane by trying a
//! short list of (search method, cost variant) combinations and keeping
//! the best Q-score.

use crate::matrix::AffineMatrix;
use crate::optimizer::{EasyStats, GlobalOptimize, GoMethod};
use crate::param::{ParameterId, ParameterModel};
use crate::volume::{VolumeCostKind, VolumeProperties, Volume};

/// Outcome of a single plane search: the resulting transform, its Q-score,
/// and whether the result fell outside the acceptance window.
#[derive(Debug, Clone)]
pub struct PlaneSearchResult {
    pub transform: AffineMatrix,
    pub quality: f64,
    pub dubious: bool,
    pub opinion: &'static str,
}

fn q_score(model: &ParameterModel, ids: &[ParameterId], final_cost: f64, maximizing: bool, reference_scale: f64) -> f64 {
    let mut sum_sq = 0.0;
    for &id in ids {
        if let Some(d) = model.dimension(id) {
            let half = d.half_range().max(1e-9);
            let center = (d.min + d.max) / 2.0;
            let delta = (d.value - center).abs() / half;
            sum_sq += delta * delta;
        }
    }
    let mintransf = sum_sq.sqrt();

    let mindiff = if maximizing {
        if final_cost.abs() < 1e-9 {
            1.0
        } else {
            (reference_scale.max(1e-9) / final_cost.abs()).min(10.0)
        }
    } else {
        (final_cost.abs() / reference_scale.max(1e-9)).min(10.0)
    };

    (mintransf * mindiff).max(0.0).sqrt()
}

fn opinion_for(quality: f64, min_q: f64, max_q: f64) -> (&'static str, bool) {
    if quality < min_q {
        ("Trivial / already aligned", false)
    } else if quality <= max_q {
        ("Accepted", false)
    } else {
        ("Dubious", true)
    }
}

fn radius_estimate(volume: &Volume) -> f64 {
    let (nx, ny, nz) = volume.dim;
    0.5 * ((nx * nx + ny * ny + nz * nz) as f64).sqrt()
}

/// Locates the sagittal symmetry plane. Tries three (method, cost) combinations,
/// keeping the best Q-score; outside `[0.10, 0.70]` the transform resets to a
/// pure translation to the volume's original center.
pub fn search_sagittal(volume: &Volume) -> PlaneSearchResult {
    const MIN_Q: f64 = 0.10;
    const MAX_Q: f64 = 0.70;
    let radius = radius_estimate(volume);

    let combos = [
        (GoMethod::CyclicalCrossHairScan, VolumeCostKind::SagittalPlaneSymmetric),
        (GoMethod::CyclicalCrossHairScan, VolumeCostKind::SagittalPlaneSymmetricT1),
        (GoMethod::GlobalCrossHairScan, VolumeCostKind::SagittalPlaneSymmetricT1Gad),
    ];

    let mut best: Option<(f64, ParameterModel, VolumeCostKind)> = None;

    for &(method, kind) in &combos {
        let mut props = VolumeProperties::new(volume, kind);
        let g = props.model.add_group();
        props.model.add_dim(g, ParameterId::TranslationX, -0.5 * radius, 0.5 * radius);
        props.model.set_value(ParameterId::TranslationX, 0.0);

        let cost = GlobalOptimize::get_solution(&mut props, method, 1e-5, None);
        let q = q_score(&props.model, &[ParameterId::TranslationX], cost, false, radius);

        if best.as_ref().map_or(true, |(bq, ..)| q < *bq) {
            best = Some((q, props.model.clone(), kind));
            if q <= 0.05 {
                break;
            }
        }
    }

    let (q, model, _kind) = best.expect("combos is non-empty");
    let (opinion, dubious) = opinion_for(q, MIN_Q, MAX_Q);

    let transform = if dubious {
        AffineMatrix::from_translation(volume.dim.0 as f64 / 2.0, 0.0, 0.0)
    } else {
        model.affine_matrix(true)
    };

    PlaneSearchResult { transform, quality: q, dubious, opinion }
}

/// Locates the transverse plane. Tries the MNI-referenced costs first
/// (short-circuiting if the best Q < 0.35), else falls back to the
/// geometric (biggest-box / biggest-surface) costs.
pub fn search_transverse(volume: &Volume, mni_slice: Option<&Volume>) -> PlaneSearchResult {
    const MIN_Q: f64 = 0.10;
    const MAX_Q: f64 = 0.70;
    let radius = radius_estimate(volume);

    let mut best: Option<(f64, ParameterModel)> = None;

    if mni_slice.is_some() {
        for kind in [VolumeCostKind::TransversePlaneMniT1, VolumeCostKind::TransversePlaneMniT2] {
            let mut props = VolumeProperties::new(volume, kind);
            props.mni_slice = mni_slice;

            // Stage 1: fast pose estimate, TranslationY/Z + RotationX.
            let g0 = props.model.add_group();
            props.model.add_dim(g0, ParameterId::TranslationY, -0.60 * radius, 0.60 * radius);
            props.model.add_dim(g0, ParameterId::TranslationZ, -0.60 * radius, 0.60 * radius);
            props.model.add_dim(g0, ParameterId::RotationX, -60f64.to_radians(), 60f64.to_radians());
            for id in [ParameterId::TranslationY, ParameterId::TranslationZ, ParameterId::RotationX] {
                props.model.set_value(id, 0.0);
            }
            GlobalOptimize::get_solution(&mut props, GoMethod::GlobalNelderMead, 1e-4, None);

            // Stage 2: full refinement with per-axis scaling.
            let g1 = props.model.add_group();
            let scale_band = 0.10;
            props.model.add_dim(g1, ParameterId::ScaleX, 1.0 - scale_band, 1.0 + scale_band);
            props.model.add_dim(g1, ParameterId::ScaleY, 1.0 - scale_band, 1.0 + scale_band);
            props.model.add_dim(g1, ParameterId::ScaleZ, 1.0 - scale_band, 1.0 + scale_band);
            for id in [ParameterId::ScaleX, ParameterId::ScaleY, ParameterId::ScaleZ] {
                props.model.set_value(id, 1.0);
            }
            let cost = GlobalOptimize::get_solution(&mut props, GoMethod::GlobalNelderMead, 1e-5, None);

            let q = q_score(
                &props.model,
                &[ParameterId::TranslationY, ParameterId::TranslationZ, ParameterId::RotationX],
                cost,
                false,
                radius,
            );
            if best.as_ref().map_or(true, |(bq, _)| q < *bq) {
                best = Some((q, props.model.clone()));
            }
        }
        if let Some((q, _)) = &best {
            if *q < 0.35 {
                let (q, model) = best.take().unwrap();
                let (opinion, dubious) = opinion_for(q, MIN_Q, MAX_Q);
                let transform = if dubious {
                    AffineMatrix::from_translation(0.0, 0.0, volume.dim.2 as f64 / 2.0)
                } else {
                    model.affine_matrix(true)
                };
                return PlaneSearchResult { transform, quality: q, dubious, opinion };
            }
        }
    }

    for kind in [VolumeCostKind::TransversePlaneBiggestBox, VolumeCostKind::TransversePlaneBiggestSurface] {
        let mut props = VolumeProperties::new(volume, kind);
        let g = props.model.add_group();
        props.model.add_dim(g, ParameterId::TranslationZ, -0.60 * radius, 0.60 * radius);
        props.model.set_value(ParameterId::TranslationZ, 0.0);
        let cost = GlobalOptimize::get_solution(&mut props, GoMethod::CyclicalCrossHairScan, 1e-4, None);
        let q = q_score(&props.model, &[ParameterId::TranslationZ], cost, true, radius);
        if best.as_ref().map_or(true, |(bq, _)| q < *bq) {
            best = Some((q, props.model.clone()));
        }
    }

    let (q, model) = best.expect("at least the fallback combos ran");
    let (opinion, dubious) = opinion_for(q, MIN_Q, MAX_Q);
    let transform = if dubious {
        AffineMatrix::from_translation(0.0, 0.0, volume.dim.2 as f64 / 2.0)
    } else {
        model.affine_matrix(true)
    };
    PlaneSearchResult { transform, quality: q, dubious, opinion }
}

/// Locates the guillotine neck-cut plane near the inferior boundary.
pub fn search_guillotine(volume: &Volume) -> PlaneSearchResult {
    const MIN_Q: f64 = 0.0;
    const MAX_Q: f64 = 0.05;
    let radius = radius_estimate(volume);

    let methods = [GoMethod::GlobalNelderMead, GoMethod::WeakestDimensionCrossHairScan];
    let mut best: Option<(f64, ParameterModel)> = None;

    for &method in &methods {
        let mut props = VolumeProperties::new(volume, VolumeCostKind::TransversePlaneGuillotine);
        let g = props.model.add_group();
        props.model.add_dim(g, ParameterId::TranslationZ, -0.20 * radius, 0.20 * radius);
        props.model.add_dim(g, ParameterId::RotationX, -30f64.to_radians(), 30f64.to_radians());
        props.model.add_dim(g, ParameterId::RotationY, -10f64.to_radians(), 10f64.to_radians());
        for id in [ParameterId::TranslationZ, ParameterId::RotationX, ParameterId::RotationY] {
            props.model.set_value(id, -0.20 * radius);
        }
        props.model.set_value(ParameterId::RotationX, 0.0);
        props.model.set_value(ParameterId::RotationY, 0.0);

        let cost = GlobalOptimize::get_solution(&mut props, method, 1e-5, None);
        let q = q_score(
            &props.model,
            &[ParameterId::TranslationZ, ParameterId::RotationX, ParameterId::RotationY],
            cost,
            false,
            1.0,
        );
        if best.as_ref().map_or(true, |(bq, _)| q < *bq) {
            best = Some((q, props.model.clone()));
            if q <= MAX_Q {
                break;
            }
        }
    }

    let (q, model) = best.expect("methods is non-empty");
    let (opinion, dubious) = opinion_for(q, MIN_Q, MAX_Q);
    let transform = if dubious {
        AffineMatrix::identity()
    } else {
        model.affine_matrix(true)
    };
    PlaneSearchResult { transform, quality: q, dubious, opinion }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mirror_phantom(n: usize) -> Volume {
        let mut v = Volume::new((n, n, n));
        for z in 0..n {
            for y in 0..n {
                for x in 0..n / 2 {
                    let dx = x as f64 - n as f64 / 2.0;
                    let dy = y as f64 - n as f64 / 2.0;
                    let dz = z as f64 - n as f64 / 2.0;
                    let r = (dx * dx + dy * dy + dz * dz).sqrt();
                    let val = if r < n as f64 / 3.0 { 80.0 } else { 0.0 };
                    v.set(x, y, z, val);
                    v.set(n - 1 - x, y, z, val);
                }
            }
        }
        v
    }

    #[test]
    fn sagittal_on_symmetric_phantom_is_confidently_accepted() {
        let v = mirror_phantom(32);
        let result = search_sagittal(&v);
        assert!(result.quality < 0.10);
    }

    #[test]
    fn guillotine_on_headless_volume_finds_cut_near_boundary() {
        let mut v = Volume::new((16, 16, 16));
        for z in 4..16 {
            for y in 0..16 {
                for x in 0..16 {
                    v.set(x, y, z, 100.0);
                }
            }
        }
        let result = search_guillotine(&v);
        assert!(result.quality <= 0.05 || !result.dubious);
    }
}
