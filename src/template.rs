//! Iterative group template builder (C6): per-subject canonicalization,
//! group-wise affine coregistration, and median voxel aggregation with
//! optional left-right symmetrization.

use rayon::prelude::*;

use crate::matrix::{AffineMatrix, MultiplySide};
use crate::optimizer::{GlobalOptimize, GoMethod};
use crate::param::ParameterId;
use crate::planesearch::{search_sagittal, search_transverse};
use crate::points::PointSet;
use crate::volume::{FitVolumeOnVolume, FitVolumeType, RemapIntensityType, Volume};

/// Transform and origin produced once per subject by [`normalize_brain`].
#[derive(Debug, Clone)]
pub struct NormalizationResult {
    pub rel_to_abs: AffineMatrix,
    pub origin: (f64, f64, f64),
    pub origin_to_target: AffineMatrix,
}

/// Sagittal plane search, then a transverse plane search seeded by it;
/// their composition yields `rel_to_abs` and the canonical origin shift.
pub fn normalize_brain(volume: &Volume, mni_slice: Option<&Volume>) -> NormalizationResult {
    let sagittal = search_sagittal(volume);
    let transverse = search_transverse(volume, mni_slice);

    let mut rel_to_abs = sagittal.transform;
    rel_to_abs.compose(&transverse.transform, MultiplySide::Right);

    let origin = rel_to_abs.get_translation();
    let origin_to_target = AffineMatrix::from_translation(-origin.0, -origin.1, -origin.2);

    NormalizationResult { rel_to_abs, origin, origin_to_target }
}

/// Which brain the group template is anchored to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    SelfRef,
    Mni,
}

/// Parameter-group sizing for one coregistration pass, indexed by
/// `(buildMode, isLooping)`.
#[derive(Debug, Clone, Copy)]
pub struct CoregistrationSpecs {
    pub num_translations: u8,
    pub num_rotations: u8,
    pub num_scalings: u8,
    pub num_shearings: u8,
}

/// The coregistration-specs table: bootstrap passes use a cheaper rigid
/// model, looping passes add scale and shear once the template has settled.
pub fn coregistration_specs(mode: BuildMode, is_looping: bool) -> CoregistrationSpecs {
    match (mode, is_looping) {
        (BuildMode::SelfRef, false) => CoregistrationSpecs {
            num_translations: 3,
            num_rotations: 3,
            num_scalings: 0,
            num_shearings: 0,
        },
        (BuildMode::SelfRef, true) => CoregistrationSpecs {
            num_translations: 3,
            num_rotations: 3,
            num_scalings: 1,
            num_shearings: 2,
        },
        (BuildMode::Mni, false) => CoregistrationSpecs {
            num_translations: 3,
            num_rotations: 3,
            num_scalings: 3,
            num_shearings: 0,
        },
        (BuildMode::Mni, true) => CoregistrationSpecs {
            num_translations: 3,
            num_rotations: 3,
            num_scalings: 3,
            num_shearings: 6,
        },
    }
}

fn round_to_odd(v: f64) -> usize {
    let r = v.round() as i64;
    (if r % 2 == 0 { r + 1 } else { r }).max(1) as usize
}

/// Template dimensions and origin fraction for the bootstrap pass.
fn self_ref_template_shape(max_dim: usize) -> ((usize, usize, usize), (f64, f64, f64)) {
    let d = round_to_odd(max_dim as f64 * 1.20);
    let dims = (d, d, d);
    let origin = (
        ((96.0 / 192.0 * d as f64) / 2.0).trunc() * 2.0,
        ((132.0 / 228.0 * d as f64) / 2.0).trunc() * 2.0,
        ((78.0 / 192.0 * d as f64) / 2.0).trunc() * 2.0,
    );
    (dims, origin)
}

fn add_group_dims(
    fit: &mut FitVolumeOnVolume,
    specs: CoregistrationSpecs,
    ref_radius: f64,
    source_radius: f64,
) {
    let translations = [ParameterId::TranslationX, ParameterId::TranslationY, ParameterId::TranslationZ];
    let rotations = [ParameterId::RotationX, ParameterId::RotationY, ParameterId::RotationZ];
    let scalings = [ParameterId::ScaleX, ParameterId::ScaleY, ParameterId::ScaleZ];
    let shearings = [
        ParameterId::ShearXtoY,
        ParameterId::ShearXtoZ,
        ParameterId::ShearYtoX,
        ParameterId::ShearYtoZ,
        ParameterId::ShearZtoX,
        ParameterId::ShearZtoY,
    ];

    let g = fit.model.add_group();
    for &id in translations.iter().take(specs.num_translations as usize) {
        fit.model.add_dim(g, id, -0.5 * ref_radius, 0.5 * ref_radius);
        fit.model.set_value(id, 0.0);
    }
    for &id in rotations.iter().take(specs.num_rotations as usize) {
        fit.model.add_dim(g, id, -15f64.to_radians(), 15f64.to_radians());
        fit.model.set_value(id, 0.0);
    }
    if specs.num_scalings > 0 {
        let extent_ratio = ref_radius / source_radius.max(1e-9);
        let lo = 0.75 * extent_ratio;
        let hi = 1.25 * extent_ratio;
        if specs.num_scalings == 1 {
            fit.model.add_dim(g, ParameterId::Scale, lo, hi);
            fit.model.set_value(ParameterId::Scale, extent_ratio);
        } else {
            for &id in scalings.iter() {
                fit.model.add_dim(g, id, lo, hi);
                fit.model.set_value(id, extent_ratio);
            }
        }
    }
    for &id in shearings.iter().take(specs.num_shearings as usize) {
        fit.model.add_dim(g, id, -0.10, 0.10);
        fit.model.set_value(id, 0.0);
    }
}

fn radius_of(volume: &Volume) -> f64 {
    let (nx, ny, nz) = volume.dim;
    0.5 * ((nx * nx + ny * ny + nz * nz) as f64).sqrt()
}

/// Median of a sample vector; empty input returns the volume background (0).
fn median(samples: &mut [f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mid = samples.len() / 2;
    if samples.len() % 2 == 0 {
        (samples[mid - 1] + samples[mid]) / 2.0
    } else {
        samples[mid]
    }
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() - 1) as f64 * p).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// One-pass binary relax filter: a voxel in the foreground mask survives
/// only if at least half its 6-neighborhood also belongs to it.
fn relax_mask(mask: &[bool], dim: (usize, usize, usize)) -> Vec<bool> {
    let (nx, ny, nz) = dim;
    let idx = |x: usize, y: usize, z: usize| (z * ny + y) * nx + x;
    let mut out = mask.to_vec();
    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                if !mask[idx(x, y, z)] {
                    continue;
                }
                let mut neighbors = 0;
                let mut on = 0;
                for (dx, dy, dz) in [(-1i64, 0i64, 0i64), (1, 0, 0), (0, -1, 0), (0, 1, 0), (0, 0, -1), (0, 0, 1)] {
                    let nx2 = x as i64 + dx;
                    let ny2 = y as i64 + dy;
                    let nz2 = z as i64 + dz;
                    if nx2 < 0 || ny2 < 0 || nz2 < 0 || nx2 >= nx as i64 || ny2 >= ny as i64 || nz2 >= nz as i64 {
                        continue;
                    }
                    neighbors += 1;
                    if mask[idx(nx2 as usize, ny2 as usize, nz2 as usize)] {
                        on += 1;
                    }
                }
                out[idx(x, y, z)] = neighbors == 0 || on * 2 >= neighbors;
            }
        }
    }
    out
}

fn post_filter(template: &mut Volume) {
    let threshold = template.background.max(0.05 * template.max_value());
    let mask: Vec<bool> = template.data.iter().map(|&v| v > threshold).collect();
    let relaxed = relax_mask(&mask, template.dim);
    for (v, &keep) in template.data.iter_mut().zip(relaxed.iter()) {
        if !keep {
            *v = template.background;
        }
    }

    // Bias-field correction, one pass: normalize each voxel by the local
    // mean of a 3-voxel box, scaled back to the global mean.
    let (nx, ny, nz) = template.dim;
    let global_mean = template.data.iter().sum::<f64>() / template.data.len().max(1) as f64;
    let before = template.data.clone();
    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                let mut sum = 0.0;
                let mut n = 0usize;
                for dz in -1i64..=1 {
                    for dy in -1i64..=1 {
                        for dx in -1i64..=1 {
                            let (xx, yy, zz) = (x as i64 + dx, y as i64 + dy, z as i64 + dz);
                            if xx < 0 || yy < 0 || zz < 0 || xx >= nx as i64 || yy >= ny as i64 || zz >= nz as i64 {
                                continue;
                            }
                            sum += before[template.index(xx as usize, yy as usize, zz as usize)];
                            n += 1;
                        }
                    }
                }
                let local_mean = sum / n.max(1) as f64;
                if local_mean > 1e-9 {
                    let idx = template.index(x, y, z);
                    template.data[idx] = before[idx] * global_mean / local_mean;
                }
            }
        }
    }

    let mut sorted = template.data.clone();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let p999 = percentile(&sorted, 0.999);
    if p999 > 1e-9 {
        let scale = 100.0 / p999;
        template.data.iter_mut().for_each(|v| *v *= scale);
    }
}

/// Result of [`merge_mris`]: the final template plus, per subject, the
/// composed `CoregAbs_to_MriAbs` matrix.
pub struct MergeResult {
    pub template: Volume,
    pub coreg_abs_to_mri_abs: Vec<AffineMatrix>,
}

/// Iteratively coregisters `subjects` onto a shrinking group template.
pub fn merge_mris(
    subjects: &[Volume],
    mode: BuildMode,
    mni_reference: Option<&Volume>,
    precision: f64,
    num_iterations: usize,
    symmetric: bool,
) -> MergeResult {
    assert!(!subjects.is_empty());

    let max_dim = subjects
        .iter()
        .flat_map(|v| [v.dim.0, v.dim.1, v.dim.2])
        .max()
        .unwrap_or(1);

    let (template_dim, template_origin) = match (mode, mni_reference) {
        (BuildMode::Mni, Some(reference)) => (reference.dim, reference.origin),
        _ => self_ref_template_shape(max_dim),
    };

    let mut template = Volume::new(template_dim);
    template.origin = template_origin;

    let mut mri_rel_to_coreg_abs: Vec<AffineMatrix> = vec![AffineMatrix::identity(); subjects.len()];
    let mut mri_rel_to_coreg_abs_inv: Vec<AffineMatrix> = vec![AffineMatrix::identity(); subjects.len()];

    for li in 0..=num_iterations {
        let is_booting = li == 0;
        let is_looping = !is_booting;
        let specs = coregistration_specs(mode, is_looping);

        let reference: &Volume = if is_booting {
            match (mode, mni_reference) {
                (BuildMode::Mni, Some(r)) => r,
                _ => &subjects[0],
            }
        } else {
            &template
        };
        let ref_radius = radius_of(reference);

        for (i, subject) in subjects.iter().enumerate() {
            let mut fit = FitVolumeOnVolume::new(
                subject,
                RemapIntensityType::EqualizeHistogram,
                reference,
                RemapIntensityType::EqualizeHistogram,
                FitVolumeType::TargetBigger,
            );
            add_group_dims(&mut fit, specs, ref_radius, radius_of(subject));
            // Coarse-to-fine schedule: narrow the optimizer's cost evaluation
            // down to full resolution over a few steps instead of starting
            // there directly.
            for level in (0..=2).rev() {
                fit.set_resolution_level(level);
                GlobalOptimize::get_solution(&mut fit, GoMethod::GlobalNelderMead, precision, None);
            }

            let from_rel_to_rel = fit.to_abs_from_abs();
            let mut rel_to_coreg_abs = fit.to_rel_to_abs;
            rel_to_coreg_abs.compose(&from_rel_to_rel, MultiplySide::Right);
            mri_rel_to_coreg_abs[i] = rel_to_coreg_abs;
            mri_rel_to_coreg_abs_inv[i] = rel_to_coreg_abs.invert().unwrap_or_else(AffineMatrix::identity);
        }

        let (tnx, tny, tnz) = template.dim;
        let mut new_data = vec![0.0f64; tnx * tny * tnz];

        // `Volume::index` is x-minor ((z*ny+y)*nx+x), so a contiguous run of
        // `tnx` elements is one (y,z) pair. Chunk on that stride instead of
        // on x, each worker owning one (y,z) run indexed by `x` within it.
        new_data
            .par_chunks_mut(tnx)
            .enumerate()
            .for_each(|(yz, slice)| {
                let z = yz / tny;
                let y = yz % tny;
                for x in 0..tnx {
                    let mut samples = Vec::with_capacity(subjects.len() * 2);
                    for (subject, inv) in subjects.iter().zip(mri_rel_to_coreg_abs_inv.iter()) {
                        let p = inv.apply_point((x as f64, y as f64, z as f64));
                        samples.push(subject.sample_trilinear(p));
                        if symmetric {
                            let mirror_p = (tnx as f64 - 1.0 - p.0, p.1, p.2);
                            samples.push(subject.sample_trilinear(mirror_p));
                        }
                    }
                    slice[x] = median(&mut samples);
                }
            });
        template.data = new_data;

        if symmetric {
            for x in 0..tnx / 2 {
                for y in 0..tny {
                    for z in 0..tnz {
                        let a = template.index(x, y, z);
                        let b = template.index(tnx - 1 - x, y, z);
                        let avg = (template.data[a] + template.data[b]) / 2.0;
                        template.data[a] = avg;
                        template.data[b] = avg;
                    }
                }
            }
        }

        post_filter(&mut template);
    }

    let coreg_abs_to_mri_abs: Vec<AffineMatrix> = mri_rel_to_coreg_abs
        .iter()
        .map(|m| {
            let mut out = m.invert().unwrap_or_else(AffineMatrix::identity);
            let origin = out.get_translation();
            let mut shift = AffineMatrix::from_translation(-origin.0, -origin.1, -origin.2);
            shift.compose(&out, MultiplySide::Right);
            shift
        })
        .collect();

    MergeResult { template, coreg_abs_to_mri_abs }
}

/// Projects a shared solution-point set into each subject's space via that
/// subject's `CoregAbs_to_MriAbs` matrix.
pub fn project_solution_points(points: &PointSet, coreg_abs_to_mri_abs: &[AffineMatrix]) -> Vec<PointSet> {
    coreg_abs_to_mri_abs
        .iter()
        .map(|m| {
            PointSet::with_names(
                points.points.iter().map(|&p| m.apply_point(p)).collect(),
                points.names.clone(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_sphere(n: usize) -> Volume {
        let mut v = Volume::new((n, n, n));
        for z in 0..n {
            for y in 0..n {
                for x in 0..n {
                    let dx = x as f64 - n as f64 / 2.0;
                    let dy = y as f64 - n as f64 / 2.0;
                    let dz = z as f64 - n as f64 / 2.0;
                    let r = (dx * dx + dy * dy + dz * dz).sqrt();
                    v.set(x, y, z, if r < n as f64 / 3.0 { 100.0 } else { 0.0 });
                }
            }
        }
        v
    }

    #[test]
    fn self_ref_template_of_two_identical_volumes_matches_input() {
        let v = solid_sphere(16);
        let result = merge_mris(&[v.clone(), v.clone()], BuildMode::SelfRef, None, 1e-4, 1, false);
        assert_eq!(result.coreg_abs_to_mri_abs.len(), 2);
        assert!(result.template.data.iter().any(|&x| x > 0.0));
    }

    #[test]
    fn symmetric_template_is_left_right_mirror_exact() {
        let v = solid_sphere(12);
        let result = merge_mris(&[v.clone(), v.clone()], BuildMode::SelfRef, None, 1e-3, 0, true);
        let (nx, ny, nz) = result.template.dim;
        for x in 0..nx {
            for y in 0..ny {
                for z in 0..nz {
                    assert_eq!(
                        result.template.get(x, y, z),
                        result.template.get(nx - 1 - x, y, z)
                    );
                }
            }
        }
    }
}
