//! Volume data model and volume-domain cost evaluators (C3).

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use crate::matrix::{AffineMatrix, MultiplySide};
use crate::optimizer::{EasyStats, Evaluable};
use crate::param::{ParameterId, ParameterModel};
use crate::{Error, Result};

/// Cardinal axis label used in orientation triples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinal {
    R,
    L,
    A,
    P,
    S,
    I,
}

/// A dense 3D array of scalar intensities with voxel geometry.
#[derive(Debug, Clone)]
pub struct Volume {
    pub dim: (usize, usize, usize),
    pub voxel_size: (f64, f64, f64),
    pub origin: (f64, f64, f64),
    pub orientation: (Cardinal, Cardinal, Cardinal),
    pub background: f64,
    pub data: Vec<f64>,
}

impl Volume {
    pub fn new(dim: (usize, usize, usize)) -> Self {
        Self {
            dim,
            voxel_size: (1.0, 1.0, 1.0),
            origin: (dim.0 as f64 / 2.0, dim.1 as f64 / 2.0, dim.2 as f64 / 2.0),
            orientation: (Cardinal::R, Cardinal::A, Cardinal::S),
            background: 0.0,
            data: vec![0.0; dim.0 * dim.1 * dim.2],
        }
    }

    #[inline]
    pub fn index(&self, x: usize, y: usize, z: usize) -> usize {
        (z * self.dim.1 + y) * self.dim.0 + x
    }

    pub fn get(&self, x: usize, y: usize, z: usize) -> f64 {
        self.data[self.index(x, y, z)]
    }

    pub fn set(&mut self, x: usize, y: usize, z: usize, v: f64) {
        let idx = self.index(x, y, z);
        self.data[idx] = v;
    }

    pub fn max_value(&self) -> f64 {
        self.data.iter().cloned().fold(f64::MIN, f64::max)
    }

    /// Trilinear sample in voxel coordinates; out-of-range returns background.
    pub fn sample_trilinear(&self, p: (f64, f64, f64)) -> f64 {
        let (x, y, z) = p;
        if x < 0.0
            || y < 0.0
            || z < 0.0
            || x >= self.dim.0 as f64 - 1.0
            || y >= self.dim.1 as f64 - 1.0
            || z >= self.dim.2 as f64 - 1.0
        {
            return self.background;
        }
        let (x0, y0, z0) = (x.floor() as usize, y.floor() as usize, z.floor() as usize);
        let (fx, fy, fz) = (x - x0 as f64, y - y0 as f64, z - z0 as f64);

        let mut acc = 0.0;
        for (dx, dy, dz) in [
            (0, 0, 0),
            (1, 0, 0),
            (0, 1, 0),
            (1, 1, 0),
            (0, 0, 1),
            (1, 0, 1),
            (0, 1, 1),
            (1, 1, 1),
        ] {
            let wx = if dx == 1 { fx } else { 1.0 - fx };
            let wy = if dy == 1 { fy } else { 1.0 - fy };
            let wz = if dz == 1 { fz } else { 1.0 - fz };
            acc += wx * wy * wz * self.get(x0 + dx, y0 + dy, z0 + dz);
        }
        acc
    }

    pub fn sample_nearest(&self, p: (f64, f64, f64)) -> f64 {
        let (x, y, z) = (p.0.round(), p.1.round(), p.2.round());
        if x < 0.0 || y < 0.0 || z < 0.0 {
            return self.background;
        }
        let (x, y, z) = (x as usize, y as usize, z as usize);
        if x >= self.dim.0 || y >= self.dim.1 || z >= self.dim.2 {
            return self.background;
        }
        self.get(x, y, z)
    }

    /// Resamples `self` into a volume of `out_dim`, where
    /// `target_to_source` maps each output voxel coordinate into `self`'s
    /// voxel space. Trilinear sampling throughout.
    pub fn resample(&self, target_to_source: &AffineMatrix, out_dim: (usize, usize, usize)) -> Volume {
        let mut out = Volume::new(out_dim);
        out.voxel_size = self.voxel_size;
        out.background = self.background;
        out.orientation = self.orientation;
        for z in 0..out_dim.2 {
            for y in 0..out_dim.1 {
                for x in 0..out_dim.0 {
                    let p = target_to_source.apply_point((x as f64, y as f64, z as f64));
                    out.set(x, y, z, self.sample_trilinear(p));
                }
            }
        }
        out
    }

    /// Hand-rolled raw dump: 3 x u32 dims, 3 x f64 voxel size, 3 x f64
    /// origin, 1 x f64 background, then `dim.0*dim.1*dim.2` x f64 data,
    /// all little-endian. Not one of the four lead-field wire formats;
    /// this is the crate's own minimal volume persistence, matching the
    /// flat-buffer-plus-metadata shape of the data model (no NIfTI parser).
    pub fn write_raw(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut f = File::create(path)?;
        for d in [self.dim.0, self.dim.1, self.dim.2] {
            f.write_all(&(d as u32).to_le_bytes())?;
        }
        for v in [self.voxel_size.0, self.voxel_size.1, self.voxel_size.2] {
            f.write_all(&v.to_le_bytes())?;
        }
        for v in [self.origin.0, self.origin.1, self.origin.2] {
            f.write_all(&v.to_le_bytes())?;
        }
        f.write_all(&self.background.to_le_bytes())?;
        for &v in &self.data {
            f.write_all(&v.to_le_bytes())?;
        }
        Ok(())
    }

    pub fn read_raw(path: impl AsRef<Path>) -> Result<Volume> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path)?;
        if metadata.len() == 0 {
            return Err(Error::CorruptFormat(format!("empty volume file: {}", path.display())));
        }
        let mut f = File::open(path)?;
        let mut read_u32 = || -> Result<u32> {
            let mut buf = [0u8; 4];
            f.read_exact(&mut buf)?;
            Ok(u32::from_le_bytes(buf))
        };
        let nx = read_u32()? as usize;
        let ny = read_u32()? as usize;
        let nz = read_u32()? as usize;
        if nx == 0 || ny == 0 || nz == 0 {
            return Err(Error::CorruptFormat("zero-sized volume dimension".into()));
        }

        let mut read_f64 = || -> Result<f64> {
            let mut buf = [0u8; 8];
            f.read_exact(&mut buf)?;
            Ok(f64::from_le_bytes(buf))
        };
        let voxel_size = (read_f64()?, read_f64()?, read_f64()?);
        let origin = (read_f64()?, read_f64()?, read_f64()?);
        let background = read_f64()?;

        let n = nx * ny * nz;
        let mut data = Vec::with_capacity(n);
        for _ in 0..n {
            data.push(read_f64()?);
        }

        Ok(Volume {
            dim: (nx, ny, nz),
            voxel_size,
            origin,
            orientation: (Cardinal::R, Cardinal::A, Cardinal::S),
            background,
            data,
        })
    }
}

/// Which transverse/sagittal/guillotine cost function to evaluate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeCostKind {
    TransversePlaneLongest,
    TransversePlaneBiggestBox,
    TransversePlaneBiggestSurface,
    TransversePlaneMniT1,
    TransversePlaneMniT2,
    TransversePlaneGuillotine,
    SagittalPlaneSymmetric,
    SagittalPlaneSymmetricT1,
    SagittalPlaneSymmetricT1Gad,
}

pub fn is_transverse_plane(k: VolumeCostKind) -> bool {
    matches!(
        k,
        VolumeCostKind::TransversePlaneLongest
            | VolumeCostKind::TransversePlaneBiggestBox
            | VolumeCostKind::TransversePlaneBiggestSurface
            | VolumeCostKind::TransversePlaneMniT1
            | VolumeCostKind::TransversePlaneMniT2
    )
}

pub fn is_sagittal_plane(k: VolumeCostKind) -> bool {
    matches!(
        k,
        VolumeCostKind::SagittalPlaneSymmetric
            | VolumeCostKind::SagittalPlaneSymmetricT1
            | VolumeCostKind::SagittalPlaneSymmetricT1Gad
    )
}

/// Evaluates plane-related cost functions against one source volume.
pub struct VolumeProperties<'a> {
    pub model: ParameterModel,
    pub volume: &'a Volume,
    pub threshold: f64,
    pub kind: VolumeCostKind,
    pub mni_slice: Option<&'a Volume>,
}

impl<'a> VolumeProperties<'a> {
    pub fn new(volume: &'a Volume, kind: VolumeCostKind) -> Self {
        let threshold = volume.background.max(0.05 * volume.max_value());
        Self {
            model: ParameterModel::new(),
            volume,
            threshold,
            kind,
            mni_slice: None,
        }
    }

    fn current_matrix(&self) -> AffineMatrix {
        self.model.affine_matrix(true)
    }

    /// Volume-space coordinates of the model's reference center, about
    /// which the decoded matrix's rotation/scale/shear act.
    fn center(&self) -> (f64, f64, f64) {
        (
            self.volume.dim.0 as f64 / 2.0,
            self.volume.dim.1 as f64 / 2.0,
            self.volume.dim.2 as f64 / 2.0,
        )
    }

    fn transverse_z(&self) -> f64 {
        self.model.get_value(ParameterId::TranslationZ)
            + self.volume.dim.2 as f64 / 2.0
    }

    fn slice_mask(&self, z: usize) -> Vec<bool> {
        let (nx, ny, _) = self.volume.dim;
        let mut mask = vec![false; nx * ny];
        for y in 0..ny {
            for x in 0..nx {
                mask[y * nx + x] = self.volume.get(x, y, z) > self.threshold;
            }
        }
        mask
    }

    fn evaluate_transverse_longest(&self) -> f64 {
        let z = self.transverse_z().round().clamp(0.0, self.volume.dim.2 as f64 - 1.0) as usize;
        let (nx, ny, _) = self.volume.dim;
        let mask = self.slice_mask(z);
        let mut longest = 0usize;
        for y in 0..ny {
            let mut run = 0usize;
            for x in 0..nx {
                if mask[y * nx + x] {
                    run += 1;
                    longest = longest.max(run);
                } else {
                    run = 0;
                }
            }
        }
        // maximize -> minimize the negative
        -(longest as f64)
    }

    fn evaluate_transverse_biggest_box(&self) -> f64 {
        let z = self.transverse_z().round().clamp(0.0, self.volume.dim.2 as f64 - 1.0) as usize;
        let (nx, ny, _) = self.volume.dim;
        let mask = self.slice_mask(z);
        // heights histogram method for largest rectangle in a binary matrix.
        let mut heights = vec![0i32; nx];
        let mut best_area = 0i64;
        for y in 0..ny {
            for x in 0..nx {
                heights[x] = if mask[y * nx + x] { heights[x] + 1 } else { 0 };
            }
            let mut stack: Vec<usize> = Vec::new();
            for x in 0..=nx {
                let h = if x == nx { 0 } else { heights[x] };
                while let Some(&top) = stack.last() {
                    if heights[top] as i32 > h {
                        stack.pop();
                        let height = heights[top] as i64;
                        let width = if stack.is_empty() {
                            x as i64
                        } else {
                            (x - stack.last().unwrap() - 1) as i64
                        };
                        best_area = best_area.max(height * width);
                    } else {
                        break;
                    }
                }
                stack.push(x);
            }
        }
        -(best_area as f64)
    }

    fn evaluate_transverse_biggest_surface(&self) -> f64 {
        let z = self.transverse_z().round().clamp(0.0, self.volume.dim.2 as f64 - 1.0) as usize;
        let mask = self.slice_mask(z);
        -(mask.iter().filter(|&&m| m).count() as f64)
    }

    /// `rel` is a point relative to the model's center; maps it through the
    /// decoded matrix (shear/scale/rotation/translation) and back into
    /// volume-space absolute coordinates.
    fn to_volume_space(&self, m: &AffineMatrix, rel: (f64, f64, f64)) -> (f64, f64, f64) {
        let c = self.center();
        let t = m.apply_point(rel);
        (c.0 + t.0, c.1 + t.1, c.2 + t.2)
    }

    fn evaluate_transverse_mni(&self) -> f64 {
        let reference = match self.mni_slice {
            Some(r) => r,
            None => return 0.0,
        };
        let (nx, ny, _) = self.volume.dim;
        let (rnx, rny, _) = reference.dim;
        if nx == 0 || ny == 0 || rnx == 0 || rny == 0 {
            return 0.0;
        }
        let m = self.current_matrix();
        let c = self.center();
        let mut sum_sq = 0.0;
        let mut n = 0usize;
        for y in 0..ny {
            for x in 0..nx {
                let rel = (x as f64 - c.0, y as f64 - c.1, 0.0);
                let abs = self.to_volume_space(&m, rel);
                let v = self.volume.sample_trilinear(abs);
                let rx = (x as f64 / nx as f64 * rnx as f64).min(rnx as f64 - 1.0);
                let ry = (y as f64 / ny as f64 * rny as f64).min(rny as f64 - 1.0);
                let r = reference.sample_trilinear((rx, ry, 0.0));
                sum_sq += (v - r).powi(2);
                n += 1;
            }
        }
        sum_sq / n.max(1) as f64
    }

    fn evaluate_transverse_guillotine(&self) -> f64 {
        let (nx, ny, nz) = self.volume.dim;
        let m = self.current_matrix();
        let inv = m.invert().unwrap_or_else(AffineMatrix::identity);
        let c = self.center();
        let mut below_fg = 0usize;
        let mut below_n = 0usize;
        for z in 0..nz {
            for y in 0..ny {
                for x in 0..nx {
                    let rel = (x as f64 - c.0, y as f64 - c.1, z as f64 - c.2);
                    let canon = inv.apply_point(rel);
                    if canon.2 < 0.0 {
                        below_n += 1;
                        if self.volume.get(x, y, z) > self.threshold {
                            below_fg += 1;
                        }
                    }
                }
            }
        }
        let density = below_fg as f64 / below_n.max(1) as f64;
        // cut near inferior boundary: penalize distance of the plane's
        // origin (under rotation/translation) from z=0.
        let plane_origin = self.to_volume_space(&m, (0.0, 0.0, 0.0));
        let boundary_penalty = plane_origin.2 / nz.max(1) as f64;
        density + 0.1 * boundary_penalty
    }

    fn evaluate_sagittal_symmetric(&self, modality_weight: f64) -> f64 {
        let (nx, ny, nz) = self.volume.dim;
        let m = self.current_matrix();
        let inv = m.invert().unwrap_or_else(AffineMatrix::identity);
        let c = self.center();
        let mut sum_sq = 0.0;
        let mut n = 0usize;
        for z in 0..nz {
            for y in 0..ny {
                for x in 0..nx {
                    let rel = (x as f64 - c.0, y as f64 - c.1, z as f64 - c.2);
                    let canon = inv.apply_point(rel);
                    let mirror_canon = (-canon.0, canon.1, canon.2);
                    let mirror_abs = self.to_volume_space(&m, mirror_canon);
                    if mirror_abs.0 < 0.0 || mirror_abs.0 >= nx as f64 {
                        continue;
                    }
                    let v = self.volume.get(x, y, z);
                    let mv = self.volume.sample_trilinear(mirror_abs);
                    sum_sq += modality_weight * (v - mv).powi(2);
                    n += 1;
                }
            }
        }
        sum_sq / n.max(1) as f64
    }
}

impl<'a> Evaluable for VolumeProperties<'a> {
    fn model(&self) -> &ParameterModel {
        &self.model
    }
    fn model_mut(&mut self) -> &mut ParameterModel {
        &mut self.model
    }
    fn evaluate(&mut self, stats: Option<&mut EasyStats>) -> f64 {
        let cost = match self.kind {
            VolumeCostKind::TransversePlaneLongest => self.evaluate_transverse_longest(),
            VolumeCostKind::TransversePlaneBiggestBox => self.evaluate_transverse_biggest_box(),
            VolumeCostKind::TransversePlaneBiggestSurface => {
                self.evaluate_transverse_biggest_surface()
            }
            VolumeCostKind::TransversePlaneMniT1 | VolumeCostKind::TransversePlaneMniT2 => {
                self.evaluate_transverse_mni()
            }
            VolumeCostKind::TransversePlaneGuillotine => self.evaluate_transverse_guillotine(),
            VolumeCostKind::SagittalPlaneSymmetric => self.evaluate_sagittal_symmetric(1.0),
            VolumeCostKind::SagittalPlaneSymmetricT1 => self.evaluate_sagittal_symmetric(1.0),
            VolumeCostKind::SagittalPlaneSymmetricT1Gad => self.evaluate_sagittal_symmetric(0.5),
        };
        if let Some(s) = stats {
            s.push(cost);
        }
        cost
    }
}

/// Intensity remapping applied before `FitVolumeOnVolume` compares two volumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemapIntensityType {
    None,
    EqualizeHistogram,
    EqualizeHistogramBrain,
    Rank,
    RankRamp,
    Binarize,
    Mask,
    Invert,
}

pub fn remap_intensity(volume: &Volume, kind: RemapIntensityType) -> Volume {
    let mut out = volume.clone();
    match kind {
        RemapIntensityType::None => {}
        RemapIntensityType::Invert => {
            let max = volume.max_value();
            out.data.iter_mut().for_each(|v| *v = max - *v);
        }
        RemapIntensityType::Binarize => {
            let t = volume.background.max(0.05 * volume.max_value());
            out.data.iter_mut().for_each(|v| *v = if *v > t { 1.0 } else { 0.0 });
        }
        RemapIntensityType::Mask => {
            let t = volume.background;
            out.data.iter_mut().for_each(|v| *v = if *v > t { 1.0 } else { 0.0 });
        }
        RemapIntensityType::Rank | RemapIntensityType::RankRamp => {
            let mut idx: Vec<usize> = (0..volume.data.len()).collect();
            idx.sort_by(|&a, &b| volume.data[a].partial_cmp(&volume.data[b]).unwrap());
            let n = idx.len().max(1) as f64;
            for (rank, &i) in idx.iter().enumerate() {
                let frac = rank as f64 / n;
                out.data[i] = if kind == RemapIntensityType::RankRamp {
                    frac.powf(0.5)
                } else {
                    frac
                };
            }
        }
        RemapIntensityType::EqualizeHistogram | RemapIntensityType::EqualizeHistogramBrain => {
            let mut idx: Vec<usize> = (0..volume.data.len()).collect();
            idx.sort_by(|&a, &b| volume.data[a].partial_cmp(&volume.data[b]).unwrap());
            let n = idx.len().max(1) as f64;
            for (rank, &i) in idx.iter().enumerate() {
                out.data[i] = rank as f64 / n * 255.0;
            }
        }
    }
    out
}

/// Inclusion mode relating source to target volume sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitVolumeType {
    EqualSizes,
    TargetBigger,
    SourceBigger,
}

/// Separable box blur with the given radius (0 = no blur, identity copy).
fn smooth_volume(volume: &Volume, radius: usize) -> Volume {
    if radius == 0 {
        return volume.clone();
    }
    let (nx, ny, nz) = volume.dim;
    let r = radius as isize;
    let mut out = volume.clone();
    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                let mut sum = 0.0;
                let mut count = 0.0;
                for dz in -r..=r {
                    let zz = z as isize + dz;
                    if zz < 0 || zz >= nz as isize {
                        continue;
                    }
                    for dy in -r..=r {
                        let yy = y as isize + dy;
                        if yy < 0 || yy >= ny as isize {
                            continue;
                        }
                        for dx in -r..=r {
                            let xx = x as isize + dx;
                            if xx < 0 || xx >= nx as isize {
                                continue;
                            }
                            sum += volume.get(xx as usize, yy as usize, zz as usize);
                            count += 1.0;
                        }
                    }
                }
                out.set(x, y, z, sum / count);
            }
        }
    }
    out
}

/// Largest subsampling level a multi-resolution search is allowed to request.
const MAX_RESOLUTION_LEVEL: usize = 4;

/// Aligns a source volume onto a target volume by a Pearson-like
/// discrepancy on remapped intensities. Caches a smoothed copy of the
/// source per resolution level so a coarse-to-fine search schedule
/// doesn't re-smooth on every narrowing step; the target side keeps a
/// single smoothed copy that only ever sharpens, never re-widens.
pub struct FitVolumeOnVolume<'a> {
    pub model: ParameterModel,
    pub from_volume: &'a Volume,
    pub to_volume: &'a Volume,
    pub from_remapped: Volume,
    pub to_remapped: Volume,
    pub flags: FitVolumeType,
    pub from_rel_from_abs: AffineMatrix,
    pub to_rel_to_abs: AffineMatrix,
    source_cache: Vec<Option<Volume>>,
    target_smoothed: Volume,
    target_radius: Option<usize>,
    current_level: usize,
}

impl<'a> FitVolumeOnVolume<'a> {
    pub fn new(
        from_volume: &'a Volume,
        from_remap: RemapIntensityType,
        to_volume: &'a Volume,
        to_remap: RemapIntensityType,
        flags: FitVolumeType,
    ) -> Self {
        let from_remapped = remap_intensity(from_volume, from_remap);
        let to_remapped = remap_intensity(to_volume, to_remap);
        let target_smoothed = to_remapped.clone();
        Self {
            model: ParameterModel::new(),
            from_volume,
            to_volume,
            from_remapped,
            to_remapped,
            flags,
            from_rel_from_abs: AffineMatrix::identity(),
            to_rel_to_abs: AffineMatrix::identity(),
            source_cache: vec![None; MAX_RESOLUTION_LEVEL + 1],
            target_smoothed,
            target_radius: None,
            current_level: 0,
        }
    }

    /// Requests that subsequent `evaluate` calls sample at `level`
    /// (0 = full resolution, up to `MAX_RESOLUTION_LEVEL` = coarsest).
    /// The source's smoothed copy for a level is cached after its first
    /// request; the target's smoothed copy only ever narrows toward a
    /// finer level, never re-widens back to one already passed.
    pub fn set_resolution_level(&mut self, level: usize) {
        let level = level.min(MAX_RESOLUTION_LEVEL);
        self.current_level = level;
        let needs_refine = match self.target_radius {
            None => true,
            Some(r) => level < r,
        };
        if needs_refine {
            self.target_radius = Some(level);
            self.target_smoothed = smooth_volume(&self.to_remapped, level);
        }
        if self.source_cache[level].is_none() {
            self.source_cache[level] = Some(smooth_volume(&self.from_remapped, level));
        }
    }

    fn source_view(&self) -> &Volume {
        self.source_cache[self.current_level]
            .as_ref()
            .unwrap_or(&self.from_remapped)
    }

    /// The current absolute source-to-target transform, composed in
    /// pipeline order: shear, scale, rotation, translation.
    pub fn to_abs_from_abs(&self) -> AffineMatrix {
        self.model.affine_matrix(true)
    }

    fn in_bounds(&self, p: (f64, f64, f64)) -> bool {
        let (nx, ny, nz) = self.to_volume.dim;
        p.0 >= 0.0
            && p.1 >= 0.0
            && p.2 >= 0.0
            && p.0 < nx as f64
            && p.1 < ny as f64
            && p.2 < nz as f64
    }

    pub fn final_quality(stat: &EasyStats) -> f64 {
        (stat.cov() * 100.0).round() / 100.0 * 1.0
    }

    pub fn quality_opinion(quality: f64) -> &'static str {
        if quality >= 120.0 {
            "Fantastic"
        } else if quality >= 100.0 {
            "Excellent"
        } else if quality >= 90.0 {
            "Very good"
        } else if quality >= 80.0 {
            "Good"
        } else {
            "Dubious"
        }
    }
}

impl<'a> Evaluable for FitVolumeOnVolume<'a> {
    fn model(&self) -> &ParameterModel {
        &self.model
    }
    fn model_mut(&mut self) -> &mut ParameterModel {
        &mut self.model
    }
    fn evaluate(&mut self, stats: Option<&mut EasyStats>) -> f64 {
        if self.source_cache[self.current_level].is_none() {
            self.set_resolution_level(self.current_level);
        }
        let to_abs_from_abs = self.to_abs_from_abs();
        let (fnx, fny, fnz) = self.from_volume.dim;
        let source = self.source_view();

        let mut xs = Vec::new();
        let mut ys = Vec::new();
        for z in 0..fnz {
            for y in 0..fny {
                for x in 0..fnx {
                    let source_v = source.get(x, y, z);
                    if source_v <= self.from_volume.background {
                        continue;
                    }
                    let target_p = to_abs_from_abs.apply_point((x as f64, y as f64, z as f64));
                    if matches!(self.flags, FitVolumeType::EqualSizes | FitVolumeType::TargetBigger)
                        && !self.in_bounds(target_p)
                    {
                        continue;
                    }
                    let target_v = self.target_smoothed.sample_trilinear(target_p);
                    xs.push(source_v);
                    ys.push(target_v);
                }
            }
        }

        if xs.len() < 2 {
            if let Some(s) = stats {
                s.push(1.0);
            }
            return 1.0;
        }

        let n = xs.len() as f64;
        let mx = xs.iter().sum::<f64>() / n;
        let my = ys.iter().sum::<f64>() / n;
        let mut cov = 0.0;
        let mut vx = 0.0;
        let mut vy = 0.0;
        for i in 0..xs.len() {
            let dx = xs[i] - mx;
            let dy = ys[i] - my;
            cov += dx * dy;
            vx += dx * dx;
            vy += dy * dy;
        }
        let denom = (vx * vy).sqrt();
        let pearson = if denom > 0.0 { cov / denom } else { 0.0 };
        let cost = 1.0 - pearson;

        if let Some(s) = stats {
            for i in 0..xs.len() {
                s.push((xs[i] - ys[i]).abs());
            }
        }
        cost
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::{GlobalOptimize, GoMethod};

    fn symmetric_phantom(n: usize) -> Volume {
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
    fn raw_round_trip_is_exact() {
        let v = symmetric_phantom(6);
        let dir = std::env::temp_dir().join(format!("geonorm_vol_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("phantom.vol");

        v.write_raw(&path).unwrap();
        let back = Volume::read_raw(&path).unwrap();
        assert_eq!(back.dim, v.dim);
        assert_eq!(back.voxel_size, v.voxel_size);
        assert_eq!(back.origin, v.origin);
        assert_eq!(back.data, v.data);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn resample_with_identity_matches_source() {
        let v = symmetric_phantom(8);
        let identity = AffineMatrix::identity();
        let out = v.resample(&identity, v.dim);
        for (a, b) in v.data.iter().zip(out.data.iter()) {
            assert_eq!(a, b);
        }
    }

    #[test]
    fn sagittal_cost_is_zero_for_already_symmetric_volume() {
        let v = symmetric_phantom(32);
        let mut props = VolumeProperties::new(&v, VolumeCostKind::SagittalPlaneSymmetric);
        let g = props.model.add_group();
        props.model.add_dim(g, ParameterId::TranslationX, -5.0, 5.0);
        props.model.set_value(ParameterId::TranslationX, 0.0);
        let cost = props.evaluate(None);
        assert!(cost < 1e-6);
    }

    #[test]
    fn fit_volume_identity_has_near_perfect_correlation() {
        let v = symmetric_phantom(16);
        let mut fit = FitVolumeOnVolume::new(
            &v,
            RemapIntensityType::None,
            &v,
            RemapIntensityType::None,
            FitVolumeType::EqualSizes,
        );
        let g = fit.model.add_group();
        fit.model.add_dim(g, ParameterId::TranslationX, -2.0, 2.0);
        fit.model.set_value(ParameterId::TranslationX, 0.0);
        let cost = GlobalOptimize::get_solution(&mut fit, GoMethod::GlobalNelderMead, 1e-6, None);
        assert!(cost < 0.05);
    }

    #[test]
    fn resolution_cache_reuses_smoothed_source_and_only_narrows_target() {
        let v = symmetric_phantom(16);
        let mut fit = FitVolumeOnVolume::new(
            &v,
            RemapIntensityType::None,
            &v,
            RemapIntensityType::None,
            FitVolumeType::EqualSizes,
        );
        fit.set_resolution_level(3);
        assert!(fit.source_cache[3].is_some());
        assert_eq!(fit.target_radius, Some(3));

        fit.set_resolution_level(1);
        assert!(fit.source_cache[1].is_some());
        assert_eq!(fit.target_radius, Some(1));

        // Requesting a coarser level again must not re-widen the target.
        fit.set_resolution_level(3);
        assert_eq!(fit.target_radius, Some(1));
        assert!(fit.source_cache[3].is_some());

        let cost = fit.evaluate(None);
        assert!(cost.is_finite());
    }
}
