//! Thin batch driver over the geonorm library: given a handful of raw
//! subject volume dumps, runs per-subject normalization, builds a group
//! template, and writes the template plus per-subject matrices.
//!
//! Positional arguments only, no argument-parsing crate: reads bare
//! `std::env::args` and bails with a usage string on a bad count.

use std::path::PathBuf;

use anyhow::{bail, Context};
use geonorm::matrix::AffineMatrix;
use geonorm::points::PointSet;
use geonorm::template::{merge_mris, normalize_brain, project_solution_points, BuildMode};
use geonorm::volume::Volume;

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 3 {
        bail!(
            "usage: normalize <out-dir> <iterations> <symmetric:0|1> <subject.vol>..."
        );
    }

    let out_dir = PathBuf::from(&args[0]);
    let iterations: usize = args[1]
        .parse()
        .with_context(|| format!("iterations is not a number: {}", args[1]))?;
    let symmetric = args[2] != "0";
    let subject_paths = &args[3..];
    if subject_paths.is_empty() {
        bail!("at least one subject volume is required");
    }

    std::fs::create_dir_all(&out_dir)
        .with_context(|| format!("creating output directory {}", out_dir.display()))?;

    println!("Loading {} subject volume(s) ...", subject_paths.len());
    let raw_subjects: Vec<Volume> = subject_paths
        .iter()
        .map(|p| Volume::read_raw(p).with_context(|| format!("reading volume {p}")))
        .collect::<anyhow::Result<_>>()?;

    println!("Normalizing each subject (sagittal + transverse plane search) ...");
    let mut canonical_subjects = Vec::with_capacity(raw_subjects.len());
    for (i, subject) in raw_subjects.iter().enumerate() {
        let result = normalize_brain(subject, None);
        println!(
            "  subject {i}: origin shift = ({:.2}, {:.2}, {:.2})",
            result.origin.0, result.origin.1, result.origin.2
        );
        let rel_to_abs_inv = result
            .rel_to_abs
            .invert()
            .unwrap_or_else(AffineMatrix::identity);
        canonical_subjects.push(subject.resample(&rel_to_abs_inv, subject.dim));
    }

    println!("Building group template over {iterations} iteration(s) ...");
    let merge = merge_mris(
        &canonical_subjects,
        BuildMode::SelfRef,
        None,
        1e-4,
        iterations,
        symmetric,
    );

    let template_path = out_dir.join("template.vol");
    merge
        .template
        .write_raw(&template_path)
        .with_context(|| format!("writing template to {}", template_path.display()))?;
    println!("Wrote template to {}", template_path.display());

    for (i, m) in merge.coreg_abs_to_mri_abs.iter().enumerate() {
        let matrix_path = out_dir.join(format!("subject{i}.txt"));
        std::fs::write(&matrix_path, m.write_text())
            .with_context(|| format!("writing matrix to {}", matrix_path.display()))?;
    }
    println!("Wrote {} subject matrices", merge.coreg_abs_to_mri_abs.len());

    let solution_points_path = out_dir.join("solution_points.txt");
    if solution_points_path.exists() {
        let shared_points = PointSet::read_text(&solution_points_path)
            .with_context(|| format!("reading {}", solution_points_path.display()))?;
        let per_subject = project_solution_points(&shared_points, &merge.coreg_abs_to_mri_abs);
        for (i, points) in per_subject.iter().enumerate() {
            let path = out_dir.join(format!("subject{i}_solution_points.txt"));
            points
                .write_text(&path)
                .with_context(|| format!("writing {}", path.display()))?;
        }
        println!("Projected solution points into {} subject space(s)", per_subject.len());
    }

    Ok(())
}
