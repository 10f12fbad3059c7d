//! Principal-component background modeling.
//!
//! Dithered observations leave a subset of cubes without the star at a given
//! detector position. Those background-only frames span a low-rank basis of
//! the background variation; each science frame is then fitted as a linear
//! combination of the basis images, with the region around the star excluded
//! from the fit, and the reconstructed model is subtracted.

use nalgebra::{DMatrix, DVector};
use ndarray::{Array2, Array3, Axis};
use tracing::{debug, info};

use super::{cube_offsets, mean_frame};
use crate::error::{PipelineError, Result};
use crate::store::{attr, read_cube, AttributeValue, FrameStore, StreamWriter};

/// Periodic source/background partition of an exposure sequence.
///
/// With `dither_positions` positions on the detector, `cubes_per_position`
/// consecutive cubes per position and the first source cube at index
/// `first_source_cube`, cube `i` carries the star iff
/// `(i - first_source_cube) mod (cubes_per_position * dither_positions)`
/// is below `cubes_per_position`.
///
/// Source cubes get the mean of the nearest background cubes subtracted
/// (next-only for the first cube, previous-only for the last); background
/// cubes get their own mean subtracted. The parallactic-angle and
/// frame-count attributes are split into the two output streams.
#[derive(Debug, Clone)]
pub struct PcaPreparation {
    pub dither_positions: usize,
    pub cubes_per_position: usize,
    pub first_source_cube: usize,
    pub image_in_tag: String,
    pub source_out_tag: String,
    pub background_out_tag: String,
}

impl PcaPreparation {
    pub fn run<S: FrameStore + ?Sized>(&self, store: &mut S) -> Result<()> {
        if self.dither_positions == 0 || self.cubes_per_position == 0 {
            return Err(PipelineError::configuration(
                "dither_positions and cubes_per_position must be at least one",
            ));
        }
        for name in [attr::PARANG, attr::NFRAMES] {
            if !store.has_attribute(&self.image_in_tag, name) {
                return Err(PipelineError::validation(format!(
                    "tag '{}' has no '{name}' attribute; parallactic angles and \
                     frame counts are required before PCA background subtraction",
                    self.image_in_tag
                )));
            }
        }

        let parang = store.get_attribute(&self.image_in_tag, attr::PARANG)?;
        let parang = parang.as_float_seq(attr::PARANG)?.to_vec();
        let nframes = store.get_attribute(&self.image_in_tag, attr::NFRAMES)?;
        let nframes = nframes.as_int_seq(attr::NFRAMES)?.to_vec();

        let offsets = cube_offsets(&nframes);
        let total = *offsets.last().expect("offsets are never empty");
        if parang.len() != total {
            return Err(PipelineError::validation(format!(
                "tag '{}' has {} parallactic angles for {total} frames",
                self.image_in_tag,
                parang.len()
            )));
        }

        let n_cubes = nframes.len();
        let period = self.cubes_per_position * self.dither_positions;
        let is_source: Vec<bool> = (0..n_cubes)
            .map(|i| {
                (i as i64 - self.first_source_cube as i64).rem_euclid(period as i64)
                    < self.cubes_per_position as i64
            })
            .collect();

        let background_indices: Vec<usize> =
            (0..n_cubes).filter(|&i| !is_source[i]).collect();
        if background_indices.is_empty() {
            return Err(PipelineError::validation(
                "dither pattern flags every cube as source; no background cubes available",
            ));
        }

        let mut cube_means = Vec::with_capacity(n_cubes);
        for window in offsets.windows(2) {
            let cube = read_cube(store, &self.image_in_tag, window[0], window[1])?;
            cube_means.push(mean_frame(cube.view()));
        }

        info!(
            input = %self.image_in_tag,
            cubes = n_cubes,
            background = background_indices.len(),
            "separating source and background cubes"
        );

        let mut source_writer = StreamWriter::new(&self.source_out_tag);
        let mut background_writer = StreamWriter::new(&self.background_out_tag);
        let mut source_parang = Vec::new();
        let mut source_nframes = Vec::new();
        let mut background_parang = Vec::new();
        let mut background_nframes = Vec::new();

        for i in 0..n_cubes {
            let (start, end) = (offsets[i], offsets[i + 1]);
            let mut cube = read_cube(store, &self.image_in_tag, start, end)?;

            if is_source[i] {
                let background = self.background_estimate(i, n_cubes, &background_indices, &cube_means);
                for mut frame in cube.outer_iter_mut() {
                    frame -= &background;
                }
                source_writer.push(store, cube)?;
                source_parang.extend_from_slice(&parang[start..end]);
                source_nframes.push(nframes[i]);
            } else {
                let own_mean = &cube_means[i];
                for mut frame in cube.outer_iter_mut() {
                    frame -= own_mean;
                }
                background_writer.push(store, cube)?;
                background_parang.extend_from_slice(&parang[start..end]);
                background_nframes.push(nframes[i]);
            }
        }

        let n_source = source_nframes.len();
        let n_background = background_nframes.len();

        store.copy_attributes(&self.image_in_tag, &self.source_out_tag)?;
        store.set_attribute(
            &self.source_out_tag,
            attr::PARANG,
            AttributeValue::FloatSeq(source_parang),
            false,
        );
        store.set_attribute(
            &self.source_out_tag,
            attr::NFRAMES,
            AttributeValue::IntSeq(source_nframes),
            false,
        );
        store.append_provenance(
            &self.source_out_tag,
            "background",
            &format!("source cubes separated: {n_source}/{n_cubes}"),
        );

        store.copy_attributes(&self.image_in_tag, &self.background_out_tag)?;
        store.set_attribute(
            &self.background_out_tag,
            attr::PARANG,
            AttributeValue::FloatSeq(background_parang),
            false,
        );
        store.set_attribute(
            &self.background_out_tag,
            attr::NFRAMES,
            AttributeValue::IntSeq(background_nframes),
            false,
        );
        store.append_provenance(
            &self.background_out_tag,
            "background",
            &format!("background cubes separated: {n_background}/{n_cubes}"),
        );

        Ok(())
    }

    /// Background mean for source cube `i`: next-only at the start of the
    /// sequence, previous-only at the end, the average of both in between.
    /// A middle cube missing one side uses the side that exists.
    fn background_estimate(
        &self,
        i: usize,
        n_cubes: usize,
        background_indices: &[usize],
        cube_means: &[Array2<f64>],
    ) -> Array2<f64> {
        let previous = background_indices
            .iter()
            .copied()
            .filter(|&b| b < i)
            .max()
            .map(|b| &cube_means[b]);
        let next = background_indices
            .iter()
            .copied()
            .find(|&b| b > i)
            .map(|b| &cube_means[b]);

        match (previous, next) {
            (_, Some(n)) if i == 0 => n.clone(),
            (Some(p), _) if i == n_cubes - 1 => p.clone(),
            (Some(p), Some(n)) => (p + n) / 2.0,
            (Some(only), None) | (None, Some(only)) => only.clone(),
            (None, None) => unreachable!("at least one background cube is validated"),
        }
    }
}

/// Placement of the star exclusion mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskPolicy {
    /// One mask for all frames, centered at the mean star position.
    Mean,
    /// One mask per frame, centered at that frame's own star position.
    Exact,
}

/// Rank-k background model fitted per science frame.
#[derive(Debug, Clone)]
pub struct PcaBackground {
    /// Number of principal components.
    pub pca_count: usize,
    /// Exclusion radius around the star, in arcsec.
    pub mask_radius_arcsec: f64,
    pub mask_policy: MaskPolicy,
    pub source_in_tag: String,
    pub background_in_tag: String,
    pub subtracted_out_tag: String,
    /// Optional second stream with the raw per-frame background model.
    pub model_out_tag: Option<String>,
    /// Frames held in memory at once.
    pub frames_per_chunk: usize,
}

impl PcaBackground {
    pub fn run<S: FrameStore + ?Sized>(&self, store: &mut S) -> Result<()> {
        if self.frames_per_chunk == 0 {
            return Err(PipelineError::configuration(
                "frames_per_chunk must be at least one",
            ));
        }
        for name in [attr::PIXSCALE, attr::STAR_POSITION] {
            if !store.has_attribute(&self.source_in_tag, name) {
                return Err(PipelineError::validation(format!(
                    "tag '{}' has no '{name}' attribute; pixel scale and star \
                     positions are required for the mask",
                    self.source_in_tag
                )));
            }
        }
        let pixscale = store
            .get_attribute(&self.source_in_tag, attr::PIXSCALE)?
            .as_float(attr::PIXSCALE)?;
        let positions = store.get_attribute(&self.source_in_tag, attr::STAR_POSITION)?;
        let positions = positions.as_positions(attr::STAR_POSITION)?.to_vec();

        let total = store.num_frames(&self.source_in_tag)?;
        if positions.len() != total {
            return Err(PipelineError::validation(format!(
                "tag '{}' has {} star positions for {total} frames",
                self.source_in_tag,
                positions.len()
            )));
        }

        let radius_px = self.mask_radius_arcsec / pixscale;

        let n_background = store.num_frames(&self.background_in_tag)?;
        let background = read_cube(store, &self.background_in_tag, 0, n_background)?;
        let (_, height, width) = background.dim();

        let basis = make_basis(&background, self.pca_count)?;
        info!(
            components = self.pca_count,
            background_frames = n_background,
            "created PCA basis set"
        );

        let mean_mask = match self.mask_policy {
            MaskPolicy::Mean => {
                let n = positions.len() as f64;
                let cx = positions.iter().map(|p| p.0).sum::<f64>() / n;
                let cy = positions.iter().map(|p| p.1).sum::<f64>() / n;
                Some(circular_mask(height, width, (cx, cy), radius_px))
            }
            MaskPolicy::Exact => None,
        };
        let mean_design = mean_mask
            .as_ref()
            .map(|mask| masked_design(&basis, mask));

        let mut subtracted_writer = StreamWriter::new(&self.subtracted_out_tag);
        let mut model_writer = self.model_out_tag.as_ref().map(StreamWriter::new);

        let mut start = 0usize;
        while start < total {
            let end = (start + self.frames_per_chunk).min(total);
            let chunk = read_cube(store, &self.source_in_tag, start, end)?;
            debug!(start, end, "fitting background model chunk");

            let mut subtracted = Array3::zeros(chunk.raw_dim());
            let mut model = Array3::zeros(chunk.raw_dim());

            for (offset, frame) in chunk.outer_iter().enumerate() {
                let (mask, design) = match (&mean_mask, &mean_design) {
                    (Some(mask), Some(design)) => (mask.clone(), design.clone()),
                    _ => {
                        let mask =
                            circular_mask(height, width, positions[start + offset], radius_px);
                        let design = masked_design(&basis, &mask);
                        (mask, design)
                    }
                };

                let masked: Vec<f64> = frame
                    .iter()
                    .zip(mask.iter())
                    .map(|(&v, &m)| v * m)
                    .collect();
                let rhs = DVector::from_vec(masked);

                let coefficients = design
                    .clone()
                    .svd(true, true)
                    .solve(&rhs, 1.0e-12)
                    .map_err(|e| {
                        PipelineError::configuration(format!(
                            "least-squares fit of basis coefficients failed: {e}"
                        ))
                    })?;

                let model_flat = basis.transpose() * &coefficients;
                let model_frame =
                    Array2::from_shape_vec((height, width), model_flat.iter().copied().collect())
                        .expect("model has frame shape by construction");

                let residual = &frame.to_owned() - &model_frame;
                subtracted.index_axis_mut(Axis(0), offset).assign(&residual);
                model.index_axis_mut(Axis(0), offset).assign(&model_frame);
            }

            subtracted_writer.push(store, subtracted)?;
            if let Some(writer) = model_writer.as_mut() {
                writer.push(store, model)?;
            }
            start = end;
        }

        store.copy_attributes(&self.source_in_tag, &self.subtracted_out_tag)?;
        store.append_provenance(&self.subtracted_out_tag, "background", "pca subtraction");
        if let Some(tag) = &self.model_out_tag {
            store.copy_attributes(&self.source_in_tag, tag)?;
            store.append_provenance(tag, "background", "pca residuals");
        }
        Ok(())
    }
}

/// Rank-k orthonormal basis from a background cube via truncated SVD of the
/// frames-by-pixels matrix. Rows of the returned matrix are flattened basis
/// images, ordered by decreasing singular value.
///
/// # Errors
///
/// `Configuration` if `count` exceeds the feasible rank
/// `min(n_frames, n_pixels)`.
pub fn make_basis(background: &Array3<f64>, count: usize) -> Result<DMatrix<f64>> {
    let (n_frames, height, width) = background.dim();
    let pixels = height * width;
    let feasible = n_frames.min(pixels);
    if count == 0 || count > feasible {
        return Err(PipelineError::configuration(format!(
            "cannot build {count} principal components from {n_frames} background \
             frames of {pixels} pixels (feasible rank {feasible})"
        )));
    }

    let flat: Vec<f64> = background.iter().copied().collect();
    let matrix = DMatrix::from_row_slice(n_frames, pixels, &flat);
    let svd = matrix.svd(true, true);
    let v_t = svd.v_t.ok_or_else(|| {
        PipelineError::configuration("svd of the background stack produced no right singular vectors")
    })?;

    Ok(v_t.rows(0, count).into_owned())
}

/// Binary (0/1) mask that is zero inside `radius` pixels of `center` (x, y).
pub fn circular_mask(
    height: usize,
    width: usize,
    center: (f64, f64),
    radius: f64,
) -> Array2<f64> {
    let mut mask = Array2::ones((height, width));
    for ((row, col), value) in mask.indexed_iter_mut() {
        let dx = col as f64 - center.0;
        let dy = row as f64 - center.1;
        if (dx * dx + dy * dy).sqrt() < radius {
            *value = 0.0;
        }
    }
    mask
}

/// Pixels-by-components design matrix of the masked basis.
fn masked_design(basis: &DMatrix<f64>, mask: &Array2<f64>) -> DMatrix<f64> {
    let mut design = basis.transpose();
    for (j, &m) in mask.iter().enumerate() {
        let mut row = design.row_mut(j);
        row *= m;
    }
    design
}
