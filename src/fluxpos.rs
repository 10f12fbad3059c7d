//! Flux and position retrieval by negative source injection.
//!
//! A detected companion is measured by injecting a negative copy of the
//! reference PSF at a trial position and contrast, running a PSF subtraction
//! over the injected stack, and scoring how well the companion cancels in the
//! residual. A downhill simplex drives the trial parameters until the
//! residual around the source is consistent with noise.
//!
//! The PSF subtraction itself is a collaborator passed in by the caller
//! through [`PsfSubtraction`], so the fit works with any algorithm that
//! leaves a residual frame in the store.

use ndarray::{Array2, Axis, Ix2, Ix3};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{PipelineError, Result};
use crate::image::{crop_center, hessian_determinant, zero_outside_radius};
use crate::inject::FakeSource;
use crate::simplex::NelderMead;
use crate::store::{attr, FrameStore, StreamWriter};

/// One PSF-subtraction run requested by the fit.
#[derive(Debug, Clone)]
pub struct SubtractionRequest {
    /// Tag holding the science stack with the negative source injected.
    pub image_tag: String,
    /// Tag holding the reference library for the subtraction.
    pub reference_tag: String,
    /// Number of principal components to subtract.
    pub pca_count: usize,
    /// Extra field rotation applied when collapsing the residuals, degrees.
    pub extra_rot_deg: f64,
    /// Tag the collaborator must leave the collapsed residual under.
    pub residual_tag: String,
}

/// PSF-subtraction collaborator invoked once per objective evaluation.
///
/// Implemented for any `FnMut(&mut S, &SubtractionRequest) -> Result<()>`,
/// so tests can hand in a closure.
pub trait PsfSubtraction<S: FrameStore + ?Sized> {
    fn subtract(&mut self, store: &mut S, request: &SubtractionRequest) -> Result<()>;
}

impl<S, F> PsfSubtraction<S> for F
where
    S: FrameStore + ?Sized,
    F: FnMut(&mut S, &SubtractionRequest) -> Result<()>,
{
    fn subtract(&mut self, store: &mut S, request: &SubtractionRequest) -> Result<()> {
        self(store, request)
    }
}

/// Figure of merit evaluated on the residual cutout around the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeritFunction {
    /// Sum of the absolute determinant of the Hessian, after Gaussian
    /// smoothing. Sensitive to curvature, robust against flux offsets.
    Hessian,
    /// Sum of absolute pixel values.
    Sum,
}

impl MeritFunction {
    fn evaluate(self, cutout: &Array2<f64>, sigma_px: f64, radius_px: f64) -> f64 {
        let mut map = match self {
            MeritFunction::Hessian => hessian_determinant(&cutout.view(), sigma_px),
            MeritFunction::Sum => cutout.clone(),
        };
        zero_outside_radius(&mut map, radius_px);
        map.iter().map(|v| v.abs()).sum()
    }
}

/// One objective evaluation, recorded in the trial table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FluxPositionTrial {
    /// Source position in the derotated residual frame, pixels.
    pub x: f64,
    pub y: f64,
    pub separation_arcsec: f64,
    /// Position angle East of North, degrees in `[0, 360)`.
    pub angle_deg: f64,
    pub magnitude: f64,
    pub merit: f64,
}

/// Outcome of a flux/position minimization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FluxPositionResult {
    /// Final trial, taken as the measurement.
    pub best: FluxPositionTrial,
    pub iterations: usize,
    pub converged: bool,
}

/// Simplex fit of a companion's position and contrast.
#[derive(Debug, Clone)]
pub struct SimplexFluxPosition {
    /// Approximate source position `(x, y)` in the derotated frame, pixels.
    pub position: (f64, f64),
    /// Initial guess of the magnitude contrast.
    pub magnitude: f64,
    /// Flux scaling of the injected PSF; negative to cancel the source.
    pub psf_scaling: f64,
    pub merit: MeritFunction,
    /// Radius of the merit aperture, arcsec.
    pub aperture_arcsec: f64,
    /// Width of the smoothing kernel for the Hessian merit, arcsec.
    pub sigma_arcsec: f64,
    /// Simplex convergence threshold on position (pixels) and magnitude.
    pub tolerance: f64,
    pub max_iterations: usize,
    pub pca_count: usize,
    /// Extra field rotation applied to the residuals, degrees.
    pub extra_rot_deg: f64,
    pub frames_per_chunk: usize,
    pub image_in_tag: String,
    pub psf_in_tag: String,
    /// Tag for the reference library handed to the subtraction collaborator.
    pub reference_in_tag: String,
    /// Scratch tag for the stack with the negative source injected.
    pub injected_tag: String,
    /// Scratch tag the collaborator writes its residual to.
    pub residual_tag: String,
    /// Output stack of residual frames, one per objective evaluation.
    pub residual_out_tag: String,
    /// Output table of trials, one row of
    /// `[x, y, sep, angle, mag, merit]` per evaluation.
    pub flux_position_tag: String,
}

impl SimplexFluxPosition {
    pub fn run<S, P>(&self, store: &mut S, subtraction: &mut P) -> Result<FluxPositionResult>
    where
        S: FrameStore + ?Sized,
        P: PsfSubtraction<S>,
    {
        if self.aperture_arcsec <= 0.0 {
            return Err(PipelineError::configuration(
                "merit aperture radius must be positive",
            ));
        }

        let shape = store.shape(&self.image_in_tag)?;
        if shape.len() != 3 {
            return Err(PipelineError::configuration(format!(
                "tag '{}' should contain a cube of images, found {} dimensions",
                self.image_in_tag,
                shape.len()
            )));
        }
        let (height, width) = (shape[1], shape[2]);
        let center = (width as f64 / 2.0 - 0.5, height as f64 / 2.0 - 0.5);

        let pixscale = store
            .get_attribute(&self.image_in_tag, attr::PIXSCALE)?
            .as_float(attr::PIXSCALE)?;
        let radius_px = (self.aperture_arcsec / pixscale).ceil() as usize;
        let sigma_px = self.sigma_arcsec / pixscale;

        info!(
            position = ?self.position,
            magnitude = self.magnitude,
            aperture_px = radius_px,
            "fitting companion flux and position"
        );

        store.clear(&self.residual_out_tag);
        store.clear(&self.flux_position_tag);
        let mut residual_writer = StreamWriter::new(&self.residual_out_tag);
        let mut trial_writer = StreamWriter::new(&self.flux_position_tag);

        // The simplex walks detector-frame coordinates; the residual frames
        // carry the extra rotation, so the starting guess is rotated into
        // the detector frame first.
        let (x0, y0) = rotate_position(center, self.position, self.extra_rot_deg);

        let request = SubtractionRequest {
            image_tag: self.injected_tag.clone(),
            reference_tag: self.reference_in_tag.clone(),
            pca_count: self.pca_count,
            extra_rot_deg: self.extra_rot_deg,
            residual_tag: self.residual_tag.clone(),
        };

        let solver = NelderMead {
            x_tolerance: self.tolerance,
            max_iterations: self.max_iterations,
        };

        let mut last_trial: Option<FluxPositionTrial> = None;
        let outcome = solver.minimize(&[x0, y0, self.magnitude], |params| {
            let (x, y, magnitude) = (params[0], params[1], params[2]);

            let dx = x - center.0;
            let dy = y - center.1;
            let separation_arcsec = dx.hypot(dy) * pixscale;
            let angle_deg = dy.atan2(dx).to_degrees() - 90.0;

            FakeSource {
                separation_arcsec,
                angle_deg,
                magnitude,
                psf_scaling: self.psf_scaling,
                frames_per_chunk: self.frames_per_chunk,
                image_in_tag: self.image_in_tag.clone(),
                psf_in_tag: self.psf_in_tag.clone(),
                image_out_tag: self.injected_tag.clone(),
            }
            .run(store)?;

            subtraction.subtract(store, &request)?;
            let residual = read_residual(store, &self.residual_tag)?;
            residual_writer.push(store, residual.clone().insert_axis(Axis(0)))?;

            let (rot_x, rot_y) = rotate_position(center, (x, y), -self.extra_rot_deg);
            let cutout = crop_center(&residual.view(), rot_x, rot_y, radius_px);
            let merit = self.merit.evaluate(&cutout, sigma_px, radius_px as f64);

            let trial = FluxPositionTrial {
                x: rot_x,
                y: rot_y,
                separation_arcsec,
                angle_deg: (angle_deg - self.extra_rot_deg).rem_euclid(360.0),
                magnitude,
                merit,
            };
            trial_writer.push_row(
                store,
                &[
                    trial.x,
                    trial.y,
                    trial.separation_arcsec,
                    trial.angle_deg,
                    trial.magnitude,
                    trial.merit,
                ],
            )?;
            last_trial = Some(trial);
            Ok(merit)
        })?;

        // The last evaluated trial is taken as the measurement, matching the
        // trial table on disk.
        let best = last_trial.ok_or_else(|| {
            PipelineError::configuration("simplex finished without evaluating the objective")
        })?;

        let evaluations = store.num_frames(&self.flux_position_tag)?;
        store.copy_attributes(&self.image_in_tag, &self.residual_out_tag)?;
        store.append_provenance(
            &self.residual_out_tag,
            "flux position",
            &format!("{evaluations} objective evaluations"),
        );
        store.append_provenance(
            &self.flux_position_tag,
            "flux position",
            &format!(
                "(x, y, mag) = ({:.3}, {:.3}, {:.3})",
                best.x, best.y, best.magnitude
            ),
        );

        info!(
            x = best.x,
            y = best.y,
            separation = best.separation_arcsec,
            angle = best.angle_deg,
            magnitude = best.magnitude,
            converged = outcome.converged,
            "flux/position fit finished"
        );

        Ok(FluxPositionResult {
            best,
            iterations: outcome.iterations,
            converged: outcome.converged,
        })
    }
}

/// Read the collaborator's residual and reduce it to a single frame.
fn read_residual<S: FrameStore + ?Sized>(store: &S, tag: &str) -> Result<Array2<f64>> {
    let data = store.read_all(tag)?;
    match data.ndim() {
        2 => Ok(data
            .into_dimensionality::<Ix2>()
            .expect("checked 2-dimensional above")),
        3 => {
            let cube = data
                .into_dimensionality::<Ix3>()
                .expect("checked 3-dimensional above");
            if cube.shape()[0] != 1 {
                return Err(PipelineError::configuration(format!(
                    "residual tag '{tag}' holds {} frames; the subtraction must \
                     collapse its residuals to a single frame",
                    cube.shape()[0]
                )));
            }
            Ok(cube.index_axis(Axis(0), 0).to_owned())
        }
        other => Err(PipelineError::configuration(format!(
            "residual tag '{tag}' has {other} dimensions, expected an image"
        ))),
    }
}

/// Rotate `(x, y)` around `center` by `angle_deg` counterclockwise.
fn rotate_position(center: (f64, f64), position: (f64, f64), angle_deg: f64) -> (f64, f64) {
    let angle = angle_deg.to_radians();
    let dx = position.0 - center.0;
    let dy = position.1 - center.1;
    (
        center.0 + dx * angle.cos() - dy * angle.sin(),
        center.1 + dx * angle.sin() + dy * angle.cos(),
    )
}
