//! Synthetic companion injection.
//!
//! A reference PSF is shifted to a polar offset from the star and added into
//! every science frame. The offset is rotated by each frame's parallactic
//! angle so the injected signal stays fixed on sky rather than on the
//! detector. A negative scaling injects a negative companion, used to cancel
//! a real source during flux/position fitting.

use std::f64::consts::PI;

use ndarray::{Array2, Axis, Ix2, Ix3};
use tracing::{info, warn};

use crate::error::{PipelineError, Result};
use crate::interp::shift_image;
use crate::store::{attr, read_cube, FrameStore, StreamWriter};

/// Configuration for injecting a synthetic point source.
#[derive(Debug, Clone)]
pub struct FakeSource {
    /// Angular separation from the star, in arcsec.
    pub separation_arcsec: f64,
    /// Position angle in degrees, measured East of North.
    pub angle_deg: f64,
    /// Magnitude contrast relative to the star.
    pub magnitude: f64,
    /// Additional flux scaling; a negative value injects a negative source.
    pub psf_scaling: f64,
    /// Frames held in memory at once.
    pub frames_per_chunk: usize,
    pub image_in_tag: String,
    pub psf_in_tag: String,
    pub image_out_tag: String,
}

impl FakeSource {
    pub fn run<S: FrameStore + ?Sized>(&self, store: &mut S) -> Result<()> {
        if self.frames_per_chunk == 0 {
            return Err(PipelineError::configuration(
                "frames_per_chunk must be at least one",
            ));
        }

        let image_shape = store.shape(&self.image_in_tag)?;
        if image_shape.len() != 3 {
            return Err(PipelineError::configuration(format!(
                "tag '{}' should contain a cube of images, found {} dimensions",
                self.image_in_tag,
                image_shape.len()
            )));
        }
        let (n_image, height, width) = (image_shape[0], image_shape[1], image_shape[2]);

        let pixscale = store
            .get_attribute(&self.image_in_tag, attr::PIXSCALE)?
            .as_float(attr::PIXSCALE)?;
        if !store.has_attribute(&self.image_in_tag, attr::PARANG) {
            return Err(PipelineError::validation(format!(
                "tag '{}' has no '{}' attribute; parallactic angles are required \
                 to keep the injected source fixed on sky",
                self.image_in_tag,
                attr::PARANG
            )));
        }
        let parang = store.get_attribute(&self.image_in_tag, attr::PARANG)?;
        let parang: Vec<f64> = parang
            .as_float_seq(attr::PARANG)?
            .iter()
            .map(|a| a * PI / 180.0)
            .collect();
        if parang.len() != n_image {
            return Err(PipelineError::validation(format!(
                "tag '{}' has {} parallactic angles for {n_image} frames",
                self.image_in_tag,
                parang.len()
            )));
        }

        let radial = self.separation_arcsec / pixscale;
        let theta = self.angle_deg * PI / 180.0 + PI / 2.0;
        let flux_ratio = 10.0_f64.powf(-self.magnitude / 2.5);

        let psf = self.load_psf(store, n_image, height, width)?;

        info!(
            separation = self.separation_arcsec,
            angle = self.angle_deg,
            magnitude = self.magnitude,
            "injecting synthetic source"
        );

        let mut writer = StreamWriter::new(&self.image_out_tag);
        let mut start = 0usize;
        while start < n_image {
            let end = (start + self.frames_per_chunk).min(n_image);
            let mut chunk = read_cube(store, &self.image_in_tag, start, end)?;

            for (offset, mut frame) in chunk.axis_iter_mut(Axis(0)).enumerate() {
                let angle = theta - parang[start + offset];
                let x_shift = radial * angle.cos();
                let y_shift = radial * angle.sin();

                let template = match &psf {
                    PsfSource::Single(image) => image.clone(),
                    PsfSource::PerFrame => {
                        let data = store.read_frame(&self.psf_in_tag, start + offset)?;
                        data.into_dimensionality::<Ix2>()
                            .expect("per-frame PSF entries are 2-dimensional")
                    }
                };

                let shifted = shift_image(&template.view(), y_shift, x_shift);
                frame.scaled_add(self.psf_scaling * flux_ratio, &shifted);
            }

            writer.push(store, chunk)?;
            start = end;
        }

        store.copy_attributes(&self.image_in_tag, &self.image_out_tag)?;
        store.append_provenance(
            &self.image_out_tag,
            "fake source",
            &format!(
                "(sep, angle, mag) = ({:.2}, {:.2}, {:.2})",
                self.separation_arcsec, self.angle_deg, self.magnitude
            ),
        );
        Ok(())
    }

    /// Resolve the reference PSF: a single image, a matching per-frame cube,
    /// or a mismatched cube collapsed to its mean.
    fn load_psf<S: FrameStore + ?Sized>(
        &self,
        store: &mut S,
        n_image: usize,
        height: usize,
        width: usize,
    ) -> Result<PsfSource> {
        let psf_shape = store.shape(&self.psf_in_tag)?;
        let (n_psf, psf_dims) = match psf_shape.len() {
            2 => (1, (psf_shape[0], psf_shape[1])),
            3 => (psf_shape[0], (psf_shape[1], psf_shape[2])),
            other => {
                return Err(PipelineError::configuration(format!(
                    "tag '{}' should contain a PSF image or cube, found {other} dimensions",
                    self.psf_in_tag
                )))
            }
        };
        if psf_dims != (height, width) {
            return Err(PipelineError::validation(format!(
                "PSF frames of tag '{}' are {psf_dims:?} but science frames of \
                 tag '{}' are {:?}",
                self.psf_in_tag,
                self.image_in_tag,
                (height, width)
            )));
        }

        if psf_shape.len() == 2 {
            let image = store
                .read_all(&self.psf_in_tag)?
                .into_dimensionality::<Ix2>()
                .expect("checked 2-dimensional above");
            return Ok(PsfSource::Single(image));
        }

        if n_psf == n_image {
            return Ok(PsfSource::PerFrame);
        }

        warn!(
            psf_frames = n_psf,
            science_frames = n_image,
            "PSF cube length does not match the science stack; \
             collapsing the PSF cube to its mean"
        );
        store.append_provenance(
            &self.image_out_tag,
            "fake source",
            &format!("PSF cube of {n_psf} frames collapsed to its mean"),
        );

        let mut sum = Array2::zeros((height, width));
        let mut start = 0usize;
        while start < n_psf {
            let end = (start + self.frames_per_chunk).min(n_psf);
            let cube = store
                .read_range(&self.psf_in_tag, start, end)?
                .into_dimensionality::<Ix3>()
                .expect("checked 3-dimensional above");
            sum += &cube.sum_axis(Axis(0));
            start = end;
        }
        Ok(PsfSource::Single(sum / n_psf as f64))
    }
}

enum PsfSource {
    /// One template for every frame (2-D input or collapsed cube).
    Single(Array2<f64>),
    /// The PSF cube matches the science stack frame for frame.
    PerFrame,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AttributeValue, MemoryStore};
    use ndarray::Array3;

    fn gaussian_psf(size: usize, sigma: f64) -> Array2<f64> {
        let center = (size / 2) as f64;
        Array2::from_shape_fn((size, size), |(r, c)| {
            let dx = c as f64 - center;
            let dy = r as f64 - center;
            (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp()
        })
    }

    fn science_store(n: usize, size: usize) -> MemoryStore {
        let mut store = MemoryStore::new();
        store.write_all("im", Array3::zeros((n, size, size)).into_dyn());
        store.set_attribute("im", attr::PIXSCALE, AttributeValue::Float(0.1), true);
        store.set_attribute(
            "im",
            attr::PARANG,
            AttributeValue::FloatSeq(vec![0.0; n]),
            false,
        );
        store
    }

    #[test]
    fn test_injection_round_trip_position_and_flux() {
        let size = 41;
        let mut store = science_store(3, size);
        store.write_all("psf", gaussian_psf(size, 1.5).into_dyn());

        // Separation of 1 arcsec at pixscale 0.1 is 10 pixels; angle 0 deg
        // East of North points up (+y) at zero parallactic angle.
        FakeSource {
            separation_arcsec: 1.0,
            angle_deg: 0.0,
            magnitude: 2.5,
            psf_scaling: 1.0,
            frames_per_chunk: 2,
            image_in_tag: "im".into(),
            psf_in_tag: "psf".into(),
            image_out_tag: "fake".into(),
        }
        .run(&mut store)
        .unwrap();

        let out = store.read_all("fake").unwrap();
        assert_eq!(out.shape(), &[3, size, size]);

        let mut peak = (0, 0);
        let mut best = f64::MIN;
        for r in 0..size {
            for c in 0..size {
                if out[[0, r, c]] > best {
                    best = out[[0, r, c]];
                    peak = (r, c);
                }
            }
        }
        // PSF center lands 10 pixels above the frame center.
        assert_eq!(peak, (30, 20));
        // Flux ratio for 2.5 mag is 0.1; the peak carries it directly.
        assert!((best - 0.1).abs() < 1e-6, "peak flux {best}");
    }

    #[test]
    fn test_two_dimensional_science_input_is_rejected() {
        let mut store = MemoryStore::new();
        store.write_all("im", Array2::<f64>::zeros((8, 8)).into_dyn());
        store.write_all("psf", Array2::<f64>::zeros((8, 8)).into_dyn());
        store.set_attribute("im", attr::PIXSCALE, AttributeValue::Float(0.1), true);

        let err = FakeSource {
            separation_arcsec: 0.5,
            angle_deg: 0.0,
            magnitude: 5.0,
            psf_scaling: 1.0,
            frames_per_chunk: 4,
            image_in_tag: "im".into(),
            psf_in_tag: "psf".into(),
            image_out_tag: "fake".into(),
        }
        .run(&mut store)
        .unwrap_err();

        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[test]
    fn test_mismatched_psf_cube_collapses_to_mean() {
        let size = 15;
        let mut store = science_store(4, size);

        // Two PSF frames with different amplitudes; the mean has 1.5.
        let mut psf = Array3::zeros((2, size, size));
        psf.index_axis_mut(Axis(0), 0)
            .assign(&(gaussian_psf(size, 1.0) * 1.0));
        psf.index_axis_mut(Axis(0), 1)
            .assign(&(gaussian_psf(size, 1.0) * 2.0));
        store.write_all("psf", psf.into_dyn());

        FakeSource {
            separation_arcsec: 0.0,
            angle_deg: 0.0,
            magnitude: 0.0,
            psf_scaling: 1.0,
            frames_per_chunk: 4,
            image_in_tag: "im".into(),
            psf_in_tag: "psf".into(),
            image_out_tag: "fake".into(),
        }
        .run(&mut store)
        .unwrap();

        let out = store.read_all("fake").unwrap();
        let center = size / 2;
        assert!((out[[0, center, center]] - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_parallactic_angle_rotates_injection() {
        let size = 41;
        let mut store = science_store(1, size);
        store.set_attribute(
            "im",
            attr::PARANG,
            AttributeValue::FloatSeq(vec![90.0]),
            false,
        );
        store.write_all("psf", gaussian_psf(size, 1.5).into_dyn());

        FakeSource {
            separation_arcsec: 1.0,
            angle_deg: 0.0,
            magnitude: 0.0,
            psf_scaling: 1.0,
            frames_per_chunk: 1,
            image_in_tag: "im".into(),
            psf_in_tag: "psf".into(),
            image_out_tag: "fake".into(),
        }
        .run(&mut store)
        .unwrap();

        let out = store.read_all("fake").unwrap();
        let mut peak = (0, 0);
        let mut best = f64::MIN;
        for r in 0..size {
            for c in 0..size {
                if out[[0, r, c]] > best {
                    best = out[[0, r, c]];
                    peak = (r, c);
                }
            }
        }
        // Rotating the field by 90 degrees moves the source from +y to +x.
        assert_eq!(peak, (20, 30));
    }
}
