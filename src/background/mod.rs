//! Background estimation and subtraction.
//!
//! Three families of estimators remove the thermal/sky background from
//! science frames before PSF subtraction:
//!
//! - [`mean`]: positional/temporal neighbor averaging for dithered data,
//!   plus a circular-shift variant and nodding sky subtraction driven by the
//!   [`crate::timeline`] index.
//! - [`pca`]: low-rank principal-component model built from background-only
//!   frames, fitted per science frame under a star mask.

pub mod mean;
pub mod nodding;
pub mod pca;

use ndarray::{Array2, ArrayView3, Axis};

/// Mean image over the leading axis of a cube.
pub(crate) fn mean_frame(cube: ArrayView3<'_, f64>) -> Array2<f64> {
    cube.mean_axis(Axis(0))
        .expect("cube has at least one frame")
}

/// Cumulative frame offsets for a sequence of per-cube frame counts,
/// starting at zero and ending at the total.
pub(crate) fn cube_offsets(nframes: &[i64]) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(nframes.len() + 1);
    let mut total = 0usize;
    offsets.push(0);
    for &count in nframes {
        total += count as usize;
        offsets.push(total);
    }
    offsets
}
