//! Small-image analysis helpers for the flux/position fit.
//!
//! The merit functions operate on a square cutout around the trial position:
//! the residual frame is cropped, optionally smoothed and differentiated, and
//! finally summed inside a circular aperture.

use ndarray::{Array1, Array2, ArrayView2};

/// Extract a square cutout of half-size `radius_px` around the floating-point
/// position `(x, y)` (column, row). The anchor pixel is the rounded position;
/// regions outside the frame are zero-padded.
pub fn crop_center(image: &ArrayView2<'_, f64>, x: f64, y: f64, radius_px: usize) -> Array2<f64> {
    let (height, width) = image.dim();
    let size = 2 * radius_px;
    let mut out = Array2::zeros((size, size));

    let row0 = y.round() as isize - radius_px as isize;
    let col0 = x.round() as isize - radius_px as isize;

    for r in 0..size {
        let src_r = row0 + r as isize;
        if src_r < 0 || src_r >= height as isize {
            continue;
        }
        for c in 0..size {
            let src_c = col0 + c as isize;
            if src_c < 0 || src_c >= width as isize {
                continue;
            }
            out[[r, c]] = image[[src_r as usize, src_c as usize]];
        }
    }
    out
}

/// Separable Gaussian blur with a kernel truncated at four standard
/// deviations. Samples beyond the image edge contribute zero.
pub fn gaussian_smooth(image: &ArrayView2<'_, f64>, sigma: f64) -> Array2<f64> {
    if sigma <= 0.0 {
        return image.to_owned();
    }

    let half = (4.0 * sigma).ceil() as usize;
    let mut kernel = Array1::zeros(2 * half + 1);
    for (i, k) in kernel.iter_mut().enumerate() {
        let d = i as f64 - half as f64;
        *k = (-d * d / (2.0 * sigma * sigma)).exp();
    }
    kernel /= kernel.sum();

    let (height, width) = image.dim();
    let mut rows = Array2::zeros((height, width));
    for r in 0..height {
        for c in 0..width {
            let mut sum = 0.0;
            for (i, &k) in kernel.iter().enumerate() {
                let src = c as isize + i as isize - half as isize;
                if src >= 0 && src < width as isize {
                    sum += k * image[[r, src as usize]];
                }
            }
            rows[[r, c]] = sum;
        }
    }

    let mut out = Array2::zeros((height, width));
    for r in 0..height {
        for c in 0..width {
            let mut sum = 0.0;
            for (i, &k) in kernel.iter().enumerate() {
                let src = r as isize + i as isize - half as isize;
                if src >= 0 && src < height as isize {
                    sum += k * rows[[src as usize, c]];
                }
            }
            out[[r, c]] = sum;
        }
    }
    out
}

/// Determinant of the Hessian at every pixel of the smoothed image.
///
/// Second derivatives are formed by applying [`gradient_2d`] twice, so the
/// interior uses central differences and the borders one-sided ones. A point
/// source produces a strong extremum in the determinant, which the fit
/// drives toward zero.
pub fn hessian_determinant(image: &ArrayView2<'_, f64>, sigma: f64) -> Array2<f64> {
    let smoothed = gaussian_smooth(image, sigma);
    let (d_row, d_col) = gradient_2d(&smoothed.view());
    let (h_rr, h_rc) = gradient_2d(&d_row.view());
    let (_, h_cc) = gradient_2d(&d_col.view());

    let mut det = Array2::zeros(image.dim());
    for ((r, c), value) in det.indexed_iter_mut() {
        *value = h_rr[[r, c]] * h_cc[[r, c]] - h_rc[[r, c]] * h_rc[[r, c]];
    }
    det
}

/// First-order gradients along rows and columns: central differences in the
/// interior, one-sided differences at the borders.
fn gradient_2d(image: &ArrayView2<'_, f64>) -> (Array2<f64>, Array2<f64>) {
    let (height, width) = image.dim();
    let mut d_row = Array2::zeros((height, width));
    let mut d_col = Array2::zeros((height, width));

    for r in 0..height {
        for c in 0..width {
            d_row[[r, c]] = if height == 1 {
                0.0
            } else if r == 0 {
                image[[1, c]] - image[[0, c]]
            } else if r == height - 1 {
                image[[r, c]] - image[[r - 1, c]]
            } else {
                (image[[r + 1, c]] - image[[r - 1, c]]) / 2.0
            };

            d_col[[r, c]] = if width == 1 {
                0.0
            } else if c == 0 {
                image[[r, 1]] - image[[r, 0]]
            } else if c == width - 1 {
                image[[r, c]] - image[[r, c - 1]]
            } else {
                (image[[r, c + 1]] - image[[r, c - 1]]) / 2.0
            };
        }
    }
    (d_row, d_col)
}

/// Distance of every pixel from the image center, in pixels. For even sizes
/// the center falls between pixels, so coordinates run over half-integers.
pub fn center_distance_grid(height: usize, width: usize) -> Array2<f64> {
    let axis = |n: usize, i: usize| -> f64 {
        if n % 2 == 0 {
            i as f64 - n as f64 / 2.0 + 0.5
        } else {
            i as f64 - (n as f64 - 1.0) / 2.0
        }
    };
    Array2::from_shape_fn((height, width), |(r, c)| {
        let dy = axis(height, r);
        let dx = axis(width, c);
        (dx * dx + dy * dy).sqrt()
    })
}

/// Zero every pixel farther than `radius_px` from the image center.
pub fn zero_outside_radius(image: &mut Array2<f64>, radius_px: f64) {
    let (height, width) = image.dim();
    let distance = center_distance_grid(height, width);
    for ((r, c), value) in image.indexed_iter_mut() {
        if distance[[r, c]] > radius_px {
            *value = 0.0;
        }
    }
}
