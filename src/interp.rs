//! Sub-pixel image shifting with quintic B-spline interpolation.
//!
//! Shifting the reference PSF to an arbitrary sub-pixel position must not
//! distort its shape, so a degree-5 B-spline interpolant is used: the image
//! is prefiltered into spline coefficients with a pair of causal/anticausal
//! recursive filters, then each output pixel is reconstructed from a 6-tap
//! window of coefficients. Out-of-bounds samples reflect at the image edge.

use ndarray::{Array2, ArrayView2, ArrayViewMut1};

/// Poles of the degree-5 B-spline prefilter.
const POLES: [f64; 2] = [
    -0.430_575_347_099_973_8,
    -0.043_096_288_203_264_65,
];

/// Shift an image by (`dy`, `dx`) pixels with quintic spline interpolation.
///
/// Output pixel (r, c) samples the input at (r - dy, c - dx); a positive
/// shift moves the image content toward larger indices. Boundaries reflect.
pub fn shift_image(image: &ArrayView2<'_, f64>, dy: f64, dx: f64) -> Array2<f64> {
    let (height, width) = image.dim();
    let mut coeffs = image.to_owned();

    // Prefilter rows, then columns.
    for mut row in coeffs.rows_mut() {
        prefilter_line(row.view_mut());
    }
    let mut coeffs = coeffs.reversed_axes();
    for mut column in coeffs.rows_mut() {
        prefilter_line(column.view_mut());
    }
    let coeffs = coeffs.reversed_axes();

    let mut output = Array2::zeros((height, width));
    for ((row, col), value) in output.indexed_iter_mut() {
        let src_r = row as f64 - dy;
        let src_c = col as f64 - dx;

        let base_r = src_r.floor() as isize - 2;
        let base_c = src_c.floor() as isize - 2;

        let mut weights_r = [0.0; 6];
        let mut weights_c = [0.0; 6];
        for t in 0..6 {
            weights_r[t] = bspline5(src_r - (base_r + t as isize) as f64);
            weights_c[t] = bspline5(src_c - (base_c + t as isize) as f64);
        }

        let mut sum = 0.0;
        for (tr, &wr) in weights_r.iter().enumerate() {
            if wr == 0.0 {
                continue;
            }
            let rr = reflect(base_r + tr as isize, height);
            for (tc, &wc) in weights_c.iter().enumerate() {
                if wc == 0.0 {
                    continue;
                }
                let cc = reflect(base_c + tc as isize, width);
                sum += wr * wc * coeffs[[rr, cc]];
            }
        }
        *value = sum;
    }

    output
}

/// Degree-5 central B-spline kernel, support (-3, 3).
fn bspline5(x: f64) -> f64 {
    let ax = x.abs();
    if ax >= 3.0 {
        return 0.0;
    }
    let a = (3.0 - ax).powi(5);
    if ax >= 2.0 {
        return a / 120.0;
    }
    let b = (2.0 - ax).powi(5);
    if ax >= 1.0 {
        return (a - 6.0 * b) / 120.0;
    }
    let c = (1.0 - ax).powi(5);
    (a - 6.0 * b + 15.0 * c) / 120.0
}

/// Mirror index into `0..len` (half-sample symmetric reflection).
fn reflect(index: isize, len: usize) -> usize {
    debug_assert!(len > 0);
    let len = len as isize;
    let mut i = index;
    loop {
        if i < 0 {
            i = -1 - i;
        } else if i >= len {
            i = 2 * len - 1 - i;
        } else {
            return i as usize;
        }
    }
}

/// In-place causal/anticausal recursive prefilter turning samples into
/// quintic spline coefficients (half-sample symmetric boundary, matching
/// [`reflect`]).
fn prefilter_line(mut line: ArrayViewMut1<'_, f64>) {
    let n = line.len();
    if n < 2 {
        return;
    }

    let gain: f64 = POLES.iter().map(|&z| (1.0 - z) * (1.0 - 1.0 / z)).product();
    for value in line.iter_mut() {
        *value *= gain;
    }

    for &z in &POLES {
        let first = causal_init(&line, z);
        line[0] = first;
        for i in 1..n {
            line[i] += z * line[i - 1];
        }
        // Anticausal init for a half-sample boundary: the extension repeats
        // the edge sample, which collapses the infinite sum to this factor.
        line[n - 1] *= z / (z - 1.0);
        for i in (0..n - 1).rev() {
            line[i] = z * (line[i + 1] - line[i]);
        }
    }
}

/// Exact first causal coefficient for half-sample symmetric boundaries.
///
/// The extended signal has period `2n` with `s[-k] = s[k-1]`, so the
/// infinite causal sum reduces to one period scaled by `1/(1 - z^{2n})`.
fn causal_init(line: &ArrayViewMut1<'_, f64>, z: f64) -> f64 {
    let n = line.len();
    let z_2n = z.powi(2 * n as i32);

    let mut sum = (1.0 + z) * line[0];
    let mut z_fwd = z * z;
    let mut z_back = z_2n / z;
    for i in 1..n {
        sum += (z_fwd + z_back) * line[i];
        z_fwd *= z;
        z_back /= z;
    }
    sum / (1.0 - z_2n)
}
