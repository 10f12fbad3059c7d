//! Neighbor-mean and circular-shift background subtraction for dithered data.
//!
//! With the telescope cycling through dither positions, the frames recorded
//! one period before and after a science block see the same detector region
//! without the star. The mean of those neighbor blocks estimates the
//! background under the science block.

use ndarray::Axis;
use std::ops::Range;
use tracing::info;

use super::{cube_offsets, mean_frame};
use crate::error::{PipelineError, Result};
use crate::store::{attr, read_cube, read_image, AttributeValue, FrameStore, OutputMode, StreamWriter};

/// Mean background subtraction with neighbor-block averaging.
///
/// The background period is either a fixed stride of `shift` frames per
/// dither position, or, when `shift` is `None`, derived from the per-cube
/// frame-count attribute with `cubes_per_position` consecutive cubes sharing
/// a dither position. Interior blocks subtract the average of the previous
/// and next block means; the first and last block use the single neighbor
/// that exists.
#[derive(Debug, Clone)]
pub struct MeanBackground {
    /// Frames per dither position; `None` reads the frame-count attribute.
    pub shift: Option<usize>,
    /// Consecutive cubes per dither position (frame-count layout only).
    pub cubes_per_position: usize,
    pub image_in_tag: String,
    pub image_out_tag: String,
}

impl MeanBackground {
    pub fn run<S: FrameStore + ?Sized>(&self, store: &mut S) -> Result<()> {
        if self.image_in_tag == self.image_out_tag {
            return Err(PipelineError::configuration(
                "mean background subtraction requires a distinct output tag",
            ));
        }

        let total = store.num_frames(&self.image_in_tag)?;
        let blocks = self.block_layout(store, total)?;

        info!(
            input = %self.image_in_tag,
            blocks = blocks.len(),
            "subtracting mean background"
        );

        let mut writer = StreamWriter::new(&self.image_out_tag);
        for (i, block) in blocks.iter().enumerate() {
            let previous = (i > 0).then(|| blocks[i - 1].clone());
            let next = (i + 1 < blocks.len()).then(|| blocks[i + 1].clone());

            let background = match (previous, next) {
                (Some(p), Some(n)) => {
                    let prev_mean = mean_frame(
                        read_cube(store, &self.image_in_tag, p.start, p.end)?.view(),
                    );
                    let next_mean = mean_frame(
                        read_cube(store, &self.image_in_tag, n.start, n.end)?.view(),
                    );
                    (prev_mean + next_mean) / 2.0
                }
                (Some(only), None) | (None, Some(only)) => mean_frame(
                    read_cube(store, &self.image_in_tag, only.start, only.end)?.view(),
                ),
                (None, None) => unreachable!("block layout always has at least two blocks"),
            };

            let mut data = read_cube(store, &self.image_in_tag, block.start, block.end)?;
            for mut frame in data.outer_iter_mut() {
                frame -= &background;
            }
            writer.push(store, data)?;
        }

        store.copy_attributes(&self.image_in_tag, &self.image_out_tag)?;
        store.append_provenance(&self.image_out_tag, "background", "mean subtraction");
        Ok(())
    }

    /// Frame ranges of the subtraction blocks, validated against the input.
    fn block_layout<S: FrameStore + ?Sized>(
        &self,
        store: &S,
        total: usize,
    ) -> Result<Vec<Range<usize>>> {
        match self.shift {
            Some(shift) => {
                if shift == 0 {
                    return Err(PipelineError::configuration(
                        "background period must be at least one frame",
                    ));
                }
                if total < 2 * shift {
                    return Err(PipelineError::validation(format!(
                        "mean background subtraction needs at least {} frames \
                         (two background periods), found {total}",
                        2 * shift
                    )));
                }
                let count = total.div_ceil(shift);
                Ok((0..count)
                    .map(|i| i * shift..((i + 1) * shift).min(total))
                    .collect())
            }
            None => {
                if self.cubes_per_position == 0 {
                    return Err(PipelineError::configuration(
                        "cubes_per_position must be at least one",
                    ));
                }
                if !store.has_attribute(&self.image_in_tag, attr::NFRAMES) {
                    return Err(PipelineError::validation(format!(
                        "tag '{}' has no '{}' attribute; per-cube frame counts are \
                         required when no explicit shift is given",
                        self.image_in_tag,
                        attr::NFRAMES
                    )));
                }
                let nframes = store.get_attribute(&self.image_in_tag, attr::NFRAMES)?;
                let nframes = nframes.as_int_seq(attr::NFRAMES)?.to_vec();
                if nframes.len() < 2 * self.cubes_per_position {
                    return Err(PipelineError::validation(format!(
                        "mean background subtraction needs at least {} cubes, found {}",
                        2 * self.cubes_per_position,
                        nframes.len()
                    )));
                }
                let offsets = cube_offsets(&nframes);
                if *offsets.last().expect("offsets are never empty") != total {
                    return Err(PipelineError::validation(format!(
                        "frame counts sum to {} but tag '{}' holds {total} frames",
                        offsets.last().expect("offsets are never empty"),
                        self.image_in_tag
                    )));
                }
                let groups = nframes.len().div_ceil(self.cubes_per_position);
                Ok((0..groups)
                    .map(|g| {
                        let first = g * self.cubes_per_position;
                        let last = ((g + 1) * self.cubes_per_position).min(nframes.len());
                        offsets[first]..offsets[last]
                    })
                    .collect())
            }
        }
    }
}

/// Circular-shift background subtraction: the background for frame `i` is
/// frame `(i + shift) mod n`, subtracted directly without averaging. Used
/// when a fixed fraction of the stack is pure offset background.
#[derive(Debug, Clone)]
pub struct SimpleBackground {
    pub shift: usize,
    pub image_in_tag: String,
    pub image_out_tag: String,
    pub output: OutputMode,
}

impl SimpleBackground {
    pub fn run<S: FrameStore + ?Sized>(&self, store: &mut S) -> Result<()> {
        let total = store.num_frames(&self.image_in_tag)?;

        match self.output {
            OutputMode::OverwriteInPlace => {
                if self.image_in_tag != self.image_out_tag {
                    return Err(PipelineError::configuration(
                        "in-place simple background subtraction requires matching \
                         input and output tags",
                    ));
                }
                for i in 0..total {
                    let background =
                        read_image(store, &self.image_in_tag, (i + self.shift) % total)?;
                    let result = read_image(store, &self.image_in_tag, i)? - background;
                    store.write_frame(&self.image_out_tag, i, result.into_dyn())?;
                }
            }
            OutputMode::CreateNew => {
                if self.image_in_tag == self.image_out_tag {
                    return Err(PipelineError::configuration(
                        "simple background subtraction to a new tag requires a \
                         distinct output tag",
                    ));
                }
                let mut writer = StreamWriter::new(&self.image_out_tag);
                for i in 0..total {
                    let background =
                        read_image(store, &self.image_in_tag, (i + self.shift) % total)?;
                    let result = read_image(store, &self.image_in_tag, i)? - background;
                    writer.push(store, result.insert_axis(Axis(0)))?;
                }
                store.copy_attributes(&self.image_in_tag, &self.image_out_tag)?;
            }
        }

        store.append_provenance(&self.image_out_tag, "background", "simple subtraction");
        Ok(())
    }
}

/// Collapse each sky exposure cube to its mean frame.
///
/// Produces the one-frame-per-exposure sky stream that nodding subtraction
/// consumes. The frame-count attribute of the output is rewritten to ones.
#[derive(Debug, Clone)]
pub struct SkyCubeCollapse {
    pub sky_in_tag: String,
    pub sky_out_tag: String,
}

impl SkyCubeCollapse {
    pub fn run<S: FrameStore + ?Sized>(&self, store: &mut S) -> Result<()> {
        if self.sky_in_tag == self.sky_out_tag {
            return Err(PipelineError::configuration(
                "sky cube collapse requires a distinct output tag",
            ));
        }
        if !store.has_attribute(&self.sky_in_tag, attr::NFRAMES) {
            return Err(PipelineError::validation(format!(
                "tag '{}' has no '{}' attribute; per-cube frame counts are required",
                self.sky_in_tag,
                attr::NFRAMES
            )));
        }
        let nframes = store.get_attribute(&self.sky_in_tag, attr::NFRAMES)?;
        let nframes = nframes.as_int_seq(attr::NFRAMES)?.to_vec();

        store.clear(&self.sky_out_tag);
        let mut writer = StreamWriter::new(&self.sky_out_tag);
        let offsets = cube_offsets(&nframes);
        for window in offsets.windows(2) {
            let cube = read_cube(store, &self.sky_in_tag, window[0], window[1])?;
            let mean = mean_frame(cube.view());
            writer.push(store, mean.insert_axis(Axis(0)))?;
        }

        store.copy_attributes(&self.sky_in_tag, &self.sky_out_tag)?;
        store.set_attribute(
            &self.sky_out_tag,
            attr::NFRAMES,
            AttributeValue::IntSeq(vec![1; nframes.len()]),
            false,
        );
        store.append_provenance(&self.sky_out_tag, "background", "sky cubes collapsed to means");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use ndarray::{Array2, Array3};

    /// Stack where block `b` of size `size` holds `signal[b] + background`.
    fn dithered_stack(signals: &[f64], size: usize, background: f64) -> Array3<f64> {
        let mut stack = Array3::zeros((signals.len() * size, 8, 8));
        for (b, &signal) in signals.iter().enumerate() {
            for i in 0..size {
                stack
                    .index_axis_mut(Axis(0), b * size + i)
                    .fill(signal + background);
            }
        }
        stack
    }

    #[test]
    fn test_interior_blocks_recover_signal_exactly() {
        // Odd blocks are pure background (signal 0), even blocks add 5.
        let signals = [5.0, 0.0, 5.0, 0.0, 5.0, 0.0];
        let mut store = MemoryStore::new();
        store.write_all("im", dithered_stack(&signals, 4, 100.0).into_dyn());

        MeanBackground {
            shift: Some(4),
            cubes_per_position: 1,
            image_in_tag: "im".into(),
            image_out_tag: "out".into(),
        }
        .run(&mut store)
        .unwrap();

        let out = store.read_all("out").unwrap();
        assert_eq!(out.shape(), &[24, 8, 8]);

        // Interior source block 2 (frames 8..12): neighbors are pure
        // background, so the signal is recovered to machine precision.
        for i in 8..12 {
            let value = out[[i, 3, 3]];
            assert!((value - 5.0).abs() < 1e-10, "frame {i} holds {value}");
        }
    }

    #[test]
    fn test_edge_blocks_use_single_neighbor() {
        let signals = [1.0, 2.0, 3.0];
        let mut store = MemoryStore::new();
        store.write_all("im", dithered_stack(&signals, 2, 0.0).into_dyn());

        MeanBackground {
            shift: Some(2),
            cubes_per_position: 1,
            image_in_tag: "im".into(),
            image_out_tag: "out".into(),
        }
        .run(&mut store)
        .unwrap();

        let out = store.read_all("out").unwrap();
        // First block subtracts the second block mean only.
        assert!((out[[0, 0, 0]] - (1.0 - 2.0)).abs() < 1e-12);
        // Middle block subtracts the average of both neighbors.
        assert!((out[[2, 0, 0]] - (2.0 - 2.0)).abs() < 1e-12);
        // Last block subtracts the middle block mean only.
        assert!((out[[4, 0, 0]] - (3.0 - 2.0)).abs() < 1e-12);
    }

    #[test]
    fn test_too_few_frames_is_validation_error() {
        let mut store = MemoryStore::new();
        store.write_all("im", Array3::zeros((5, 4, 4)).into_dyn());

        let err = MeanBackground {
            shift: Some(4),
            cubes_per_position: 1,
            image_in_tag: "im".into(),
            image_out_tag: "out".into(),
        }
        .run(&mut store)
        .unwrap_err();

        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[test]
    fn test_frame_count_attribute_drives_block_layout() {
        // Cubes of uneven length: 2, 3, 2 frames with values 1, 2, 3.
        let mut stack = Array3::zeros((7, 4, 4));
        for i in 0..2 {
            stack.index_axis_mut(Axis(0), i).fill(1.0);
        }
        for i in 2..5 {
            stack.index_axis_mut(Axis(0), i).fill(2.0);
        }
        for i in 5..7 {
            stack.index_axis_mut(Axis(0), i).fill(3.0);
        }
        let mut store = MemoryStore::new();
        store.write_all("im", stack.into_dyn());
        store.set_attribute(
            "im",
            attr::NFRAMES,
            AttributeValue::IntSeq(vec![2, 3, 2]),
            false,
        );

        MeanBackground {
            shift: None,
            cubes_per_position: 1,
            image_in_tag: "im".into(),
            image_out_tag: "out".into(),
        }
        .run(&mut store)
        .unwrap();

        let out = store.read_all("out").unwrap();
        // Middle cube subtracts the average of cube means 1 and 3.
        assert!((out[[3, 0, 0]] - 0.0).abs() < 1e-12);
        // First cube subtracts the middle cube mean.
        assert!((out[[0, 0, 0]] - (1.0 - 2.0)).abs() < 1e-12);
    }

    #[test]
    fn test_simple_background_circular_shift() {
        let mut stack = Array3::zeros((4, 2, 2));
        for i in 0..4 {
            stack.index_axis_mut(Axis(0), i).fill(i as f64);
        }
        let mut store = MemoryStore::new();
        store.write_all("im", stack.into_dyn());

        SimpleBackground {
            shift: 2,
            image_in_tag: "im".into(),
            image_out_tag: "out".into(),
            output: OutputMode::CreateNew,
        }
        .run(&mut store)
        .unwrap();

        let out = store.read_all("out").unwrap();
        assert_eq!(out[[0, 0, 0]], 0.0 - 2.0);
        assert_eq!(out[[1, 0, 0]], 1.0 - 3.0);
        assert_eq!(out[[2, 0, 0]], 2.0 - 0.0);
        assert_eq!(out[[3, 0, 0]], 3.0 - 1.0);
    }

    #[test]
    fn test_simple_background_in_place_requires_same_tag() {
        let mut store = MemoryStore::new();
        store.write_all("im", Array3::zeros((4, 2, 2)).into_dyn());

        let err = SimpleBackground {
            shift: 1,
            image_in_tag: "im".into(),
            image_out_tag: "other".into(),
            output: OutputMode::OverwriteInPlace,
        }
        .run(&mut store)
        .unwrap_err();

        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[test]
    fn test_sky_cube_collapse_means_per_cube() {
        let mut stack = Array3::zeros((5, 2, 2));
        for i in 0..5 {
            stack.index_axis_mut(Axis(0), i).fill(i as f64);
        }
        let mut store = MemoryStore::new();
        store.write_all("sky", stack.into_dyn());
        store.set_attribute("sky", attr::NFRAMES, AttributeValue::IntSeq(vec![2, 3]), false);

        SkyCubeCollapse {
            sky_in_tag: "sky".into(),
            sky_out_tag: "sky_mean".into(),
        }
        .run(&mut store)
        .unwrap();

        let out = store.read_all("sky_mean").unwrap();
        assert_eq!(out.shape(), &[2, 2, 2]);
        assert!((out[[0, 0, 0]] - 0.5).abs() < 1e-12);
        assert!((out[[1, 0, 0]] - 3.0).abs() < 1e-12);

        let counts = store.get_attribute("sky_mean", attr::NFRAMES).unwrap();
        assert_eq!(counts.as_int_seq(attr::NFRAMES).unwrap(), &[1, 1]);
    }

    #[test]
    fn test_constant_background_mean_recovery() {
        // Constant background under a per-pixel source pattern; interior
        // blocks recover the pattern to machine precision.
        let mut background = Array2::zeros((8, 8));
        for ((r, c), value) in background.indexed_iter_mut() {
            *value = 40.0 + r as f64 * 0.5 + c as f64 * 0.25;
        }
        let mut signal = Array2::zeros((8, 8));
        signal[[4, 4]] = 12.0;

        let mut stack = Array3::zeros((16, 8, 8));
        for i in 0..16 {
            let block = i / 4;
            let mut frame = stack.index_axis_mut(Axis(0), i);
            frame.assign(&background);
            if block % 2 == 0 {
                frame += &signal;
            }
        }
        let mut store = MemoryStore::new();
        store.write_all("im", stack.into_dyn());

        MeanBackground {
            shift: Some(4),
            cubes_per_position: 1,
            image_in_tag: "im".into(),
            image_out_tag: "out".into(),
        }
        .run(&mut store)
        .unwrap();

        let out = store.read_all("out").unwrap();
        for i in 8..12 {
            for r in 0..8 {
                for c in 0..8 {
                    let expected = signal[[r, c]];
                    assert!(
                        (out[[i, r, c]] - expected).abs() < 1e-10,
                        "frame {i} pixel ({r}, {c})"
                    );
                }
            }
        }
    }
}
