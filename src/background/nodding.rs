//! Sky subtraction for nodding observations.
//!
//! Nodding alternates between on-source and sky-only pointings. Each science
//! exposure gets the sky frame recorded closest in time, resolved through the
//! merged [`TimeStampIndex`] with directional fallback.

use tracing::info;

use crate::error::{PipelineError, Result};
use crate::store::{read_cube, FrameStore, StreamWriter};
use crate::timeline::{resolve, FrameRole, LookupMode, TimeStampIndex};

/// Time-stamp-driven sky subtraction.
#[derive(Debug, Clone)]
pub struct NoddingBackground {
    pub sky_in_tag: String,
    pub science_in_tag: String,
    pub image_out_tag: String,
    pub mode: LookupMode,
}

impl NoddingBackground {
    pub fn run<S: FrameStore + ?Sized>(&self, store: &mut S) -> Result<()> {
        if self.image_out_tag == self.sky_in_tag || self.image_out_tag == self.science_in_tag {
            return Err(PipelineError::configuration(
                "nodding sky subtraction requires an output tag distinct from both inputs",
            ));
        }

        let index = TimeStampIndex::build(store, &self.sky_in_tag, &self.science_in_tag)?;
        info!(
            science = %self.science_in_tag,
            sky = %self.sky_in_tag,
            entries = index.len(),
            "subtracting nodding sky background"
        );

        store.clear(&self.image_out_tag);
        let mut writer = StreamWriter::new(&self.image_out_tag);

        for (position, entry) in index.entries().iter().enumerate() {
            if entry.role == FrameRole::Background {
                continue;
            }

            let sky = resolve(&index, position, store, &self.sky_in_tag, self.mode)?;
            let mut science = read_cube(
                store,
                &self.science_in_tag,
                entry.frames.start,
                entry.frames.end,
            )?;
            for mut frame in science.outer_iter_mut() {
                frame -= &sky;
            }
            writer.push(store, science)?;
        }

        store.copy_attributes(&self.science_in_tag, &self.image_out_tag)?;
        store.append_provenance(&self.image_out_tag, "background", "nodding sky subtraction");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{attr, AttributeValue, MemoryStore};
    use ndarray::Array3;

    #[test]
    fn test_nodding_subtracts_time_matched_sky() {
        let mut store = MemoryStore::new();

        let mut sky = Array3::zeros((2, 2, 2));
        sky.index_axis_mut(ndarray::Axis(0), 0).fill(10.0);
        sky.index_axis_mut(ndarray::Axis(0), 1).fill(20.0);
        store.write_all("sky", sky.into_dyn());
        store.set_attribute("sky", attr::EXP_NO, AttributeValue::IntSeq(vec![1, 5]), false);

        // Two science exposures of two frames each, between the sky frames.
        let mut science = Array3::zeros((4, 2, 2));
        science.index_axis_mut(ndarray::Axis(0), 0).fill(110.0);
        science.index_axis_mut(ndarray::Axis(0), 1).fill(111.0);
        science.index_axis_mut(ndarray::Axis(0), 2).fill(220.0);
        science.index_axis_mut(ndarray::Axis(0), 3).fill(221.0);
        store.write_all("science", science.into_dyn());
        store.set_attribute(
            "science",
            attr::EXP_NO,
            AttributeValue::IntSeq(vec![2, 4]),
            false,
        );
        store.set_attribute(
            "science",
            attr::NFRAMES,
            AttributeValue::IntSeq(vec![2, 2]),
            false,
        );

        NoddingBackground {
            sky_in_tag: "sky".into(),
            science_in_tag: "science".into(),
            image_out_tag: "cleaned".into(),
            mode: LookupMode::Previous,
        }
        .run(&mut store)
        .unwrap();

        let out = store.read_all("cleaned").unwrap();
        assert_eq!(out.shape(), &[4, 2, 2]);
        // Both science exposures resolve the earlier sky frame (value 10).
        assert_eq!(out[[0, 0, 0]], 100.0);
        assert_eq!(out[[1, 0, 0]], 101.0);
        assert_eq!(out[[2, 0, 0]], 210.0);
        assert_eq!(out[[3, 0, 0]], 211.0);
    }

    #[test]
    fn test_nodding_both_mode_averages_neighbors() {
        let mut store = MemoryStore::new();

        let mut sky = Array3::zeros((2, 2, 2));
        sky.index_axis_mut(ndarray::Axis(0), 0).fill(10.0);
        sky.index_axis_mut(ndarray::Axis(0), 1).fill(30.0);
        store.write_all("sky", sky.into_dyn());
        store.set_attribute("sky", attr::EXP_NO, AttributeValue::IntSeq(vec![1, 5]), false);

        let mut science = Array3::zeros((1, 2, 2));
        science.index_axis_mut(ndarray::Axis(0), 0).fill(100.0);
        store.write_all("science", science.into_dyn());
        store.set_attribute("science", attr::EXP_NO, AttributeValue::IntSeq(vec![3]), false);
        store.set_attribute("science", attr::NFRAMES, AttributeValue::IntSeq(vec![1]), false);

        NoddingBackground {
            sky_in_tag: "sky".into(),
            science_in_tag: "science".into(),
            image_out_tag: "cleaned".into(),
            mode: LookupMode::Both,
        }
        .run(&mut store)
        .unwrap();

        let out = store.read_all("cleaned").unwrap();
        assert_eq!(out[[0, 0, 0]], 100.0 - 20.0);
    }
}
