//! Time-ordered index over background and source exposures.
//!
//! Nodding observations interleave on-source exposures with sky-only
//! exposures. To subtract the sky frame taken closest in time, both frame
//! collections are merged into one index ordered by exposure number, and a
//! lookup resolves the role-appropriate sky frame for a given source entry
//! with directional fallback.
//!
//! The index is a plain value type and the lookups are free functions taking
//! the index and position explicitly; nothing captures hidden mutable state.

use std::ops::Range;

use ndarray::Array2;

use crate::error::{PipelineError, Result};
use crate::store::{attr, read_image, FrameStore};

/// Role of an entry in the merged timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameRole {
    /// Sky-only exposure, usable as background.
    Background,
    /// On-source exposure.
    Source,
}

/// One exposure in the merged timeline. Background entries span a single
/// frame of the background stack; source entries span every frame of the
/// exposure in the source stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeStampEntry {
    pub time: i64,
    pub role: FrameRole,
    pub frames: Range<usize>,
}

/// Direction preference when resolving a background frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupMode {
    /// First background entry at or after the source entry, falling back to
    /// the nearest previous one.
    Next,
    /// Nearest background entry before the source entry, falling back to the
    /// first one after it.
    Previous,
    /// Elementwise average of the previous and next resolutions, each with
    /// its own opposite-direction fallback.
    Both,
}

/// Merged, time-sorted sequence of background and source entries.
#[derive(Debug, Clone)]
pub struct TimeStampIndex {
    entries: Vec<TimeStampEntry>,
}

impl TimeStampIndex {
    /// Merge the exposure numbers of a background-role tag and a source-role
    /// tag into one sorted index.
    ///
    /// Background entries are one per frame; source entries cover frame
    /// ranges accumulated from the per-exposure frame counts. The sort is
    /// stable, so entries with equal time keep their insertion order
    /// (background first).
    ///
    /// # Errors
    ///
    /// `Configuration` if the merged sequence contains no background entries,
    /// `Validation` if the source frame counts do not line up with its
    /// exposure numbers.
    pub fn build<S: FrameStore + ?Sized>(
        store: &S,
        background_tag: &str,
        source_tag: &str,
    ) -> Result<Self> {
        let mut entries = Vec::new();

        let bg_exp = store.get_attribute(background_tag, attr::EXP_NO)?;
        for (i, &time) in bg_exp.as_int_seq(attr::EXP_NO)?.iter().enumerate() {
            entries.push(TimeStampEntry {
                time,
                role: FrameRole::Background,
                frames: i..i + 1,
            });
        }

        let src_exp = store.get_attribute(source_tag, attr::EXP_NO)?;
        let src_exp = src_exp.as_int_seq(attr::EXP_NO)?;
        let nframes = store.get_attribute(source_tag, attr::NFRAMES)?;
        let nframes = nframes.as_int_seq(attr::NFRAMES)?;
        if src_exp.len() != nframes.len() {
            return Err(PipelineError::validation(format!(
                "source tag '{source_tag}' has {} exposure numbers but {} frame counts",
                src_exp.len(),
                nframes.len()
            )));
        }

        let mut current = 0usize;
        for (&time, &count) in src_exp.iter().zip(nframes) {
            let count = count as usize;
            entries.push(TimeStampEntry {
                time,
                role: FrameRole::Source,
                frames: current..current + count,
            });
            current += count;
        }

        entries.sort_by_key(|entry| entry.time);

        if !entries.iter().any(|e| e.role == FrameRole::Background) {
            return Err(PipelineError::configuration(format!(
                "timeline of '{background_tag}' and '{source_tag}' contains no background entries"
            )));
        }

        Ok(TimeStampIndex { entries })
    }

    pub fn entries(&self) -> &[TimeStampEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn background_at_or_after(&self, position: usize) -> Option<&TimeStampEntry> {
        self.entries[position..]
            .iter()
            .find(|e| e.role == FrameRole::Background)
    }

    fn background_before(&self, position: usize) -> Option<&TimeStampEntry> {
        self.entries[..position]
            .iter()
            .rev()
            .find(|e| e.role == FrameRole::Background)
    }
}

/// Resolve the first background frame at or after `position`, falling back to
/// the nearest previous one.
pub fn resolve_next<S: FrameStore + ?Sized>(
    index: &TimeStampIndex,
    position: usize,
    store: &S,
    background_tag: &str,
) -> Result<Array2<f64>> {
    let entry = index
        .background_at_or_after(position)
        .or_else(|| index.background_before(position))
        .ok_or_else(|| no_background(background_tag))?;
    Ok(read_image(store, background_tag, entry.frames.start)?)
}

/// Resolve the nearest background frame before `position`, falling back to
/// the first one after it.
pub fn resolve_previous<S: FrameStore + ?Sized>(
    index: &TimeStampIndex,
    position: usize,
    store: &S,
    background_tag: &str,
) -> Result<Array2<f64>> {
    let entry = index
        .background_before(position)
        .or_else(|| index.background_at_or_after(position))
        .ok_or_else(|| no_background(background_tag))?;
    Ok(read_image(store, background_tag, entry.frames.start)?)
}

/// Resolve both directions independently and average the two frames. When
/// both directions fall back to the same physical side, that frame is
/// averaged with itself.
pub fn resolve_both<S: FrameStore + ?Sized>(
    index: &TimeStampIndex,
    position: usize,
    store: &S,
    background_tag: &str,
) -> Result<Array2<f64>> {
    let previous = resolve_previous(index, position, store, background_tag)?;
    let next = resolve_next(index, position, store, background_tag)?;
    Ok((previous + next) / 2.0)
}

/// Resolve a background frame for the entry at `position` per `mode`.
pub fn resolve<S: FrameStore + ?Sized>(
    index: &TimeStampIndex,
    position: usize,
    store: &S,
    background_tag: &str,
    mode: LookupMode,
) -> Result<Array2<f64>> {
    match mode {
        LookupMode::Next => resolve_next(index, position, store, background_tag),
        LookupMode::Previous => resolve_previous(index, position, store, background_tag),
        LookupMode::Both => resolve_both(index, position, store, background_tag),
    }
}

fn no_background(tag: &str) -> PipelineError {
    PipelineError::configuration(format!("timeline of '{tag}' contains no background entries"))
}
