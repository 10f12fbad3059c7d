//! In-memory reference implementation of [`FrameStore`].
//!
//! Backs all unit and integration tests. A persistent implementation only
//! needs to reproduce the same leading-axis indexing and attribute semantics.

use std::collections::HashMap;

use ndarray::{ArrayD, Axis};

use super::{AttributeValue, FrameStore, StoreError};

#[derive(Debug, Clone, Default)]
struct Entry {
    data: Option<ArrayD<f64>>,
    attributes: HashMap<String, (AttributeValue, bool)>,
    provenance: Vec<(String, String)>,
}

/// HashMap-backed frame store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: HashMap<String, Entry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Provenance records appended to `tag`, in insertion order.
    pub fn provenance(&self, tag: &str) -> &[(String, String)] {
        self.entries
            .get(tag)
            .map(|e| e.provenance.as_slice())
            .unwrap_or(&[])
    }

    fn data(&self, tag: &str) -> Result<&ArrayD<f64>, StoreError> {
        self.entries
            .get(tag)
            .and_then(|e| e.data.as_ref())
            .ok_or_else(|| StoreError::NotFound(tag.to_string()))
    }

    fn entry_mut(&mut self, tag: &str) -> &mut Entry {
        self.entries.entry(tag.to_string()).or_default()
    }
}

impl FrameStore for MemoryStore {
    fn shape(&self, tag: &str) -> Result<Vec<usize>, StoreError> {
        Ok(self.data(tag)?.shape().to_vec())
    }

    fn read_all(&self, tag: &str) -> Result<ArrayD<f64>, StoreError> {
        Ok(self.data(tag)?.clone())
    }

    fn read_range(&self, tag: &str, start: usize, end: usize) -> Result<ArrayD<f64>, StoreError> {
        let data = self.data(tag)?;
        let len = data.len_of(Axis(0));
        if start > end || end > len {
            return Err(StoreError::OutOfBounds {
                tag: tag.to_string(),
                start,
                end,
                len,
            });
        }
        Ok(data.slice_axis(Axis(0), (start..end).into()).to_owned())
    }

    fn read_frame(&self, tag: &str, index: usize) -> Result<ArrayD<f64>, StoreError> {
        let data = self.data(tag)?;
        let len = data.len_of(Axis(0));
        if index >= len {
            return Err(StoreError::OutOfBounds {
                tag: tag.to_string(),
                start: index,
                end: index + 1,
                len,
            });
        }
        Ok(data.index_axis(Axis(0), index).to_owned())
    }

    fn write_all(&mut self, tag: &str, data: ArrayD<f64>) {
        self.entry_mut(tag).data = Some(data);
    }

    fn write_frame(
        &mut self,
        tag: &str,
        index: usize,
        frame: ArrayD<f64>,
    ) -> Result<(), StoreError> {
        let data = self
            .entries
            .get_mut(tag)
            .and_then(|e| e.data.as_mut())
            .ok_or_else(|| StoreError::NotFound(tag.to_string()))?;
        let len = data.len_of(Axis(0));
        if index >= len {
            return Err(StoreError::OutOfBounds {
                tag: tag.to_string(),
                start: index,
                end: index + 1,
                len,
            });
        }
        let expected = data.shape()[1..].to_vec();
        if frame.shape() != expected.as_slice() {
            return Err(StoreError::ShapeMismatch {
                tag: tag.to_string(),
                expected,
                found: frame.shape().to_vec(),
            });
        }
        data.index_axis_mut(Axis(0), index).assign(&frame);
        Ok(())
    }

    fn append(&mut self, tag: &str, data: ArrayD<f64>) -> Result<(), StoreError> {
        let existing = self
            .entries
            .get_mut(tag)
            .and_then(|e| e.data.as_mut())
            .ok_or_else(|| StoreError::NotFound(tag.to_string()))?;

        // A single element is promoted to a one-element stack.
        let data = if data.ndim() + 1 == existing.ndim() {
            data.insert_axis(Axis(0))
        } else {
            data
        };

        let expected = existing.shape()[1..].to_vec();
        if data.ndim() != existing.ndim() || data.shape()[1..] != expected[..] {
            return Err(StoreError::ShapeMismatch {
                tag: tag.to_string(),
                expected,
                found: data.shape().to_vec(),
            });
        }

        existing
            .append(Axis(0), data.view())
            .map_err(|_| StoreError::ShapeMismatch {
                tag: tag.to_string(),
                expected: existing.shape()[1..].to_vec(),
                found: data.shape().to_vec(),
            })
    }

    fn get_attribute(&self, tag: &str, name: &str) -> Result<AttributeValue, StoreError> {
        self.entries
            .get(tag)
            .and_then(|e| e.attributes.get(name))
            .map(|(value, _)| value.clone())
            .ok_or_else(|| StoreError::MissingAttribute {
                tag: tag.to_string(),
                name: name.to_string(),
            })
    }

    fn has_attribute(&self, tag: &str, name: &str) -> bool {
        self.entries
            .get(tag)
            .is_some_and(|e| e.attributes.contains_key(name))
    }

    fn set_attribute(&mut self, tag: &str, name: &str, value: AttributeValue, is_static: bool) {
        self.entry_mut(tag)
            .attributes
            .insert(name.to_string(), (value, is_static));
    }

    fn copy_attributes(&mut self, src_tag: &str, dst_tag: &str) -> Result<(), StoreError> {
        let attributes = self
            .entries
            .get(src_tag)
            .ok_or_else(|| StoreError::NotFound(src_tag.to_string()))?
            .attributes
            .clone();
        self.entry_mut(dst_tag).attributes.extend(attributes);
        Ok(())
    }

    fn append_provenance(&mut self, tag: &str, category: &str, message: &str) {
        self.entry_mut(tag)
            .provenance
            .push((category.to_string(), message.to_string()));
    }

    fn clear(&mut self, tag: &str) {
        self.entries.remove(tag);
    }
}
