//! Frame stack storage abstraction.
//!
//! All pipeline stages read and write through [`FrameStore`]: an ordered,
//! indexable array store keyed by tag, with typed attributes attached per tag
//! and an append-only provenance trail. Stacks are stored with dynamic
//! dimensionality so that a tag can hold a cube of frames (n, h, w), a single
//! image (h, w), or a table of records (n, k); indexing and appends always act
//! along the leading axis.
//!
//! The store is a single-writer-per-tag resource: one pipeline stage owns one
//! output tag for the duration of its run, and nothing here locks.

use ndarray::{Array2, Array3, ArrayD, Ix2, Ix3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod memory;

pub use memory::MemoryStore;

/// Well-known attribute names used by the pipeline stages.
pub mod attr {
    /// Per-cube frame count (non-static integer sequence).
    pub const NFRAMES: &str = "nframes";
    /// Per-frame parallactic angle in degrees (non-static float sequence).
    pub const PARANG: &str = "parang";
    /// Detector pixel scale in arcsec per pixel (static float).
    pub const PIXSCALE: &str = "pixscale";
    /// Per-cube exposure sequence number (non-static integer sequence).
    pub const EXP_NO: &str = "exp_no";
    /// Per-frame star pixel position (non-static position sequence).
    pub const STAR_POSITION: &str = "star_position";
}

/// Errors from store-level lookups and writes.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The tag holds no data.
    #[error("no data found for tag '{0}'")]
    NotFound(String),

    /// The requested attribute is absent from the tag.
    #[error("attribute '{name}' not found on tag '{tag}'")]
    MissingAttribute { tag: String, name: String },

    /// The attribute exists but holds a different kind of value.
    #[error("attribute '{name}' is of kind {found}, expected {expected}")]
    AttributeType {
        name: String,
        expected: &'static str,
        found: &'static str,
    },

    /// Appended data does not match the trailing dimensions of the stack.
    #[error("shape mismatch on tag '{tag}': stack frames are {expected:?}, appended {found:?}")]
    ShapeMismatch {
        tag: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    /// Frame index or range outside the stored stack.
    #[error("index range {start}..{end} out of bounds for tag '{tag}' with {len} frames")]
    OutOfBounds {
        tag: String,
        start: usize,
        end: usize,
        len: usize,
    },

    /// The stored data does not have the dimensionality a stage requires.
    #[error("tag '{tag}' holds {found}-dimensional data, expected {expected} dimensions")]
    Dimensionality {
        tag: String,
        expected: usize,
        found: usize,
    },
}

/// Typed attribute value, either static (one value per tag) or non-static
/// (one element per logical unit, cube or frame depending on the attribute).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    Int(i64),
    Float(f64),
    Text(String),
    IntSeq(Vec<i64>),
    FloatSeq(Vec<f64>),
    /// Per-frame (x, y) pixel positions.
    PositionSeq(Vec<(f64, f64)>),
}

impl AttributeValue {
    pub fn kind(&self) -> &'static str {
        match self {
            AttributeValue::Int(_) => "int",
            AttributeValue::Float(_) => "float",
            AttributeValue::Text(_) => "text",
            AttributeValue::IntSeq(_) => "int sequence",
            AttributeValue::FloatSeq(_) => "float sequence",
            AttributeValue::PositionSeq(_) => "position sequence",
        }
    }

    /// Scalar float value; integer scalars coerce.
    pub fn as_float(&self, name: &str) -> Result<f64, StoreError> {
        match self {
            AttributeValue::Float(v) => Ok(*v),
            AttributeValue::Int(v) => Ok(*v as f64),
            other => Err(StoreError::AttributeType {
                name: name.to_string(),
                expected: "float",
                found: other.kind(),
            }),
        }
    }

    pub fn as_int_seq(&self, name: &str) -> Result<&[i64], StoreError> {
        match self {
            AttributeValue::IntSeq(v) => Ok(v),
            other => Err(StoreError::AttributeType {
                name: name.to_string(),
                expected: "int sequence",
                found: other.kind(),
            }),
        }
    }

    pub fn as_float_seq(&self, name: &str) -> Result<&[f64], StoreError> {
        match self {
            AttributeValue::FloatSeq(v) => Ok(v),
            other => Err(StoreError::AttributeType {
                name: name.to_string(),
                expected: "float sequence",
                found: other.kind(),
            }),
        }
    }

    pub fn as_positions(&self, name: &str) -> Result<&[(f64, f64)], StoreError> {
        match self {
            AttributeValue::PositionSeq(v) => Ok(v),
            other => Err(StoreError::AttributeType {
                name: name.to_string(),
                expected: "position sequence",
                found: other.kind(),
            }),
        }
    }
}

/// Ordered, indexable array storage with per-tag attributes and provenance.
pub trait FrameStore {
    /// Dimensions of the data stored under `tag`.
    fn shape(&self, tag: &str) -> Result<Vec<usize>, StoreError>;

    /// Full contents of `tag`.
    fn read_all(&self, tag: &str) -> Result<ArrayD<f64>, StoreError>;

    /// Slice `start..end` along the leading axis.
    fn read_range(&self, tag: &str, start: usize, end: usize) -> Result<ArrayD<f64>, StoreError>;

    /// Single element along the leading axis (one dimension lower).
    fn read_frame(&self, tag: &str, index: usize) -> Result<ArrayD<f64>, StoreError>;

    /// Replace the contents of `tag`.
    fn write_all(&mut self, tag: &str, data: ArrayD<f64>);

    /// Overwrite a single element along the leading axis in place.
    fn write_frame(&mut self, tag: &str, index: usize, frame: ArrayD<f64>)
        -> Result<(), StoreError>;

    /// Extend `tag` along the leading axis. Data one dimension lower than the
    /// stack is treated as a single new element. Trailing dimensions must
    /// match the existing stack.
    fn append(&mut self, tag: &str, data: ArrayD<f64>) -> Result<(), StoreError>;

    fn get_attribute(&self, tag: &str, name: &str) -> Result<AttributeValue, StoreError>;

    fn has_attribute(&self, tag: &str, name: &str) -> bool;

    fn set_attribute(&mut self, tag: &str, name: &str, value: AttributeValue, is_static: bool);

    /// Bulk-copy all attributes (and their static flags) from one tag to another.
    fn copy_attributes(&mut self, src_tag: &str, dst_tag: &str) -> Result<(), StoreError>;

    /// Append a free-text audit record; never overwritten.
    fn append_provenance(&mut self, tag: &str, category: &str, message: &str);

    /// Drop data, attributes and provenance stored under `tag`.
    fn clear(&mut self, tag: &str);

    /// Number of elements along the leading axis.
    fn num_frames(&self, tag: &str) -> Result<usize, StoreError> {
        Ok(self.shape(tag)?[0])
    }
}

/// Read a tag as a cube of frames (n, h, w).
pub fn read_cube<S: FrameStore + ?Sized>(
    store: &S,
    tag: &str,
    start: usize,
    end: usize,
) -> Result<Array3<f64>, StoreError> {
    let data = store.read_range(tag, start, end)?;
    let ndim = data.ndim();
    data.into_dimensionality::<Ix3>()
        .map_err(|_| StoreError::Dimensionality {
            tag: tag.to_string(),
            expected: 3,
            found: ndim,
        })
}

/// Read one frame of a cube as a 2-D image.
pub fn read_image<S: FrameStore + ?Sized>(
    store: &S,
    tag: &str,
    index: usize,
) -> Result<Array2<f64>, StoreError> {
    let data = store.read_frame(tag, index)?;
    let ndim = data.ndim();
    data.into_dimensionality::<Ix2>()
        .map_err(|_| StoreError::Dimensionality {
            tag: tag.to_string(),
            expected: 2,
            found: ndim,
        })
}

/// Output-tag write policy, decided once at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputMode {
    /// Replace the output tag with freshly computed frames.
    CreateNew,
    /// Overwrite the input tag frame by frame.
    OverwriteInPlace,
}

/// Streaming writer for chunked output: the first chunk replaces the tag,
/// every later chunk appends.
#[derive(Debug)]
pub struct StreamWriter {
    tag: String,
    started: bool,
}

impl StreamWriter {
    pub fn new(tag: impl Into<String>) -> Self {
        StreamWriter {
            tag: tag.into(),
            started: false,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn push<S: FrameStore + ?Sized>(
        &mut self,
        store: &mut S,
        chunk: Array3<f64>,
    ) -> Result<(), StoreError> {
        let chunk = chunk.into_dyn();
        if self.started {
            store.append(&self.tag, chunk)
        } else {
            store.write_all(&self.tag, chunk);
            self.started = true;
            Ok(())
        }
    }

    /// Append a table row, creating the table on first use.
    pub fn push_row<S: FrameStore + ?Sized>(
        &mut self,
        store: &mut S,
        row: &[f64],
    ) -> Result<(), StoreError> {
        let row = ArrayD::from_shape_vec(vec![1, row.len()], row.to_vec())
            .expect("row shape is consistent by construction");
        if self.started {
            store.append(&self.tag, row)
        } else {
            store.write_all(&self.tag, row);
            self.started = true;
            Ok(())
        }
    }
}
