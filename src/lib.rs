//! Background estimation and companion characterization for high-contrast
//! imaging stacks.
//!
//! The crate operates on stacks of detector frames held in a tagged
//! [`store::FrameStore`]. Processing steps read one or more input tags,
//! stream their results to output tags in bounded-memory chunks, and carry
//! the non-static attributes of their inputs forward:
//!
//! - [`background`]: sky and instrument background removal for dithered and
//!   nodding observations, including a PCA model of the background field.
//! - [`timeline`]: merges background and science exposures into a single
//!   time-ordered index used to pair each science cube with sky frames.
//! - [`inject`]: adds a scaled, shifted copy of the reference PSF into every
//!   frame, tracking the parallactic rotation.
//! - [`fluxpos`]: measures a companion's position and contrast by negative
//!   injection and simplex minimization over a PSF-subtraction residual.

pub mod background;
pub mod error;
pub mod fluxpos;
pub mod image;
pub mod inject;
pub mod interp;
pub mod simplex;
pub mod store;
pub mod timeline;

pub use error::{PipelineError, Result};
pub use store::{FrameStore, MemoryStore, OutputMode};
