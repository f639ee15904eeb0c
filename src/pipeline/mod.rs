//! Pipeline stages for attachment-to-report processing.
//!
//! Stages in execution order:
//!
//! 1. [`store`] — persist a downloaded attachment body under the attachment
//!    root with a collision-free name
//! 2. [`extract`] — walk the PDF object graph and yield embedded raster
//!    images in deterministic page-then-discovery order
//! 3. [`normalize`] — decode, resize, contrast-normalise and re-encode each
//!    image to a file bounded by the report's printable area
//! 4. [`report`] — assemble the normalised images into one captioned PDF
//!
//! Each stage owns its error scope: `store`/`extract`/`report` failures are
//! attachment-fatal, `normalize` failures drop a single image.

pub mod extract;
pub mod normalize;
pub mod report;
pub mod store;

pub use extract::{extract_images, ColorSpaceKind, ExtractedImage, Extraction, ImageEncoding};
pub use normalize::{normalize, ProcessedImage};
pub use report::{generate_report, GeneratedReport, ReportMetadata};
pub use store::{store_attachment, StoredAttachment};
