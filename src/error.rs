//! Error types for the mail2report library.
//!
//! Three distinct error types reflect three distinct blast radii:
//!
//! * [`PipelineError`] — **Cycle-fatal**: the mailbox cycle cannot proceed at
//!   all (bad credentials, unreachable host, invalid configuration). Returned
//!   as `Err(PipelineError)` from the top-level `run_cycle*` functions; no
//!   attachment is processed and no outcome record is emitted.
//!
//! * [`AttachmentError`] — **Attachment-fatal**: a single attachment failed
//!   (truncated download, unparseable PDF, unwritable report) but every other
//!   attachment in the cycle is unaffected. Converted into a
//!   [`crate::outcome::OutcomeRecord::Failure`] by the orchestrator, never
//!   propagated past it.
//!
//! * [`ImageError`] — **Image-local**: a single embedded image could not be
//!   decoded or normalised. The image is dropped and counted; the rest of the
//!   attachment's image set still produces a report.

use std::path::PathBuf;
use thiserror::Error;

/// All cycle-fatal errors returned by the mail2report library.
///
/// Attachment-level failures use [`AttachmentError`] and become Failure
/// outcome records rather than propagating here.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Mailbox errors ────────────────────────────────────────────────────
    /// The mail server rejected the supplied credentials.
    #[error("Mailbox authentication failed for '{user}': {detail}\nCheck the account name and secret.")]
    Auth { user: String, detail: String },

    /// The mail server could not be reached, or the session broke mid-cycle.
    #[error("Mailbox unreachable at '{host}:{port}': {detail}")]
    Network {
        host: String,
        port: u16,
        detail: String,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error (panicked worker task, poisoned lock).
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A failure scoped to one attachment.
///
/// The orchestrator converts these into Failure outcome records; other
/// attachments in the same cycle continue unaffected.
#[derive(Debug, Error)]
pub enum AttachmentError {
    /// Storage read/write failed, or the attachment body could not be
    /// retrieved in full. Partial files are deleted before this surfaces.
    #[error("I/O failure for attachment '{name}': {detail}")]
    Io { name: String, detail: String },

    /// The PDF's cross-reference structure could not be parsed.
    #[error("Corrupt PDF document '{path}': {detail}")]
    CorruptDocument { path: PathBuf, detail: String },

    /// The report document could not be written. The downloaded attachment
    /// is preserved so the report can be regenerated later.
    #[error("Report rendering failed: {detail}")]
    Render { detail: String },
}

/// A non-fatal failure for a single embedded image.
///
/// The image is dropped from the report and counted; extraction and
/// normalisation of the remaining images continue.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum ImageError {
    /// The image payload uses an encoding the decoder cannot handle
    /// (e.g. CCITTFax, JBIG2, an exotic colour space).
    #[error("Unsupported image encoding on page {page}: {detail}")]
    UnsupportedFormat { page: usize, detail: String },

    /// The payload claimed a supported encoding but failed to decode.
    #[error("Image decode failed on page {page}: {detail}")]
    Decode { page: usize, detail: String },

    /// The normalised image file could not be written.
    #[error("Image write failed on page {page}: {detail}")]
    Io { page: usize, detail: String },
}
