//! # mail2report
//!
//! Watch a mailbox for messages carrying PDF attachments, extract the
//! embedded raster images from each PDF, normalise them, and reassemble
//! them into a captioned report PDF — recording a success/warning/failure
//! outcome per attachment for later review.
//!
//! ## Pipeline Overview
//!
//! ```text
//! Mailbox (IMAP)
//!  │
//!  ├─ 1. Fetch      unseen emails matching the sender allow-list
//!  ├─ 2. Download   each PDF attachment to the attachment root
//!  ├─ 3. Extract    embedded images via typed object-graph traversal
//!  ├─ 4. Normalize  resize + contrast-stretch, bounded to the page
//!  ├─ 5. Assemble   one captioned report PDF per attachment
//!  └─ 6. Record     Success / Warning / Failure outcome records
//! ```
//!
//! Failures are isolated per attachment: a corrupt PDF produces one Failure
//! record, an undecodable image drops out of its report, and only mailbox
//! authentication/connectivity errors abort a cycle.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mail2report::{run_cycle, MailboxCredentials, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::builder()
//!         .credentials(MailboxCredentials {
//!             host: "imap.example.com".into(),
//!             port: 993,
//!             user: "reports@example.com".into(),
//!             secret: std::env::var("MAIL2REPORT_SECRET")?,
//!             tls: true,
//!         })
//!         .allowed_sender("scanner@example.com")
//!         .attachment_root("uploads/pdfs")
//!         .report_root("output")
//!         .build()?;
//!
//!     let report = run_cycle(&config).await?;
//!     for record in &report.records {
//!         println!("{record:?}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `mail2report` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! mail2report = { version = "0.3", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod cycle;
pub mod error;
pub mod mailbox;
pub mod outcome;
pub mod pipeline;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ImageQuality, PageSize, PipelineConfig, PipelineConfigBuilder};
pub use cycle::{run_cycle, run_cycle_cancellable, run_cycle_sync, CancelToken};
pub use error::{AttachmentError, ImageError, PipelineError};
pub use mailbox::{
    AttachmentRef, ImapMailbox, IncomingEmail, Mailbox, MailboxCredentials, SenderFilter,
};
pub use outcome::{CycleReport, CycleStats, OutcomeRecord};
pub use pipeline::{
    ExtractedImage, GeneratedReport, ProcessedImage, ReportMetadata, StoredAttachment,
};
