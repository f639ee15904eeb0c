//! Outcome records and cycle statistics.
//!
//! One [`OutcomeRecord`] is emitted per processed attachment (none for
//! qualifying emails that carried no PDF at all). Records are immutable once
//! created and serialisable, so the calling collaborator can persist them
//! for operator review without further interpretation. A single three-way
//! variant replaces separate warning/error sinks: every attachment ends up
//! in exactly one bucket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// The structured result of processing one attachment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeRecord {
    /// A report was generated from at least one normalised image.
    Success {
        /// Subject of the originating email.
        email_subject: String,
        /// Path of the generated report PDF.
        report_path: PathBuf,
        /// Number of images embedded in the report.
        image_count: usize,
        /// Images extracted but dropped during normalisation (warning-level
        /// note; a non-zero count still yields a Success).
        dropped_images: usize,
        /// Path of the stored source attachment.
        source_pdf: PathBuf,
    },

    /// The attachment was processed but produced no report
    /// (zero extractable images, or every image failed normalisation).
    Warning {
        reason: String,
        email_subject: String,
        /// Path of the stored source attachment, kept for inspection.
        source_pdf: PathBuf,
    },

    /// The attachment could not be processed at all.
    Failure {
        reason: String,
        email_subject: String,
    },
}

impl OutcomeRecord {
    /// Subject of the email this record belongs to.
    pub fn email_subject(&self) -> &str {
        match self {
            OutcomeRecord::Success { email_subject, .. }
            | OutcomeRecord::Warning { email_subject, .. }
            | OutcomeRecord::Failure { email_subject, .. } => email_subject,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, OutcomeRecord::Success { .. })
    }

    pub fn is_warning(&self) -> bool {
        matches!(self, OutcomeRecord::Warning { .. })
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, OutcomeRecord::Failure { .. })
    }
}

/// Aggregate statistics for one mailbox cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CycleStats {
    /// Qualifying (unseen, sender-matching) emails returned by the mailbox.
    pub emails_fetched: usize,
    /// PDF attachments that entered the processing pipeline.
    pub attachments_processed: usize,
    /// Reports written to the report root.
    pub reports_generated: usize,
    /// Attachments that ended in a Warning record.
    pub warnings: usize,
    /// Attachments that ended in a Failure record.
    pub failures: usize,
    /// Images yielded by extraction across all attachments.
    pub images_extracted: usize,
    /// Images dropped during normalisation across all attachments.
    pub images_dropped: usize,
    /// Wall-clock duration of the cycle in milliseconds.
    pub duration_ms: u64,
}

/// The complete account of one mailbox cycle.
///
/// `records` covers every email that was marked seen in the cycle: each PDF
/// attachment contributes exactly one record, in email order then attachment
/// order. Emails with zero PDF attachments are marked seen and contribute
/// nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub records: Vec<OutcomeRecord>,
    pub stats: CycleStats,
    /// When the cycle finished.
    pub completed_at: DateTime<Utc>,
}

impl CycleReport {
    /// Iterate only the Failure records (operator review shortcut).
    pub fn failures(&self) -> impl Iterator<Item = &OutcomeRecord> {
        self.records.iter().filter(|r| r.is_failure())
    }
}
