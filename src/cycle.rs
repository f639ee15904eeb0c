//! Cycle orchestration: one poll-connect-fetch-process-disconnect run.
//!
//! Per cycle: `Idle → Connecting → Fetching → ProcessingEmail(i) →
//! Disconnecting → Idle`. Each attachment runs the sub-sequence
//! `Downloading → ExtractingImages → NormalizingImages → AssemblingReport →
//! Recording`; a failure while downloading or parsing the document aborts
//! that attachment with one Failure record, failures deeper in the sequence
//! follow the partial-success policy (drop the image, keep the report).
//!
//! ## Phases and the session
//!
//! Mailbox traffic (search, mark seen, body fetch) is serial on the single
//! session and happens first; the CPU/disk stages then fan out across
//! attachments via `buffer_unordered`, bounded by
//! [`PipelineConfig::concurrency`]. Results are re-keyed by their original
//! email/attachment order before records are assembled, so report order
//! never depends on completion order.
//!
//! ## Guarantees
//!
//! One mailbox connection per cycle; disconnect always runs, also on
//! failure paths; every email marked seen in the cycle is accounted for by
//! the emitted records (an email whose mark-seen fails is skipped entirely,
//! keeping delivery at-most-once). Only authentication and connectivity
//! errors escape this module — everything else becomes a record.

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::mailbox::{ImapMailbox, IncomingEmail, Mailbox};
use crate::outcome::{CycleReport, CycleStats, OutcomeRecord};
use crate::pipeline::report::ReportMetadata;
use crate::pipeline::store::StoredAttachment;
use crate::pipeline::{extract, normalize, report, store};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Cooperative cancellation handle for an in-flight cycle.
///
/// On cancellation, in-flight attachments clean up their partial files and
/// emit no record; already-completed attachments keep theirs, and the
/// mailbox is still disconnected.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Run one mailbox cycle to completion.
///
/// This is the primary entry point for the library.
///
/// # Errors
/// Returns `Err(PipelineError)` only for cycle-fatal conditions — bad
/// credentials, unreachable host, invalid configuration. Per-attachment
/// failures are reported through the records in [`CycleReport`].
pub async fn run_cycle(config: &PipelineConfig) -> Result<CycleReport, PipelineError> {
    run_cycle_cancellable(config, &CancelToken::new()).await
}

/// Synchronous wrapper around [`run_cycle`].
///
/// Creates a temporary tokio runtime internally.
pub fn run_cycle_sync(config: &PipelineConfig) -> Result<CycleReport, PipelineError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| PipelineError::Internal(format!("Failed to create tokio runtime: {e}")))?
        .block_on(run_cycle(config))
}

/// [`run_cycle`] with an external cancellation handle.
pub async fn run_cycle_cancellable(
    config: &PipelineConfig,
    cancel: &CancelToken,
) -> Result<CycleReport, PipelineError> {
    let total_start = Instant::now();
    info!(mailbox = %config.mailbox_name, "Starting mailbox cycle");

    // ── Step 1: Connect ──────────────────────────────────────────────────
    let mailbox = resolve_mailbox(config).await?;

    // ── Steps 2–4 run behind the connection so disconnect always follows ─
    let outcome = drive_cycle(mailbox.as_ref(), config, cancel).await;

    // ── Step 5: Disconnect, also after failures ──────────────────────────
    if let Err(e) = mailbox.disconnect().await {
        warn!("Mailbox disconnect failed: {e}");
    }

    let (records, mut stats) = outcome?;
    stats.duration_ms = total_start.elapsed().as_millis() as u64;

    info!(
        emails = stats.emails_fetched,
        reports = stats.reports_generated,
        warnings = stats.warnings,
        failures = stats.failures,
        duration_ms = stats.duration_ms,
        "Cycle complete"
    );

    Ok(CycleReport {
        records,
        stats,
        completed_at: Utc::now(),
    })
}

/// Resolve the mailbox, most-specific first: a pre-built instance wins,
/// otherwise connect with the configured credentials.
async fn resolve_mailbox(config: &PipelineConfig) -> Result<Arc<dyn Mailbox>, PipelineError> {
    if let Some(mailbox) = &config.mailbox {
        return Ok(Arc::clone(mailbox));
    }
    let creds = config.credentials.as_ref().ok_or_else(|| {
        PipelineError::InvalidConfig(
            "Either mailbox credentials or a pre-built mailbox is required".into(),
        )
    })?;
    let mailbox = ImapMailbox::connect(creds, &config.mailbox_name).await?;
    Ok(Arc::new(mailbox))
}

async fn drive_cycle(
    mailbox: &dyn Mailbox,
    config: &PipelineConfig,
    cancel: &CancelToken,
) -> Result<(Vec<OutcomeRecord>, CycleStats), PipelineError> {
    let mut stats = CycleStats::default();

    // ── Step 2: Fetch ────────────────────────────────────────────────────
    let emails = mailbox.fetch_qualifying(&config.sender_filter).await?;
    stats.emails_fetched = emails.len();
    if emails.is_empty() {
        info!("No new qualifying emails");
        return Ok((Vec::new(), stats));
    }

    // ── Step 3: Mailbox phase — mark seen and download, serially ────────
    let mut keyed_records: Vec<(usize, OutcomeRecord)> = Vec::new();
    let mut work: Vec<(usize, StoredAttachment)> = Vec::new();
    let mut order = 0usize;

    'emails: for email in &emails {
        if cancel.is_cancelled() {
            break;
        }

        // Mark seen exactly once per yielded email, before processing. An
        // email whose mark fails is skipped entirely: dropping it keeps
        // delivery at-most-once, processing it unmarked would not.
        if let Err(e) = mailbox.mark_seen(email.uid).await {
            warn!(uid = email.uid, "Mark-seen failed, skipping email: {e}");
            continue;
        }

        if email.attachments.is_empty() {
            debug!(uid = email.uid, subject = %email.subject, "No PDF attachments, ignoring");
            continue;
        }

        for attachment in &email.attachments {
            if cancel.is_cancelled() {
                break 'emails;
            }
            order += 1;
            stats.attachments_processed += 1;

            match download_attachment(mailbox, config, email, attachment).await {
                Ok(stored) => work.push((order, stored)),
                Err(e) => {
                    warn!(uid = email.uid, attachment = %attachment.filename, "Download failed: {e}");
                    keyed_records.push((
                        order,
                        OutcomeRecord::Failure {
                            reason: e.to_string(),
                            email_subject: email.subject.clone(),
                        },
                    ));
                }
            }
        }
    }

    // ── Step 4: CPU phase — bounded fan-out over stored attachments ─────
    let processed: Vec<Option<(usize, AttachmentOutcome)>> =
        stream::iter(work.into_iter().map(|(order, stored)| {
            let config = config.clone();
            let cancel = cancel.clone();
            async move {
                let result = tokio::task::spawn_blocking(move || {
                    process_attachment(stored, &config, &cancel)
                })
                .await;
                match result {
                    Ok(Some(outcome)) => Some((order, outcome)),
                    Ok(None) => None, // cancelled in flight, already cleaned up
                    Err(e) => Some((
                        order,
                        AttachmentOutcome {
                            record: OutcomeRecord::Failure {
                                reason: format!("processing task panicked: {e}"),
                                email_subject: String::new(),
                            },
                            images_extracted: 0,
                            images_dropped: 0,
                        },
                    )),
                }
            }
        }))
        .buffer_unordered(config.concurrency)
        .collect()
        .await;

    for (order, outcome) in processed.into_iter().flatten() {
        stats.images_extracted += outcome.images_extracted;
        stats.images_dropped += outcome.images_dropped;
        keyed_records.push((order, outcome.record));
    }

    // Report order must match email/attachment order, not completion order.
    keyed_records.sort_by_key(|(order, _)| *order);
    let records: Vec<OutcomeRecord> = keyed_records.into_iter().map(|(_, r)| r).collect();

    for record in &records {
        match record {
            OutcomeRecord::Success { .. } => stats.reports_generated += 1,
            OutcomeRecord::Warning { .. } => stats.warnings += 1,
            OutcomeRecord::Failure { .. } => stats.failures += 1,
        }
    }

    Ok((records, stats))
}

/// Fetch one attachment body through the session and persist it.
async fn download_attachment(
    mailbox: &dyn Mailbox,
    config: &PipelineConfig,
    email: &IncomingEmail,
    attachment: &crate::mailbox::AttachmentRef,
) -> Result<StoredAttachment, crate::error::AttachmentError> {
    let body = mailbox.fetch_attachment(email, attachment).await?;
    store::store_attachment(&config.attachment_root, email, attachment, &body)
}

struct AttachmentOutcome {
    record: OutcomeRecord,
    images_extracted: usize,
    images_dropped: usize,
}

/// Extract → normalise → assemble for one stored attachment. Blocking;
/// runs on the blocking thread pool.
///
/// Returns `None` when cancelled mid-flight — partial files (including the
/// stored attachment, which no record will reference) are removed first.
fn process_attachment(
    stored: StoredAttachment,
    config: &PipelineConfig,
    cancel: &CancelToken,
) -> Option<AttachmentOutcome> {
    let cleanup_cancelled = |processed: &[normalize::ProcessedImage]| {
        for image in processed {
            let _ = std::fs::remove_file(&image.path);
        }
        let _ = std::fs::remove_file(&stored.path);
        debug!(path = %stored.path.display(), "Cancelled, partial files removed");
    };

    if cancel.is_cancelled() {
        cleanup_cancelled(&[]);
        return None;
    }

    // ── ExtractingImages ─────────────────────────────────────────────────
    let extraction = match extract::extract_images(&stored) {
        Ok(extraction) => extraction,
        Err(e) => {
            return Some(AttachmentOutcome {
                record: OutcomeRecord::Failure {
                    reason: e.to_string(),
                    email_subject: stored.email_subject.clone(),
                },
                images_extracted: 0,
                images_dropped: 0,
            });
        }
    };

    let images_extracted = extraction.images.len();
    if images_extracted == 0 {
        return Some(AttachmentOutcome {
            record: OutcomeRecord::Warning {
                reason: "no embeddable images found in document".into(),
                email_subject: stored.email_subject.clone(),
                source_pdf: stored.path.clone(),
            },
            images_extracted: 0,
            images_dropped: extraction.skipped_objects,
        });
    }

    // ── NormalizingImages ────────────────────────────────────────────────
    let processed_dir = config.processed_dir();
    let mut processed: Vec<normalize::ProcessedImage> = Vec::with_capacity(images_extracted);
    let mut dropped = extraction.skipped_objects;

    for image in &extraction.images {
        if cancel.is_cancelled() {
            cleanup_cancelled(&processed);
            return None;
        }
        match normalize::normalize(
            image,
            config.max_image_width,
            config.max_image_height,
            config.quality,
            &processed_dir,
        ) {
            Ok(p) => processed.push(p),
            Err(e) => {
                warn!(page = image.page_index, "Dropping image: {e}");
                dropped += 1;
            }
        }
    }

    if processed.is_empty() {
        // Every image failed to decode — treated identically to the
        // zero-image case.
        return Some(AttachmentOutcome {
            record: OutcomeRecord::Warning {
                reason: format!("all {images_extracted} images failed normalisation"),
                email_subject: stored.email_subject.clone(),
                source_pdf: stored.path.clone(),
            },
            images_extracted,
            images_dropped: dropped,
        });
    }

    if cancel.is_cancelled() {
        cleanup_cancelled(&processed);
        return None;
    }

    // ── AssemblingReport ─────────────────────────────────────────────────
    let metadata = ReportMetadata {
        title: if stored.email_subject.is_empty() {
            config.default_title.clone()
        } else {
            stored.email_subject.clone()
        },
        author: stored.email_sender.clone(),
        created: stored.email_date,
    };

    let record = match report::generate_report(&processed, &metadata, config) {
        Ok(generated) => {
            if !config.keep_processed {
                for image in &processed {
                    let _ = std::fs::remove_file(&image.path);
                }
            }
            OutcomeRecord::Success {
                email_subject: stored.email_subject.clone(),
                report_path: generated.path,
                image_count: generated.images.len(),
                dropped_images: dropped,
                source_pdf: stored.path.clone(),
            }
        }
        // The download is preserved so the report can be regenerated.
        Err(e) => OutcomeRecord::Failure {
            reason: e.to_string(),
            email_subject: stored.email_subject.clone(),
        },
    };

    Some(AttachmentOutcome {
        record,
        images_extracted,
        images_dropped: dropped,
    })
}
