//! End-to-end pipeline tests over an in-memory mailbox.
//!
//! These run the real orchestrator — download, extraction, normalisation,
//! and report assembly against real files in temp dirs — with only the
//! IMAP transport replaced by a scripted [`Mailbox`] implementation, the
//! same injection seam production callers use for custom transports.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use lopdf::{Dictionary, Document, Object, Stream};
use mail2report::{
    run_cycle, run_cycle_cancellable, AttachmentError, AttachmentRef, CancelToken, IncomingEmail,
    Mailbox, MailboxCredentials, OutcomeRecord, PipelineConfig, PipelineError, SenderFilter,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

// ── Scripted mailbox ─────────────────────────────────────────────────────────

#[derive(Default)]
struct FakeMailbox {
    emails: Vec<IncomingEmail>,
    /// (uid, filename) → attachment body bytes.
    bodies: HashMap<(u32, String), Vec<u8>>,
    seen: Mutex<Vec<u32>>,
    disconnected: AtomicBool,
}

impl FakeMailbox {
    fn seen_uids(&self) -> Vec<u32> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mailbox for FakeMailbox {
    async fn fetch_qualifying(
        &self,
        filter: &SenderFilter,
    ) -> Result<Vec<IncomingEmail>, PipelineError> {
        Ok(self
            .emails
            .iter()
            .filter(|e| filter.matches(&e.sender))
            .cloned()
            .collect())
    }

    async fn mark_seen(&self, uid: u32) -> Result<(), PipelineError> {
        self.seen.lock().unwrap().push(uid);
        Ok(())
    }

    async fn fetch_attachment(
        &self,
        email: &IncomingEmail,
        attachment: &AttachmentRef,
    ) -> Result<Vec<u8>, AttachmentError> {
        self.bodies
            .get(&(email.uid, attachment.filename.clone()))
            .cloned()
            .ok_or_else(|| AttachmentError::Io {
                name: attachment.filename.clone(),
                detail: "scripted body missing".into(),
            })
    }

    async fn disconnect(&self) -> Result<(), PipelineError> {
        self.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ── Test helpers ─────────────────────────────────────────────────────────────

/// One page per entry; each entry is `(width, height, color_space, filter)`.
fn build_pdf(images: &[(u32, u32, &[u8], Option<&[u8]>)]) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let mut kids = Vec::new();

    for (w, h, cs, filter) in images {
        let mut img_dict = Dictionary::new();
        img_dict.set("Type", Object::Name(b"XObject".to_vec()));
        img_dict.set("Subtype", Object::Name(b"Image".to_vec()));
        img_dict.set("Width", Object::Integer(*w as i64));
        img_dict.set("Height", Object::Integer(*h as i64));
        img_dict.set("ColorSpace", Object::Name(cs.to_vec()));
        img_dict.set("BitsPerComponent", Object::Integer(8));
        if let Some(f) = filter {
            img_dict.set("Filter", Object::Name(f.to_vec()));
        }
        let samples = vec![140u8; (*w * *h) as usize];
        let img_id = doc.add_object(Object::Stream(Stream::new(img_dict, samples)));

        let content_id = doc.add_object(Object::Stream(Stream::new(
            Dictionary::new(),
            b"q Q\n".to_vec(),
        )));

        let mut xobjects = Dictionary::new();
        xobjects.set("Im0", Object::Reference(img_id));
        let mut resources = Dictionary::new();
        resources.set("XObject", Object::Dictionary(xobjects));

        let mut page = Dictionary::new();
        page.set("Type", Object::Name(b"Page".to_vec()));
        page.set("Parent", Object::Reference(pages_id));
        page.set("Contents", Object::Reference(content_id));
        page.set("Resources", Object::Dictionary(resources));
        page.set(
            "MediaBox",
            Object::Array(vec![0.into(), 0.into(), 612.into(), 792.into()]),
        );
        kids.push(Object::Reference(doc.add_object(Object::Dictionary(page))));
    }

    let mut pages = Dictionary::new();
    pages.set("Type", Object::Name(b"Pages".to_vec()));
    pages.set("Count", Object::Integer(kids.len() as i64));
    pages.set("Kids", Object::Array(kids));
    doc.objects.insert(pages_id, Object::Dictionary(pages));

    let mut catalog = Dictionary::new();
    catalog.set("Type", Object::Name(b"Catalog".to_vec()));
    catalog.set("Pages", Object::Reference(pages_id));
    let catalog_id = doc.add_object(Object::Dictionary(catalog));
    doc.trailer.set("Root", Object::Reference(catalog_id));

    let mut buf = Vec::new();
    doc.save_to(&mut buf).unwrap();
    buf
}

fn pdf_ref(name: &str) -> AttachmentRef {
    AttachmentRef {
        filename: name.into(),
        content_type: "application/pdf".into(),
    }
}

fn email(uid: u32, subject: &str, sender: &str, attachments: Vec<AttachmentRef>) -> IncomingEmail {
    IncomingEmail {
        uid,
        subject: subject.into(),
        sender: sender.into(),
        received_at: Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
        attachments,
    }
}

struct TestEnv {
    _root: tempfile::TempDir,
    attachment_root: PathBuf,
    report_root: PathBuf,
}

impl TestEnv {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        Self {
            attachment_root: root.path().join("in"),
            report_root: root.path().join("out"),
            _root: root,
        }
    }

    fn config(&self, mailbox: Arc<FakeMailbox>, senders: &[&str]) -> PipelineConfig {
        let mut builder = PipelineConfig::builder()
            .mailbox(mailbox)
            .attachment_root(&self.attachment_root)
            .report_root(&self.report_root)
            .concurrency(2);
        for s in senders {
            builder = builder.allowed_sender(*s);
        }
        builder.build().unwrap()
    }

    fn files_in(&self, dir: &Path) -> Vec<PathBuf> {
        match std::fs::read_dir(dir) {
            Ok(entries) => {
                let mut files: Vec<_> = entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| p.is_file())
                    .collect();
                files.sort();
                files
            }
            Err(_) => Vec::new(),
        }
    }
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn q1_report_end_to_end() {
    let env = TestEnv::new();
    let pdf = build_pdf(&[
        (1600, 1000, b"DeviceGray", None),
        (400, 300, b"DeviceGray", None),
    ]);
    let mailbox = Arc::new(FakeMailbox {
        emails: vec![email(7, "Q1 Report", "a@x.com", vec![pdf_ref("q1.pdf")])],
        bodies: HashMap::from([((7, "q1.pdf".to_string()), pdf)]),
        ..Default::default()
    });

    let config = env.config(Arc::clone(&mailbox), &["a@x.com"]);
    let report = run_cycle(&config).await.unwrap();

    // Exactly one Success referencing the generated report.
    assert_eq!(report.records.len(), 1);
    let OutcomeRecord::Success {
        email_subject,
        report_path,
        image_count,
        dropped_images,
        source_pdf,
    } = &report.records[0]
    else {
        panic!("expected Success, got {:?}", report.records[0]);
    };
    assert_eq!(email_subject, "Q1 Report");
    assert_eq!(*image_count, 2);
    assert_eq!(*dropped_images, 0);

    // One stored attachment under the attachment root.
    assert!(source_pdf.starts_with(&env.attachment_root));
    assert_eq!(env.files_in(&env.attachment_root).len(), 1);

    // Two processed images, each bounded to 800x1000.
    let processed = env.files_in(&env.attachment_root.join("processed"));
    assert_eq!(processed.len(), 2);
    for path in &processed {
        let img = image::open(path).unwrap();
        assert!(img.width() <= 800, "width {} > 800", img.width());
        assert!(img.height() <= 1000, "height {} > 1000", img.height());
    }

    // The report has one page per image and carries the email subject.
    let bytes = std::fs::read(report_path).unwrap();
    let doc = Document::load_mem(&bytes).unwrap();
    assert_eq!(doc.get_pages().len(), 2);
    let Object::Reference(info_id) = doc.trailer.get(b"Info").unwrap() else {
        panic!("Info missing");
    };
    let Object::Dictionary(info) = doc.get_object(*info_id).unwrap() else {
        panic!("Info not a dictionary");
    };
    let Object::String(title, _) = info.get(b"Title").unwrap() else {
        panic!("Title missing");
    };
    assert_eq!(String::from_utf8_lossy(title), "Q1 Report");

    // Marked seen exactly once, session released.
    assert_eq!(mailbox.seen_uids(), vec![7]);
    assert!(mailbox.disconnected.load(Ordering::SeqCst));

    assert_eq!(report.stats.reports_generated, 1);
    assert_eq!(report.stats.images_extracted, 2);
}

#[tokio::test]
async fn sender_outside_allow_list_is_untouched() {
    let env = TestEnv::new();
    let pdf = build_pdf(&[(10, 10, b"DeviceGray", None)]);
    let mailbox = Arc::new(FakeMailbox {
        emails: vec![email(3, "spam", "intruder@evil.io", vec![pdf_ref("x.pdf")])],
        bodies: HashMap::from([((3, "x.pdf".to_string()), pdf)]),
        ..Default::default()
    });

    let config = env.config(Arc::clone(&mailbox), &["a@x.com"]);
    let report = run_cycle(&config).await.unwrap();

    assert!(report.records.is_empty());
    assert!(mailbox.seen_uids().is_empty());
    assert!(env.files_in(&env.attachment_root).is_empty());
}

#[tokio::test]
async fn email_without_pdfs_is_marked_seen_and_ignored() {
    let env = TestEnv::new();
    let mailbox = Arc::new(FakeMailbox {
        emails: vec![email(11, "hello", "a@x.com", vec![])],
        ..Default::default()
    });

    let config = env.config(Arc::clone(&mailbox), &["a@x.com"]);
    let report = run_cycle(&config).await.unwrap();

    assert!(report.records.is_empty());
    assert_eq!(mailbox.seen_uids(), vec![11]);
    assert_eq!(report.stats.emails_fetched, 1);
    assert_eq!(report.stats.attachments_processed, 0);
}

#[tokio::test]
async fn zero_image_pdf_yields_one_warning_and_no_report() {
    let env = TestEnv::new();
    let pdf = build_pdf(&[]);
    let mailbox = Arc::new(FakeMailbox {
        emails: vec![email(5, "empty doc", "a@x.com", vec![pdf_ref("empty.pdf")])],
        bodies: HashMap::from([((5, "empty.pdf".to_string()), pdf)]),
        ..Default::default()
    });

    let config = env.config(Arc::clone(&mailbox), &["a@x.com"]);
    let report = run_cycle(&config).await.unwrap();

    assert_eq!(report.records.len(), 1);
    assert!(report.records[0].is_warning(), "got {:?}", report.records[0]);
    assert!(env.files_in(&env.report_root).is_empty());
    assert_eq!(report.stats.warnings, 1);
}

#[tokio::test]
async fn all_undecodable_images_match_the_zero_image_case() {
    let env = TestEnv::new();
    // JPXDecode is not a supported encoding; every image drops.
    let pdf = build_pdf(&[
        (10, 10, b"DeviceRGB", Some(b"JPXDecode")),
        (20, 20, b"DeviceRGB", Some(b"JPXDecode")),
    ]);
    let mailbox = Arc::new(FakeMailbox {
        emails: vec![email(9, "scans", "a@x.com", vec![pdf_ref("s.pdf")])],
        bodies: HashMap::from([((9, "s.pdf".to_string()), pdf)]),
        ..Default::default()
    });

    let config = env.config(Arc::clone(&mailbox), &["a@x.com"]);
    let report = run_cycle(&config).await.unwrap();

    assert_eq!(report.records.len(), 1);
    assert!(report.records[0].is_warning());
    assert!(env.files_in(&env.report_root).is_empty());
    assert_eq!(report.stats.images_extracted, 2);
    assert_eq!(report.stats.images_dropped, 2);
}

#[tokio::test]
async fn one_bad_image_still_produces_a_partial_report() {
    let env = TestEnv::new();
    let pdf = build_pdf(&[
        (40, 30, b"DeviceGray", None),
        (10, 10, b"DeviceRGB", Some(b"JPXDecode")),
        (20, 50, b"DeviceGray", None),
    ]);
    let mailbox = Arc::new(FakeMailbox {
        emails: vec![email(4, "mixed", "a@x.com", vec![pdf_ref("m.pdf")])],
        bodies: HashMap::from([((4, "m.pdf".to_string()), pdf)]),
        ..Default::default()
    });

    let config = env.config(Arc::clone(&mailbox), &["a@x.com"]);
    let report = run_cycle(&config).await.unwrap();

    assert_eq!(report.records.len(), 1);
    let OutcomeRecord::Success {
        image_count,
        dropped_images,
        report_path,
        ..
    } = &report.records[0]
    else {
        panic!("expected Success, got {:?}", report.records[0]);
    };
    assert_eq!(*image_count, 2);
    assert_eq!(*dropped_images, 1);
    assert_eq!(report.stats.failures, 0);

    let doc = Document::load_mem(&std::fs::read(report_path).unwrap()).unwrap();
    assert_eq!(doc.get_pages().len(), 2);
}

#[tokio::test]
async fn corrupt_attachment_fails_without_stopping_its_siblings() {
    let env = TestEnv::new();
    let good = build_pdf(&[(12, 12, b"DeviceGray", None)]);
    let corrupt = b"%PDF-1.5 this is not a real document".to_vec();
    let mailbox = Arc::new(FakeMailbox {
        emails: vec![email(
            6,
            "two files",
            "a@x.com",
            vec![pdf_ref("bad.pdf"), pdf_ref("good.pdf")],
        )],
        bodies: HashMap::from([
            ((6, "bad.pdf".to_string()), corrupt),
            ((6, "good.pdf".to_string()), good),
        ]),
        ..Default::default()
    });

    let config = env.config(Arc::clone(&mailbox), &["a@x.com"]);
    let report = run_cycle(&config).await.unwrap();

    // Records keep attachment order: the corrupt one first, then the good.
    assert_eq!(report.records.len(), 2);
    assert!(report.records[0].is_failure(), "got {:?}", report.records[0]);
    assert!(report.records[1].is_success(), "got {:?}", report.records[1]);
    assert_eq!(report.stats.failures, 1);
    assert_eq!(report.stats.reports_generated, 1);
}

#[tokio::test]
async fn missing_body_becomes_a_download_failure() {
    let env = TestEnv::new();
    let mailbox = Arc::new(FakeMailbox {
        emails: vec![email(8, "ghost", "a@x.com", vec![pdf_ref("gone.pdf")])],
        ..Default::default()
    });

    let config = env.config(Arc::clone(&mailbox), &["a@x.com"]);
    let report = run_cycle(&config).await.unwrap();

    assert_eq!(report.records.len(), 1);
    assert!(report.records[0].is_failure());
    assert!(env.files_in(&env.attachment_root).is_empty());
}

#[tokio::test]
async fn unreachable_mailbox_is_a_clean_repeatable_network_error() {
    // Grab a port nobody is listening on.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let env = TestEnv::new();
    let config = PipelineConfig::builder()
        .credentials(MailboxCredentials {
            host: "127.0.0.1".into(),
            port,
            user: "u".into(),
            secret: "s".into(),
            tls: false,
        })
        .attachment_root(&env.attachment_root)
        .report_root(&env.report_root)
        .build()
        .unwrap();

    for _ in 0..2 {
        let err = run_cycle(&config).await.unwrap_err();
        assert!(
            matches!(err, PipelineError::Network { .. }),
            "expected Network, got {err:?}"
        );
        // No partial side effects: nothing written, nothing recorded.
        assert!(!env.attachment_root.exists());
        assert!(!env.report_root.exists());
    }
}

#[tokio::test]
async fn cancelled_cycle_emits_no_records_but_disconnects() {
    let env = TestEnv::new();
    let pdf = build_pdf(&[(10, 10, b"DeviceGray", None)]);
    let mailbox = Arc::new(FakeMailbox {
        emails: vec![email(2, "late", "a@x.com", vec![pdf_ref("late.pdf")])],
        bodies: HashMap::from([((2, "late.pdf".to_string()), pdf)]),
        ..Default::default()
    });

    let config = env.config(Arc::clone(&mailbox), &["a@x.com"]);
    let cancel = CancelToken::new();
    cancel.cancel();

    let report = run_cycle_cancellable(&config, &cancel).await.unwrap();
    assert!(report.records.is_empty());
    assert!(mailbox.seen_uids().is_empty());
    assert!(mailbox.disconnected.load(Ordering::SeqCst));
}

#[tokio::test]
async fn discard_processed_removes_intermediate_files() {
    let env = TestEnv::new();
    let pdf = build_pdf(&[(16, 16, b"DeviceGray", None)]);
    let mailbox = Arc::new(FakeMailbox {
        emails: vec![email(12, "tidy", "a@x.com", vec![pdf_ref("t.pdf")])],
        bodies: HashMap::from([((12, "t.pdf".to_string()), pdf)]),
        ..Default::default()
    });

    let mut config = env.config(Arc::clone(&mailbox), &["a@x.com"]);
    config.keep_processed = false;

    let report = run_cycle(&config).await.unwrap();
    assert!(report.records[0].is_success());
    assert!(env.files_in(&env.attachment_root.join("processed")).is_empty());
    assert_eq!(env.files_in(&env.report_root).len(), 1);
}
