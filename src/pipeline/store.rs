//! Attachment persistence: downloaded bodies to durable, uniquely named
//! files under the attachment root.
//!
//! Target names combine the sanitised sender, a timestamp, and the sanitised
//! original filename, then probe numeric suffixes until an unused name is
//! found — an existing file is never overwritten. Attachment filenames are
//! reduced to their final path component before use; a name that still
//! carries traversal sequences or sanitises to nothing is rejected, so no
//! write can escape the configured root.

use crate::error::AttachmentError;
use crate::mailbox::{AttachmentRef, IncomingEmail};
use chrono::{DateTime, Utc};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A PDF attachment persisted to the attachment root, together with the
/// metadata of its originating email.
///
/// Owned by the pipeline while the email is processed; ownership of the file
/// passes to the caller afterwards — the pipeline never deletes a stored
/// attachment that an outcome record references.
#[derive(Debug, Clone)]
pub struct StoredAttachment {
    pub path: PathBuf,
    pub filename: String,
    pub content_type: String,
    pub email_subject: String,
    pub email_sender: String,
    pub email_date: DateTime<Utc>,
}

/// Write one attachment body under `root`, returning the stored record.
///
/// A failed or truncated write deletes the partial file before the error
/// propagates, so no outcome record can reference a path that does not hold
/// the complete body.
pub fn store_attachment(
    root: &Path,
    email: &IncomingEmail,
    attachment: &AttachmentRef,
    body: &[u8],
) -> Result<StoredAttachment, AttachmentError> {
    let io_err = |detail: String| AttachmentError::Io {
        name: attachment.filename.clone(),
        detail,
    };

    let safe_name = sanitize_filename(&attachment.filename)
        .ok_or_else(|| io_err("attachment filename is empty or traversal-only".into()))?;

    fs::create_dir_all(root).map_err(|e| io_err(format!("cannot create {}: {e}", root.display())))?;

    let stem = format!(
        "{}_{}_{}",
        sanitize_component(&email.sender),
        email.received_at.format("%Y%m%d%H%M%S"),
        safe_name
    );
    let path = unique_path(root, &stem);

    if let Err(e) = write_all(&path, body) {
        // Partial files must not outlive the error.
        let _ = fs::remove_file(&path);
        return Err(io_err(format!("write to {} failed: {e}", path.display())));
    }

    info!(path = %path.display(), bytes = body.len(), "Stored attachment");
    Ok(StoredAttachment {
        path,
        filename: attachment.filename.clone(),
        content_type: attachment.content_type.clone(),
        email_subject: email.subject.clone(),
        email_sender: email.sender.clone(),
        email_date: email.received_at,
    })
}

fn write_all(path: &Path, body: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(body)?;
    file.flush()?;
    Ok(())
}

/// First unused path for `name` under `root`: `name`, then `name.1`,
/// `name.2`, … before the extension.
pub(crate) fn unique_path(root: &Path, name: &str) -> PathBuf {
    let candidate = root.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((s, e)) => (s.to_string(), format!(".{e}")),
        None => (name.to_string(), String::new()),
    };
    let mut n = 1u32;
    loop {
        let candidate = root.join(format!("{stem}.{n}{ext}"));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// Reduce an attachment filename to a safe final component.
///
/// Returns `None` when nothing safe remains (empty input, `..`, bare
/// separators).
pub(crate) fn sanitize_filename(raw: &str) -> Option<String> {
    let last = raw
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    if last.is_empty() || last == "." || last == ".." {
        debug!(raw, "Rejected unsafe attachment filename");
        return None;
    }
    Some(sanitize_component(last))
}

/// Keep alphanumerics, dots and dashes; everything else becomes `_`.
fn sanitize_component(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn email() -> IncomingEmail {
        IncomingEmail {
            uid: 7,
            subject: "Q1 Report".into(),
            sender: "a@x.com".into(),
            received_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            attachments: Vec::new(),
        }
    }

    fn pdf_ref(name: &str) -> AttachmentRef {
        AttachmentRef {
            filename: name.into(),
            content_type: "application/pdf".into(),
        }
    }

    #[test]
    fn stores_body_under_root_with_email_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let stored =
            store_attachment(dir.path(), &email(), &pdf_ref("scan.pdf"), b"%PDF-1.4 x").unwrap();
        assert!(stored.path.starts_with(dir.path()));
        assert_eq!(fs::read(&stored.path).unwrap(), b"%PDF-1.4 x");
        assert_eq!(stored.email_subject, "Q1 Report");
        let name = stored.path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.contains("a_x.com"), "got {name}");
        assert!(name.ends_with("scan.pdf"));
    }

    #[test]
    fn never_overwrites_an_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let first = store_attachment(dir.path(), &email(), &pdf_ref("scan.pdf"), b"one").unwrap();
        let second = store_attachment(dir.path(), &email(), &pdf_ref("scan.pdf"), b"two").unwrap();
        assert_ne!(first.path, second.path);
        assert_eq!(fs::read(&first.path).unwrap(), b"one");
        assert_eq!(fs::read(&second.path).unwrap(), b"two");
    }

    #[test]
    fn traversal_names_cannot_escape_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let stored = store_attachment(
            dir.path(),
            &email(),
            &pdf_ref("../../etc/passwd.pdf"),
            b"x",
        )
        .unwrap();
        assert!(stored.path.starts_with(dir.path()));
        assert!(stored
            .path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .ends_with("passwd.pdf"));
    }

    #[test]
    fn pure_traversal_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = store_attachment(dir.path(), &email(), &pdf_ref(".."), b"x").unwrap_err();
        assert!(matches!(err, AttachmentError::Io { .. }));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn sanitize_filename_cases() {
        assert_eq!(sanitize_filename("a b.pdf").as_deref(), Some("a_b.pdf"));
        assert_eq!(
            sanitize_filename("dir/sub/doc.pdf").as_deref(),
            Some("doc.pdf")
        );
        assert_eq!(sanitize_filename(r"c:\x\doc.pdf").as_deref(), Some("doc.pdf"));
        assert_eq!(sanitize_filename(""), None);
        assert_eq!(sanitize_filename("  "), None);
        assert_eq!(sanitize_filename("a/.."), None);
    }

    #[test]
    fn unique_path_probes_suffixes() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("r.pdf"), b"x").unwrap();
        fs::write(dir.path().join("r.1.pdf"), b"x").unwrap();
        assert_eq!(
            unique_path(dir.path(), "r.pdf"),
            dir.path().join("r.2.pdf")
        );
    }
}
