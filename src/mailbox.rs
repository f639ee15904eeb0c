//! Mailbox access: credentials, sender filtering, and the IMAP client.
//!
//! The pipeline talks to mail through the [`Mailbox`] trait so the
//! orchestrator and the test suite can run against any transport; the
//! production implementation is [`ImapMailbox`], a TLS IMAP session owned
//! explicitly by the caller (no module-level connection cache).
//!
//! ## Why a blocking IMAP session behind `spawn_blocking`?
//!
//! The `imap` crate is synchronous and a single session only supports one
//! in-flight command. All protocol work runs on the blocking thread pool
//! with the session behind a mutex, which serialises mailbox traffic by
//! construction while the CPU-bound pipeline stages fan out elsewhere.
//!
//! ## Fetch discipline
//!
//! `fetch_qualifying` retrieves headers and BODYSTRUCTURE only — attachment
//! bodies are pulled on demand by `fetch_attachment`, one message at a time,
//! which bounds memory to a single raw message regardless of mailbox size.
//! Marking a message seen is a separate, explicit operation so callers can
//! assert it happens exactly once per yielded email.

use crate::error::{AttachmentError, PipelineError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use imap_proto::types::BodyStructure;
use mailparse::ParsedMail;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Read/write timeout applied to the raw TCP stream before TLS.
const SOCKET_TIMEOUT: Duration = Duration::from_secs(30);

// ── Data model ───────────────────────────────────────────────────────────

/// Account coordinates for the polled mailbox.
///
/// Immutable, supplied at pipeline start, never persisted by the pipeline.
#[derive(Clone, Serialize, Deserialize)]
pub struct MailboxCredentials {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub secret: String,
    /// Use implicit TLS (IMAPS). Plain TCP is supported for local test
    /// servers only.
    pub tls: bool,
}

impl fmt::Debug for MailboxCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailboxCredentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("secret", &"<redacted>")
            .field("tls", &self.tls)
            .finish()
    }
}

/// Allow-list narrowing which senders qualify for processing.
///
/// Patterns: `user@example.com` (exact), `@example.com` or `example.com`
/// (domain). An empty filter does not narrow at all.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SenderFilter {
    patterns: Vec<String>,
}

impl SenderFilter {
    pub fn new(patterns: Vec<String>) -> Self {
        Self { patterns }
    }

    pub fn push(&mut self, pattern: String) {
        self.patterns.push(pattern);
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Whether `email` passes the filter.
    pub fn matches(&self, email: &str) -> bool {
        if self.patterns.is_empty() {
            return true;
        }
        let email_lower = email.to_lowercase();
        self.patterns.iter().any(|p| {
            if p.starts_with('@') {
                email_lower.ends_with(&p.to_lowercase())
            } else if p.contains('@') {
                p.eq_ignore_ascii_case(email)
            } else {
                email_lower.ends_with(&format!("@{}", p.to_lowercase()))
            }
        })
    }

    /// The single exact address in the filter, if that is all it holds.
    /// Used to push the narrowing into the server-side SEARCH.
    pub fn single_address(&self) -> Option<&str> {
        match self.patterns.as_slice() {
            [p] if p.contains('@') && !p.starts_with('@') => Some(p),
            _ => None,
        }
    }
}

/// Metadata of one attachment, known before its body is downloaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub filename: String,
    pub content_type: String,
}

impl AttachmentRef {
    /// Whether this part carries a PDF, by declared type or file extension.
    pub fn is_pdf(&self) -> bool {
        self.content_type.to_ascii_lowercase().contains("pdf")
            || self.filename.to_ascii_lowercase().ends_with(".pdf")
    }
}

/// One unseen, sender-matching email as returned by the mailbox.
///
/// Immutable once constructed; consumed and discarded within one pipeline
/// cycle. `attachments` lists PDF parts only and may be empty — such emails
/// are still marked seen, then ignored.
#[derive(Debug, Clone)]
pub struct IncomingEmail {
    pub uid: u32,
    pub subject: String,
    pub sender: String,
    pub received_at: DateTime<Utc>,
    pub attachments: Vec<AttachmentRef>,
}

// ── Trait ────────────────────────────────────────────────────────────────

/// A mailbox supporting unseen-message search and on-demand attachment
/// fetch. Implemented by [`ImapMailbox`] and by in-memory fakes in tests.
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// List unseen emails passing `filter`, newest last, with headers and
    /// PDF attachment metadata but no bodies. Does NOT mark anything seen.
    async fn fetch_qualifying(
        &self,
        filter: &SenderFilter,
    ) -> Result<Vec<IncomingEmail>, PipelineError>;

    /// Mark one message seen. Called exactly once per email returned by
    /// [`Mailbox::fetch_qualifying`], before that email is processed.
    async fn mark_seen(&self, uid: u32) -> Result<(), PipelineError>;

    /// Fetch one attachment body. Bounded to a single raw message in memory.
    async fn fetch_attachment(
        &self,
        email: &IncomingEmail,
        attachment: &AttachmentRef,
    ) -> Result<Vec<u8>, AttachmentError>;

    /// Release the session. Idempotent; safe to call after a failed cycle.
    async fn disconnect(&self) -> Result<(), PipelineError>;
}

// ── IMAP implementation ──────────────────────────────────────────────────

enum SessionKind {
    Tls(imap::Session<native_tls::TlsStream<TcpStream>>),
    Plain(imap::Session<TcpStream>),
}

struct Inner {
    session: Mutex<Option<SessionKind>>,
    creds: MailboxCredentials,
}

/// IMAP implementation of [`Mailbox`] over an explicitly owned session.
pub struct ImapMailbox {
    inner: Arc<Inner>,
}

impl ImapMailbox {
    /// Connect, authenticate, and select `mailbox_name`.
    ///
    /// Fails with [`PipelineError::Network`] when the host is unreachable or
    /// the TLS handshake breaks, and [`PipelineError::Auth`] when the server
    /// rejects the credentials — both before any email is touched.
    pub async fn connect(
        creds: &MailboxCredentials,
        mailbox_name: &str,
    ) -> Result<Self, PipelineError> {
        let creds = creds.clone();
        let creds_for_errors = creds.clone();
        let mailbox_name = mailbox_name.to_string();

        let session = tokio::task::spawn_blocking(move || connect_blocking(&creds, &mailbox_name))
            .await
            .map_err(|e| PipelineError::Internal(format!("Connect task panicked: {e}")))??;

        Ok(Self {
            inner: Arc::new(Inner {
                creds: creds_for_errors,
                session: Mutex::new(Some(session)),
            }),
        })
    }

    fn network_error(&self, detail: impl fmt::Display) -> PipelineError {
        PipelineError::Network {
            host: self.inner.creds.host.clone(),
            port: self.inner.creds.port,
            detail: detail.to_string(),
        }
    }

    /// Run `op` against the live session on the blocking pool.
    async fn with_session<F, T>(&self, op: F) -> Result<T, PipelineError>
    where
        F: FnOnce(&mut SessionKind) -> Result<T, imap::Error> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let result = tokio::task::spawn_blocking(move || {
            let mut guard = lock_session(&inner.session);
            match guard.as_mut() {
                Some(session) => op(session).map_err(|e| e.to_string()),
                None => Err("session already disconnected".to_string()),
            }
        })
        .await
        .map_err(|e| PipelineError::Internal(format!("Mailbox task panicked: {e}")))?;

        result.map_err(|detail| self.network_error(detail))
    }
}

fn lock_session(m: &Mutex<Option<SessionKind>>) -> MutexGuard<'_, Option<SessionKind>> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn connect_blocking(
    creds: &MailboxCredentials,
    mailbox_name: &str,
) -> Result<SessionKind, PipelineError> {
    let network = |detail: String| PipelineError::Network {
        host: creds.host.clone(),
        port: creds.port,
        detail,
    };
    let auth = |detail: String| PipelineError::Auth {
        user: creds.user.clone(),
        detail,
    };

    let mut session = if creds.tls {
        let tls = native_tls::TlsConnector::builder()
            .build()
            .map_err(|e| network(format!("TLS setup failed: {e}")))?;
        let client = imap::connect((creds.host.as_str(), creds.port), &creds.host, &tls)
            .map_err(|e| network(e.to_string()))?;
        let session = client
            .login(&creds.user, &creds.secret)
            .map_err(|(e, _)| auth(e.to_string()))?;
        SessionKind::Tls(session)
    } else {
        let stream = TcpStream::connect((creds.host.as_str(), creds.port))
            .map_err(|e| network(e.to_string()))?;
        let _ = stream.set_read_timeout(Some(SOCKET_TIMEOUT));
        let _ = stream.set_write_timeout(Some(SOCKET_TIMEOUT));
        let mut client = imap::Client::new(stream);
        client
            .read_greeting()
            .map_err(|e| network(format!("greeting read failed: {e}")))?;
        let session = client
            .login(&creds.user, &creds.secret)
            .map_err(|(e, _)| auth(e.to_string()))?;
        SessionKind::Plain(session)
    };

    match &mut session {
        SessionKind::Tls(s) => s.select(mailbox_name),
        SessionKind::Plain(s) => s.select(mailbox_name),
    }
    .map_err(|e| network(format!("SELECT {mailbox_name} failed: {e}")))?;

    info!(host = %creds.host, user = %creds.user, "Mailbox session established");
    Ok(session)
}

#[async_trait]
impl Mailbox for ImapMailbox {
    async fn fetch_qualifying(
        &self,
        filter: &SenderFilter,
    ) -> Result<Vec<IncomingEmail>, PipelineError> {
        let filter = filter.clone();
        let emails = self
            .with_session(move |session| match session {
                SessionKind::Tls(s) => list_unseen(s, &filter),
                SessionKind::Plain(s) => list_unseen(s, &filter),
            })
            .await?;
        info!(count = emails.len(), "Fetched qualifying emails");
        Ok(emails)
    }

    async fn mark_seen(&self, uid: u32) -> Result<(), PipelineError> {
        self.with_session(move |session| {
            match session {
                SessionKind::Tls(s) => s.uid_store(uid.to_string(), "+FLAGS.SILENT (\\Seen)")?,
                SessionKind::Plain(s) => s.uid_store(uid.to_string(), "+FLAGS.SILENT (\\Seen)")?,
            };
            Ok(())
        })
        .await?;
        debug!(uid, "Marked message seen");
        Ok(())
    }

    async fn fetch_attachment(
        &self,
        email: &IncomingEmail,
        attachment: &AttachmentRef,
    ) -> Result<Vec<u8>, AttachmentError> {
        let uid = email.uid;
        let target = attachment.clone();
        let name = attachment.filename.clone();

        self.with_session(move |session| {
            let raw = match session {
                SessionKind::Tls(s) => fetch_raw_message(s, uid)?,
                SessionKind::Plain(s) => fetch_raw_message(s, uid)?,
            };
            Ok(extract_part_bytes(&raw, &target))
        })
        .await
        .map_err(|e| AttachmentError::Io {
            name: name.clone(),
            detail: e.to_string(),
        })?
        .ok_or_else(|| AttachmentError::Io {
            name,
            detail: format!("no matching MIME part in message {uid}"),
        })
    }

    async fn disconnect(&self) -> Result<(), PipelineError> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut guard = lock_session(&inner.session);
            if let Some(session) = guard.take() {
                let result = match session {
                    SessionKind::Tls(mut s) => s.logout(),
                    SessionKind::Plain(mut s) => s.logout(),
                };
                if let Err(e) = result {
                    warn!("IMAP logout failed: {e}");
                }
            }
        })
        .await
        .map_err(|e| PipelineError::Internal(format!("Disconnect task panicked: {e}")))?;
        debug!("Mailbox session released");
        Ok(())
    }
}

// ── Blocking protocol helpers ────────────────────────────────────────────

fn list_unseen<T: Read + Write>(
    session: &mut imap::Session<T>,
    filter: &SenderFilter,
) -> Result<Vec<IncomingEmail>, imap::Error> {
    // Push the narrowing into the server when the filter is one plain
    // address; otherwise search UNSEEN and filter client-side below.
    let query = match filter.single_address() {
        Some(addr) => format!("UNSEEN FROM \"{}\"", addr.replace('"', "\\\"")),
        None => "UNSEEN".to_string(),
    };

    let mut uids: Vec<u32> = session.uid_search(&query)?.into_iter().collect();
    uids.sort_unstable();
    if uids.is_empty() {
        debug!("No unseen messages match");
        return Ok(Vec::new());
    }

    let uid_set = uids
        .iter()
        .map(|u| u.to_string())
        .collect::<Vec<_>>()
        .join(",");
    let fetches = session.uid_fetch(uid_set, "(UID ENVELOPE INTERNALDATE BODYSTRUCTURE)")?;

    let mut emails = Vec::new();
    for fetch in fetches.iter() {
        let Some(uid) = fetch.uid else { continue };

        let (subject, sender) = match fetch.envelope() {
            Some(env) => (
                env.subject
                    .as_deref()
                    .map(decode_header_value)
                    .unwrap_or_default(),
                env.from
                    .as_ref()
                    .and_then(|addrs| addrs.first())
                    .map(address_to_string)
                    .unwrap_or_default(),
            ),
            None => {
                warn!(uid, "FETCH returned no envelope, skipping");
                continue;
            }
        };

        if !filter.matches(&sender) {
            debug!(uid, sender = %sender, "Sender not in allow-list, skipping");
            continue;
        }

        let received_at = fetch
            .internal_date()
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let mut attachments = Vec::new();
        if let Some(bs) = fetch.bodystructure() {
            collect_pdf_attachments(bs, &mut attachments);
        }

        emails.push(IncomingEmail {
            uid,
            subject,
            sender,
            received_at,
            attachments,
        });
    }

    emails.sort_by_key(|e| e.uid);
    Ok(emails)
}

fn fetch_raw_message<T: Read + Write>(
    session: &mut imap::Session<T>,
    uid: u32,
) -> Result<Vec<u8>, imap::Error> {
    let fetches = session.uid_fetch(uid.to_string(), "(BODY.PEEK[])")?;
    let body = fetches
        .iter()
        .find_map(|f| f.body())
        .map(|b| b.to_vec())
        .unwrap_or_default();
    Ok(body)
}

/// Decode the transfer encoding of the MIME part matching `target` from a
/// raw RFC 822 message, if any.
fn extract_part_bytes(raw: &[u8], target: &AttachmentRef) -> Option<Vec<u8>> {
    let mail = mailparse::parse_mail(raw).ok()?;
    let part = find_attachment_part(&mail, target)?;
    part.get_body_raw().ok()
}

fn find_attachment_part<'a>(
    part: &'a ParsedMail<'a>,
    target: &AttachmentRef,
) -> Option<&'a ParsedMail<'a>> {
    if part.subparts.is_empty() {
        let filename = part_filename(part);
        let matches = match filename {
            Some(name) => name == target.filename,
            None => part.ctype.mimetype.to_ascii_lowercase().contains("pdf"),
        };
        return matches.then_some(part);
    }
    part.subparts
        .iter()
        .find_map(|p| find_attachment_part(p, target))
}

fn part_filename(part: &ParsedMail<'_>) -> Option<String> {
    let disposition = part.get_content_disposition();
    disposition
        .params
        .get("filename")
        .cloned()
        .or_else(|| part.ctype.params.get("name").cloned())
}

// ── BODYSTRUCTURE walk ───────────────────────────────────────────────────

/// Collect every PDF-typed leaf part as an [`AttachmentRef`], in the order
/// the structure declares them.
fn collect_pdf_attachments(bs: &BodyStructure<'_>, out: &mut Vec<AttachmentRef>) {
    match bs {
        BodyStructure::Basic { common, .. } | BodyStructure::Text { common, .. } => {
            let mime = format!("{}/{}", common.ty.ty, common.ty.subtype).to_ascii_lowercase();
            let filename = common
                .disposition
                .as_ref()
                .and_then(|d| params_get(&d.params, "filename"))
                .or_else(|| params_get(&common.ty.params, "name"));
            if let Some(r) = classify_pdf_part(&mime, filename) {
                out.push(r);
            }
        }
        BodyStructure::Message { body, .. } => collect_pdf_attachments(body, out),
        BodyStructure::Multipart { bodies, .. } => {
            for body in bodies {
                collect_pdf_attachments(body, out);
            }
        }
    }
}

type BodyParams<'a> = Option<Vec<(&'a str, &'a str)>>;

fn params_get(params: &BodyParams<'_>, key: &str) -> Option<String> {
    params.as_ref().and_then(|ps| {
        ps.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.to_string())
    })
}

/// Decide whether a leaf part is a PDF attachment, building its ref.
fn classify_pdf_part(mime: &str, filename: Option<String>) -> Option<AttachmentRef> {
    let named_pdf = filename
        .as_deref()
        .is_some_and(|n| n.to_ascii_lowercase().ends_with(".pdf"));
    if !mime.contains("pdf") && !named_pdf {
        return None;
    }
    Some(AttachmentRef {
        filename: filename.unwrap_or_else(|| "attachment.pdf".to_string()),
        content_type: mime.to_string(),
    })
}

fn address_to_string(addr: &imap_proto::types::Address<'_>) -> String {
    let mailbox = addr
        .mailbox
        .as_deref()
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .unwrap_or_default();
    let host = addr
        .host
        .as_deref()
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .unwrap_or_default();
    if mailbox.is_empty() || host.is_empty() {
        format!("{mailbox}{host}")
    } else {
        format!("{mailbox}@{host}")
    }
}

/// Best-effort RFC 2047 decode of an envelope header value.
fn decode_header_value(raw: &[u8]) -> String {
    let mut buf = Vec::with_capacity(raw.len() + 9);
    buf.extend_from_slice(b"Subject: ");
    buf.extend_from_slice(raw);
    match mailparse::parse_header(&buf) {
        Ok((header, _)) => header.get_value(),
        Err(_) => String::from_utf8_lossy(raw).into_owned(),
    }
}
