//! Configuration types for the mailbox-to-report pipeline.
//!
//! All pipeline behaviour is controlled through [`PipelineConfig`], built via
//! its [`PipelineConfigBuilder`]. Keeping every knob in one struct makes it
//! trivial to share configs across tasks, serialise the scalar parts for
//! logging, and diff two runs to understand why their outputs differ.
//!
//! Configuration is passed explicitly into each component at construction;
//! there is no ambient global and no module-level connection cache.

use crate::error::PipelineError;
use crate::mailbox::{Mailbox, MailboxCredentials, SenderFilter};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Configuration for one pipeline instance.
///
/// Built via [`PipelineConfig::builder()`].
///
/// # Example
/// ```rust,no_run
/// use mail2report::{MailboxCredentials, PipelineConfig};
///
/// let config = PipelineConfig::builder()
///     .credentials(MailboxCredentials {
///         host: "imap.example.com".into(),
///         port: 993,
///         user: "reports@example.com".into(),
///         secret: "app-password".into(),
///         tls: true,
///     })
///     .allowed_sender("a@x.com")
///     .attachment_root("uploads/pdfs")
///     .report_root("output")
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Mailbox account to poll. May be omitted when a pre-built
    /// [`Mailbox`] is injected via `mailbox`.
    pub credentials: Option<MailboxCredentials>,

    /// IMAP mailbox (folder) to search. Default: `"INBOX"`.
    pub mailbox_name: String,

    /// Allow-list narrowing which senders qualify. An empty filter does not
    /// narrow at all.
    pub sender_filter: SenderFilter,

    /// Maximum width of a normalised image in pixels. Default: 800.
    ///
    /// 800 × 1000 bounds an image to the printable area of an A4 page at the
    /// report's 72 DPI baseline; images are never upscaled to reach it.
    pub max_image_width: u32,

    /// Maximum height of a normalised image in pixels. Default: 1000.
    pub max_image_height: u32,

    /// Output encoding tier for normalised images. Default: [`ImageQuality::Standard`].
    pub quality: ImageQuality,

    /// Logo drawn on the report cover page. No cover page is produced when
    /// unset.
    pub logo_path: Option<PathBuf>,

    /// Report title used when the originating email has an empty subject.
    /// Default: `"Generated Report"`.
    pub default_title: String,

    /// Page size preset for generated reports. Default: [`PageSize::A4`].
    pub page_size: PageSize,

    /// Draw title/author/date header text on the cover page. Default: false.
    pub include_metadata: bool,

    /// Root directory for stored attachments. Normalised images are written
    /// to a `processed/` subdirectory underneath it. Attachment filenames
    /// never escape this root.
    pub attachment_root: PathBuf,

    /// Root directory for generated report PDFs.
    pub report_root: PathBuf,

    /// Keep normalised image files after they are embedded in a report.
    /// Default: true.
    pub keep_processed: bool,

    /// Number of attachments processed concurrently (extract → normalise →
    /// assemble). Default: 4.
    ///
    /// Each in-flight attachment can hold one decoded image in memory at a
    /// time, so size this against available memory divided by the largest
    /// decoded image you expect, not against CPU count alone. Mailbox
    /// protocol traffic is serialised on the single session regardless.
    pub concurrency: usize,

    /// Pre-constructed mailbox. Takes precedence over `credentials`; used by
    /// tests and callers with custom transports.
    pub mailbox: Option<Arc<dyn Mailbox>>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            credentials: None,
            mailbox_name: "INBOX".to_string(),
            sender_filter: SenderFilter::default(),
            max_image_width: 800,
            max_image_height: 1000,
            quality: ImageQuality::default(),
            logo_path: None,
            default_title: "Generated Report".to_string(),
            page_size: PageSize::default(),
            include_metadata: false,
            attachment_root: PathBuf::from("uploads/pdfs"),
            report_root: PathBuf::from("output"),
            keep_processed: true,
            concurrency: 4,
            mailbox: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("credentials", &self.credentials)
            .field("mailbox_name", &self.mailbox_name)
            .field("sender_filter", &self.sender_filter)
            .field("max_image_width", &self.max_image_width)
            .field("max_image_height", &self.max_image_height)
            .field("quality", &self.quality)
            .field("logo_path", &self.logo_path)
            .field("default_title", &self.default_title)
            .field("page_size", &self.page_size)
            .field("include_metadata", &self.include_metadata)
            .field("attachment_root", &self.attachment_root)
            .field("report_root", &self.report_root)
            .field("keep_processed", &self.keep_processed)
            .field("concurrency", &self.concurrency)
            .field("mailbox", &self.mailbox.as_ref().map(|_| "<dyn Mailbox>"))
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Directory for normalised image files.
    pub fn processed_dir(&self) -> PathBuf {
        self.attachment_root.join("processed")
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn credentials(mut self, creds: MailboxCredentials) -> Self {
        self.config.credentials = Some(creds);
        self
    }

    pub fn mailbox_name(mut self, name: impl Into<String>) -> Self {
        self.config.mailbox_name = name.into();
        self
    }

    /// Add one sender to the allow-list. Accepts `user@host`, `@domain`, or
    /// a bare domain.
    pub fn allowed_sender(mut self, pattern: impl Into<String>) -> Self {
        self.config.sender_filter.push(pattern.into());
        self
    }

    pub fn sender_filter(mut self, filter: SenderFilter) -> Self {
        self.config.sender_filter = filter;
        self
    }

    pub fn max_image_dimensions(mut self, width: u32, height: u32) -> Self {
        self.config.max_image_width = width;
        self.config.max_image_height = height;
        self
    }

    pub fn quality(mut self, quality: ImageQuality) -> Self {
        self.config.quality = quality;
        self
    }

    pub fn logo_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.logo_path = Some(path.into());
        self
    }

    pub fn default_title(mut self, title: impl Into<String>) -> Self {
        self.config.default_title = title.into();
        self
    }

    pub fn page_size(mut self, size: PageSize) -> Self {
        self.config.page_size = size;
        self
    }

    pub fn include_metadata(mut self, v: bool) -> Self {
        self.config.include_metadata = v;
        self
    }

    pub fn attachment_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.attachment_root = path.into();
        self
    }

    pub fn report_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.report_root = path.into();
        self
    }

    pub fn keep_processed(mut self, v: bool) -> Self {
        self.config.keep_processed = v;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn mailbox(mut self, mailbox: Arc<dyn Mailbox>) -> Self {
        self.config.mailbox = Some(mailbox);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let c = &self.config;
        if c.max_image_width == 0 || c.max_image_height == 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "Image bounds must be non-zero, got {}x{}",
                c.max_image_width, c.max_image_height
            )));
        }
        if c.concurrency == 0 {
            return Err(PipelineError::InvalidConfig(
                "Concurrency must be ≥ 1".into(),
            ));
        }
        if c.attachment_root.as_os_str().is_empty() || c.report_root.as_os_str().is_empty() {
            return Err(PipelineError::InvalidConfig(
                "Attachment and report roots must be set".into(),
            ));
        }
        if c.credentials.is_none() && c.mailbox.is_none() {
            return Err(PipelineError::InvalidConfig(
                "Either mailbox credentials or a pre-built mailbox is required".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Output encoding tier for normalised images.
///
/// The tier trades file size against fidelity of the embedded scans. JPEG is
/// fine for photographs and scanned pages; line art survives better as PNG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageQuality {
    /// JPEG, quality 60. Smallest files.
    Draft,
    /// JPEG, quality 85. (default)
    #[default]
    Standard,
    /// PNG. Lossless, largest files.
    Lossless,
}

impl ImageQuality {
    /// JPEG quality for this tier, or `None` for the lossless PNG tier.
    pub fn jpeg_quality(self) -> Option<u8> {
        match self {
            ImageQuality::Draft => Some(60),
            ImageQuality::Standard => Some(85),
            ImageQuality::Lossless => None,
        }
    }

    /// File extension for normalised images at this tier.
    pub fn extension(self) -> &'static str {
        match self {
            ImageQuality::Draft | ImageQuality::Standard => "jpg",
            ImageQuality::Lossless => "png",
        }
    }
}

/// Named page-size preset for generated reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageSize {
    /// 210 × 297 mm. (default)
    #[default]
    A4,
    /// 215.9 × 279.4 mm.
    Letter,
    /// 297 × 420 mm.
    A3,
}

impl PageSize {
    /// Page dimensions in millimetres (width, height).
    pub fn dimensions_mm(self) -> (f32, f32) {
        match self {
            PageSize::A4 => (210.0, 297.0),
            PageSize::Letter => (215.9, 279.4),
            PageSize::A3 => (297.0, 420.0),
        }
    }

    /// Page dimensions in PDF points (width, height); 1 mm = 72/25.4 pt.
    pub fn dimensions_pt(self) -> (f32, f32) {
        let (w, h) = self.dimensions_mm();
        (w * 72.0 / 25.4, h * 72.0 / 25.4)
    }
}
