//! Report assembly: normalised images into one captioned PDF.
//!
//! The document is built object by object with lopdf — the same typed
//! object model the extractor reads with. Each image becomes an XObject
//! drawn through a `cm`/`Do` pair, one image per page, caption below;
//! an optional cover page carries the configured logo and, when enabled,
//! a title/author/date header. Geometry is computed in whole PDF points.
//!
//! Placement per page:
//! `scale = min((page_w − H_MARGIN) / img_w, (page_h − V_MARGIN) / img_h)`,
//! image centred horizontally with its top edge `TOP_OFFSET` below the page
//! top; the caption sits at a fixed position near the bottom margin.

use crate::config::PipelineConfig;
use crate::error::AttachmentError;
use crate::pipeline::normalize::ProcessedImage;
use crate::pipeline::store::unique_path;
use chrono::{DateTime, Utc};
use lopdf::content::{Content, Operation};
use lopdf::{Dictionary, Document, Object, ObjectId, Stream};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Total horizontal margin reserved around an image, in points.
const H_MARGIN: f64 = 100.0;
/// Total vertical margin reserved around an image, in points.
const V_MARGIN: f64 = 150.0;
/// Distance from the page top to the image's top edge, in points.
const TOP_OFFSET: f64 = 50.0;
/// Caption anchor, in points from the bottom-left corner.
const CAPTION_POS: (f64, f64) = (50.0, 30.0);
const CAPTION_SIZE: i64 = 12;
/// Logo placement on the cover page (x, distance from page top), in points.
const LOGO_POS: (f64, f64) = (50.0, 100.0);
const LOGO_SCALE: f64 = 0.5;

/// Title, author, and creation date carried into the document Info
/// dictionary. Derived from the originating email.
#[derive(Debug, Clone)]
pub struct ReportMetadata {
    pub title: String,
    pub author: String,
    pub created: DateTime<Utc>,
}

/// The terminal artifact of one attachment's pipeline run.
///
/// Ownership passes to the calling collaborator; the pipeline never deletes
/// a generated report.
#[derive(Debug, Clone)]
pub struct GeneratedReport {
    pub path: PathBuf,
    pub images: Vec<ProcessedImage>,
    pub metadata: ReportMetadata,
    pub generated_at: DateTime<Utc>,
}

/// Assemble one report PDF from an ordered list of normalised images.
///
/// Requires at least one image — an empty list is the orchestrator's
/// Warning path and is rejected here defensively. Fails with
/// [`AttachmentError::Render`] only on unrecoverable build/write failures;
/// an individual unreadable image file is skipped with a warning.
pub fn generate_report(
    images: &[ProcessedImage],
    metadata: &ReportMetadata,
    config: &PipelineConfig,
) -> Result<GeneratedReport, AttachmentError> {
    let render = |detail: String| AttachmentError::Render { detail };

    if images.is_empty() {
        return Err(render("no images to embed".into()));
    }

    let (page_w_pt, page_h_pt) = config.page_size.dimensions_pt();
    let (page_w, page_h) = (page_w_pt as f64, page_h_pt as f64);

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(helvetica());
    let mut kids: Vec<Object> = Vec::new();
    let mut embedded: Vec<ProcessedImage> = Vec::new();

    // Cover page: logo and, when enabled, a metadata header.
    if config.logo_path.is_some() || config.include_metadata {
        if let Some(page) = cover_page(
            &mut doc,
            pages_id,
            font_id,
            metadata,
            config,
            page_w,
            page_h,
        ) {
            kids.push(Object::Reference(page));
        }
    }

    for image in images {
        match image_page(&mut doc, pages_id, font_id, image, page_w, page_h) {
            Ok(page_id) => {
                kids.push(Object::Reference(page_id));
                embedded.push(image.clone());
            }
            Err(detail) => {
                // Not expected after normalisation; drop the page, keep going.
                warn!(path = %image.path.display(), detail = %detail, "Skipping unplaceable image");
            }
        }
    }

    if embedded.is_empty() {
        return Err(render("every image failed to embed".into()));
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

    let generated_at = Utc::now();
    let info_id = info_dictionary(&mut doc, metadata, generated_at);
    doc.trailer.set("Info", Object::Reference(info_id));

    std::fs::create_dir_all(&config.report_root)
        .map_err(|e| render(format!("cannot create {}: {e}", config.report_root.display())))?;
    let name = format!("report_{}.pdf", generated_at.format("%Y%m%d%H%M%S"));
    let path = unique_path(&config.report_root, &name);

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes)
        .map_err(|e| render(format!("document serialisation failed: {e}")))?;
    if let Err(e) = std::fs::write(&path, &bytes) {
        let _ = std::fs::remove_file(&path);
        return Err(render(format!("write to {} failed: {e}", path.display())));
    }

    info!(
        path = %path.display(),
        pages = embedded.len(),
        title = %metadata.title,
        "Generated report"
    );
    Ok(GeneratedReport {
        path,
        images: embedded,
        metadata: metadata.clone(),
        generated_at,
    })
}

// ── Page builders ────────────────────────────────────────────────────────

/// One page drawing `image` per the placement formula, captioned with the
/// image's file name.
fn image_page(
    doc: &mut Document,
    pages_id: ObjectId,
    font_id: ObjectId,
    image: &ProcessedImage,
    page_w: f64,
    page_h: f64,
) -> Result<ObjectId, String> {
    let decoded = image::open(&image.path).map_err(|e| e.to_string())?;
    let rgb = decoded.to_rgb8();
    let (px_w, px_h) = rgb.dimensions();

    let xobject_id = doc.add_object(Object::Stream(rgb_xobject(px_w, px_h, rgb.into_raw())));

    let scale = ((page_w - H_MARGIN) / px_w as f64).min((page_h - V_MARGIN) / px_h as f64);
    let scaled_w = px_w as f64 * scale;
    let scaled_h = px_h as f64 * scale;
    let x = (page_w - scaled_w) / 2.0;
    let y = page_h - scaled_h - TOP_OFFSET;

    let caption = format!(
        "Image {}",
        image
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "(unnamed)".to_string())
    );

    let content = Content {
        operations: vec![
            Operation::new("q", vec![]),
            Operation::new(
                "cm",
                vec![
                    pt(scaled_w),
                    0.into(),
                    0.into(),
                    pt(scaled_h),
                    pt(x),
                    pt(y),
                ],
            ),
            Operation::new("Do", vec![Object::Name(b"Im0".to_vec())]),
            Operation::new("Q", vec![]),
            Operation::new("BT", vec![]),
            Operation::new(
                "Tf",
                vec![Object::Name(b"F1".to_vec()), CAPTION_SIZE.into()],
            ),
            Operation::new("Td", vec![pt(CAPTION_POS.0), pt(CAPTION_POS.1)]),
            Operation::new("Tj", vec![Object::string_literal(ascii_safe(&caption))]),
            Operation::new("ET", vec![]),
        ],
    };

    add_page(
        doc,
        pages_id,
        font_id,
        Some(xobject_id),
        content,
        page_w,
        page_h,
    )
}

/// The cover page: logo at the top-left, optional metadata header lines.
/// Returns `None` when there is nothing to draw (logo unreadable and no
/// metadata requested).
fn cover_page(
    doc: &mut Document,
    pages_id: ObjectId,
    font_id: ObjectId,
    metadata: &ReportMetadata,
    config: &PipelineConfig,
    page_w: f64,
    page_h: f64,
) -> Option<ObjectId> {
    let mut operations: Vec<Operation> = Vec::new();
    let mut logo_xobject: Option<ObjectId> = None;

    if let Some(logo_path) = &config.logo_path {
        match image::open(logo_path) {
            Ok(logo) => {
                let rgb = logo.to_rgb8();
                let (w, h) = rgb.dimensions();
                let scaled_w = w as f64 * LOGO_SCALE;
                let scaled_h = h as f64 * LOGO_SCALE;
                let id = doc.add_object(Object::Stream(rgb_xobject(w, h, rgb.into_raw())));
                operations.extend([
                    Operation::new("q", vec![]),
                    Operation::new(
                        "cm",
                        vec![
                            pt(scaled_w),
                            0.into(),
                            0.into(),
                            pt(scaled_h),
                            pt(LOGO_POS.0),
                            pt(page_h - LOGO_POS.1),
                        ],
                    ),
                    Operation::new("Do", vec![Object::Name(b"Im0".to_vec())]),
                    Operation::new("Q", vec![]),
                ]);
                logo_xobject = Some(id);
            }
            Err(e) => warn!(path = %logo_path.display(), "Logo unreadable, skipping: {e}"),
        }
    }

    if config.include_metadata {
        let lines: [(String, i64, f64); 3] = [
            (metadata.title.clone(), 16, page_h - 140.0),
            (format!("Author: {}", metadata.author), 10, page_h - 158.0),
            (
                format!("Date: {}", metadata.created.format("%Y-%m-%d %H:%M UTC")),
                10,
                page_h - 172.0,
            ),
        ];
        for (text, size, y) in lines {
            operations.extend([
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec![Object::Name(b"F1".to_vec()), size.into()]),
                Operation::new("Td", vec![pt(50.0), pt(y)]),
                Operation::new("Tj", vec![Object::string_literal(ascii_safe(&text))]),
                Operation::new("ET", vec![]),
            ]);
        }
    }

    if operations.is_empty() {
        return None;
    }

    add_page(
        doc,
        pages_id,
        font_id,
        logo_xobject,
        Content { operations },
        page_w,
        page_h,
    )
    .ok()
}

fn add_page(
    doc: &mut Document,
    pages_id: ObjectId,
    font_id: ObjectId,
    xobject_id: Option<ObjectId>,
    content: Content,
    page_w: f64,
    page_h: f64,
) -> Result<ObjectId, String> {
    let encoded = content.encode().map_err(|e| e.to_string())?;
    let content_id = doc.add_object(Object::Stream(Stream::new(Dictionary::new(), encoded)));

    let mut fonts = Dictionary::new();
    fonts.set("F1", Object::Reference(font_id));
    let mut resources = Dictionary::new();
    if let Some(id) = xobject_id {
        let mut xobjects = Dictionary::new();
        xobjects.set("Im0", Object::Reference(id));
        resources.set("XObject", Object::Dictionary(xobjects));
    }
    resources.set("Font", Object::Dictionary(fonts));

    let mut page = Dictionary::new();
    page.set("Type", Object::Name(b"Page".to_vec()));
    page.set("Parent", Object::Reference(pages_id));
    page.set("Contents", Object::Reference(content_id));
    page.set("Resources", Object::Dictionary(resources));
    page.set(
        "MediaBox",
        Object::Array(vec![
            0.into(),
            0.into(),
            pt(page_w),
            pt(page_h),
        ]),
    );
    Ok(doc.add_object(Object::Dictionary(page)))
}

// ── Object helpers ───────────────────────────────────────────────────────

/// An uncompressed DeviceRGB image XObject.
fn rgb_xobject(width: u32, height: u32, raw_rgb: Vec<u8>) -> Stream {
    let mut dict = Dictionary::new();
    dict.set("Type", Object::Name(b"XObject".to_vec()));
    dict.set("Subtype", Object::Name(b"Image".to_vec()));
    dict.set("Width", Object::Integer(width as i64));
    dict.set("Height", Object::Integer(height as i64));
    dict.set("ColorSpace", Object::Name(b"DeviceRGB".to_vec()));
    dict.set("BitsPerComponent", Object::Integer(8));
    Stream::new(dict, raw_rgb)
}

fn helvetica() -> Object {
    let mut font = Dictionary::new();
    font.set("Type", Object::Name(b"Font".to_vec()));
    font.set("Subtype", Object::Name(b"Type1".to_vec()));
    font.set("BaseFont", Object::Name(b"Helvetica".to_vec()));
    Object::Dictionary(font)
}

fn info_dictionary(
    doc: &mut Document,
    metadata: &ReportMetadata,
    generated_at: DateTime<Utc>,
) -> ObjectId {
    let mut info = Dictionary::new();
    info.set("Title", Object::string_literal(ascii_safe(&metadata.title)));
    info.set("Author", Object::string_literal(ascii_safe(&metadata.author)));
    info.set(
        "CreationDate",
        Object::string_literal(format!("D:{}Z", generated_at.format("%Y%m%d%H%M%S"))),
    );
    doc.add_object(Object::Dictionary(info))
}

/// Whole-point operand. Sub-point placement precision is invisible at page
/// scale and keeps the content stream free of float formatting concerns.
fn pt(value: f64) -> Object {
    Object::Integer(value.round() as i64)
}

/// Captions and Info strings are drawn with a WinAnsi base font; keep them
/// to printable ASCII and neutralise the string delimiters.
fn ascii_safe(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '(' | ')' | '\\' => '_',
            c if c.is_ascii_graphic() || c == ' ' => c,
            _ => '_',
        })
        .collect()
}
