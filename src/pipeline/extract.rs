//! PDF image extraction: walk the document's object graph and yield every
//! embedded raster image in deterministic order.
//!
//! The binary format is isolated here behind a typed decode step: lopdf
//! parses the cross-reference structure, and this module maps the untyped
//! dictionary soup into explicit [`ExtractedImage`] records before any other
//! stage touches the data. Pixel decoding happens later, in
//! [`crate::pipeline::normalize`] — an image object whose *encoding* is
//! exotic still extracts cleanly here and fails (non-fatally) there.
//!
//! ## Ordering
//!
//! Images are yielded in page order, then within-page resource-dictionary
//! discovery order. An image object referenced from several pages keeps its
//! first position only. The walk is a pure function of the input bytes, so
//! identical input yields an identical sequence — reports are reproducible.

use crate::error::AttachmentError;
use crate::pipeline::store::StoredAttachment;
use lopdf::{Dictionary, Document, Object, ObjectId};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, warn};

/// Colour space of a raw (non-JPEG) image payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColorSpaceKind {
    DeviceRgb,
    DeviceGray,
    DeviceCmyk,
    /// ICC profile stream; interpreted by component-count heuristic.
    IccBased,
    Other(String),
}

/// How an [`ExtractedImage`] payload is encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageEncoding {
    /// DCTDecode — the payload is a complete JPEG file.
    Jpeg,
    /// FlateDecode over raw samples.
    Flate {
        color_space: ColorSpaceKind,
        bits_per_component: u16,
    },
    /// Unfiltered raw samples.
    Raw {
        color_space: ColorSpaceKind,
        bits_per_component: u16,
    },
    /// Anything else (JPXDecode, CCITTFaxDecode, JBIG2Decode, filter
    /// chains). Carried through so the normaliser can count the drop.
    Unsupported { filter: String },
}

/// One embedded raster image, as found in the document.
///
/// Created here, consumed and discarded by the normaliser within the same
/// cycle.
#[derive(Debug, Clone)]
pub struct ExtractedImage {
    /// Encoded payload bytes, exactly as stored in the PDF stream.
    pub data: Vec<u8>,
    pub encoding: ImageEncoding,
    /// Declared pixel width.
    pub width: u32,
    /// Declared pixel height.
    pub height: u32,
    /// 0-based index of the first page referencing this image.
    pub page_index: usize,
    /// PDF object id, for dedup and stable ordering.
    pub object_id: (u32, u16),
}

/// Result of walking one document.
#[derive(Debug, Default)]
pub struct Extraction {
    pub images: Vec<ExtractedImage>,
    /// Image objects that were structurally unusable (zero dimensions,
    /// missing stream data). Counted, never fatal.
    pub skipped_objects: usize,
}

/// Extract every embedded raster image from a stored attachment.
///
/// Fails with [`AttachmentError::CorruptDocument`] only when the structural
/// parse fails outright; individually malformed image objects are skipped
/// and counted in [`Extraction::skipped_objects`].
pub fn extract_images(stored: &StoredAttachment) -> Result<Extraction, AttachmentError> {
    let bytes = std::fs::read(&stored.path).map_err(|e| AttachmentError::Io {
        name: stored.filename.clone(),
        detail: format!("cannot read {}: {e}", stored.path.display()),
    })?;
    extract_images_from_bytes(&bytes, &stored.path)
}

/// Extract from in-memory document bytes. `origin` only labels errors.
pub fn extract_images_from_bytes(
    bytes: &[u8],
    origin: &Path,
) -> Result<Extraction, AttachmentError> {
    if bytes.len() < 4 || &bytes[..4] != b"%PDF" {
        return Err(AttachmentError::CorruptDocument {
            path: origin.to_path_buf(),
            detail: "missing %PDF header".into(),
        });
    }

    let doc = Document::load_mem(bytes).map_err(|e| AttachmentError::CorruptDocument {
        path: origin.to_path_buf(),
        detail: e.to_string(),
    })?;

    let mut extraction = Extraction::default();
    let mut seen: HashSet<ObjectId> = HashSet::new();

    // get_pages returns a BTreeMap keyed by 1-based page number, so page
    // order is already sorted and stable.
    for (page_no, page_id) in doc.get_pages() {
        let page_index = (page_no - 1) as usize;
        let Ok(Object::Dictionary(page_dict)) = doc.get_object(page_id) else {
            warn!(page_no, "Page object is not a dictionary, skipping");
            continue;
        };

        let Some(resources) = page_resources(&doc, page_dict) else {
            continue;
        };
        let Some(xobjects) = resolve_dict(&doc, resources.get(b"XObject").ok()) else {
            continue;
        };

        for (name, value) in xobjects.iter() {
            let Object::Reference(object_id) = value else {
                continue;
            };
            if seen.contains(object_id) {
                continue;
            }
            let Ok(Object::Stream(stream)) = doc.get_object(*object_id) else {
                continue;
            };
            if name_entry(&stream.dict, b"Subtype").as_deref() != Some("Image") {
                continue;
            }
            seen.insert(*object_id);

            match image_from_stream(&doc, stream, page_index, *object_id) {
                Some(image) => {
                    debug!(
                        page = page_index,
                        name = %String::from_utf8_lossy(name),
                        width = image.width,
                        height = image.height,
                        "Found embedded image"
                    );
                    extraction.images.push(image);
                }
                None => {
                    warn!(page = page_index, object = ?object_id, "Skipping malformed image object");
                    extraction.skipped_objects += 1;
                }
            }
        }
    }

    debug!(
        images = extraction.images.len(),
        skipped = extraction.skipped_objects,
        "Extraction complete"
    );
    Ok(extraction)
}

/// Map one image XObject stream into a typed record.
fn image_from_stream(
    doc: &Document,
    stream: &lopdf::Stream,
    page_index: usize,
    object_id: ObjectId,
) -> Option<ExtractedImage> {
    let width = int_entry(&stream.dict, b"Width")? as u32;
    let height = int_entry(&stream.dict, b"Height")? as u32;
    if width == 0 || height == 0 || stream.content.is_empty() {
        return None;
    }

    let bits = int_entry(&stream.dict, b"BitsPerComponent").unwrap_or(8) as u16;
    let color_space = color_space_kind(doc, stream.dict.get(b"ColorSpace").ok());

    let filters = filter_names(&stream.dict);
    let encoding = match filters.as_slice() {
        [] => ImageEncoding::Raw {
            color_space,
            bits_per_component: bits,
        },
        [f] if f == "FlateDecode" => ImageEncoding::Flate {
            color_space,
            bits_per_component: bits,
        },
        [f] if f == "DCTDecode" => ImageEncoding::Jpeg,
        other => ImageEncoding::Unsupported {
            filter: other.join("+"),
        },
    };

    Some(ExtractedImage {
        data: stream.content.clone(),
        encoding,
        width,
        height,
        page_index,
        object_id,
    })
}

/// Page resources, falling back to the parent tree when inherited.
fn page_resources<'a>(doc: &'a Document, page_dict: &'a Dictionary) -> Option<&'a Dictionary> {
    if let Some(res) = resolve_dict(doc, page_dict.get(b"Resources").ok()) {
        return Some(res);
    }
    let mut parent = page_dict.get(b"Parent").ok();
    // The page tree is shallow in practice; bound the climb anyway.
    for _ in 0..32 {
        let Some(Object::Reference(parent_id)) = parent else {
            return None;
        };
        let Ok(Object::Dictionary(parent_dict)) = doc.get_object(*parent_id) else {
            return None;
        };
        if let Some(res) = resolve_dict(doc, parent_dict.get(b"Resources").ok()) {
            return Some(res);
        }
        parent = parent_dict.get(b"Parent").ok();
    }
    None
}

/// Follow a reference (if any) down to a dictionary.
fn resolve_dict<'a>(doc: &'a Document, obj: Option<&'a Object>) -> Option<&'a Dictionary> {
    match obj? {
        Object::Dictionary(d) => Some(d),
        Object::Reference(id) => match doc.get_object(*id).ok()? {
            Object::Dictionary(d) => Some(d),
            _ => None,
        },
        _ => None,
    }
}

fn name_entry(dict: &Dictionary, key: &[u8]) -> Option<String> {
    match dict.get(key).ok()? {
        Object::Name(n) => Some(String::from_utf8_lossy(n).into_owned()),
        _ => None,
    }
}

fn int_entry(dict: &Dictionary, key: &[u8]) -> Option<i64> {
    match dict.get(key).ok()? {
        Object::Integer(n) => Some(*n),
        _ => None,
    }
}

fn filter_names(dict: &Dictionary) -> Vec<String> {
    match dict.get(b"Filter") {
        Ok(Object::Name(n)) => vec![String::from_utf8_lossy(n).into_owned()],
        Ok(Object::Array(arr)) => arr
            .iter()
            .filter_map(|f| match f {
                Object::Name(n) => Some(String::from_utf8_lossy(n).into_owned()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn color_space_kind(doc: &Document, obj: Option<&Object>) -> ColorSpaceKind {
    match obj {
        Some(Object::Name(n)) => color_space_from_name(&String::from_utf8_lossy(n)),
        Some(Object::Array(arr)) => match arr.first() {
            Some(Object::Name(n)) => color_space_from_name(&String::from_utf8_lossy(n)),
            _ => ColorSpaceKind::Other("unknown".into()),
        },
        Some(Object::Reference(id)) => match doc.get_object(*id) {
            Ok(resolved) => color_space_kind(doc, Some(resolved)),
            Err(_) => ColorSpaceKind::Other("unresolved".into()),
        },
        _ => ColorSpaceKind::DeviceRgb,
    }
}

fn color_space_from_name(name: &str) -> ColorSpaceKind {
    match name {
        "DeviceRGB" | "CalRGB" => ColorSpaceKind::DeviceRgb,
        "DeviceGray" | "CalGray" => ColorSpaceKind::DeviceGray,
        "DeviceCMYK" => ColorSpaceKind::DeviceCmyk,
        "ICCBased" => ColorSpaceKind::IccBased,
        other => ColorSpaceKind::Other(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::Stream;

    /// Build a document with one page per entry; each entry is
    /// `(width, height, color_space, filter)`.
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
            let samples = vec![128u8; (*w * *h) as usize];
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

    #[test]
    fn extracts_in_page_order() {
        let bytes = build_pdf(&[
            (4, 3, b"DeviceGray", None),
            (8, 5, b"DeviceRGB", None),
        ]);
        let extraction = extract_images_from_bytes(&bytes, Path::new("t.pdf")).unwrap();
        assert_eq!(extraction.images.len(), 2);
        assert_eq!(extraction.skipped_objects, 0);
        assert_eq!(extraction.images[0].page_index, 0);
        assert_eq!(extraction.images[0].width, 4);
        assert_eq!(extraction.images[1].page_index, 1);
        assert_eq!(extraction.images[1].width, 8);
    }

    #[test]
    fn identical_bytes_yield_identical_sequences() {
        let bytes = build_pdf(&[
            (4, 4, b"DeviceGray", None),
            (6, 2, b"DeviceRGB", None),
            (3, 3, b"DeviceGray", None),
        ]);
        let a = extract_images_from_bytes(&bytes, Path::new("t.pdf")).unwrap();
        let b = extract_images_from_bytes(&bytes, Path::new("t.pdf")).unwrap();
        let ids_a: Vec<_> = a.images.iter().map(|i| i.object_id).collect();
        let ids_b: Vec<_> = b.images.iter().map(|i| i.object_id).collect();
        assert_eq!(ids_a, ids_b);
        let data_a: Vec<_> = a.images.iter().map(|i| i.data.clone()).collect();
        let data_b: Vec<_> = b.images.iter().map(|i| i.data.clone()).collect();
        assert_eq!(data_a, data_b);
    }

    #[test]
    fn zero_images_in_imageless_document() {
        let bytes = build_pdf(&[]);
        let extraction = extract_images_from_bytes(&bytes, Path::new("t.pdf")).unwrap();
        assert!(extraction.images.is_empty());
    }

    #[test]
    fn classifies_encodings() {
        let bytes = build_pdf(&[
            (2, 2, b"DeviceGray", None),
            (2, 2, b"DeviceRGB", Some(b"DCTDecode")),
            (2, 2, b"DeviceRGB", Some(b"JPXDecode")),
        ]);
        let extraction = extract_images_from_bytes(&bytes, Path::new("t.pdf")).unwrap();
        assert_eq!(extraction.images.len(), 3);
        assert!(matches!(
            extraction.images[0].encoding,
            ImageEncoding::Raw {
                color_space: ColorSpaceKind::DeviceGray,
                bits_per_component: 8
            }
        ));
        assert!(matches!(extraction.images[1].encoding, ImageEncoding::Jpeg));
        assert!(matches!(
            extraction.images[2].encoding,
            ImageEncoding::Unsupported { .. }
        ));
    }

    #[test]
    fn garbage_bytes_are_a_corrupt_document() {
        let err = extract_images_from_bytes(b"not a pdf at all", Path::new("bad.pdf")).unwrap_err();
        assert!(matches!(err, AttachmentError::CorruptDocument { .. }));
    }

    #[test]
    fn truncated_pdf_is_a_corrupt_document() {
        let mut bytes = build_pdf(&[(4, 4, b"DeviceGray", None)]);
        bytes.truncate(bytes.len() / 2);
        let err = extract_images_from_bytes(&bytes, Path::new("t.pdf")).unwrap_err();
        assert!(matches!(err, AttachmentError::CorruptDocument { .. }));
    }
}
