use std::fmt;
use std::str::FromStr;

use anyhow::Context as _;
use image::ExtendedColorType;
use image::codecs::jpeg::JpegEncoder;
use lopdf::{Document, Object, Stream, dictionary};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::assemble::page::Page;
use crate::config::AssemblyPolicy;
use crate::foundation::error::{MailError, MailResult};

/// How rendered pages are packaged into documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentMode {
    /// One single-page PDF per recipient.
    OneFilePerRecipient,
    /// One multi-page PDF for the whole batch, in recipient order.
    Merged,
}

impl fmt::Display for DocumentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::OneFilePerRecipient => "per-recipient",
            Self::Merged => "merged",
        })
    }
}

impl FromStr for DocumentMode {
    type Err = MailError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "per-recipient" | "one_file_per_recipient" => Ok(Self::OneFilePerRecipient),
            "merged" => Ok(Self::Merged),
            other => Err(MailError::validation(format!(
                "unknown document mode '{other}' (expected 'per-recipient' or 'merged')"
            ))),
        }
    }
}

/// A finished PDF ready for a [`crate::assemble::sink::DocumentSink`].
#[derive(Clone, PartialEq, Eq)]
pub struct AssembledDocument {
    /// File name, unique within a batch.
    pub name: String,
    /// Packaging mode that produced the document.
    pub mode: DocumentMode,
    /// Recipients whose pages the document holds, in page order.
    pub recipient_indices: Vec<usize>,
    /// PDF bytes.
    pub bytes: Vec<u8>,
}

impl fmt::Debug for AssembledDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssembledDocument")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("recipient_indices", &self.recipient_indices)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

/// File name for a recipient's own document.
pub fn recipient_document_name(recipient_index: usize) -> String {
    format!("recipient-{recipient_index:05}.pdf")
}

/// File name of a merged batch document.
pub const MERGED_DOCUMENT_NAME: &str = "batch.pdf";

/// Package `pages` using the default assembly policy.
pub fn assemble_document(pages: &[Page], mode: DocumentMode) -> MailResult<Vec<AssembledDocument>> {
    assemble_document_with(pages, mode, &AssemblyPolicy::default())
}

/// Package `pages` into PDFs.
///
/// Each page becomes a full-bleed JPEG image whose `MediaBox` spans the bleed and whose
/// `TrimBox` marks the cut line. Images are encoded in parallel; page order follows `pages`.
pub fn assemble_document_with(
    pages: &[Page],
    mode: DocumentMode,
    policy: &AssemblyPolicy,
) -> MailResult<Vec<AssembledDocument>> {
    if pages.is_empty() {
        return Err(MailError::empty_batch("no pages to assemble"));
    }

    let encoded = pages
        .par_iter()
        .map(|p| encode_jpeg(p, policy.jpeg_quality))
        .collect::<MailResult<Vec<_>>>()?;

    match mode {
        DocumentMode::OneFilePerRecipient => pages
            .iter()
            .zip(encoded)
            .map(|(page, jpeg)| {
                Ok(AssembledDocument {
                    name: recipient_document_name(page.recipient_index),
                    mode,
                    recipient_indices: vec![page.recipient_index],
                    bytes: build_pdf(vec![(page, jpeg)])?,
                })
            })
            .collect(),
        DocumentMode::Merged => {
            let entries: Vec<(&Page, Vec<u8>)> = pages.iter().zip(encoded).collect();
            Ok(vec![AssembledDocument {
                name: MERGED_DOCUMENT_NAME.to_owned(),
                mode,
                recipient_indices: pages.iter().map(|p| p.recipient_index).collect(),
                bytes: build_pdf(entries)?,
            }])
        }
    }
}

fn encode_jpeg(page: &Page, quality: u8) -> MailResult<Vec<u8>> {
    let (w, h) = page.pixels.dimensions();
    let mut out = Vec::with_capacity((w as usize * h as usize) / 4);
    JpegEncoder::new_with_quality(&mut out, quality)
        .encode(page.pixels.as_raw(), w, h, ExtendedColorType::Rgb8)
        .with_context(|| format!("encode page for recipient {}", page.recipient_index))?;
    Ok(out)
}

fn pt_array(rect: [f64; 4]) -> Object {
    Object::Array(rect.iter().map(|v| Object::Real(*v as f32)).collect())
}

fn build_pdf(pages: Vec<(&Page, Vec<u8>)>) -> MailResult<Vec<u8>> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let mut kids = Vec::with_capacity(pages.len());

    for (page, jpeg) in pages {
        let (w_px, h_px) = page.pixels.dimensions();
        let media = page.format.media_box_pt();

        let image_id = doc.add_object(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => i64::from(w_px),
                "Height" => i64::from(h_px),
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8,
                "Filter" => "DCTDecode",
            },
            jpeg,
        ));

        let content =
            format!("q {:.4} 0 0 {:.4} 0 0 cm /Im0 Do Q\n", media[2], media[3]).into_bytes();
        let content_id = doc.add_object(Stream::new(dictionary! {}, content));

        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => dictionary! {
                "XObject" => dictionary! {
                    "Im0" => image_id,
                },
            },
            "MediaBox" => pt_array(media),
            "BleedBox" => pt_array(media),
            "TrimBox" => pt_array(page.format.trim_box_pt()),
        });
        kids.push(Object::Reference(page_id));
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    let info_id = doc.add_object(dictionary! {
        "Producer" => Object::string_literal("mailpress"),
    });
    doc.trailer.set("Info", info_id);

    let mut out = Vec::new();
    doc.save_to(&mut out).context("serialize PDF")?;
    Ok(out)
}

#[cfg(test)]
#[path = "../../tests/unit/assemble/document.rs"]
mod tests;
