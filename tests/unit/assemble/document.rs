use super::*;
use crate::format::registry::PrintFormat;
use crate::foundation::error::ErrorKind;
use image::RgbImage;

fn page(index: usize) -> Page {
    let format = PrintFormat::new("tiny", 1.0, 0.5, 0.1, 20);
    let (w, h) = format.page_px();
    Page {
        recipient_index: index,
        format,
        pixels: RgbImage::from_pixel(w, h, image::Rgb([10, 120, 200])),
        scale: 1.0,
    }
}

#[test]
fn empty_input_is_an_empty_batch() {
    let err = assemble_document(&[], DocumentMode::Merged).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EmptyBatch);
}

#[test]
fn per_recipient_mode_yields_one_single_page_pdf_each() {
    let docs = assemble_document(&[page(3), page(0)], DocumentMode::OneFilePerRecipient).unwrap();
    assert_eq!(docs.len(), 2);
    assert_eq!(docs[0].name, "recipient-00003.pdf");
    assert_eq!(docs[1].recipient_indices, vec![0]);
    for d in &docs {
        let pdf = Document::load_mem(&d.bytes).unwrap();
        assert_eq!(pdf.get_pages().len(), 1);
    }
}

#[test]
fn merged_mode_keeps_input_order_and_trim_boxes() {
    let docs = assemble_document(&[page(0), page(1), page(2)], DocumentMode::Merged).unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].name, MERGED_DOCUMENT_NAME);
    assert_eq!(docs[0].recipient_indices, vec![0, 1, 2]);

    let pdf = Document::load_mem(&docs[0].bytes).unwrap();
    let pages = pdf.get_pages();
    assert_eq!(pages.len(), 3);
    let first = pdf.get_dictionary(pages[&1]).unwrap();
    let trim = first.get(b"TrimBox").unwrap().as_array().unwrap();
    assert_eq!(trim.len(), 4);
    let media = first.get(b"MediaBox").unwrap().as_array().unwrap();
    assert!((media[2].as_float().unwrap() - 86.4).abs() < 0.01);
}

#[test]
fn mode_parses_cli_spellings() {
    assert_eq!("merged".parse::<DocumentMode>().unwrap(), DocumentMode::Merged);
    assert_eq!(
        "per-recipient".parse::<DocumentMode>().unwrap(),
        DocumentMode::OneFilePerRecipient
    );
    assert!("zip".parse::<DocumentMode>().is_err());
    assert_eq!(DocumentMode::OneFilePerRecipient.to_string(), "per-recipient");
}
