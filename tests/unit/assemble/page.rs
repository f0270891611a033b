use super::*;
use crate::foundation::error::ErrorKind;

fn solid(width: u32, height: u32, rgba: [u8; 4]) -> RasterImage {
    RasterImage {
        width,
        height,
        data: rgba.repeat((width * height) as usize),
        text_runs: Vec::new(),
    }
}

fn tiny() -> PrintFormat {
    PrintFormat::new("tiny", 1.0, 0.5, 0.0, 10)
}

#[test]
fn exact_raster_passes_through() {
    let page = assemble_page(&solid(10, 5, [200, 0, 0, 255]), &tiny(), &AssemblyPolicy::default())
        .unwrap();
    assert_eq!(page.pixels.dimensions(), (10, 5));
    assert_eq!(page.pixels.get_pixel(3, 3).0, [200, 0, 0]);
    assert!((page.scale - 1.0).abs() < 1e-12);
}

#[test]
fn larger_raster_is_downscaled_and_cropped_to_cover() {
    let page = assemble_page(&solid(40, 40, [0, 0, 255, 255]), &tiny(), &AssemblyPolicy::default())
        .unwrap();
    assert_eq!(page.pixels.dimensions(), (10, 5));
    assert!((page.scale - 0.25).abs() < 1e-12);
    let [r, g, b] = page.pixels.get_pixel(5, 2).0;
    assert!(r <= 1 && g <= 1 && b >= 254, "got {r},{g},{b}");
}

#[test]
fn excessive_upscale_is_rejected_unless_allowed() {
    let small = solid(4, 4, [0, 0, 0, 255]);
    let err = assemble_page(&small, &tiny(), &AssemblyPolicy::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ImageTooSmall);

    let policy = AssemblyPolicy {
        allow_upscale: true,
        ..AssemblyPolicy::default()
    };
    let page = assemble_page(&small, &tiny(), &policy).unwrap();
    assert_eq!(page.pixels.dimensions(), (10, 5));
    assert!(page.scale > 2.0);
}

#[test]
fn transparency_is_flattened_onto_white() {
    let page = assemble_page(&solid(10, 5, [0, 0, 0, 0]), &tiny(), &AssemblyPolicy::default())
        .unwrap();
    assert_eq!(page.pixels.get_pixel(0, 0).0, [255, 255, 255]);
}

#[test]
fn bleed_is_part_of_the_canvas() {
    let fmt = PrintFormat::new("bled", 1.0, 1.0, 0.1, 10);
    let page = assemble_page(&solid(12, 12, [9, 9, 9, 255]), &fmt, &AssemblyPolicy::default())
        .unwrap()
        .for_recipient(7);
    assert_eq!(page.pixels.dimensions(), (12, 12));
    assert_eq!(page.recipient_index, 7);
}

#[test]
fn malformed_raster_is_an_engine_fault() {
    let mut bad = solid(2, 2, [0, 0, 0, 255]);
    bad.data.pop();
    let err = assemble_page(&bad, &tiny(), &AssemblyPolicy::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EngineFault);
}
