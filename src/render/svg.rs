//! Built-in CPU render engine.
//!
//! Each surface owns a long-lived paint thread, the moral equivalent of a browser page process:
//! the harness (decoded background and static images) is prepared once per template, and every
//! render turns the scene graph plus the injected fields into SVG layers rasterized by `resvg`.
//! Image nodes are composited between the vector layers so paint order matches node order.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, mpsc};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Context as _;
use resvg::tiny_skia::{self, IntSize, Pixmap, PixmapPaint, Transform};

use crate::foundation::core::{Generation, SurfaceId};
use crate::foundation::error::{MailError, MailResult};
use crate::render::engine::{
    FieldValues, RasterImage, RenderEngine, RenderSignal, SignalSender, SurfaceDriver,
};
use crate::template::model::{
    ImageSource, NodeKind, SceneNode, Template, TextAlign, fill_placeholders,
};

/// Largest raster edge the engine will allocate.
const MAX_DIM: u32 = 16_384;

/// How long closing a surface waits for its paint thread before detaching it.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Options for [`SvgEngine`].
#[derive(Clone, Debug)]
pub struct SvgEngineOpts {
    /// Pixels per design unit.
    pub device_scale: f64,
    /// Extra directories scanned for `.ttf`/`.otf`/`.ttc` fonts.
    pub font_dirs: Vec<PathBuf>,
    /// Load the host's system fonts.
    pub system_fonts: bool,
}

impl Default for SvgEngineOpts {
    fn default() -> Self {
        Self {
            device_scale: 1.0,
            font_dirs: Vec::new(),
            system_fonts: true,
        }
    }
}

/// CPU engine rasterizing templates through `usvg`/`resvg`.
pub struct SvgEngine {
    opts: SvgEngineOpts,
    fontdb: Arc<usvg::fontdb::Database>,
}

impl SvgEngine {
    /// Build the engine and its shared font database.
    pub fn new(opts: SvgEngineOpts) -> MailResult<Self> {
        if !opts.device_scale.is_finite() || opts.device_scale <= 0.0 {
            return Err(MailError::validation("device_scale must be > 0"));
        }
        let mut db = usvg::fontdb::Database::new();
        if opts.system_fonts {
            db.load_system_fonts();
        }
        for dir in &opts.font_dirs {
            load_fonts_from_dir(&mut db, dir);
        }
        tracing::debug!(faces = db.len(), "svg engine font database ready");
        Ok(Self {
            opts,
            fontdb: Arc::new(db),
        })
    }
}

impl RenderEngine for SvgEngine {
    fn name(&self) -> &str {
        "svg-cpu"
    }

    fn create_surface(
        &self,
        id: SurfaceId,
        signals: SignalSender,
    ) -> MailResult<Box<dyn SurfaceDriver>> {
        let (tx, rx) = mpsc::channel::<PaintJob>();
        let output: OutputSlot = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&output);
        let fontdb = Arc::clone(&self.fontdb);
        let (exited_tx, exited) = mpsc::sync_channel::<()>(0);
        let worker = std::thread::Builder::new()
            .name(format!("mailpress-{id}"))
            .spawn(move || {
                // Dropped on exit, panics included.
                let _exited = exited_tx;
                paint_loop(rx, slot, signals, fontdb);
            })
            .with_context(|| format!("spawn paint thread for {id}"))?;

        Ok(Box::new(SvgSurface {
            id,
            scale: self.opts.device_scale,
            commands: Some(tx),
            worker: Some(worker),
            exited: Some(exited),
            output,
            harness: None,
            fields: FieldValues::new(),
        }))
    }
}

type OutputSlot = Arc<Mutex<Option<(Generation, MailResult<RasterImage>)>>>;

/// Template prepared for repeated personalization on one surface.
struct Harness {
    template: Template,
    scale: f64,
    width: u32,
    height: u32,
    background: Option<Pixmap>,
    static_images: HashMap<String, Pixmap>,
}

struct PaintJob {
    generation: Generation,
    harness: Arc<Harness>,
    fields: FieldValues,
}

struct SvgSurface {
    id: SurfaceId,
    scale: f64,
    commands: Option<mpsc::Sender<PaintJob>>,
    worker: Option<JoinHandle<()>>,
    exited: Option<mpsc::Receiver<()>>,
    output: OutputSlot,
    harness: Option<Arc<Harness>>,
    fields: FieldValues,
}

impl SurfaceDriver for SvgSurface {
    fn load_template(&mut self, template: &Template) -> MailResult<()> {
        self.harness = None;
        let harness = build_harness(template, self.scale)
            .map_err(|e| MailError::engine_fault(format!("{}: load template: {e}", self.id)))?;
        self.harness = Some(Arc::new(harness));
        Ok(())
    }

    fn inject(&mut self, fields: &FieldValues) -> MailResult<()> {
        if self.harness.is_none() {
            return Err(MailError::engine_fault(format!(
                "{}: inject before a template was loaded",
                self.id
            )));
        }
        self.fields = fields.clone();
        Ok(())
    }

    fn trigger_render(&mut self, generation: Generation) -> MailResult<()> {
        let harness = self.harness.clone().ok_or_else(|| {
            MailError::engine_fault(format!("{}: render before a template was loaded", self.id))
        })?;
        let commands = self
            .commands
            .as_ref()
            .ok_or_else(|| MailError::engine_fault(format!("{}: surface is closed", self.id)))?;
        commands
            .send(PaintJob {
                generation,
                harness,
                fields: self.fields.clone(),
            })
            .map_err(|_| MailError::engine_fault(format!("{}: paint thread exited", self.id)))
    }

    fn capture(&mut self, generation: Generation) -> MailResult<RasterImage> {
        let taken = self
            .output
            .lock()
            .map_err(|_| MailError::engine_fault(format!("{}: output slot poisoned", self.id)))?
            .take();
        match taken {
            Some((g, res)) if g == generation => res,
            Some((g, _)) => Err(MailError::engine_fault(format!(
                "{}: captured output of {g}, expected {generation}",
                self.id
            ))),
            None => Err(MailError::engine_fault(format!(
                "{}: no rendered output to capture",
                self.id
            ))),
        }
    }

    fn close(&mut self) {
        self.commands = None;
        if let (Some(worker), Some(exited)) = (self.worker.take(), self.exited.take()) {
            retire_paint_thread(self.id, worker, &exited, CLOSE_GRACE);
        }
    }
}

/// Join the paint thread if it exits within `grace`, otherwise leave it running detached.
/// Returns whether the thread was joined.
fn retire_paint_thread(
    id: SurfaceId,
    worker: JoinHandle<()>,
    exited: &mpsc::Receiver<()>,
    grace: Duration,
) -> bool {
    match exited.recv_timeout(grace) {
        Err(mpsc::RecvTimeoutError::Timeout) => {
            tracing::warn!(
                surface = %id,
                grace_ms = grace.as_millis() as u64,
                "paint thread still busy at close; detaching it"
            );
            false
        }
        _ => {
            if worker.join().is_err() {
                tracing::warn!(surface = %id, "paint thread panicked");
            }
            true
        }
    }
}

impl Drop for SvgSurface {
    fn drop(&mut self) {
        self.close();
    }
}

fn paint_loop(
    jobs: mpsc::Receiver<PaintJob>,
    output: OutputSlot,
    signals: SignalSender,
    fontdb: Arc<usvg::fontdb::Database>,
) {
    for job in jobs {
        let res = paint(&job, &fontdb);
        let outcome = res.as_ref().map(|_| ()).map_err(|e| e.to_string());
        if let Ok(mut slot) = output.lock() {
            *slot = Some((job.generation, res));
        }
        if signals
            .send(RenderSignal {
                generation: job.generation,
                outcome,
            })
            .is_err()
        {
            break;
        }
    }
}

fn build_harness(template: &Template, scale: f64) -> anyhow::Result<Harness> {
    let width = scaled_px(f64::from(template.canvas.width), scale)?;
    let height = scaled_px(f64::from(template.canvas.height), scale)?;

    let background = match &template.background {
        Some(path) => Some(load_pixmap(path, width, height)?),
        None => None,
    };

    let mut static_images = HashMap::new();
    for node in &template.nodes {
        if let NodeKind::Image {
            source: ImageSource::Path(path),
        } = &node.kind
        {
            let (w, h) = node_px(node, scale)?;
            static_images.insert(node.id.clone(), load_pixmap(path, w, h)?);
        }
    }

    Ok(Harness {
        template: template.clone(),
        scale,
        width,
        height,
        background,
        static_images,
    })
}

fn paint(job: &PaintJob, fontdb: &Arc<usvg::fontdb::Database>) -> MailResult<RasterImage> {
    let h = &job.harness;
    let mut pixmap = Pixmap::new(h.width, h.height)
        .ok_or_else(|| MailError::engine_fault("failed to allocate page pixmap"))?;

    let [r, g, b, a] = h.template.background_color.to_rgba8();
    pixmap.fill(tiny_skia::Color::from_rgba8(r, g, b, a));
    if let Some(bg) = &h.background {
        pixmap.draw_pixmap(
            0,
            0,
            bg.as_ref(),
            &PixmapPaint::default(),
            Transform::identity(),
            None,
        );
    }

    let mut text_runs = Vec::new();
    let mut layer: Vec<&SceneNode> = Vec::new();
    for node in &h.template.nodes {
        match &node.kind {
            NodeKind::Image { source } => {
                flush_layer(&mut pixmap, h, &layer, &job.fields, fontdb)?;
                layer.clear();
                draw_image_node(&mut pixmap, h, node, source, &job.fields)?;
            }
            NodeKind::Text { content, .. } => {
                text_runs.push(fill_placeholders(content, &job.fields));
                layer.push(node);
            }
            NodeKind::Rect { .. } | NodeKind::Ellipse { .. } => layer.push(node),
        }
    }
    flush_layer(&mut pixmap, h, &layer, &job.fields, fontdb)?;

    Ok(RasterImage {
        width: h.width,
        height: h.height,
        data: demultiply(pixmap.data()),
        text_runs,
    })
}

fn flush_layer(
    pixmap: &mut Pixmap,
    h: &Harness,
    layer: &[&SceneNode],
    fields: &FieldValues,
    fontdb: &Arc<usvg::fontdb::Database>,
) -> MailResult<()> {
    if layer.is_empty() {
        return Ok(());
    }
    let svg = layer_svg(&h.template, layer, fields);
    let opts = usvg::Options {
        fontdb: Arc::clone(fontdb),
        ..usvg::Options::default()
    };
    let tree = usvg::Tree::from_str(&svg, &opts)
        .map_err(|e| MailError::engine_fault(format!("parse personalized svg layer: {e}")))?;
    let scale = h.scale as f32;
    resvg::render(
        &tree,
        Transform::from_scale(scale, scale),
        &mut pixmap.as_mut(),
    );
    Ok(())
}

fn draw_image_node(
    pixmap: &mut Pixmap,
    h: &Harness,
    node: &SceneNode,
    source: &ImageSource,
    fields: &FieldValues,
) -> MailResult<()> {
    let loaded;
    let img = match source {
        ImageSource::Path(_) => h.static_images.get(&node.id),
        ImageSource::Field(name) => {
            let Some(path) = fields.get(name).filter(|p| !p.trim().is_empty()) else {
                return Ok(());
            };
            let (w, hgt) = node_px(node, h.scale).map_err(|e| {
                MailError::engine_fault(format!("image node '{}': {e}", node.id))
            })?;
            loaded = load_pixmap(Path::new(path), w, hgt).map_err(|e| {
                MailError::engine_fault(format!("image node '{}': {e:#}", node.id))
            })?;
            Some(&loaded)
        }
    };
    if let Some(img) = img {
        let paint = PixmapPaint {
            opacity: node.opacity.clamp(0.0, 1.0) as f32,
            ..PixmapPaint::default()
        };
        pixmap.draw_pixmap(
            (node.x * h.scale).round() as i32,
            (node.y * h.scale).round() as i32,
            img.as_ref(),
            &paint,
            Transform::identity(),
            None,
        );
    }
    Ok(())
}

fn layer_svg(template: &Template, layer: &[&SceneNode], fields: &FieldValues) -> String {
    let (cw, ch) = (template.canvas.width, template.canvas.height);
    let mut s = String::with_capacity(256 + layer.len() * 160);
    let _ = write!(
        s,
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{cw}" height="{ch}" viewBox="0 0 {cw} {ch}">"#
    );
    for node in layer {
        let opacity = node.opacity.clamp(0.0, 1.0);
        match &node.kind {
            NodeKind::Rect {
                fill,
                corner_radius,
            } => {
                let _ = write!(
                    s,
                    r#"<rect x="{}" y="{}" width="{}" height="{}" rx="{}" fill="{}" fill-opacity="{}" opacity="{opacity}"/>"#,
                    node.x,
                    node.y,
                    node.width,
                    node.height,
                    corner_radius.max(0.0),
                    fill.to_svg_hex(),
                    fill.opacity(),
                );
            }
            NodeKind::Ellipse { fill } => {
                let _ = write!(
                    s,
                    r#"<ellipse cx="{}" cy="{}" rx="{}" ry="{}" fill="{}" fill-opacity="{}" opacity="{opacity}"/>"#,
                    node.x + node.width / 2.0,
                    node.y + node.height / 2.0,
                    node.width / 2.0,
                    node.height / 2.0,
                    fill.to_svg_hex(),
                    fill.opacity(),
                );
            }
            NodeKind::Text {
                content,
                font_size,
                font_family,
                fill,
                bold,
                align,
            } => {
                let (x, anchor) = match align {
                    TextAlign::Start => (node.x, "start"),
                    TextAlign::Middle => (node.x + node.width / 2.0, "middle"),
                    TextAlign::End => (node.x + node.width, "end"),
                };
                let _ = write!(
                    s,
                    r#"<text x="{x}" y="{}" font-family="{}" font-size="{font_size}" font-weight="{}" text-anchor="{anchor}" fill="{}" fill-opacity="{}" opacity="{opacity}" xml:space="preserve">{}</text>"#,
                    node.y + font_size,
                    escape_xml(font_family),
                    if *bold { "bold" } else { "normal" },
                    fill.to_svg_hex(),
                    fill.opacity(),
                    escape_xml(&fill_placeholders(content, fields)),
                );
            }
            NodeKind::Image { .. } => {}
        }
    }
    s.push_str("</svg>");
    s
}

fn escape_xml(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

fn scaled_px(units: f64, scale: f64) -> anyhow::Result<u32> {
    let px = (units * scale).round();
    if !px.is_finite() || px < 1.0 {
        anyhow::bail!("raster edge collapses to zero pixels ({units} units at scale {scale})");
    }
    if px > f64::from(MAX_DIM) {
        anyhow::bail!("raster edge too large: {px} px (max {MAX_DIM})");
    }
    Ok(px as u32)
}

fn node_px(node: &SceneNode, scale: f64) -> anyhow::Result<(u32, u32)> {
    Ok((scaled_px(node.width, scale)?, scaled_px(node.height, scale)?))
}

fn load_pixmap(path: &Path, width: u32, height: u32) -> anyhow::Result<Pixmap> {
    let img = image::open(path)
        .with_context(|| format!("decode image '{}'", path.display()))?
        .to_rgba8();
    let img = image::imageops::resize(&img, width, height, image::imageops::FilterType::Triangle);
    let mut data = img.into_raw();
    premultiply_rgba8_in_place(&mut data);
    let size = IntSize::from_wh(width, height).context("image size must be non-zero")?;
    Pixmap::from_vec(data, size).context("wrap decoded image as pixmap")
}

fn premultiply_rgba8_in_place(rgba: &mut [u8]) {
    for px in rgba.chunks_exact_mut(4) {
        let a = u16::from(px[3]);
        for c in &mut px[..3] {
            *c = ((u16::from(*c) * a + 127) / 255) as u8;
        }
    }
}

fn demultiply(premul: &[u8]) -> Vec<u8> {
    let mut out = premul.to_vec();
    for px in out.chunks_exact_mut(4) {
        let a = u16::from(px[3]);
        if a == 0 || a == 255 {
            continue;
        }
        for c in &mut px[..3] {
            *c = ((u16::from(*c) * 255 + a / 2) / a).min(255) as u8;
        }
    }
    out
}

fn load_fonts_from_dir(db: &mut usvg::fontdb::Database, dir: &Path) {
    let Ok(rd) = std::fs::read_dir(dir) else {
        return;
    };

    for entry in rd.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(ext) = path.extension().and_then(|s| s.to_str()) else {
            continue;
        };
        let ext = ext.to_ascii_lowercase();
        if ext != "ttf" && ext != "otf" && ext != "ttc" {
            continue;
        }
        let _ = db.load_font_file(&path);
    }
}

#[cfg(test)]
#[path = "../../tests/unit/render/svg.rs"]
mod tests;
