use std::collections::BTreeMap;
use std::sync::mpsc;

use crate::foundation::core::{Generation, SurfaceId};
use crate::foundation::error::MailResult;
use crate::template::model::Template;

/// Personalization values keyed by field name, already resolved against the template's
/// declarations (defaults applied, optional gaps filled with empty strings).
pub type FieldValues = BTreeMap<String, String>;

/// A rendered recipient document as straight-alpha RGBA8 pixels.
#[derive(Clone, Debug, PartialEq)]
pub struct RasterImage {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// RGBA8 bytes, tightly packed, row-major, straight alpha.
    pub data: Vec<u8>,
    /// Text the surface painted, in paint order.
    ///
    /// Engines report the personalized strings alongside the pixels so callers can audit what
    /// each recipient received without OCR.
    pub text_runs: Vec<String>,
}

impl RasterImage {
    /// Check that `data` matches the declared dimensions.
    pub fn is_well_formed(&self) -> bool {
        self.width > 0
            && self.height > 0
            && (self.width as usize)
                .checked_mul(self.height as usize)
                .and_then(|px| px.checked_mul(4))
                == Some(self.data.len())
    }
}

/// Render-complete notification sent by a surface on its completion channel.
///
/// The generation tags which lease triggered the render; receivers discard signals whose
/// generation does not match their own.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderSignal {
    /// Generation passed to [`SurfaceDriver::trigger_render`].
    pub generation: Generation,
    /// `Err` carries an engine-side failure description.
    pub outcome: Result<(), String>,
}

/// Sending half of a surface's completion channel.
pub type SignalSender = mpsc::Sender<RenderSignal>;

/// Receiving half of a surface's completion channel.
pub type SignalReceiver = mpsc::Receiver<RenderSignal>;

/// An external rendering engine able to spawn sandboxed render surfaces.
///
/// Creating a surface is the expensive step the pool amortizes; implementations should do
/// their process/page startup in [`RenderEngine::create_surface`].
pub trait RenderEngine: Send + Sync {
    /// Short engine name for logs.
    fn name(&self) -> &str;

    /// Start a new surface. Completion signals must be sent on `signals`.
    fn create_surface(
        &self,
        id: SurfaceId,
        signals: SignalSender,
    ) -> MailResult<Box<dyn SurfaceDriver>>;
}

/// One live rendering context (a browser page or equivalent).
///
/// The renderer drives a surface strictly in order: `load_template` (only when the template
/// changes), `inject`, `trigger_render`, wait for the completion signal, `capture`.
pub trait SurfaceDriver: Send {
    /// Load the template harness. Expensive; called once per surface per distinct template.
    fn load_template(&mut self, template: &Template) -> MailResult<()>;

    /// Replace all personalization values. Values from a previous inject must not survive.
    fn inject(&mut self, fields: &FieldValues) -> MailResult<()>;

    /// Start rendering asynchronously; signal completion tagged with `generation`.
    fn trigger_render(&mut self, generation: Generation) -> MailResult<()>;

    /// Read back the output of the render tagged `generation`.
    fn capture(&mut self, generation: Generation) -> MailResult<RasterImage>;

    /// Tear the surface down. Called once, before the driver is dropped.
    fn close(&mut self) {}
}
