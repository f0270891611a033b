use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};

use crate::batch::job::RenderResult;
use crate::foundation::core::{Generation, duration_ms};
use crate::foundation::error::{MailError, MailResult};
use crate::render::engine::{FieldValues, RasterImage};
use crate::render::pool::{RenderSurface, SurfaceLease};
use crate::template::model::{RecipientRecord, Template};

/// Drives one leased surface through a single recipient render.
///
/// The renderer never retries and never releases the lease. Engine-level failures flag the
/// surface unhealthy so that the caller's release destroys it.
#[derive(Debug, Clone, Copy, Default)]
pub struct Renderer;

impl Renderer {
    /// Render `recipient` with `template` on the leased surface, waiting at most `timeout` for
    /// the completion signal.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(index = recipient_index, surface = %lease.id(), generation = %lease.generation())
    )]
    pub fn render(
        lease: &mut SurfaceLease,
        template: &Template,
        recipient_index: usize,
        recipient: &RecipientRecord,
        timeout: Duration,
    ) -> RenderResult {
        let started = Instant::now();
        let (surface_id, generation) = (lease.id(), lease.generation());
        let outcome = render_on(lease.surface_mut(), template, recipient, timeout);

        let mut result = match outcome {
            Ok(image) => RenderResult::success(recipient_index, image, surface_id, generation),
            Err(err) => {
                if err.poisons_surface() {
                    lease.surface_mut().mark_unhealthy();
                }
                tracing::debug!(error = %err, "render failed");
                RenderResult::failure(recipient_index, &err).on_surface(surface_id, generation)
            }
        };
        result.timing_ms = duration_ms(started.elapsed());
        result
    }
}

/// Map a recipient onto the template's fields.
///
/// Declared fields take the recipient's value; blank or absent optional fields fall back to
/// their default or the empty string. Placeholders the template uses without declaring them
/// resolve to the recipient value or the empty string. A blank or absent required field fails
/// with `MissingRequiredField` naming every such field.
pub fn resolve_fields(template: &Template, recipient: &RecipientRecord) -> MailResult<FieldValues> {
    let mut values = FieldValues::new();
    let mut missing = Vec::new();

    for decl in &template.fields {
        match recipient.get(&decl.name).filter(|v| !v.trim().is_empty()) {
            Some(v) => {
                values.insert(decl.name.clone(), v.to_owned());
            }
            None if decl.required => missing.push(decl.name.as_str()),
            None => {
                values.insert(decl.name.clone(), decl.default.clone().unwrap_or_default());
            }
        }
    }
    if !missing.is_empty() {
        return Err(MailError::missing_required_field(missing.join(", ")));
    }

    for name in template.referenced_fields() {
        if !values.contains_key(&name) {
            let v = recipient.get(&name).unwrap_or_default().to_owned();
            values.insert(name, v);
        }
    }
    Ok(values)
}

fn render_on(
    surface: &mut RenderSurface,
    template: &Template,
    recipient: &RecipientRecord,
    timeout: Duration,
) -> MailResult<RasterImage> {
    let fields = resolve_fields(template, recipient)?;
    let generation = surface.generation;

    if surface.loaded_template.as_ref() != Some(&template.id) {
        surface.loaded_template = None;
        let t0 = Instant::now();
        surface.driver.load_template(template)?;
        surface.loaded_template = Some(template.id.clone());
        tracing::debug!(
            template = %template.id,
            load_ms = duration_ms(t0.elapsed()),
            "template harness loaded"
        );
    }

    surface.driver.inject(&fields)?;
    surface.driver.trigger_render(generation)?;
    await_completion(surface, generation, timeout)?;

    let image = surface.driver.capture(generation)?;
    if !image.is_well_formed() {
        return Err(MailError::engine_fault(format!(
            "{}: malformed capture ({}x{}, {} bytes)",
            surface.id,
            image.width,
            image.height,
            image.data.len()
        )));
    }
    Ok(image)
}

fn await_completion(
    surface: &RenderSurface,
    generation: Generation,
    timeout: Duration,
) -> MailResult<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match surface.signals.recv_timeout(remaining) {
            Ok(signal) if signal.generation == generation => {
                return signal.outcome.map_err(|msg| {
                    MailError::engine_fault(format!("{}: render failed: {msg}", surface.id))
                });
            }
            Ok(signal) => {
                tracing::debug!(
                    surface = %surface.id,
                    stale = %signal.generation,
                    current = %generation,
                    "discarding stale completion"
                );
            }
            Err(RecvTimeoutError::Timeout) => {
                return Err(MailError::render_timeout(format!(
                    "{}: no completion for {generation} within {} ms",
                    surface.id,
                    timeout.as_millis()
                )));
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(MailError::engine_fault(format!(
                    "{}: completion channel closed",
                    surface.id
                )));
            }
        }
    }
}

#[cfg(test)]
#[path = "../../tests/unit/render/renderer.rs"]
mod tests;
