use super::*;
use crate::batch::job::RenderStatus;
use crate::foundation::core::{SurfaceId, TemplateId};
use crate::foundation::error::ErrorKind;
use crate::render::engine::{RenderEngine, RenderSignal, SignalSender, SurfaceDriver};
use crate::render::pool::{PoolOpts, SurfaceHealth, SurfacePool};
use crate::template::color::Color;
use crate::template::model::{Canvas, FieldDecl, NodeKind, SceneNode, TextAlign};
use std::sync::{Arc, Mutex};

#[derive(Clone, Copy, PartialEq)]
enum Script {
    Normal,
    Silent,
    StaleFirst,
    EngineError,
    Malformed,
}

#[derive(Default)]
struct Log {
    loads: usize,
    injected: Vec<FieldValues>,
}

struct ScriptedEngine {
    script: Script,
    log: Arc<Mutex<Log>>,
}

struct ScriptedDriver {
    script: Script,
    log: Arc<Mutex<Log>>,
    signals: SignalSender,
}

impl RenderEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    fn create_surface(
        &self,
        _id: SurfaceId,
        signals: SignalSender,
    ) -> MailResult<Box<dyn SurfaceDriver>> {
        Ok(Box::new(ScriptedDriver {
            script: self.script,
            log: Arc::clone(&self.log),
            signals,
        }))
    }
}

impl SurfaceDriver for ScriptedDriver {
    fn load_template(&mut self, _template: &Template) -> MailResult<()> {
        self.log.lock().unwrap().loads += 1;
        Ok(())
    }

    fn inject(&mut self, fields: &FieldValues) -> MailResult<()> {
        self.log.lock().unwrap().injected.push(fields.clone());
        Ok(())
    }

    fn trigger_render(&mut self, generation: Generation) -> MailResult<()> {
        let send = |generation, outcome| {
            let _ = self.signals.send(RenderSignal {
                generation,
                outcome,
            });
        };
        match self.script {
            Script::Silent => {}
            Script::StaleFirst => {
                send(Generation(0), Err("leftover".to_owned()));
                send(generation, Ok(()));
            }
            Script::EngineError => send(generation, Err("page crashed".to_owned())),
            Script::Normal | Script::Malformed => send(generation, Ok(())),
        }
        Ok(())
    }

    fn capture(&mut self, _generation: Generation) -> MailResult<RasterImage> {
        let data = if self.script == Script::Malformed {
            vec![0; 3]
        } else {
            vec![255; 2 * 2 * 4]
        };
        Ok(RasterImage {
            width: 2,
            height: 2,
            data,
            text_runs: Vec::new(),
        })
    }
}

fn setup(script: Script) -> (Arc<Mutex<Log>>, SurfacePool) {
    let log = Arc::new(Mutex::new(Log::default()));
    let engine = Arc::new(ScriptedEngine {
        script,
        log: Arc::clone(&log),
    });
    let opts = PoolOpts {
        max_surfaces: 1,
        ..PoolOpts::default()
    };
    let pool = SurfacePool::new(engine, opts).unwrap();
    (log, pool)
}

fn template(id: &str) -> Template {
    Template {
        id: TemplateId::new(id),
        canvas: Canvas {
            width: 2,
            height: 2,
        },
        background_color: Color::WHITE,
        background: None,
        fields: vec![
            FieldDecl {
                name: "name".to_owned(),
                required: true,
                default: None,
            },
            FieldDecl {
                name: "offer".to_owned(),
                required: false,
                default: Some("10% off".to_owned()),
            },
        ],
        nodes: vec![SceneNode {
            id: "t".to_owned(),
            x: 0.0,
            y: 0.0,
            width: 2.0,
            height: 2.0,
            opacity: 1.0,
            kind: NodeKind::Text {
                content: "{{name}} {{city}}".to_owned(),
                font_size: 1.0,
                font_family: "sans-serif".to_owned(),
                fill: Color::BLACK,
                bold: false,
                align: TextAlign::Start,
            },
        }],
    }
}

const WAIT: Duration = Duration::from_millis(200);

#[test]
fn resolve_fields_applies_defaults_and_undeclared_placeholders() {
    let values = resolve_fields(
        &template("t"),
        &RecipientRecord::new().with("name", "Ada").with("city", "Leeds"),
    )
    .unwrap();
    assert_eq!(values["name"], "Ada");
    assert_eq!(values["offer"], "10% off");
    assert_eq!(values["city"], "Leeds");

    let values = resolve_fields(&template("t"), &RecipientRecord::new().with("name", "Bo")).unwrap();
    assert_eq!(values["city"], "");
}

#[test]
fn resolve_fields_rejects_blank_required_values() {
    let err = resolve_fields(&template("t"), &RecipientRecord::new().with("name", "  "))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MissingRequiredField);
    assert!(err.to_string().contains("name"));
}

#[test]
fn loads_template_once_per_surface_and_injects_every_time() {
    let (log, pool) = setup(Script::Normal);
    let t = template("t");
    for (i, name) in ["Ada", "Bo"].into_iter().enumerate() {
        let mut lease = pool.acquire(WAIT).unwrap();
        let r = Renderer::render(&mut lease, &t, i, &RecipientRecord::new().with("name", name), WAIT);
        assert!(r.is_success());
        assert_eq!(r.recipient_index, i);
        assert_eq!(r.generation, Some(lease.generation()));
        lease.release(SurfaceHealth::Healthy);
    }

    let mut lease = pool.acquire(WAIT).unwrap();
    let r = Renderer::render(
        &mut lease,
        &template("other"),
        2,
        &RecipientRecord::new().with("name", "Cy"),
        WAIT,
    );
    assert!(r.is_success());
    lease.release(SurfaceHealth::Healthy);

    let log = log.lock().unwrap();
    assert_eq!(log.loads, 2);
    assert_eq!(log.injected.len(), 3);
    assert_eq!(log.injected[1]["name"], "Bo");
}

#[test]
fn missing_field_fails_without_touching_the_surface() {
    let (log, pool) = setup(Script::Normal);
    let mut lease = pool.acquire(WAIT).unwrap();
    let r = Renderer::render(&mut lease, &template("t"), 0, &RecipientRecord::new(), WAIT);
    assert_eq!(r.status, RenderStatus::Failed);
    assert_eq!(r.error_kind(), Some(ErrorKind::MissingRequiredField));
    assert!(lease.surface().is_healthy());
    assert_eq!(log.lock().unwrap().loads, 0);
}

#[test]
fn silent_surface_times_out_and_is_poisoned() {
    let (_log, pool) = setup(Script::Silent);
    let mut lease = pool.acquire(WAIT).unwrap();
    let r = Renderer::render(
        &mut lease,
        &template("t"),
        0,
        &RecipientRecord::new().with("name", "Ada"),
        Duration::from_millis(40),
    );
    assert_eq!(r.error_kind(), Some(ErrorKind::RenderTimeout));
    assert!(!lease.surface().is_healthy());
}

#[test]
fn stale_signals_are_skipped() {
    let (_log, pool) = setup(Script::StaleFirst);
    let mut lease = pool.acquire(WAIT).unwrap();
    let r = Renderer::render(
        &mut lease,
        &template("t"),
        0,
        &RecipientRecord::new().with("name", "Ada"),
        WAIT,
    );
    assert!(r.is_success());
}

#[test]
fn engine_errors_and_malformed_output_poison_the_surface() {
    for script in [Script::EngineError, Script::Malformed] {
        let (_log, pool) = setup(script);
        let mut lease = pool.acquire(WAIT).unwrap();
        let r = Renderer::render(
            &mut lease,
            &template("t"),
            0,
            &RecipientRecord::new().with("name", "Ada"),
            WAIT,
        );
        assert_eq!(r.error_kind(), Some(ErrorKind::EngineFault));
        assert!(!lease.surface().is_healthy());
        assert!(r.image.is_none());
    }
}
