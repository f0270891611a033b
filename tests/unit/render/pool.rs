use super::*;
use crate::foundation::error::ErrorKind;
use crate::render::engine::{FieldValues, RasterImage, SignalSender};
use crate::template::model::Template;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Default)]
struct CountingEngine {
    created: AtomicUsize,
    closed: Arc<AtomicUsize>,
    fail: AtomicBool,
}

struct NoopDriver {
    closed: Arc<AtomicUsize>,
}

impl SurfaceDriver for NoopDriver {
    fn load_template(&mut self, _template: &Template) -> MailResult<()> {
        Ok(())
    }

    fn inject(&mut self, _fields: &FieldValues) -> MailResult<()> {
        Ok(())
    }

    fn trigger_render(&mut self, _generation: Generation) -> MailResult<()> {
        Ok(())
    }

    fn capture(&mut self, _generation: Generation) -> MailResult<RasterImage> {
        Err(MailError::engine_fault("noop"))
    }

    fn close(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

impl RenderEngine for CountingEngine {
    fn name(&self) -> &str {
        "counting"
    }

    fn create_surface(
        &self,
        _id: SurfaceId,
        _signals: SignalSender,
    ) -> MailResult<Box<dyn SurfaceDriver>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(MailError::engine_fault("browser binary missing"));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(NoopDriver {
            closed: Arc::clone(&self.closed),
        }))
    }
}

fn pool(max: usize) -> (Arc<CountingEngine>, SurfacePool) {
    let engine = Arc::new(CountingEngine::default());
    let opts = PoolOpts {
        max_surfaces: max,
        ..PoolOpts::default()
    };
    let pool = SurfacePool::new(engine.clone(), opts).unwrap();
    (engine, pool)
}

const SHORT: Duration = Duration::from_millis(30);

#[test]
fn creates_lazily_and_never_exceeds_max() {
    let (engine, pool) = pool(2);
    assert_eq!(engine.created.load(Ordering::SeqCst), 0);

    let a = pool.acquire(SHORT).unwrap();
    let b = pool.acquire(SHORT).unwrap();
    assert_ne!(a.id(), b.id());
    assert_eq!(engine.created.load(Ordering::SeqCst), 2);

    let err = pool.acquire(SHORT).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::AcquisitionTimeout);
    assert_eq!(pool.stats().peak_leased, 2);

    pool.release(a, SurfaceHealth::Healthy);
    pool.release(b, SurfaceHealth::Healthy);
    assert_eq!(pool.stats().leased_now, 0);
}

#[test]
fn healthy_release_reuses_surface_with_greater_generation() {
    let (engine, pool) = pool(1);
    let first = pool.acquire(SHORT).unwrap();
    let (id, g1) = (first.id(), first.generation());
    first.release(SurfaceHealth::Healthy);

    let second = pool.acquire(SHORT).unwrap();
    assert_eq!(second.id(), id);
    assert!(second.generation() > g1);
    assert_eq!(engine.created.load(Ordering::SeqCst), 1);
    second.release(SurfaceHealth::Healthy);
}

#[test]
fn unhealthy_release_destroys_and_replaces_lazily() {
    let (engine, pool) = pool(1);
    let first = pool.acquire(SHORT).unwrap();
    let g1 = first.generation();
    pool.release(first, SurfaceHealth::Unhealthy);

    assert_eq!(engine.closed.load(Ordering::SeqCst), 1);
    assert_eq!(pool.slot_states()[0].1, LeaseState::Dead);
    assert_eq!(engine.created.load(Ordering::SeqCst), 1);

    let replacement = pool.acquire(SHORT).unwrap();
    assert_eq!(engine.created.load(Ordering::SeqCst), 2);
    assert!(replacement.generation() > g1);
    let stats = pool.stats();
    assert_eq!(stats.surfaces_destroyed, 1);
    drop(replacement);
}

#[test]
fn surface_flag_overrides_a_healthy_release() {
    let (engine, pool) = pool(1);
    let mut lease = pool.acquire(SHORT).unwrap();
    lease.surface_mut().mark_unhealthy();
    lease.release(SurfaceHealth::Healthy);
    assert_eq!(engine.closed.load(Ordering::SeqCst), 1);
}

#[test]
fn dropping_a_lease_counts_as_unhealthy() {
    let (engine, pool) = pool(1);
    drop(pool.acquire(SHORT).unwrap());
    assert_eq!(engine.closed.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().leased_now, 0);
}

#[test]
fn creation_failure_before_any_surface_is_systemic() {
    let (engine, pool) = pool(2);
    engine.fail.store(true, Ordering::SeqCst);
    let err = pool.acquire(SHORT).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::SystemicPoolFailure);
    assert_eq!(pool.stats().creation_failures, 2);
}

/// First creation succeeds slowly; every later one fails at once.
struct SlowThenBrokenEngine {
    calls: AtomicUsize,
}

impl RenderEngine for SlowThenBrokenEngine {
    fn name(&self) -> &str {
        "slow-then-broken"
    }

    fn create_surface(
        &self,
        _id: SurfaceId,
        _signals: SignalSender,
    ) -> MailResult<Box<dyn SurfaceDriver>> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            std::thread::sleep(Duration::from_millis(150));
            return Ok(Box::new(NoopDriver {
                closed: Arc::new(AtomicUsize::new(0)),
            }));
        }
        Err(MailError::engine_fault("transient start failure"))
    }
}

#[test]
fn failure_during_another_creation_is_not_systemic() {
    let engine = Arc::new(SlowThenBrokenEngine {
        calls: AtomicUsize::new(0),
    });
    let opts = PoolOpts {
        max_surfaces: 2,
        ..PoolOpts::default()
    };
    let pool = SurfacePool::new(engine.clone(), opts).unwrap();

    let slow = {
        let pool = pool.clone();
        std::thread::spawn(move || pool.acquire(Duration::from_secs(5)).map(|l| l.id()))
    };
    while engine.calls.load(Ordering::SeqCst) == 0 {
        std::thread::yield_now();
    }
    let err = pool.acquire(SHORT).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::EngineFault);
    assert_eq!(slow.join().unwrap().unwrap(), SurfaceId(0));
    assert_eq!(pool.stats().surfaces_created, 1);
}

#[test]
fn creation_failure_after_a_success_is_an_engine_fault() {
    let (engine, pool) = pool(2);
    let held = pool.acquire(SHORT).unwrap();
    engine.fail.store(true, Ordering::SeqCst);
    let err = pool.acquire(SHORT).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::EngineFault);
    held.release(SurfaceHealth::Healthy);
}

#[test]
fn avoiding_prefers_another_surface_when_possible() {
    let (_engine, pool) = pool(2);
    let a = pool.acquire(SHORT).unwrap();
    let a_id = a.id();
    a.release(SurfaceHealth::Healthy);

    let b = pool.acquire_avoiding(SHORT, Some(a_id)).unwrap();
    assert_ne!(b.id(), a_id);
    b.release(SurfaceHealth::Healthy);

    let (_engine, single) = self::pool(1);
    let only = single.acquire(SHORT).unwrap();
    let only_id = only.id();
    only.release(SurfaceHealth::Healthy);
    let again = single.acquire_avoiding(SHORT, Some(only_id)).unwrap();
    assert_eq!(again.id(), only_id);
    again.release(SurfaceHealth::Healthy);
}

#[test]
fn waiting_acquirer_wakes_on_release() {
    let (_engine, pool) = pool(1);
    let held = pool.acquire(SHORT).unwrap();
    let waiter = {
        let pool = pool.clone();
        std::thread::spawn(move || {
            pool.acquire(Duration::from_secs(5))
                .map(|l| l.release(SurfaceHealth::Healthy))
        })
    };
    std::thread::sleep(Duration::from_millis(20));
    held.release(SurfaceHealth::Healthy);
    assert!(waiter.join().unwrap().is_ok());
}

#[test]
fn shutdown_with_no_surfaces_is_safe_and_idempotent() {
    let (_engine, pool) = pool(3);
    pool.shutdown(SHORT);
    pool.shutdown(SHORT);
    let err = pool.acquire(SHORT).err().unwrap();
    assert!(matches!(err, MailError::PoolShutdown(_)));
}

#[test]
fn shutdown_destroys_free_surfaces_and_discards_late_releases() {
    let (engine, pool) = pool(2);
    let a = pool.acquire(SHORT).unwrap();
    let b = pool.acquire(SHORT).unwrap();
    a.release(SurfaceHealth::Healthy);

    pool.shutdown(SHORT);
    assert_eq!(engine.closed.load(Ordering::SeqCst), 1);

    b.release(SurfaceHealth::Healthy);
    assert_eq!(engine.closed.load(Ordering::SeqCst), 2);
    assert!(
        pool.slot_states()
            .iter()
            .all(|(_, state, _)| *state == LeaseState::Dead)
    );
}

#[test]
fn without_replacement_a_dead_pool_fails_fast() {
    let engine = Arc::new(CountingEngine::default());
    let opts = PoolOpts {
        max_surfaces: 1,
        replace_dead: false,
    };
    let pool = SurfacePool::new(engine.clone(), opts).unwrap();
    pool.acquire(SHORT)
        .unwrap()
        .release(SurfaceHealth::Unhealthy);

    let started = std::time::Instant::now();
    let err = pool.acquire(Duration::from_secs(5)).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::EngineFault);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(engine.created.load(Ordering::SeqCst), 1);
}
