use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, mpsc};
use std::time::{Duration, Instant};

use crate::config::PoolConfig;
use crate::foundation::core::{Generation, SurfaceId, TemplateId};
use crate::foundation::error::{MailError, MailResult};
use crate::render::engine::{RenderEngine, SignalReceiver, SurfaceDriver};

/// Creation attempts a caller makes before a never-started engine counts as unusable.
const CREATION_ATTEMPTS: u32 = 2;

/// Failed creations per slot after which a never-started engine is unusable even while other
/// creations are still in flight.
const CREATION_FAILURE_LIMIT: u64 = 4;

/// Pool sizing options.
#[derive(Debug, Clone, Copy)]
pub struct PoolOpts {
    /// Maximum number of live surfaces, and therefore of concurrent leases.
    pub max_surfaces: usize,
    /// Create a replacement when a destroyed surface's slot is needed again.
    ///
    /// Without replacement, a pool whose every slot is dead fails acquisitions immediately
    /// with `EngineFault`.
    pub replace_dead: bool,
}

impl Default for PoolOpts {
    fn default() -> Self {
        Self {
            max_surfaces: 4,
            replace_dead: true,
        }
    }
}

impl From<&PoolConfig> for PoolOpts {
    fn from(cfg: &PoolConfig) -> Self {
        Self {
            max_surfaces: cfg.max_surfaces,
            ..Self::default()
        }
    }
}

/// Lease state of one pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    /// Holds a warm surface ready to lease.
    Free,
    /// Its surface is out on a lease.
    Leased,
    /// A surface is being created for it outside the pool lock.
    Recycling,
    /// Holds no surface; the next demand may create a replacement here.
    Dead,
}

/// How the leaseholder left the surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceHealth {
    /// Reusable as-is.
    Healthy,
    /// Engine fault, timeout, or malformed output. The surface is destroyed.
    Unhealthy,
}

/// Pool counters. `peak_leased` is the high-water mark of concurrent leases.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Surfaces successfully created by the engine.
    pub surfaces_created: u64,
    /// Surfaces destroyed after an unhealthy release or on shutdown.
    pub surfaces_destroyed: u64,
    /// Failed engine surface creations.
    pub creation_failures: u64,
    /// Leases handed out.
    pub leases_granted: u64,
    /// Leases currently out.
    pub leased_now: usize,
    /// Most leases ever out at once.
    pub peak_leased: usize,
}

/// One live engine surface as seen by the renderer.
pub struct RenderSurface {
    pub(crate) id: SurfaceId,
    pub(crate) generation: Generation,
    pub(crate) driver: Box<dyn SurfaceDriver>,
    pub(crate) signals: SignalReceiver,
    pub(crate) loaded_template: Option<TemplateId>,
    pub(crate) healthy: bool,
}

impl RenderSurface {
    /// Slot identity.
    pub fn id(&self) -> SurfaceId {
        self.id
    }

    /// Generation of the lease currently holding this surface.
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Template whose harness is currently loaded.
    pub fn loaded_template(&self) -> Option<&TemplateId> {
        self.loaded_template.as_ref()
    }

    /// Health flag; false once any engine-level fault has been seen.
    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// Flag the surface as faulted so its release destroys it.
    pub fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }

    fn close(mut self) {
        self.driver.close();
    }
}

struct Slot {
    id: SurfaceId,
    generation: Generation,
    state: LeaseState,
    surface: Option<RenderSurface>,
}

struct PoolState {
    slots: Vec<Slot>,
    shutting_down: bool,
    stats: PoolStats,
}

impl PoolState {
    fn free_slot(&self, avoid: Option<SurfaceId>) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.state == LeaseState::Free && Some(s.id) != avoid)
    }

    fn reserve_creation_slot(&mut self, max: usize, replace_dead: bool) -> Option<usize> {
        let dead = replace_dead
            .then(|| self.slots.iter().position(|s| s.state == LeaseState::Dead))
            .flatten();
        let i = match dead {
            Some(i) => i,
            None if self.slots.len() < max => {
                let id = u32::try_from(self.slots.len()).ok()?;
                self.slots.push(Slot {
                    id: SurfaceId(id),
                    generation: Generation::default(),
                    state: LeaseState::Dead,
                    surface: None,
                });
                self.slots.len() - 1
            }
            None => return None,
        };
        self.slots[i].state = LeaseState::Recycling;
        Some(i)
    }

    fn exhausted(&self, max: usize) -> bool {
        self.slots.len() >= max && self.slots.iter().all(|s| s.state == LeaseState::Dead)
    }

    /// Whether a slot other than `except` is mid-creation.
    fn creation_in_flight(&self, except: usize) -> bool {
        self.slots
            .iter()
            .enumerate()
            .any(|(i, s)| i != except && s.state == LeaseState::Recycling)
    }

    fn any_live_surface(&self) -> bool {
        self.slots
            .iter()
            .any(|s| matches!(s.state, LeaseState::Free | LeaseState::Leased))
    }
}

struct PoolInner {
    engine: Arc<dyn RenderEngine>,
    opts: PoolOpts,
    state: Mutex<PoolState>,
    changed: Condvar,
}

/// Bounded pool of reusable render surfaces.
///
/// Surfaces are created lazily up to `max_surfaces` and kept warm (template harness loaded)
/// between leases. All lease state, generation counters and health flags are mutated under the
/// pool's own lock. Cloning the pool clones a handle to the same surfaces.
#[derive(Clone)]
pub struct SurfacePool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for SurfacePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurfacePool")
            .field("engine", &self.engine_name())
            .field("max_surfaces", &self.max_surfaces())
            .finish_non_exhaustive()
    }
}

impl SurfacePool {
    /// Create an empty pool. No surface is created until the first acquisition.
    pub fn new(engine: Arc<dyn RenderEngine>, opts: PoolOpts) -> MailResult<Self> {
        if opts.max_surfaces == 0 {
            return Err(MailError::validation("pool max_surfaces must be >= 1"));
        }
        Ok(Self {
            inner: Arc::new(PoolInner {
                engine,
                opts,
                state: Mutex::new(PoolState {
                    slots: Vec::with_capacity(opts.max_surfaces),
                    shutting_down: false,
                    stats: PoolStats::default(),
                }),
                changed: Condvar::new(),
            }),
        })
    }

    /// Maximum number of concurrent leases.
    pub fn max_surfaces(&self) -> usize {
        self.inner.opts.max_surfaces
    }

    /// Name of the wrapped engine.
    pub fn engine_name(&self) -> &str {
        self.inner.engine.name()
    }

    /// Snapshot of the pool counters.
    pub fn stats(&self) -> PoolStats {
        self.lock().stats.clone()
    }

    /// Lease state of every slot created so far, by slot index.
    pub fn slot_states(&self) -> Vec<(SurfaceId, LeaseState, Generation)> {
        self.lock()
            .slots
            .iter()
            .map(|s| (s.id, s.state, s.generation))
            .collect()
    }

    /// Lease a free healthy surface, creating one if below capacity, waiting up to `timeout`.
    ///
    /// A failed creation is `EngineFault`. It becomes `SystemicPoolFailure` only when no
    /// surface was ever created, no other creation is in flight, and a second attempt failed too.
    pub fn acquire(&self, timeout: Duration) -> MailResult<SurfaceLease> {
        self.acquire_avoiding(timeout, None)
    }

    /// Like [`SurfacePool::acquire`], but prefers any surface other than `avoid`.
    ///
    /// `avoid` is a preference: if the only way to lease without waiting is the avoided
    /// surface, it is leased anyway.
    pub fn acquire_avoiding(
        &self,
        timeout: Duration,
        avoid: Option<SurfaceId>,
    ) -> MailResult<SurfaceLease> {
        let deadline = Instant::now() + timeout;
        let PoolOpts {
            max_surfaces: max,
            replace_dead,
        } = self.inner.opts;
        let mut st = self.lock();
        loop {
            if st.shutting_down {
                return Err(MailError::pool_shutdown("pool no longer grants leases"));
            }

            if let Some(i) = st.free_slot(avoid) {
                return Ok(self.lease_slot(&mut st, i));
            }

            if let Some(i) = st.reserve_creation_slot(max, replace_dead) {
                drop(st);
                return self.create_and_lease(i);
            }

            if !replace_dead && st.exhausted(max) {
                return Err(MailError::engine_fault(
                    "every surface has faulted and replacement is disabled",
                ));
            }

            if avoid.is_some()
                && let Some(i) = st.free_slot(None)
            {
                return Ok(self.lease_slot(&mut st, i));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(MailError::acquisition_timeout(format!(
                    "no surface free within {} ms ({} of {max} leased)",
                    timeout.as_millis(),
                    st.stats.leased_now
                )));
            }
            st = self
                .inner
                .changed
                .wait_timeout(st, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Return a lease to the pool.
    ///
    /// Unhealthy surfaces (by `health` or by their own flag) are destroyed and their slot is
    /// left for lazy replacement. A lease whose generation no longer matches its slot (the pool
    /// was shut down under it) is destroyed without touching the slot.
    pub fn release(&self, mut lease: SurfaceLease, health: SurfaceHealth) {
        if let Some(surface) = lease.surface.take() {
            self.return_surface(lease.slot, surface, health);
        }
    }

    /// Stop granting leases, wait up to `drain_timeout` for outstanding leases, then destroy
    /// every surface. Safe to call repeatedly and on a pool that never created a surface.
    pub fn shutdown(&self, drain_timeout: Duration) {
        let deadline = Instant::now() + drain_timeout;
        let mut st = self.lock();
        st.shutting_down = true;
        self.inner.changed.notify_all();

        while st.stats.leased_now > 0 {
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(
                    abandoned = st.stats.leased_now,
                    "pool shutdown drain timed out; outstanding leases will be discarded"
                );
                break;
            }
            st = self
                .inner
                .changed
                .wait_timeout(st, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        let mut doomed = Vec::new();
        for slot in &mut st.slots {
            if slot.state == LeaseState::Leased {
                // Late releases of this lease will see a newer generation and be discarded.
                slot.generation = slot.generation.next();
            }
            if let Some(surface) = slot.surface.take() {
                doomed.push(surface);
            }
            slot.state = LeaseState::Dead;
        }
        st.stats.surfaces_destroyed += doomed.len() as u64;
        drop(st);

        if !doomed.is_empty() {
            tracing::debug!(count = doomed.len(), "destroying pooled surfaces");
        }
        for surface in doomed {
            surface.close();
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lease_slot(&self, st: &mut PoolState, i: usize) -> SurfaceLease {
        let slot = &mut st.slots[i];
        slot.generation = slot.generation.next();
        slot.state = LeaseState::Leased;
        let mut surface = slot
            .surface
            .take()
            .unwrap_or_else(|| unreachable!("free slot without a surface"));
        surface.generation = slot.generation;
        tracing::trace!(surface = %slot.id, generation = %slot.generation, "lease granted");

        st.stats.leases_granted += 1;
        st.stats.leased_now += 1;
        st.stats.peak_leased = st.stats.peak_leased.max(st.stats.leased_now);

        SurfaceLease {
            pool: self.clone(),
            slot: i,
            surface: Some(surface),
        }
    }

    fn create_and_lease(&self, i: usize) -> MailResult<SurfaceLease> {
        let id = self.lock().slots[i].id;
        let mut attempt = 1;
        loop {
            let (tx, rx) = mpsc::channel();
            let created = self.inner.engine.create_surface(id, tx);

            let mut st = self.lock();
            let e = match created {
                Ok(driver) => {
                    st.stats.surfaces_created += 1;
                    let slot = &mut st.slots[i];
                    slot.surface = Some(RenderSurface {
                        id,
                        generation: slot.generation,
                        driver,
                        signals: rx,
                        loaded_template: None,
                        healthy: true,
                    });
                    slot.state = LeaseState::Free;
                    tracing::debug!(surface = %id, engine = self.engine_name(), "surface created");
                    if st.shutting_down {
                        let surface = st.slots[i].surface.take();
                        st.slots[i].state = LeaseState::Dead;
                        st.stats.surfaces_destroyed += 1;
                        drop(st);
                        if let Some(s) = surface {
                            s.close();
                        }
                        return Err(MailError::pool_shutdown("pool shut down during creation"));
                    }
                    return Ok(self.lease_slot(&mut st, i));
                }
                Err(e) => e,
            };

            st.stats.creation_failures += 1;
            let never_created = st.stats.surfaces_created == 0 && !st.any_live_surface();
            let in_flight = st.creation_in_flight(i);
            tracing::warn!(
                surface = %id,
                error = %e,
                attempt,
                never_created,
                in_flight,
                "surface creation failed"
            );

            // With nothing created yet, re-attempt once before judging the engine dead.
            if never_created && !in_flight && attempt < CREATION_ATTEMPTS && !st.shutting_down {
                drop(st);
                attempt += 1;
                continue;
            }

            st.slots[i].state = LeaseState::Dead;
            self.inner.changed.notify_all();
            let max = self.inner.opts.max_surfaces as u64;
            let exhausted = (!in_flight && attempt >= CREATION_ATTEMPTS)
                || st.stats.creation_failures >= CREATION_FAILURE_LIMIT * max;
            return if never_created && exhausted {
                Err(MailError::systemic_pool_failure(format!(
                    "engine '{}' could not create any surface: {e}",
                    self.engine_name()
                )))
            } else {
                Err(MailError::engine_fault(format!("create {id}: {e}")))
            };
        }
    }

    fn return_surface(&self, i: usize, surface: RenderSurface, health: SurfaceHealth) {
        let healthy = health == SurfaceHealth::Healthy && surface.healthy;
        let mut st = self.lock();
        let PoolState { slots, stats, .. } = &mut *st;
        stats.leased_now = stats.leased_now.saturating_sub(1);

        let slot = &mut slots[i];
        let stale = slot.state != LeaseState::Leased || slot.generation != surface.generation;
        let doomed = if stale {
            tracing::debug!(surface = %surface.id, generation = %surface.generation, "stale lease released");
            stats.surfaces_destroyed += 1;
            Some(surface)
        } else if healthy {
            slot.surface = Some(surface);
            slot.state = LeaseState::Free;
            None
        } else {
            slot.state = LeaseState::Dead;
            stats.surfaces_destroyed += 1;
            tracing::debug!(surface = %surface.id, generation = %surface.generation, "unhealthy surface destroyed");
            Some(surface)
        };
        self.inner.changed.notify_all();
        drop(st);

        if let Some(s) = doomed {
            s.close();
        }
    }
}

/// A leased surface. Return it with [`SurfacePool::release`]; dropping it releases it as
/// unhealthy.
pub struct SurfaceLease {
    pool: SurfacePool,
    slot: usize,
    surface: Option<RenderSurface>,
}

impl SurfaceLease {
    /// Leased surface.
    pub fn surface(&self) -> &RenderSurface {
        self.surface
            .as_ref()
            .unwrap_or_else(|| unreachable!("lease accessed after release"))
    }

    /// Leased surface, mutably.
    pub fn surface_mut(&mut self) -> &mut RenderSurface {
        self.surface
            .as_mut()
            .unwrap_or_else(|| unreachable!("lease accessed after release"))
    }

    /// Slot identity of the leased surface.
    pub fn id(&self) -> SurfaceId {
        self.surface().id
    }

    /// Generation of this lease.
    pub fn generation(&self) -> Generation {
        self.surface().generation
    }

    /// Release back to the owning pool, taking the surface's own health flag into account.
    pub fn release(self, health: SurfaceHealth) {
        let pool = self.pool.clone();
        pool.release(self, health);
    }
}

impl Drop for SurfaceLease {
    fn drop(&mut self) {
        if let Some(surface) = self.surface.take() {
            self.pool
                .return_surface(self.slot, surface, SurfaceHealth::Unhealthy);
        }
    }
}

#[cfg(test)]
#[path = "../../tests/unit/render/pool.rs"]
mod tests;
