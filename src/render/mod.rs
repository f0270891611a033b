//! Render surfaces: the engine seam, the built-in CPU engine, the surface pool, and the
//! per-recipient renderer.

/// Engine and surface traits plus the completion-signal channel.
pub mod engine;
/// Bounded pool of reusable render surfaces.
pub mod pool;
/// One recipient on one leased surface.
pub mod renderer;
/// `resvg`-backed engine.
pub mod svg;
