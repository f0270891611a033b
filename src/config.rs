//! Engine configuration.
//!
//! Every knob has a default so an empty JSON object (`{}`) is a valid configuration file. The
//! CLI layers its flags on top of whatever [`EngineConfig::from_path`] returns.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::foundation::error::{MailError, MailResult};

/// Top-level engine configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Surface pool sizing.
    pub pool: PoolConfig,
    /// Independent per-step deadlines.
    pub timeouts: TimeoutConfig,
    /// Work-item retry behavior.
    pub retry: RetryPolicy,
    /// Raster-to-print conversion policy.
    pub assembly: AssemblyPolicy,
}

/// Pool sizing knobs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    /// Maximum number of surfaces (and therefore concurrent leases).
    pub max_surfaces: usize,
    /// How long `shutdown` waits for in-flight leases before destroying surfaces.
    pub drain_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_surfaces: 4,
            drain_timeout_ms: 10_000,
        }
    }
}

/// Deadlines for the three suspension points of a work item.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutConfig {
    /// Bounded wait for a free surface.
    pub acquire_ms: u64,
    /// Bounded wait for the surface's render-complete signal.
    pub render_ms: u64,
    /// Bounded wait for a document sink write.
    pub write_ms: u64,
}

impl TimeoutConfig {
    /// Surface acquisition deadline.
    pub fn acquire(&self) -> Duration {
        Duration::from_millis(self.acquire_ms)
    }

    /// Render completion deadline.
    pub fn render(&self) -> Duration {
        Duration::from_millis(self.render_ms)
    }

    /// Document write deadline.
    pub fn write(&self) -> Duration {
        Duration::from_millis(self.write_ms)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            acquire_ms: 30_000,
            render_ms: 20_000,
            write_ms: 15_000,
        }
    }
}

/// Retry behavior for a failed work item.
///
/// A work item always gets exactly one retry on a freshly acquired lease. Whether that lease
/// should avoid the surface that just failed, and whether to pause first, is policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    /// Pause before the retry attempt.
    pub backoff_ms: u64,
    /// Prefer a different physical surface for the retry when one is free.
    pub prefer_different_surface: bool,
}

impl RetryPolicy {
    /// Total attempts per work item (first try plus one retry).
    pub const MAX_ATTEMPTS: u32 = 2;

    /// Pause before retrying.
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_ms: 0,
            prefer_different_surface: true,
        }
    }
}

/// Raster-to-print conversion policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AssemblyPolicy {
    /// Largest acceptable upscale factor before a raster counts as too small for the format.
    pub max_upscale: f64,
    /// Build the page anyway (with a warning) when `max_upscale` is exceeded.
    pub allow_upscale: bool,
    /// JPEG quality used for page images embedded into PDFs.
    pub jpeg_quality: u8,
}

impl Default for AssemblyPolicy {
    fn default() -> Self {
        Self {
            max_upscale: 1.5,
            allow_upscale: false,
            jpeg_quality: 92,
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from a JSON reader.
    pub fn from_reader<R: std::io::Read>(r: R) -> MailResult<Self> {
        let cfg: Self = serde_json::from_reader(r)
            .map_err(|e| MailError::serde(format!("parse engine config JSON: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse a configuration from a JSON file on disk.
    pub fn from_path(path: impl AsRef<Path>) -> MailResult<Self> {
        let path = path.as_ref();
        let f = File::open(path).map_err(|e| {
            MailError::validation(format!("open engine config '{}': {e}", path.display()))
        })?;
        Self::from_reader(BufReader::new(f))
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> MailResult<()> {
        if self.pool.max_surfaces == 0 {
            return Err(MailError::validation("pool.max_surfaces must be >= 1"));
        }
        if self.timeouts.acquire_ms == 0 || self.timeouts.render_ms == 0 {
            return Err(MailError::validation(
                "timeouts.acquire_ms and timeouts.render_ms must be > 0",
            ));
        }
        if self.timeouts.write_ms == 0 {
            return Err(MailError::validation("timeouts.write_ms must be > 0"));
        }
        if !self.assembly.max_upscale.is_finite() || self.assembly.max_upscale < 1.0 {
            return Err(MailError::validation(
                "assembly.max_upscale must be a finite number >= 1.0",
            ));
        }
        if !(1..=100).contains(&self.assembly.jpeg_quality) {
            return Err(MailError::validation(
                "assembly.jpeg_quality must be within 1..=100",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "../tests/unit/config.rs"]
mod tests;
