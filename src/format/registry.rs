use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::foundation::error::{MailError, MailResult};

/// PDF user-space points per inch.
pub const POINTS_PER_INCH: f64 = 72.0;

const MM: f64 = 1.0 / 25.4;

/// Physical page geometry of a print product.
///
/// All lengths are inches. `width_units × height_units` is the trimmed piece; `bleed_units` is
/// added on every side of it, so the printable canvas is `(w + 2b) × (h + 2b)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintFormat {
    /// Registry key.
    pub name: String,
    /// Trimmed width in inches.
    pub width_units: f64,
    /// Trimmed height in inches.
    pub height_units: f64,
    /// Bleed margin in inches, per side.
    pub bleed_units: f64,
    /// Output resolution.
    pub dpi: u32,
}

impl PrintFormat {
    /// Build a format; see [`PrintFormat::validate`] for the accepted ranges.
    pub fn new(name: impl Into<String>, width: f64, height: f64, bleed: f64, dpi: u32) -> Self {
        Self {
            name: name.into(),
            width_units: width,
            height_units: height,
            bleed_units: bleed,
            dpi,
        }
    }

    /// Reject geometry that cannot produce a page.
    pub fn validate(&self) -> MailResult<()> {
        if self.name.trim().is_empty() {
            return Err(MailError::validation("print format name must be non-empty"));
        }
        let dims = [self.width_units, self.height_units];
        if dims.iter().any(|v| !v.is_finite() || *v <= 0.0) {
            return Err(MailError::validation(format!(
                "print format '{}' must have positive width and height",
                self.name
            )));
        }
        if !self.bleed_units.is_finite() || self.bleed_units < 0.0 {
            return Err(MailError::validation(format!(
                "print format '{}' bleed must be >= 0",
                self.name
            )));
        }
        if self.dpi == 0 {
            return Err(MailError::validation(format!(
                "print format '{}' dpi must be > 0",
                self.name
            )));
        }
        Ok(())
    }

    /// Full-bleed canvas in pixels at `dpi`.
    pub fn page_px(&self) -> (u32, u32) {
        (
            self.to_px(self.width_units + 2.0 * self.bleed_units),
            self.to_px(self.height_units + 2.0 * self.bleed_units),
        )
    }

    /// Trimmed piece in pixels at `dpi`.
    pub fn trim_px(&self) -> (u32, u32) {
        (self.to_px(self.width_units), self.to_px(self.height_units))
    }

    /// Bleed margin in pixels at `dpi`.
    pub fn bleed_px(&self) -> u32 {
        (self.bleed_units * f64::from(self.dpi)).round() as u32
    }

    /// PDF `MediaBox` (full bleed) in points.
    pub fn media_box_pt(&self) -> [f64; 4] {
        [
            0.0,
            0.0,
            (self.width_units + 2.0 * self.bleed_units) * POINTS_PER_INCH,
            (self.height_units + 2.0 * self.bleed_units) * POINTS_PER_INCH,
        ]
    }

    /// PDF `TrimBox` in points.
    pub fn trim_box_pt(&self) -> [f64; 4] {
        let b = self.bleed_units * POINTS_PER_INCH;
        [
            b,
            b,
            b + self.width_units * POINTS_PER_INCH,
            b + self.height_units * POINTS_PER_INCH,
        ]
    }

    fn to_px(&self, inches: f64) -> u32 {
        (inches * f64::from(self.dpi)).round().max(1.0) as u32
    }
}

/// Immutable name → [`PrintFormat`] table.
#[derive(Debug, Clone, Default)]
pub struct FormatRegistry {
    formats: BTreeMap<String, PrintFormat>,
}

impl FormatRegistry {
    /// The built-in table of mail and office formats.
    pub fn builtin() -> Self {
        let us = |name: &str, w: f64, h: f64| PrintFormat::new(name, w, h, 0.125, 300);
        let iso = |name: &str, w_mm: f64, h_mm: f64| {
            PrintFormat::new(name, w_mm * MM, h_mm * MM, 3.0 * MM, 300)
        };
        let formats = [
            us("postcard-4x6", 6.0, 4.0),
            us("postcard-6x9", 9.0, 6.0),
            us("postcard-6x11", 11.0, 6.0),
            us("letter", 8.5, 11.0),
            iso("a4", 210.0, 297.0),
            iso("a5", 148.0, 210.0),
        ];
        Self {
            formats: formats.into_iter().map(|f| (f.name.clone(), f)).collect(),
        }
    }

    /// Build a registry from explicit formats. Duplicate names are rejected.
    pub fn from_formats(formats: impl IntoIterator<Item = PrintFormat>) -> MailResult<Self> {
        let mut out = BTreeMap::new();
        for f in formats {
            f.validate()?;
            if out.contains_key(&f.name) {
                return Err(MailError::validation(format!(
                    "print format '{}' registered twice",
                    f.name
                )));
            }
            out.insert(f.name.clone(), f);
        }
        Ok(Self { formats: out })
    }

    /// Load a registry from a JSON array of formats.
    pub fn from_path(path: impl AsRef<Path>) -> MailResult<Self> {
        let path = path.as_ref();
        let f = File::open(path).map_err(|e| {
            MailError::validation(format!("open format table '{}': {e}", path.display()))
        })?;
        let formats: Vec<PrintFormat> = serde_json::from_reader(BufReader::new(f))
            .map_err(|e| MailError::serde(format!("parse format table JSON: {e}")))?;
        Self::from_formats(formats)
    }

    /// Resolve a format by name.
    pub fn lookup(&self, name: &str) -> MailResult<&PrintFormat> {
        self.formats
            .get(name)
            .ok_or_else(|| MailError::unknown_format(format!("no print format named '{name}'")))
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.formats.keys().map(String::as_str)
    }

    /// Number of registered formats.
    pub fn len(&self) -> usize {
        self.formats.len()
    }

    /// Whether the registry has no formats.
    pub fn is_empty(&self) -> bool {
        self.formats.is_empty()
    }
}

/// Process-wide built-in registry, built on first use.
pub fn builtin_registry() -> &'static FormatRegistry {
    static REGISTRY: OnceLock<FormatRegistry> = OnceLock::new();
    REGISTRY.get_or_init(FormatRegistry::builtin)
}

#[cfg(test)]
#[path = "../../tests/unit/format/registry.rs"]
mod tests;
