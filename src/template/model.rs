use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::foundation::core::TemplateId;
use crate::foundation::error::{MailError, MailResult};
use crate::template::color::Color;

/// Canvas dimensions in design units (one unit renders as one pixel at device scale 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Canvas {
    /// Width in design units.
    pub width: u32,
    /// Height in design units.
    pub height: u32,
}

/// A personalization field declared by the template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDecl {
    /// Field name as it appears in recipient records and `{{placeholders}}`.
    pub name: String,
    /// A recipient without this field fails instead of rendering it empty.
    #[serde(default)]
    pub required: bool,
    /// Value used when the recipient omits a non-required field.
    #[serde(default)]
    pub default: Option<String>,
}

/// Horizontal text anchoring within a text node's box.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextAlign {
    /// Left edge.
    #[default]
    Start,
    /// Box centre.
    Middle,
    /// Right edge.
    End,
}

/// Where an image node takes its pixels from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSource {
    /// Fixed asset path, shared by every recipient.
    Path(PathBuf),
    /// Path read from the named recipient field.
    Field(String),
}

/// Node payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// Filled rectangle.
    Rect {
        /// Fill color.
        fill: Color,
        /// Corner radius in design units.
        #[serde(default)]
        corner_radius: f64,
    },
    /// Filled ellipse inscribed in the node box.
    Ellipse {
        /// Fill color.
        fill: Color,
    },
    /// Text run; `{{field}}` placeholders are personalized per recipient.
    Text {
        /// Text content with optional placeholders.
        content: String,
        /// Font size in design units.
        font_size: f64,
        /// CSS-style font family list.
        #[serde(default = "default_font_family")]
        font_family: String,
        /// Text color.
        #[serde(default = "default_text_fill")]
        fill: Color,
        /// Bold weight.
        #[serde(default)]
        bold: bool,
        /// Horizontal anchoring.
        #[serde(default)]
        align: TextAlign,
    },
    /// Raster image scaled into the node box.
    Image {
        /// Pixel source.
        source: ImageSource,
    },
}

fn default_font_family() -> String {
    "sans-serif".to_owned()
}

fn default_text_fill() -> Color {
    Color::BLACK
}

fn default_opacity() -> f64 {
    1.0
}

/// One element of the template scene graph. Nodes paint in list order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneNode {
    /// Designer-assigned node id.
    pub id: String,
    /// Left edge in design units.
    pub x: f64,
    /// Top edge in design units.
    pub y: f64,
    /// Box width in design units.
    pub width: f64,
    /// Box height in design units.
    pub height: f64,
    /// Node opacity.
    #[serde(default = "default_opacity")]
    pub opacity: f64,
    /// Node payload.
    #[serde(flatten)]
    pub kind: NodeKind,
}

/// Immutable design description shared by every recipient of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    /// Stable template id.
    pub id: TemplateId,
    /// Canvas size in design units.
    pub canvas: Canvas,
    /// Solid fill painted before the background image.
    #[serde(default = "default_background_color")]
    pub background_color: Color,
    /// Background image stretched over the whole canvas.
    #[serde(default)]
    pub background: Option<PathBuf>,
    /// Declared personalization fields.
    #[serde(default)]
    pub fields: Vec<FieldDecl>,
    /// Scene graph in paint order.
    #[serde(default)]
    pub nodes: Vec<SceneNode>,
}

fn default_background_color() -> Color {
    Color::WHITE
}

impl Template {
    /// Parse a template from a JSON reader.
    pub fn from_reader<R: std::io::Read>(r: R) -> MailResult<Self> {
        let t: Self = serde_json::from_reader(r)
            .map_err(|e| MailError::serde(format!("parse template JSON: {e}")))?;
        t.validate()?;
        Ok(t)
    }

    /// Parse a template from a JSON file on disk.
    ///
    /// Relative asset paths are resolved against the file's directory.
    pub fn from_path(path: impl AsRef<Path>) -> MailResult<Self> {
        let path = path.as_ref();
        let f = File::open(path).map_err(|e| {
            MailError::validation(format!("open template JSON '{}': {e}", path.display()))
        })?;
        let mut t = Self::from_reader(BufReader::new(f))?;
        if let Some(dir) = path.parent() {
            t.resolve_asset_paths(dir);
        }
        Ok(t)
    }

    /// Check structural constraints the renderer relies on.
    pub fn validate(&self) -> MailResult<()> {
        if self.id.as_str().trim().is_empty() {
            return Err(MailError::validation("template id must be non-empty"));
        }
        if self.canvas.width == 0 || self.canvas.height == 0 {
            return Err(MailError::validation(format!(
                "template '{}' canvas must be non-empty, got {}x{}",
                self.id, self.canvas.width, self.canvas.height
            )));
        }

        let mut seen = BTreeSet::new();
        for f in &self.fields {
            if f.name.trim().is_empty() {
                return Err(MailError::validation("field names must be non-empty"));
            }
            if !seen.insert(f.name.as_str()) {
                return Err(MailError::validation(format!(
                    "template '{}' declares field '{}' twice",
                    self.id, f.name
                )));
            }
        }

        for n in &self.nodes {
            let geom = [n.x, n.y, n.width, n.height, n.opacity];
            if geom.iter().any(|v| !v.is_finite()) {
                return Err(MailError::validation(format!(
                    "node '{}' has non-finite geometry",
                    n.id
                )));
            }
            if n.width < 0.0 || n.height < 0.0 {
                return Err(MailError::validation(format!(
                    "node '{}' has negative size",
                    n.id
                )));
            }
            if let NodeKind::Text { font_size, .. } = &n.kind
                && !(font_size.is_finite() && *font_size > 0.0)
            {
                return Err(MailError::validation(format!(
                    "text node '{}' font_size must be > 0",
                    n.id
                )));
            }
        }
        Ok(())
    }

    /// Look up a declared field.
    pub fn field(&self, name: &str) -> Option<&FieldDecl> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Every field name the scene graph or the declarations mention, sorted.
    pub fn referenced_fields(&self) -> BTreeSet<String> {
        let mut out: BTreeSet<String> = self.fields.iter().map(|f| f.name.clone()).collect();
        for n in &self.nodes {
            match &n.kind {
                NodeKind::Text { content, .. } => {
                    out.extend(placeholders(content).into_iter().map(str::to_owned));
                }
                NodeKind::Image {
                    source: ImageSource::Field(name),
                } => {
                    out.insert(name.clone());
                }
                _ => {}
            }
        }
        out
    }

    fn resolve_asset_paths(&mut self, dir: &Path) {
        if let Some(bg) = self.background.as_mut()
            && bg.is_relative()
        {
            *bg = dir.join(&*bg);
        }
        for n in &mut self.nodes {
            if let NodeKind::Image {
                source: ImageSource::Path(p),
            } = &mut n.kind
                && p.is_relative()
            {
                *p = dir.join(&*p);
            }
        }
    }
}

/// Names referenced as `{{ name }}` in `content`, in order of appearance.
pub fn placeholders(content: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut rest = content;
    while let Some(open) = rest.find("{{") {
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            break;
        };
        let name = after[..close].trim();
        if !name.is_empty() {
            out.push(name);
        }
        rest = &after[close + 2..];
    }
    out
}

/// Replace `{{ name }}` placeholders with values from `fields`; unknown names become empty.
pub fn fill_placeholders(content: &str, fields: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(content.len());
    let mut rest = content;
    while let Some(open) = rest.find("{{") {
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            break;
        };
        out.push_str(&rest[..open]);
        let name = after[..close].trim();
        if let Some(v) = fields.get(name) {
            out.push_str(v);
        }
        rest = &after[close + 2..];
    }
    out.push_str(rest);
    out
}

/// One recipient's personalization data.
///
/// JSON objects with string, number, or boolean values are accepted; `null` values are treated
/// as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct RecipientRecord {
    fields: BTreeMap<String, String>,
}

impl RecipientRecord {
    /// Empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    /// Insert or replace a field value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Field value, if present.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// All fields, sorted by name.
    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for RecipientRecord {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl<'de> Deserialize<'de> for RecipientRecord {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = BTreeMap::<String, serde_json::Value>::deserialize(deserializer)?;
        let mut fields = BTreeMap::new();
        for (k, v) in raw {
            let s = match v {
                serde_json::Value::Null => continue,
                serde_json::Value::String(s) => s,
                serde_json::Value::Bool(b) => b.to_string(),
                serde_json::Value::Number(n) => n.to_string(),
                other => {
                    return Err(serde::de::Error::custom(format!(
                        "recipient field '{k}' must be a scalar, got {other}"
                    )));
                }
            };
            fields.insert(k, s);
        }
        Ok(Self { fields })
    }
}

/// Load an ordered recipient list from a JSON array file.
pub fn load_recipients(path: impl AsRef<Path>) -> MailResult<Vec<RecipientRecord>> {
    let path = path.as_ref();
    let f = File::open(path).map_err(|e| {
        MailError::validation(format!("open recipients JSON '{}': {e}", path.display()))
    })?;
    serde_json::from_reader(BufReader::new(f))
        .map_err(|e| MailError::serde(format!("parse recipients JSON: {e}")))
}

#[cfg(test)]
#[path = "../../tests/unit/template/model.rs"]
mod tests;
