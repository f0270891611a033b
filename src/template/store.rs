use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::foundation::core::TemplateId;
use crate::foundation::error::{MailError, MailResult};
use crate::template::model::Template;

/// Read-only access to templates owned by the design tool.
pub trait TemplateStore: Send + Sync {
    /// Fetch a template by id.
    fn get_template(&self, id: &TemplateId) -> MailResult<Arc<Template>>;
}

/// Process-local template store for tests and the CLI.
#[derive(Default)]
pub struct InMemoryTemplateStore {
    templates: RwLock<HashMap<TemplateId, Arc<Template>>>,
}

impl InMemoryTemplateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register a template, replacing any previous one with the same id.
    pub fn insert(&self, template: Template) -> MailResult<Arc<Template>> {
        template.validate()?;
        let t = Arc::new(template);
        self.templates
            .write()
            .map_err(|_| MailError::validation("template store lock poisoned"))?
            .insert(t.id.clone(), Arc::clone(&t));
        Ok(t)
    }
}

impl TemplateStore for InMemoryTemplateStore {
    fn get_template(&self, id: &TemplateId) -> MailResult<Arc<Template>> {
        self.templates
            .read()
            .map_err(|_| MailError::validation("template store lock poisoned"))?
            .get(id)
            .cloned()
            .ok_or_else(|| MailError::validation(format!("unknown template '{id}'")))
    }
}
