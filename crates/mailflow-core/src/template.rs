//! Template fetch, caching, and rendering.
//!
//! Templates are owned by an external store and fetched on demand. The
//! renderer keeps a read-through cache keyed by `(template_id, locale)`;
//! concurrent misses may both fetch, last write wins. Locale resolution
//! tries the requested locale first and falls back to the default locale.
//!
//! A missing template always fails the render. A field that fails to render
//! degrades to the raw template string with a warning, never silently.

use crate::message::{EmailDraft, EmailMessage, RenderedContent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use handlebars::Handlebars;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

#[cfg(test)]
#[path = "template_tests.rs"]
mod tests;

// ============================================================================
// Template Model
// ============================================================================

/// An email template for one locale
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub template_id: String,
    pub locale: String,
    pub subject: String,
    pub html_body: String,
    #[serde(default)]
    pub text_body: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// Template lookup and rendering failures
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error(
        "template '{template_id}' not found for locale '{locale}' or default locale '{default_locale}'"
    )]
    NotFound {
        template_id: String,
        locale: String,
        default_locale: String,
    },

    #[error("template store request failed: {message}")]
    StoreUnavailable { message: String },

    #[error("template store returned an invalid response: {message}")]
    InvalidResponse { message: String },
}

// ============================================================================
// Template Store
// ============================================================================

/// Source of templates, typically a remote service
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TemplateStore: Send + Sync {
    /// Fetch the template for an exact `(template_id, locale)` pair
    ///
    /// `Ok(None)` means the store has no such template; locale fallback is
    /// the renderer's concern, not the store's.
    async fn fetch(
        &self,
        template_id: &str,
        locale: &str,
    ) -> Result<Option<Template>, TemplateError>;
}

#[derive(Debug, Serialize)]
struct TemplateQuery<'a> {
    template_id: &'a str,
    locale: &'a str,
}

/// Template store backed by a REST service
pub struct HttpTemplateStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTemplateStore {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl TemplateStore for HttpTemplateStore {
    async fn fetch(
        &self,
        template_id: &str,
        locale: &str,
    ) -> Result<Option<Template>, TemplateError> {
        let url = format!("{}/get-email-template", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&TemplateQuery {
                template_id,
                locale,
            })
            .send()
            .await
            .map_err(|e| TemplateError::StoreUnavailable {
                message: e.to_string(),
            })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if !response.status().is_success() {
            return Err(TemplateError::StoreUnavailable {
                message: format!("store responded with status {}", response.status()),
            });
        }

        // The store returns a (possibly empty) list of matching templates
        let mut templates: Vec<Template> =
            response
                .json()
                .await
                .map_err(|e| TemplateError::InvalidResponse {
                    message: e.to_string(),
                })?;

        Ok(if templates.is_empty() {
            None
        } else {
            Some(templates.swap_remove(0))
        })
    }
}

// ============================================================================
// Renderer
// ============================================================================

type CacheKey = (String, String);

/// Renders drafts into queue-ready messages
pub struct TemplateRenderer {
    store: Arc<dyn TemplateStore>,
    cache: RwLock<HashMap<CacheKey, Arc<Template>>>,
    registry: Handlebars<'static>,
    default_locale: String,
}

impl TemplateRenderer {
    pub fn new(store: Arc<dyn TemplateStore>, default_locale: impl Into<String>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
            registry: Handlebars::new(),
            default_locale: default_locale.into(),
        }
    }

    /// Render a draft into a queue-ready message
    ///
    /// A draft without a template renders to empty content; direct-content
    /// sends are a valid submission shape.
    pub async fn render(
        &self,
        draft: EmailDraft,
        now: DateTime<Utc>,
    ) -> Result<EmailMessage, TemplateError> {
        let content = match &draft.template_id {
            None => RenderedContent::empty(),
            Some(template_id) => {
                let template = self.resolve(template_id, &draft.locale).await?;
                self.render_content(&template, &draft.template_data)
            }
        };

        Ok(EmailMessage::from_draft(draft, content, now))
    }

    /// Resolve a template: exact locale first, then the default locale
    async fn resolve(
        &self,
        template_id: &str,
        locale: &str,
    ) -> Result<Arc<Template>, TemplateError> {
        if let Some(template) = self.lookup(template_id, locale).await? {
            return Ok(template);
        }

        if locale != self.default_locale {
            debug!(
                template_id,
                locale,
                fallback = %self.default_locale,
                "template missing for locale, falling back to default"
            );
            if let Some(template) = self.lookup(template_id, &self.default_locale).await? {
                return Ok(template);
            }
        }

        Err(TemplateError::NotFound {
            template_id: template_id.to_string(),
            locale: locale.to_string(),
            default_locale: self.default_locale.clone(),
        })
    }

    /// Read-through cache lookup for one exact `(template_id, locale)` pair
    async fn lookup(
        &self,
        template_id: &str,
        locale: &str,
    ) -> Result<Option<Arc<Template>>, TemplateError> {
        let key = (template_id.to_string(), locale.to_string());

        {
            let cache = self.cache.read().expect("template cache lock poisoned");
            if let Some(template) = cache.get(&key) {
                return Ok(Some(template.clone()));
            }
        }

        let Some(template) = self.store.fetch(template_id, locale).await? else {
            return Ok(None);
        };

        let template = Arc::new(template);
        let mut cache = self.cache.write().expect("template cache lock poisoned");
        cache.insert(key, template.clone());

        Ok(Some(template))
    }

    fn render_content(
        &self,
        template: &Template,
        data: &HashMap<String, serde_json::Value>,
    ) -> RenderedContent {
        RenderedContent {
            subject: self.render_field(template, "subject", &template.subject, data),
            html_body: self.render_field(template, "html_body", &template.html_body, data),
            text_body: template
                .text_body
                .as_ref()
                .map(|text| self.render_field(template, "text_body", text, data)),
        }
    }

    /// Render one field, degrading to the raw template string on failure
    fn render_field(
        &self,
        template: &Template,
        field: &str,
        source: &str,
        data: &HashMap<String, serde_json::Value>,
    ) -> String {
        match self.registry.render_template(source, data) {
            Ok(rendered) => rendered,
            Err(error) => {
                warn!(
                    template_id = %template.template_id,
                    locale = %template.locale,
                    field,
                    %error,
                    "template field failed to render, using raw template string"
                );
                source.to_string()
            }
        }
    }

    /// Drop one cached entry so the next render re-fetches it
    pub fn evict(&self, template_id: &str, locale: &str) {
        let mut cache = self.cache.write().expect("template cache lock poisoned");
        cache.remove(&(template_id.to_string(), locale.to_string()));
    }
}
