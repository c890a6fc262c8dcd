//! Template rendering seam and default variables

use std::collections::BTreeMap;

use chrono::{Datelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RenderError;

/// Template variables, ordered for stable output
pub type Variables = BTreeMap<String, String>;

/// Turns a template name and variables into a message body
///
/// Rendering is pure and synchronous; a renderer must not perform I/O per call.
pub trait Renderer: Send + Sync {
    /// # Errors
    ///
    /// Returns a [`RenderError`] for unknown or malformed templates, or when a
    /// required variable is missing.
    fn render(&self, template: &str, variables: &Variables) -> Result<String, RenderError>;
}

impl<F> Renderer for F
where
    F: Fn(&str, &Variables) -> Result<String, RenderError> + Send + Sync,
{
    fn render(&self, template: &str, variables: &Variables) -> Result<String, RenderError> {
        self(template, variables)
    }
}

/// Variables every message gets unless the request supplies its own value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultVariables {
    /// Exposed to templates as `company_name`
    #[serde(default = "default_company_name")]
    pub company_name: String,

    /// Any further defaults
    #[serde(default)]
    pub extra: Variables,
}

impl Default for DefaultVariables {
    fn default() -> Self {
        Self {
            company_name: default_company_name(),
            extra: Variables::new(),
        }
    }
}

fn default_company_name() -> String {
    String::from("Herald")
}

impl DefaultVariables {
    /// Defaults overlaid with `supplied`; supplied values always win
    #[must_use]
    pub fn merge(&self, supplied: &Variables) -> Variables {
        let mut merged = self.extra.clone();
        merged.insert("company_name".to_string(), self.company_name.clone());
        merged.insert("year".to_string(), Utc::now().year().to_string());
        merged.extend(supplied.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }
}
