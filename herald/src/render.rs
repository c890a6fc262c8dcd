//! File-backed templates with `{{ name }}` placeholders

use std::path::{Component, Path, PathBuf};

use herald_dispatch::{RenderError, Renderer, Variables};

/// Renders `<directory>/<template>.<extension>`
#[derive(Debug, Clone)]
pub struct DirectoryRenderer {
    directory: PathBuf,
    extension: String,
}

impl DirectoryRenderer {
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            extension: extension.into(),
        }
    }

    fn path_of(&self, template: &str) -> Result<PathBuf, RenderError> {
        let name = Path::new(template);
        let plain = name
            .components()
            .all(|component| matches!(component, Component::Normal(_)));

        if template.is_empty() || !plain {
            return Err(RenderError::Malformed {
                template: template.to_string(),
                reason: "template names must be plain file names".to_string(),
            });
        }

        Ok(self
            .directory
            .join(format!("{template}.{}", self.extension)))
    }
}

impl Renderer for DirectoryRenderer {
    fn render(&self, template: &str, variables: &Variables) -> Result<String, RenderError> {
        let path = self.path_of(template)?;
        let source = std::fs::read_to_string(&path).map_err(|error| {
            tracing::debug!(path = %path.display(), %error, "Template unavailable");
            RenderError::UnknownTemplate(template.to_string())
        })?;

        substitute(template, &source, variables)
    }
}

/// Replace every `{{ name }}` in `source`
///
/// # Errors
///
/// [`RenderError::MissingVariable`] for a name with no value and
/// [`RenderError::Malformed`] for an unterminated placeholder.
pub fn substitute(template: &str, source: &str, variables: &Variables) -> Result<String, RenderError> {
    let mut rendered = String::with_capacity(source.len());
    let mut rest = source;

    while let Some(open) = rest.find("{{") {
        rendered.push_str(&rest[..open]);
        let after = &rest[open + 2..];

        let Some(close) = after.find("}}") else {
            return Err(RenderError::Malformed {
                template: template.to_string(),
                reason: format!("unterminated placeholder at byte {}", source.len() - rest.len() + open),
            });
        };

        let name = after[..close].trim();
        let value = variables
            .get(name)
            .ok_or_else(|| RenderError::MissingVariable {
                template: template.to_string(),
                variable: name.to_string(),
            })?;

        rendered.push_str(value);
        rest = &after[close + 2..];
    }

    rendered.push_str(rest);
    Ok(rendered)
}
