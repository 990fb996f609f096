//! Template loading from JSON and TOML files.
//!
//! Templates live in a directory tree (by default the `templates/` directory
//! of the workspace, or the platform data directory). A template's name is
//! its file stem.

use crate::{
    error::{Result, TemplateError},
    template::Template,
};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const EXTENSIONS: [&str; 2] = ["json", "toml"];

/// Loader for extraction templates.
pub struct TemplateLoader {
    /// Base directory containing templates
    templates_dir: PathBuf,
}

impl TemplateLoader {
    /// Create a new loader with the given templates directory.
    ///
    /// # Errors
    /// Returns error if the directory doesn't exist.
    pub fn new(templates_dir: impl Into<PathBuf>) -> Result<Self> {
        let templates_dir = templates_dir.into();

        if !templates_dir.is_dir() {
            return Err(TemplateError::DirectoryNotFound {
                path: templates_dir.display().to_string(),
            });
        }

        Ok(Self { templates_dir })
    }

    /// Create a loader using the default templates directory.
    ///
    /// Looks for `templates/` at the workspace root, then falls back to the
    /// platform data directory.
    ///
    /// # Errors
    /// Returns error if no templates directory exists.
    pub fn with_default_dir() -> Result<Self> {
        let mut current_dir = std::env::current_dir()?;

        loop {
            let cargo_toml = current_dir.join("Cargo.toml");
            if let Ok(contents) = std::fs::read_to_string(&cargo_toml) {
                if contents.contains("[workspace]") {
                    let templates_dir = current_dir.join("templates");
                    if templates_dir.is_dir() {
                        return Self::new(templates_dir);
                    }
                    break;
                }
            }

            if let Some(parent) = current_dir.parent() {
                current_dir = parent.to_path_buf();
            } else {
                break;
            }
        }

        let templates_dir = sieve_core::SieveConfig::templates_dir().map_err(|e| {
            TemplateError::LoadError {
                path: "templates".to_string(),
                source: Box::new(e),
            }
        })?;
        Self::new(templates_dir)
    }

    /// Directory this loader reads from.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.templates_dir
    }

    /// Load and validate a template by name (file stem).
    ///
    /// # Errors
    /// Returns error if no file has that name, or it can't be read or is invalid.
    pub fn load(&self, name: &str) -> Result<Template> {
        let path = EXTENSIONS
            .iter()
            .map(|ext| Self::find_file(&self.templates_dir, &format!("{name}.{ext}")))
            .find_map(|found| found.transpose())
            .transpose()?
            .ok_or_else(|| TemplateError::NotFound {
                name: name.to_string(),
            })?;

        let template = Self::load_path(&path)?;
        debug!(
            name,
            path = %path.display(),
            url = %template.url,
            "loaded template"
        );
        Ok(template)
    }

    /// Load every template under the directory.
    ///
    /// Invalid templates are logged as warnings and skipped.
    ///
    /// # Errors
    /// Returns error if the directory can't be read.
    pub fn load_all(&self) -> Result<Vec<(String, Template)>> {
        let mut templates = Vec::new();
        Self::walk_and_load_recursive(&self.templates_dir, &mut templates)?;

        info!(
            count = templates.len(),
            dir = %self.templates_dir.display(),
            "loaded templates"
        );
        Ok(templates)
    }

    /// Load and validate a template from a specific file.
    ///
    /// The format is chosen by extension.
    ///
    /// # Errors
    /// Returns error if the file can't be read, has an unknown extension, or is invalid.
    pub fn load_path(path: &Path) -> Result<Template> {
        let display = path.display().to_string();
        let extension = path.extension().and_then(|s| s.to_str());
        if !extension.is_some_and(|ext| EXTENSIONS.contains(&ext)) {
            return Err(TemplateError::UnsupportedFormat { path: display });
        }

        let contents = std::fs::read_to_string(path).map_err(|e| TemplateError::LoadError {
            path: display.clone(),
            source: Box::new(e),
        })?;

        let template: Template = if extension == Some("json") {
            serde_json::from_str(&contents).map_err(|e| TemplateError::JsonError {
                path: display,
                source: e,
            })?
        } else {
            toml::from_str(&contents).map_err(|e| TemplateError::ParseError {
                path: display,
                source: e,
            })?
        };

        template.validate()?;
        Ok(template)
    }

    fn walk_and_load_recursive(dir: &Path, templates: &mut Vec<(String, Template)>) -> Result<()> {
        let mut entries = std::fs::read_dir(dir)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<std::io::Result<Vec<_>>>()?;
        entries.sort();

        for path in entries {
            if path.is_dir() {
                Self::walk_and_load_recursive(&path, templates)?;
                continue;
            }
            let supported = path
                .extension()
                .and_then(|s| s.to_str())
                .is_some_and(|ext| EXTENSIONS.contains(&ext));
            if !supported {
                continue;
            }

            match Self::load_path(&path) {
                Ok(template) => {
                    let name = path
                        .file_stem()
                        .and_then(|s| s.to_str())
                        .unwrap_or_default()
                        .to_string();
                    templates.push((name, template));
                }
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "skipping invalid template"
                    );
                }
            }
        }

        Ok(())
    }

    /// Recursively search for a file by name.
    fn find_file(dir: &Path, filename: &str) -> Result<Option<PathBuf>> {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();

            if path.is_dir() {
                if let Some(found) = Self::find_file(&path, filename)? {
                    return Ok(Some(found));
                }
            } else if path.file_name().and_then(|s| s.to_str()) == Some(filename) {
                return Ok(Some(path));
            }
        }

        Ok(None)
    }
}
