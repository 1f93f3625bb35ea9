//! Checks and rewrites applied to an extracted project before rendering.

use std::{
    io,
    path::{Path, PathBuf},
};

use serde_yaml::{Mapping, Value};
use thiserror::Error;

/// Recognised project configuration files, in lookup order.
pub const CONFIG_FILES: [&str; 2] = ["_quarto.yml", "_quarto.yaml"];

/// Project type accepted when `project.type` is declared.
pub const DEFAULT_PROJECT_TYPE: &str = "default";

/// Lockfile restored before rendering when present.
pub const DEPENDENCY_LOCKFILE: &str = "renv.lock";

/// Bootstrap script of the dependency manager; its presence means the render
/// packages must be installed into the project library.
pub const DEPENDENCY_BOOTSTRAP: &str = "renv/activate.R";

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("no project configuration (`_quarto.yml` or `_quarto.yaml`) at the project root")]
    MissingConfig,
    #[error("`{file}` is not valid YAML: {source}")]
    Unparsable {
        file: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("`{file}` must contain a mapping at the top level")]
    NotAMapping { file: String },
    #[error("project type `{found}` is not supported; only `default` projects can be rendered")]
    UnsupportedType { found: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Parsed project configuration of an extracted project.
#[derive(Debug, Clone)]
pub struct ProjectConfig {
    path: PathBuf,
    document: Mapping,
}

impl ProjectConfig {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Declared `project.type`, if any. Non-string values are rendered back to
    /// YAML so they can be reported.
    pub fn project_type(&self) -> Option<String> {
        let project = self.document.get("project")?.as_mapping()?;
        match project.get("type")? {
            Value::Null => None,
            Value::String(value) => Some(value.clone()),
            other => Some(
                serde_yaml::to_string(other)
                    .map(|rendered| rendered.trim().to_string())
                    .unwrap_or_else(|_| "<unprintable>".to_string()),
            ),
        }
    }

    /// Force a single self-contained HTML output and drop any output
    /// directory override, keeping the rest of the HTML options.
    pub fn force_single_html(&mut self) {
        if let Some(Value::Mapping(project)) = self.document.get_mut("project") {
            project.remove("output-dir");
        }

        let mut html = match self.document.get("format") {
            Some(Value::Mapping(formats)) => match formats.get("html") {
                Some(Value::Mapping(options)) => options.clone(),
                _ => Mapping::new(),
            },
            _ => Mapping::new(),
        };
        html.insert(Value::from("embed-resources"), Value::Bool(true));

        let mut formats = Mapping::new();
        formats.insert(Value::from("html"), Value::Mapping(html));
        self.document
            .insert(Value::from("format"), Value::Mapping(formats));
    }

    pub fn write(&self) -> Result<(), ProjectError> {
        let rendered = serde_yaml::to_string(&self.document).map_err(|source| {
            ProjectError::Unparsable {
                file: self.file_name(),
                source,
            }
        })?;
        std::fs::write(&self.path, rendered)?;
        Ok(())
    }

    fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

pub fn locate_config(project: &Path) -> Option<PathBuf> {
    CONFIG_FILES
        .iter()
        .map(|name| project.join(name))
        .find(|candidate| candidate.is_file())
}

/// Load the configuration and require a default-type project.
pub fn validate_project(project: &Path) -> Result<ProjectConfig, ProjectError> {
    let path = locate_config(project).ok_or(ProjectError::MissingConfig)?;
    let file = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let raw = std::fs::read_to_string(&path)?;
    let document = match serde_yaml::from_str::<Value>(&raw) {
        Ok(Value::Mapping(mapping)) => mapping,
        Ok(Value::Null) => Mapping::new(),
        Ok(_) => return Err(ProjectError::NotAMapping { file }),
        Err(source) => return Err(ProjectError::Unparsable { file, source }),
    };

    let config = ProjectConfig { path, document };
    if let Some(found) = config.project_type()
        && found != DEFAULT_PROJECT_TYPE
    {
        return Err(ProjectError::UnsupportedType { found });
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn project_with(file: &str, contents: &str) -> TempDir {
        let dir = TempDir::new().expect("temp dir");
        std::fs::write(dir.path().join(file), contents).expect("write config");
        dir
    }

    #[test]
    fn accepts_untyped_and_default_projects() {
        let untyped = project_with("_quarto.yml", "project:\n  title: Paper\n");
        assert!(validate_project(untyped.path()).is_ok());

        let typed = project_with("_quarto.yaml", "project:\n  type: default\n");
        let config = validate_project(typed.path()).expect("default type");
        assert_eq!(config.project_type().as_deref(), Some("default"));

        let empty = project_with("_quarto.yml", "");
        assert!(validate_project(empty.path()).is_ok());
    }

    #[test]
    fn rejects_other_project_types() {
        let book = project_with("_quarto.yml", "project:\n  type: book\n");
        let err = validate_project(book.path()).expect_err("book");
        assert!(matches!(err, ProjectError::UnsupportedType { ref found } if found == "book"));
    }

    #[test]
    fn missing_config_is_reported() {
        let dir = TempDir::new().expect("temp dir");
        std::fs::write(dir.path().join("index.qmd"), "# hi").expect("write");
        assert!(matches!(
            validate_project(dir.path()),
            Err(ProjectError::MissingConfig)
        ));
    }

    #[test]
    fn malformed_yaml_is_reported() {
        let bad = project_with("_quarto.yml", "project: [unclosed\n");
        assert!(matches!(
            validate_project(bad.path()),
            Err(ProjectError::Unparsable { .. })
        ));

        let list = project_with("_quarto.yml", "- a\n- b\n");
        assert!(matches!(
            validate_project(list.path()),
            Err(ProjectError::NotAMapping { .. })
        ));
    }

    #[test]
    fn yml_takes_precedence_over_yaml() {
        let dir = project_with("_quarto.yml", "project:\n  type: default\n");
        std::fs::write(dir.path().join("_quarto.yaml"), "project:\n  type: book\n")
            .expect("write");
        assert!(validate_project(dir.path()).is_ok());
    }

    #[test]
    fn single_html_rewrite_keeps_html_options() {
        let dir = project_with(
            "_quarto.yml",
            "project:\n  output-dir: _site\n  title: Paper\nformat:\n  html:\n    toc: true\n  pdf: default\n",
        );
        let mut config = validate_project(dir.path()).expect("valid");
        config.force_single_html();
        config.write().expect("write");

        let reread: Value = serde_yaml::from_str(
            &std::fs::read_to_string(dir.path().join("_quarto.yml")).expect("read"),
        )
        .expect("yaml");
        assert!(reread["project"].get("output-dir").is_none());
        assert_eq!(reread["project"]["title"], Value::from("Paper"));
        assert_eq!(reread["format"]["html"]["toc"], Value::Bool(true));
        assert_eq!(
            reread["format"]["html"]["embed-resources"],
            Value::Bool(true)
        );
        assert!(reread["format"].get("pdf").is_none());
    }
}
