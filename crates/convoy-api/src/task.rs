//! Task bundles and implementation selection

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::TaskError;
use crate::target::Target;

/// How parameters reach the task executable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputMethod {
    Stdin,
    Environment,
    Powershell,
    Both,
}

impl InputMethod {
    /// Parameters are written to stdin as JSON
    #[must_use]
    pub fn uses_stdin(&self) -> bool {
        matches!(self, InputMethod::Stdin | InputMethod::Both)
    }

    /// Parameters are exported as `PT_` variables
    #[must_use]
    pub fn uses_environment(&self) -> bool {
        matches!(self, InputMethod::Environment | InputMethod::Both)
    }
}

/// A file shipped with a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFile {
    /// Install name, relative to the task's module root (`mymod/tasks/init.sh`)
    pub name: String,
    /// Local source path
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub input_method: Option<InputMethod>,
    #[serde(default)]
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMetadata {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_method: Option<InputMethod>,
    #[serde(default)]
    pub implementations: Vec<Implementation>,
    #[serde(default)]
    pub files: Vec<String>,
    /// Task is meant to run on a proxy on behalf of the target
    #[serde(default)]
    pub remote: bool,
}

/// A named executable bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Qualified name such as `package::install`
    pub name: String,
    /// Executables first, then support files
    pub files: Vec<TaskFile>,
    #[serde(default)]
    pub metadata: TaskMetadata,
}

/// The concrete executable chosen for one target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedImplementation {
    pub name: String,
    pub path: PathBuf,
    /// None when neither the implementation nor the task declares one
    pub input_method: Option<InputMethod>,
    /// Support files to stage under `_installdir`
    pub files: Vec<TaskFile>,
}

impl Task {
    /// Task with a single executable and no metadata
    pub fn new(name: impl Into<String>, executable: impl Into<PathBuf>) -> Self {
        let path = executable.into();
        let file_name = path
            .file_name()
            .map_or_else(String::new, |n| n.to_string_lossy().into_owned());
        Self {
            name: name.into(),
            files: vec![TaskFile {
                name: file_name,
                path,
            }],
            metadata: TaskMetadata::default(),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: TaskMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    #[must_use]
    pub fn with_file(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.files.push(TaskFile {
            name: name.into(),
            path: path.into(),
        });
        self
    }

    /// Module part of the task name
    #[must_use]
    pub fn module_name(&self) -> &str {
        self.name.split("::").next().unwrap_or(&self.name)
    }

    /// Directory executables are installed into when support files are staged
    #[must_use]
    pub fn tasks_dir(&self) -> String {
        format!("{}/tasks", self.module_name())
    }

    #[must_use]
    pub fn file_path(&self, name: &str) -> Option<&Path> {
        self.files
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.path.as_path())
    }

    /// Pick the implementation whose requirements the target satisfies
    ///
    /// `provided` holds the features the shell or transport adds on top
    /// of the target's own.
    ///
    /// # Errors
    /// Returns `TaskError::NoImplementation` if nothing matches and
    /// `TaskError::MissingFile` if metadata names a file the task lacks.
    pub fn select_implementation(
        &self,
        target: &Target,
        provided: &[&str],
    ) -> Result<SelectedImplementation, TaskError> {
        let has = |feature: &String| {
            target.features.contains(feature) || provided.contains(&feature.as_str())
        };

        let (name, input_method, impl_files) = if self.metadata.implementations.is_empty() {
            let first = self.files.first().ok_or_else(|| TaskError::MissingFile {
                task: self.name.clone(),
                file: "<executable>".to_string(),
            })?;
            (first.name.clone(), None, Vec::new())
        } else {
            let chosen = self
                .metadata
                .implementations
                .iter()
                .find(|i| i.requirements.iter().all(|f| has(f)))
                .ok_or_else(|| TaskError::NoImplementation {
                    task: self.name.clone(),
                    target: target.safe_name(),
                })?;
            (chosen.name.clone(), chosen.input_method, chosen.files.clone())
        };

        let path = self
            .file_path(&name)
            .ok_or_else(|| TaskError::MissingFile {
                task: self.name.clone(),
                file: name.clone(),
            })?
            .to_path_buf();

        let wanted: Vec<&String> = self.metadata.files.iter().chain(&impl_files).collect();
        let mut files = Vec::new();
        for entry in wanted {
            let matches: Vec<&TaskFile> = if entry.ends_with('/') {
                self.files.iter().filter(|f| f.name.starts_with(entry.as_str())).collect()
            } else {
                self.files.iter().filter(|f| &f.name == entry).collect()
            };
            if matches.is_empty() {
                return Err(TaskError::MissingFile {
                    task: self.name.clone(),
                    file: entry.clone(),
                });
            }
            for file in matches {
                if !files.contains(file) {
                    files.push(file.clone());
                }
            }
        }

        Ok(SelectedImplementation {
            name,
            path,
            input_method: input_method.or(self.metadata.input_method),
            files,
        })
    }
}

/// Environment variables for task parameters: `PT_<name>`
///
/// Strings pass through as they are, everything else is JSON encoded.
#[must_use]
pub fn envify_params(arguments: &Map<String, Value>) -> Vec<(String, String)> {
    arguments
        .iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (format!("PT_{key}"), value)
        })
        .collect()
}
