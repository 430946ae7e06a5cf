//! Tool definitions loaded from host-local configuration
//!
//! One JSON file per tool in the tools directory. Definitions are read at
//! startup and on explicit reload, and are never mutated at runtime
//! otherwise — executions only ever see them behind an `Arc`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Hard ceiling on any tool's wall-clock timeout
pub const MAX_TIMEOUT_SECS: u64 = 300;

/// Default timeout when a definition omits one
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Declared type of a tool parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    /// UTF-8 string (sanitized before substitution)
    String,
    /// Any JSON number
    Number,
    /// Whole number
    Integer,
    /// true/false
    Boolean,
}

/// One named parameter in a tool's schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSpec {
    /// Declared type
    #[serde(rename = "type")]
    pub kind: ParameterType,

    /// Human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// JSON-schema-like parameter block
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolParameters {
    /// Always "object"; kept for schema compatibility
    #[serde(rename = "type", default = "object_type")]
    pub kind: String,

    /// Named, typed parameters
    #[serde(default)]
    pub properties: BTreeMap<String, ParameterSpec>,

    /// Subset of `properties` that must be supplied
    #[serde(default)]
    pub required: Vec<String>,
}

fn object_type() -> String {
    "object".to_string()
}

/// How a tool executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionKind {
    /// Subprocess from a command template
    Script,
    /// HTTP call from a URL template
    Http,
}

/// Execution block of a tool definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSpec {
    /// Script or HTTP
    #[serde(rename = "type")]
    pub kind: ExecutionKind,

    /// Command template with `{name}` placeholders (script tools)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// URL template with `{name}` placeholders (HTTP tools)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// HTTP method (HTTP tools; defaults to GET)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    /// Extra request headers (HTTP tools)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,

    /// Wall-clock timeout in seconds, capped at [`MAX_TIMEOUT_SECS`]
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl ExecutionSpec {
    /// Effective timeout after applying the global cap
    #[must_use]
    pub fn effective_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout.clamp(1, MAX_TIMEOUT_SECS))
    }
}

/// A caller-invokable unit of work with a declared argument schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique tool name
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Argument schema
    #[serde(default)]
    pub parameters: ToolParameters,

    /// Execution block
    pub execution: ExecutionSpec,
}

impl ToolDefinition {
    /// Check the definition's internal consistency
    ///
    /// # Errors
    ///
    /// Returns error if the execution block is incomplete or the required
    /// list names an undeclared parameter
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation("tool name must not be empty".to_string()));
        }

        match self.execution.kind {
            ExecutionKind::Script if self.execution.command.is_none() => {
                return Err(Error::Validation(format!(
                    "script tool {} has no command template",
                    self.name
                )));
            }
            ExecutionKind::Http if self.execution.url.is_none() => {
                return Err(Error::Validation(format!(
                    "http tool {} has no url template",
                    self.name
                )));
            }
            _ => {}
        }

        for required in &self.parameters.required {
            if !self.parameters.properties.contains_key(required) {
                return Err(Error::Validation(format!(
                    "tool {}: required parameter {required} is not declared",
                    self.name
                )));
            }
        }

        Ok(())
    }
}

/// Read-only view of the host's tool set, reloadable on request
pub struct ToolRegistry {
    dir: PathBuf,
    tools: RwLock<HashMap<String, Arc<ToolDefinition>>>,
}

impl ToolRegistry {
    /// Load every `*.json` definition in a directory
    ///
    /// Unparseable or inconsistent files are skipped with a warning so one
    /// bad definition cannot take the host down.
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be read
    pub fn load(dir: &Path) -> Result<Self> {
        let registry = Self {
            dir: dir.to_path_buf(),
            tools: RwLock::new(HashMap::new()),
        };
        registry.reload()?;
        Ok(registry)
    }

    /// Re-read all definitions from the tools directory
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be read
    pub fn reload(&self) -> Result<usize> {
        let mut loaded: HashMap<String, Arc<ToolDefinition>> = HashMap::new();

        if self.dir.exists() {
            for entry in std::fs::read_dir(&self.dir)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }

                match load_definition(&path) {
                    Ok(def) => {
                        if loaded.contains_key(&def.name) {
                            tracing::warn!(
                                tool = %def.name,
                                file = %path.display(),
                                "duplicate tool name, keeping the first definition"
                            );
                            continue;
                        }
                        loaded.insert(def.name.clone(), Arc::new(def));
                    }
                    Err(e) => {
                        tracing::warn!(file = %path.display(), error = %e, "skipping tool definition");
                    }
                }
            }
        }

        let count = loaded.len();
        *self.tools.write().expect("tool registry lock poisoned") = loaded;
        tracing::info!(count, dir = %self.dir.display(), "tool definitions loaded");
        Ok(count)
    }

    /// Look up a tool by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<ToolDefinition>> {
        self.tools
            .read()
            .expect("tool registry lock poisoned")
            .get(name)
            .cloned()
    }

    /// All loaded definitions, sorted by name
    #[must_use]
    pub fn list(&self) -> Vec<Arc<ToolDefinition>> {
        let mut tools: Vec<_> = self
            .tools
            .read()
            .expect("tool registry lock poisoned")
            .values()
            .cloned()
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }
}

fn load_definition(path: &Path) -> Result<ToolDefinition> {
    let content = std::fs::read_to_string(path)?;
    let def: ToolDefinition = serde_json::from_str(&content)?;
    def.validate()?;
    Ok(def)
}
