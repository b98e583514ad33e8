//! Agent role definitions and the registry that serves them.
//!
//! An [`AgentRole`] binds a name to a system prompt, a model identifier, a
//! temperature, a loop budget, and tool allow/deny lists. Roles are loaded
//! once at engine startup — from the built-in set, a directory of JSON
//! definition files, or both — and never mutated afterwards.
//!
//! The registry also computes each role's **effective tool set**: every
//! non-builtin tool discovered from the backend is callable by every role
//! unless explicitly forbidden, while `builtin.*` tools must be opted into
//! via `default_tools`. Connecting a new MCP server therefore makes its
//! tools available to all roles without touching any role file.
//!
//! # Role file format
//!
//! One JSON object per file:
//!
//! ```json
//! {
//!   "name": "READER",
//!   "emoji": "📖",
//!   "description": "Reads and summarizes files and directories.",
//!   "planning_hints": "Use for read-only inspection steps.",
//!   "system_prompt": "You are a careful reader...",
//!   "model": "qwen2.5:7b",
//!   "temperature": 0.3,
//!   "loop_limit": 6,
//!   "default_tools": ["builtin.read_file", "builtin.list_files"],
//!   "forbidden_tools": ["builtin.execute_bash_command"]
//! }
//! ```
//!
//! # Example
//!
//! ```rust
//! use swarmllm::registry::AgentRegistry;
//! use swarmllm::tool_backend::ToolDescriptor;
//!
//! let registry = AgentRegistry::builtin();
//! assert!(registry.get("EXECUTOR").is_ok());
//!
//! let available = vec![
//!     ToolDescriptor::new("builtin.read_file", "Read a file", serde_json::json!({})),
//!     ToolDescriptor::new("github.search_issues", "Search issues", serde_json::json!({})),
//! ];
//! let tools = registry.effective_tools("READER", &available).unwrap();
//! // The MCP tool is available without opt-in; the builtin required one.
//! assert!(tools.iter().any(|t| t.name == "github.search_issues"));
//! assert!(tools.iter().any(|t| t.name == "builtin.read_file"));
//! ```

use crate::swarmllm::tool_backend::ToolDescriptor;
use serde::Deserialize;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::fs;
use std::path::Path;

/// A named agent configuration, immutable after load.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentRole {
    /// Uppercase identifier (e.g. `"EXECUTOR"`).
    pub name: String,
    /// Optional display emoji/label shown in the aggregated response.
    #[serde(default)]
    pub emoji: Option<String>,
    /// Free-text description shown to the planner.
    #[serde(default)]
    pub description: String,
    /// Free-text guidance shown to the planner about when to pick this role.
    #[serde(default)]
    pub planning_hints: String,
    /// System prompt assumed for every task assigned to this role.
    pub system_prompt: String,
    /// Model identifier this role runs on.
    pub model: String,
    /// Sampling temperature, `0.0..=2.0`.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Advisory context budget in tokens.
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,
    /// Maximum iterations of the tool-call loop for one task.
    #[serde(default = "default_loop_limit")]
    pub loop_limit: usize,
    /// Fully-qualified tool names this role opts into (builtins must be
    /// listed here to be callable).
    #[serde(default)]
    pub default_tools: Vec<String>,
    /// Fully-qualified tool names this role may never call.
    #[serde(default)]
    pub forbidden_tools: Vec<String>,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_context_tokens() -> usize {
    8192
}

fn default_loop_limit() -> usize {
    10
}

impl AgentRole {
    /// Display label: emoji-prefixed name when an emoji is configured.
    pub fn label(&self) -> String {
        match &self.emoji {
            Some(emoji) => format!("{} {}", emoji, self.name),
            None => self.name.clone(),
        }
    }
}

/// Errors from registry loading and lookups.
#[derive(Debug)]
pub enum RegistryError {
    /// Lookup of a role name that is not registered.
    UnknownRole(String),
    /// A role definition file could not be read.
    Io(std::io::Error),
    /// A role definition file is not valid JSON or misses required fields.
    Parse(String, serde_json::Error),
    /// A role lists the same tool as both default and forbidden.
    ConflictingTools(String, String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::UnknownRole(name) => write!(f, "Unknown role: {}", name),
            RegistryError::Io(err) => write!(f, "Role directory error: {}", err),
            RegistryError::Parse(file, err) => {
                write!(f, "Invalid role definition {}: {}", file, err)
            }
            RegistryError::ConflictingTools(role, tool) => write!(
                f,
                "Role {} lists '{}' as both default and forbidden",
                role, tool
            ),
        }
    }
}

impl Error for RegistryError {}

/// Read-only collection of [`AgentRole`]s keyed by name.
pub struct AgentRegistry {
    roles: HashMap<String, AgentRole>,
    order: Vec<String>,
}

impl AgentRegistry {
    /// An empty registry. Mostly useful in tests.
    pub fn empty() -> Self {
        Self {
            roles: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// The built-in default roles: `PLANNER`, `EXECUTOR`, `READER`, `CODER`.
    ///
    /// These make the engine usable without any on-disk role directory.
    /// [`AgentRegistry::load_dir`] definitions override built-ins by name.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        for role in builtin_roles() {
            registry.insert(role);
        }
        registry
    }

    /// Register or replace a role.
    pub fn insert(&mut self, role: AgentRole) {
        if !self.roles.contains_key(&role.name) {
            self.order.push(role.name.clone());
        }
        self.roles.insert(role.name.clone(), role);
    }

    /// Load every `*.json` role file in `dir`, overriding same-named roles.
    ///
    /// Files are visited in lexical order so overrides are deterministic.
    /// A definition with overlapping default/forbidden lists is rejected.
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize, RegistryError> {
        let mut paths: Vec<_> = fs::read_dir(dir)
            .map_err(RegistryError::Io)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().map(|ext| ext == "json").unwrap_or(false))
            .collect();
        paths.sort();

        let mut loaded = 0;
        for path in paths {
            let text = fs::read_to_string(&path).map_err(RegistryError::Io)?;
            let role: AgentRole = serde_json::from_str(&text)
                .map_err(|e| RegistryError::Parse(path.display().to_string(), e))?;
            if let Some(tool) = role
                .default_tools
                .iter()
                .find(|t| role.forbidden_tools.contains(t))
            {
                return Err(RegistryError::ConflictingTools(role.name, tool.clone()));
            }
            log::debug!("loaded role {} from {}", role.name, path.display());
            self.insert(role);
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Role names in registration order.
    pub fn roles(&self) -> Vec<&str> {
        self.order.iter().map(|s| s.as_str()).collect()
    }

    /// Look up a role by name.
    pub fn get(&self, name: &str) -> Result<&AgentRole, RegistryError> {
        self.roles
            .get(name)
            .ok_or_else(|| RegistryError::UnknownRole(name.to_string()))
    }

    /// Whether a role is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.roles.contains_key(name)
    }

    /// Compute the role's effective tool set against the current snapshot.
    ///
    /// `(default_tools ∪ {non-builtin available}) − forbidden_tools`,
    /// intersected with `available`. The result preserves the snapshot's
    /// order.
    pub fn effective_tools(
        &self,
        name: &str,
        available: &[ToolDescriptor],
    ) -> Result<Vec<ToolDescriptor>, RegistryError> {
        let role = self.get(name)?;
        Ok(available
            .iter()
            .filter(|tool| {
                if role.forbidden_tools.iter().any(|f| f == &tool.name) {
                    return false;
                }
                !tool.is_builtin() || role.default_tools.iter().any(|d| d == &tool.name)
            })
            .cloned()
            .collect())
    }
}

/// The four roles the engine ships with.
fn builtin_roles() -> Vec<AgentRole> {
    const DEFAULT_MODEL: &str = "qwen2.5:7b";
    vec![
        AgentRole {
            name: "PLANNER".to_string(),
            emoji: Some("🗺️".to_string()),
            description: "Decomposes a user query into a dependency-ordered task list.".to_string(),
            planning_hints: String::new(),
            system_prompt: "You are a planning assistant. Decompose the user's request into \
                            the smallest set of independent or dependent subtasks and assign \
                            each to the most suitable agent. Respond with JSON only."
                .to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.2,
            max_context_tokens: 8192,
            loop_limit: 1,
            default_tools: Vec::new(),
            forbidden_tools: Vec::new(),
        },
        AgentRole {
            name: "EXECUTOR".to_string(),
            emoji: Some("⚙️".to_string()),
            description: "General-purpose agent able to run commands and manage files."
                .to_string(),
            planning_hints: "Default choice when no specialist fits.".to_string(),
            system_prompt: "You are a capable assistant executing one well-scoped task. Use \
                            the available tools when needed and answer with the task result \
                            once you are done."
                .to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.7,
            max_context_tokens: 8192,
            loop_limit: 10,
            default_tools: vec![
                "builtin.read_file".to_string(),
                "builtin.write_file".to_string(),
                "builtin.patch_file".to_string(),
                "builtin.list_files".to_string(),
                "builtin.file_exists".to_string(),
                "builtin.execute_bash_command".to_string(),
                "builtin.execute_python_code".to_string(),
            ],
            forbidden_tools: Vec::new(),
        },
        AgentRole {
            name: "READER".to_string(),
            emoji: Some("📖".to_string()),
            description: "Reads files and summarizes their content; never mutates anything."
                .to_string(),
            planning_hints: "Use for inspection, reading, and summarization steps.".to_string(),
            system_prompt: "You are a careful reader. Gather the requested information with \
                            read-only tools and report it faithfully."
                .to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.3,
            max_context_tokens: 8192,
            loop_limit: 6,
            default_tools: vec![
                "builtin.read_file".to_string(),
                "builtin.list_files".to_string(),
                "builtin.file_exists".to_string(),
                "builtin.read_image".to_string(),
            ],
            forbidden_tools: vec![
                "builtin.write_file".to_string(),
                "builtin.patch_file".to_string(),
                "builtin.execute_bash_command".to_string(),
            ],
        },
        AgentRole {
            name: "CODER".to_string(),
            emoji: Some("🛠️".to_string()),
            description: "Writes and patches files, runs code to verify changes.".to_string(),
            planning_hints: "Use for steps that create or modify files.".to_string(),
            system_prompt: "You are a software engineer. Make the requested change with the \
                            file tools, verify it when possible, and report what you did."
                .to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.4,
            max_context_tokens: 8192,
            loop_limit: 10,
            default_tools: vec![
                "builtin.read_file".to_string(),
                "builtin.write_file".to_string(),
                "builtin.patch_file".to_string(),
                "builtin.list_files".to_string(),
                "builtin.file_exists".to_string(),
                "builtin.execute_python_code".to_string(),
            ],
            forbidden_tools: Vec::new(),
        },
    ]
}
