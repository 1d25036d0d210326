//! Toolchain registry: the closed set of languages and how to run each one.
//!
//! Every [`Language`] has exactly one recipe, produced by an exhaustive
//! `match`. Config may override binaries and limits, but cannot add or
//! remove languages.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

use crate::config::ToolchainOverride;
use crate::error::ExecError;

/// Placeholder replaced with the absolute path of the job's source file.
pub const SOURCE_PLACEHOLDER: &str = "{source}";
/// Placeholder replaced with the absolute path of the job's workspace.
pub const WORKSPACE_PLACEHOLDER: &str = "{workspace}";

const DEFAULT_COMPILE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Supported languages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    JavaScript,
    Python,
    TypeScript,
    Java,
    Cpp,
}

impl Language {
    pub const ALL: [Self; 5] = [
        Self::JavaScript,
        Self::Python,
        Self::TypeScript,
        Self::Java,
        Self::Cpp,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::JavaScript => "javascript",
            Self::Python => "python",
            Self::TypeScript => "typescript",
            Self::Java => "java",
            Self::Cpp => "cpp",
        }
    }

    /// Built-in recipe for this language.
    pub fn default_toolchain(self) -> ToolchainSpec {
        match self {
            Self::JavaScript => recipe(self, "main.js", &[], &["node", "{source}"]),
            Self::Python => recipe(self, "main.py", &[], &["python3", "-u", "{source}"]),
            Self::TypeScript => recipe(
                self,
                "main.ts",
                &[
                    "tsc",
                    "{source}",
                    "--target",
                    "es2020",
                    "--module",
                    "commonjs",
                    "--outDir",
                    "{workspace}",
                ],
                &["node", "{workspace}/main.js"],
            ),
            Self::Java => recipe(
                self,
                "Solution.java",
                &["javac", "-d", "{workspace}", "{source}"],
                &["java", "-cp", "{workspace}", "Solution"],
            ),
            Self::Cpp => recipe(
                self,
                "main.cpp",
                &[
                    "g++",
                    "-std=c++17",
                    "-O2",
                    "-pipe",
                    "-o",
                    "{workspace}/main",
                    "{source}",
                ],
                &["{workspace}/main"],
            ),
        }
    }
}

/// An empty `compile` argv means the language is interpreted.
fn recipe(
    language: Language,
    source_filename: &str,
    compile: &[&str],
    run: &[&str],
) -> ToolchainSpec {
    ToolchainSpec {
        language,
        source_filename: source_filename.to_string(),
        compile: (!compile.is_empty()).then(|| CommandTemplate::from_slice(compile)),
        run: CommandTemplate::from_slice(run),
        compile_timeout: DEFAULT_COMPILE_TIMEOUT,
        run_timeout: DEFAULT_RUN_TIMEOUT,
        max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = ExecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "javascript" | "js" => Ok(Self::JavaScript),
            "python" | "py" => Ok(Self::Python),
            "typescript" | "ts" => Ok(Self::TypeScript),
            "java" => Ok(Self::Java),
            "cpp" | "c++" => Ok(Self::Cpp),
            other => Err(ExecError::UnsupportedLanguage(other.to_string())),
        }
    }
}

/// An argv template. The first element is the program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate(Vec<String>);

impl CommandTemplate {
    fn from_slice(argv: &[&str]) -> Self {
        Self(argv.iter().map(|s| (*s).to_string()).collect())
    }

    pub fn new(argv: Vec<String>) -> Self {
        Self(argv)
    }

    pub fn program(&self) -> &str {
        self.0.first().map_or("", String::as_str)
    }

    /// Substitute placeholders and return the full argv.
    ///
    /// Both substituted values are generated internally from the job id.
    pub fn expand(&self, workspace: &Path, source: &Path) -> Vec<String> {
        let workspace = workspace.to_string_lossy();
        let source = source.to_string_lossy();
        self.0
            .iter()
            .map(|arg| {
                arg.replace(SOURCE_PLACEHOLDER, &source)
                    .replace(WORKSPACE_PLACEHOLDER, &workspace)
            })
            .collect()
    }
}

/// Execution recipe for one language. Read-only once the registry is built.
#[derive(Debug, Clone)]
pub struct ToolchainSpec {
    pub language: Language,
    pub source_filename: String,
    pub compile: Option<CommandTemplate>,
    pub run: CommandTemplate,
    pub compile_timeout: Duration,
    pub run_timeout: Duration,
    pub max_output_bytes: usize,
}

impl ToolchainSpec {
    pub const fn is_compiled(&self) -> bool {
        self.compile.is_some()
    }

    fn apply(&mut self, o: &ToolchainOverride) -> Result<()> {
        if let Some(compile) = &o.compile {
            self.compile = if compile.is_empty() {
                None
            } else {
                Some(CommandTemplate::new(compile.clone()))
            };
        }
        if let Some(run) = &o.run {
            ensure!(!run.is_empty(), "{}: run command cannot be empty", self.language);
            self.run = CommandTemplate::new(run.clone());
        }
        if let Some(ms) = o.compile_timeout_ms {
            ensure!(ms > 0, "{}: compile_timeout_ms must be positive", self.language);
            self.compile_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = o.run_timeout_ms {
            ensure!(ms > 0, "{}: run_timeout_ms must be positive", self.language);
            self.run_timeout = Duration::from_millis(ms);
        }
        if let Some(bytes) = o.max_output_bytes {
            ensure!(bytes > 0, "{}: max_output_bytes must be positive", self.language);
            self.max_output_bytes = bytes;
        }
        Ok(())
    }
}

/// Immutable table of recipes, one per [`Language`].
#[derive(Debug, Clone)]
pub struct ToolchainRegistry {
    specs: Vec<ToolchainSpec>,
}

impl Default for ToolchainRegistry {
    fn default() -> Self {
        Self {
            specs: Language::ALL
                .into_iter()
                .map(Language::default_toolchain)
                .collect(),
        }
    }
}

impl ToolchainRegistry {
    /// Build the registry, applying per-language overrides from config.
    pub fn with_overrides<'a>(
        overrides: impl IntoIterator<Item = (&'a Language, &'a ToolchainOverride)>,
    ) -> Result<Self> {
        let mut registry = Self::default();
        for (language, o) in overrides {
            if let Some(spec) = registry.specs.iter_mut().find(|s| s.language == *language) {
                spec.apply(o)?;
            }
        }
        Ok(registry)
    }

    /// Resolve a raw identifier. Never touches disk or spawns anything.
    pub fn lookup(&self, language: &str) -> Result<&ToolchainSpec, ExecError> {
        let language: Language = language.parse()?;
        self.get(language)
            .ok_or_else(|| ExecError::UnsupportedLanguage(language.to_string()))
    }

    pub fn get(&self, language: Language) -> Option<&ToolchainSpec> {
        self.specs.iter().find(|s| s.language == language)
    }

    pub fn languages(&self) -> impl Iterator<Item = Language> + '_ {
        self.specs.iter().map(|s| s.language)
    }
}
