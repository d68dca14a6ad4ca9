//! Language toolchains for compilation and execution
//!
//! Commands may contain the `{build}` placeholder, which the sandbox replaces
//! with the absolute path of the submission's private build directory.

pub mod c;
pub mod cpp;
pub mod go;
pub mod python;
pub mod rust;

use std::collections::HashMap;
use std::path::Path;

use themis_common::Language;

/// Placeholder for the build directory inside toolchain commands
pub const BUILD_DIR_PLACEHOLDER: &str = "{build}";

/// How to build and run a program in one language
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    /// File name the source code is written to
    pub source_file: String,
    /// Build command, run inside the build directory
    pub compile: Option<Vec<String>>,
    /// Command that runs the built program
    pub run: Vec<String>,
    /// Extra environment for both steps
    pub env: Vec<(String, String)>,
    /// Apply RLIMIT_AS to runs
    pub limit_address_space: bool,
}

impl Toolchain {
    /// Toolchain with a build step.
    pub fn compiled(source_file: &str, compile: &[&str], run: &[&str]) -> Self {
        Self {
            source_file: source_file.to_string(),
            compile: Some(compile.iter().map(|s| s.to_string()).collect()),
            run: run.iter().map(|s| s.to_string()).collect(),
            env: Vec::new(),
            limit_address_space: true,
        }
    }

    /// Toolchain that runs the source directly.
    pub fn interpreted(source_file: &str, run: &[&str]) -> Self {
        Self {
            source_file: source_file.to_string(),
            compile: None,
            run: run.iter().map(|s| s.to_string()).collect(),
            env: Vec::new(),
            limit_address_space: true,
        }
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    pub fn without_address_space_limit(mut self) -> Self {
        self.limit_address_space = false;
        self
    }

    /// Substitute the build directory into a command or value.
    pub fn resolve(template: &[String], build_dir: &Path) -> Vec<String> {
        let dir = build_dir.to_string_lossy();
        template
            .iter()
            .map(|part| part.replace(BUILD_DIR_PLACEHOLDER, &dir))
            .collect()
    }

    /// Environment with the build directory substituted.
    pub fn resolved_env(&self, build_dir: &Path) -> Vec<(String, String)> {
        let dir = build_dir.to_string_lossy();
        self.env
            .iter()
            .map(|(k, v)| (k.clone(), v.replace(BUILD_DIR_PLACEHOLDER, &dir)))
            .collect()
    }
}

/// Get the built-in toolchain for a language
pub fn builtin(language: Language) -> Toolchain {
    match language {
        Language::C => c::toolchain(),
        Language::Cpp => cpp::toolchain(),
        Language::Rust => rust::toolchain(),
        Language::Go => go::toolchain(),
        Language::Python => python::toolchain(),
    }
}

/// Registry of the toolchains enabled on this judge
#[derive(Debug, Clone, Default)]
pub struct Toolchains {
    toolchains: HashMap<Language, Toolchain>,
}

impl Toolchains {
    /// Built-in toolchains for the given languages.
    pub fn builtin(enabled: &[Language]) -> Self {
        Self {
            toolchains: enabled.iter().map(|lang| (*lang, builtin(*lang))).collect(),
        }
    }

    /// Replace or add the toolchain for one language.
    pub fn with(mut self, language: Language, toolchain: Toolchain) -> Self {
        self.toolchains.insert(language, toolchain);
        self
    }

    pub fn get(&self, language: Language) -> Option<&Toolchain> {
        self.toolchains.get(&language)
    }

    /// Resolve a declared language string to an enabled toolchain.
    pub fn resolve(&self, declared: &str) -> Option<(Language, &Toolchain)> {
        let language = declared.parse::<Language>().ok()?;
        self.get(language).map(|toolchain| (language, toolchain))
    }
}
