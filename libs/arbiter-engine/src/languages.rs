// Language profile registry for the judging engine

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Directory every sandbox mounts the job workspace at.
pub const WORKSPACE_DIR: &str = "/box";

/// How to build and run one language inside the sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguageProfile {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub file_extension: String,
    #[serde(default = "default_source_stem")]
    pub source_stem: String,
    /// Shell command run once with `/box` writable. Absent means the source
    /// is only staged.
    #[serde(default)]
    pub compile_command: Option<String>,
    /// Shell command run once per test case with `/box` read-only.
    pub run_command: String,
    pub base_image: String,
    pub default_time_limit_ms: u64,
    pub default_memory_limit_mb: u64,
    #[serde(default = "default_compile_time_limit")]
    pub compile_time_limit_ms: u64,
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: f64,
}

fn default_source_stem() -> String {
    "main".to_string()
}

fn default_compile_time_limit() -> u64 {
    10_000
}

fn default_cpu_limit() -> f64 {
    1.0
}

impl LanguageProfile {
    /// File name of the staged source, e.g. `main.cpp` or `Main.java`.
    pub fn source_file(&self) -> String {
        format!("{}.{}", self.source_stem, self.file_extension)
    }

    /// Absolute path of the staged source inside the sandbox.
    pub fn source_path(&self) -> String {
        format!("{}/{}", WORKSPACE_DIR, self.source_file())
    }

    pub fn requires_compilation(&self) -> bool {
        self.compile_command.is_some()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesJson {
    languages: Vec<LanguageProfile>,
}

#[allow(clippy::too_many_arguments)]
fn profile(
    id: &str,
    display_name: &str,
    aliases: &[&str],
    file_extension: &str,
    compile_command: Option<&str>,
    run_command: &str,
    base_image: &str,
    time_limit_ms: u64,
    memory_limit_mb: u64,
) -> LanguageProfile {
    LanguageProfile {
        id: id.to_string(),
        display_name: display_name.to_string(),
        aliases: aliases.iter().map(|a| a.to_string()).collect(),
        file_extension: file_extension.to_string(),
        source_stem: default_source_stem(),
        compile_command: compile_command.map(str::to_string),
        run_command: run_command.to_string(),
        base_image: base_image.to_string(),
        default_time_limit_ms: time_limit_ms,
        default_memory_limit_mb: memory_limit_mb,
        compile_time_limit_ms: default_compile_time_limit(),
        cpu_limit: default_cpu_limit(),
    }
}

/// Profiles shipped with the engine.
pub fn builtin_profiles() -> Vec<LanguageProfile> {
    let mut java = profile(
        "java",
        "Java 21",
        &[],
        "java",
        Some("javac -J-Xss64m -encoding UTF-8 -d /box /box/Main.java"),
        "java -Xss64m -XX:+UseSerialGC -cp /box Main",
        "eclipse-temurin:21-jdk",
        4000,
        512,
    );
    java.source_stem = "Main".to_string();
    java.compile_time_limit_ms = 20_000;

    let mut rust = profile(
        "rust",
        "Rust",
        &["rs"],
        "rs",
        Some("rustc -O --edition 2021 -o /box/main /box/main.rs"),
        "/box/main",
        "rust:1-slim",
        2000,
        256,
    );
    rust.compile_time_limit_ms = 30_000;

    vec![
        profile(
            "c",
            "C (GCC, C17)",
            &["gcc"],
            "c",
            Some("gcc -O2 -std=gnu17 -pipe -o /box/main /box/main.c -lm"),
            "/box/main",
            "gcc:13",
            2000,
            256,
        ),
        profile(
            "cpp",
            "C++ (GCC, C++17)",
            &["c++", "cxx", "g++"],
            "cpp",
            Some("g++ -O2 -std=gnu++17 -pipe -o /box/main /box/main.cpp"),
            "/box/main",
            "gcc:13",
            2000,
            256,
        ),
        java,
        profile(
            "python",
            "Python 3",
            &["py", "python3"],
            "py",
            Some("python3 -m py_compile /box/main.py"),
            "python3 -u /box/main.py",
            "python:3.12-slim",
            5000,
            256,
        ),
        profile(
            "javascript",
            "JavaScript (Node.js)",
            &["js", "node", "nodejs"],
            "js",
            Some("node --check /box/main.js"),
            "node /box/main.js",
            "node:20-slim",
            5000,
            256,
        ),
        rust,
    ]
}

/// Closed lookup table from language identifier to profile.
///
/// Every component resolves languages through this registry; adding a
/// language means adding a profile, either built in or through the
/// languages JSON file.
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    profiles: HashMap<String, Arc<LanguageProfile>>,
    aliases: HashMap<String, String>,
}

impl LanguageRegistry {
    pub fn new(profiles: impl IntoIterator<Item = LanguageProfile>) -> Self {
        let mut registry = Self {
            profiles: HashMap::new(),
            aliases: HashMap::new(),
        };
        for profile in profiles {
            registry.insert(profile);
        }
        registry
    }

    /// Registry holding the built-in profiles
    pub fn builtin() -> Self {
        Self::new(builtin_profiles())
    }

    /// Add or replace a profile.
    pub fn insert(&mut self, profile: LanguageProfile) {
        let id = profile.id.to_lowercase();
        for alias in &profile.aliases {
            self.aliases.insert(alias.to_lowercase(), id.clone());
        }
        self.profiles.insert(id, Arc::new(profile));
    }

    /// Merge profiles from a `{"languages": [...]}` document.
    pub fn merge_json(&mut self, content: &str) -> anyhow::Result<usize> {
        let parsed: LanguagesJson = serde_json::from_str(content)?;
        let count = parsed.languages.len();
        for profile in parsed.languages {
            self.insert(profile);
        }
        Ok(count)
    }

    /// Merge profiles from a languages JSON file.
    pub fn merge_file(&mut self, path: &Path) -> anyhow::Result<usize> {
        use anyhow::Context;

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        self.merge_json(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Apply `ARBITER_LANG_<ID>_TIME_LIMIT_MS` / `ARBITER_LANG_<ID>_MEMORY_LIMIT_MB`.
    pub fn apply_limit_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for profile in self.profiles.values_mut() {
            let key = profile.id.to_uppercase();
            let time = lookup(&format!("ARBITER_LANG_{}_TIME_LIMIT_MS", key))
                .and_then(|v| v.trim().parse::<u64>().ok());
            let memory = lookup(&format!("ARBITER_LANG_{}_MEMORY_LIMIT_MB", key))
                .and_then(|v| v.trim().parse::<u64>().ok());

            if time.is_none() && memory.is_none() {
                continue;
            }
            let updated = Arc::make_mut(profile);
            if let Some(ms) = time {
                updated.default_time_limit_ms = ms;
            }
            if let Some(mb) = memory {
                updated.default_memory_limit_mb = mb;
            }
        }
    }

    /// Resolve a language identifier or alias, case-insensitively.
    pub fn resolve(&self, language: &str) -> Result<Arc<LanguageProfile>> {
        let key = language.trim().to_lowercase();
        let id = self.aliases.get(&key).unwrap_or(&key);
        self.profiles
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::UnsupportedLanguage(language.to_string()))
    }

    /// All registered profiles, sorted by id.
    pub fn profiles(&self) -> Vec<Arc<LanguageProfile>> {
        let mut all: Vec<_> = self.profiles.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn list_languages(&self) -> Vec<String> {
        self.profiles().iter().map(|p| p.id.clone()).collect()
    }
}

impl Default for LanguageRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_covers_required_languages() {
        let registry = LanguageRegistry::builtin();
        for id in ["cpp", "java", "python", "javascript"] {
            let profile = registry.resolve(id).unwrap();
            assert_eq!(profile.id, id);
            assert!(profile.default_time_limit_ms > 0);
            assert!(profile.default_memory_limit_mb > 0);
        }
    }

    #[test]
    fn test_resolve_aliases_case_insensitive() {
        let registry = LanguageRegistry::builtin();
        assert_eq!(registry.resolve("C++").unwrap().id, "cpp");
        assert_eq!(registry.resolve(" py ").unwrap().id, "python");
        assert_eq!(registry.resolve("node").unwrap().id, "javascript");
        assert_eq!(registry.resolve("JAVA").unwrap().id, "java");
    }

    #[test]
    fn test_unknown_language_is_rejected() {
        let registry = LanguageRegistry::builtin();
        let err = registry.resolve("brainfuck").unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedLanguage(ref l) if l == "brainfuck"));
    }

    #[test]
    fn test_java_source_file_is_main_class() {
        let registry = LanguageRegistry::builtin();
        let java = registry.resolve("java").unwrap();
        assert_eq!(java.source_file(), "Main.java");
        assert_eq!(java.source_path(), "/box/Main.java");
        assert!(java.requires_compilation());
    }

    #[test]
    fn test_merge_json_adds_language() {
        let mut registry = LanguageRegistry::builtin();
        let added = registry
            .merge_json(
                r#"{"languages": [{
                    "id": "go",
                    "displayName": "Go",
                    "aliases": ["golang"],
                    "fileExtension": "go",
                    "compileCommand": "cd /box && go build -o /box/main main.go",
                    "runCommand": "/box/main",
                    "baseImage": "golang:1.22",
                    "defaultTimeLimitMs": 2000,
                    "defaultMemoryLimitMb": 256
                }]}"#,
            )
            .unwrap();

        assert_eq!(added, 1);
        let go = registry.resolve("golang").unwrap();
        assert_eq!(go.source_file(), "main.go");
        assert_eq!(go.compile_time_limit_ms, 10_000);
        assert_eq!(go.cpu_limit, 1.0);
    }

    #[test]
    fn test_merge_json_rejects_malformed() {
        let mut registry = LanguageRegistry::builtin();
        assert!(registry.merge_json("{\"languages\": [{}]}").is_err());
    }

    #[test]
    fn test_limit_overrides() {
        let mut registry = LanguageRegistry::builtin();
        registry.apply_limit_overrides(|key| match key {
            "ARBITER_LANG_CPP_TIME_LIMIT_MS" => Some("1500".to_string()),
            "ARBITER_LANG_PYTHON_MEMORY_LIMIT_MB" => Some("512".to_string()),
            _ => None,
        });

        let cpp = registry.resolve("cpp").unwrap();
        assert_eq!(cpp.default_time_limit_ms, 1500);
        assert_eq!(cpp.default_memory_limit_mb, 256);

        let python = registry.resolve("python").unwrap();
        assert_eq!(python.default_memory_limit_mb, 512);
    }
}
