//! Language configuration for compilation and execution
//!
//! The registry maps a language identifier (name, alias or catalog id) to a
//! [`RunnerStrategy`]. It is built once at startup and only read afterwards,
//! so workers share it through an `Arc` without locking.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;

use crate::error::JudgeError;

const BUNDLED_LANGUAGES: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/languages.toml"));

/// Command template with `{source}`, `{binary}` and `{workdir}` placeholders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate(Vec<String>);

/// Values substituted into a [`CommandTemplate`]
#[derive(Debug, Clone, Copy)]
pub struct TemplateVars<'a> {
    pub source: &'a str,
    pub binary: &'a str,
    pub workdir: &'a str,
}

impl CommandTemplate {
    pub fn new(parts: Vec<String>) -> Self {
        Self(parts)
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }

    pub fn render(&self, vars: &TemplateVars<'_>) -> Vec<String> {
        self.0
            .iter()
            .map(|part| {
                part.replace("{source}", vars.source)
                    .replace("{binary}", vars.binary)
                    .replace("{workdir}", vars.workdir)
            })
            .collect()
    }
}

/// Whether a language needs a build step before it can run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Toolchain {
    Compiled { compile: CommandTemplate },
    Interpreted,
}

/// Build + execute strategy for one language
#[derive(Debug, Clone)]
pub struct RunnerStrategy {
    /// Canonical language name
    pub name: String,
    /// Name of the source file (e.g., "main.cpp")
    pub source_file: String,
    /// Name of the build artifact for compiled languages
    pub binary: String,
    pub toolchain: Toolchain,
    /// Run command template
    pub run: CommandTemplate,
    /// Time limit multiplier and bonus: (multiplier, bonus_seconds)
    /// actual_time = base_time * multiplier + bonus
    /// Example: (3, 2) means base_time * 3 + 2 seconds
    pub time_limit: Option<(u32, u32)>,
    /// Memory limit multiplier and bonus: (multiplier, bonus_mb)
    /// actual_memory = base_memory * multiplier + bonus
    /// Example: (2, 32) means base_memory * 2 + 32 MB
    pub memory_limit: Option<(u32, u32)>,
    /// Enforce the memory limit with RLIMIT_AS (VM runtimes reserve far more
    /// address space than they use and need this off)
    pub address_space_limit: bool,
}

impl RunnerStrategy {
    pub fn needs_build(&self) -> bool {
        matches!(self.toolchain, Toolchain::Compiled { .. })
    }

    /// Build command for `work_dir`, `None` for interpreted languages
    pub fn compile_argv(&self, work_dir: &Path) -> Option<Vec<String>> {
        match &self.toolchain {
            Toolchain::Compiled { compile } => Some(self.render(compile, work_dir)),
            Toolchain::Interpreted => None,
        }
    }

    /// Run command for `work_dir`
    pub fn run_argv(&self, work_dir: &Path) -> Vec<String> {
        self.render(&self.run, work_dir)
    }

    /// `{binary}` renders as an absolute path; `{source}` stays relative to
    /// the working directory.
    fn render(&self, template: &CommandTemplate, work_dir: &Path) -> Vec<String> {
        let workdir = work_dir.to_string_lossy();
        let binary = work_dir.join(&self.binary);
        let binary = binary.to_string_lossy();
        template.render(&TemplateVars {
            source: &self.source_file,
            binary: &binary,
            workdir: &workdir,
        })
    }

    /// Source file extension, without the dot
    pub fn source_extension(&self) -> Option<&str> {
        Path::new(&self.source_file).extension().and_then(|ext| ext.to_str())
    }

    /// Calculate actual time limit based on base time limit
    /// base_time_ms: base time limit in milliseconds (from problem)
    /// Returns: adjusted time limit in milliseconds
    pub fn calculate_time_limit(&self, base_time_ms: u32) -> u32 {
        match self.time_limit {
            Some((multiplier, bonus_seconds)) => base_time_ms
                .saturating_mul(multiplier)
                .saturating_add(bonus_seconds.saturating_mul(1000)),
            None => base_time_ms, // No adjustment
        }
    }

    /// Calculate actual memory limit based on base memory limit
    /// base_memory_mb: base memory limit in MB (from problem)
    /// Returns: adjusted memory limit in MB
    pub fn calculate_memory_limit(&self, base_memory_mb: u32) -> u32 {
        match self.memory_limit {
            Some((multiplier, bonus_mb)) => base_memory_mb
                .saturating_mul(multiplier)
                .saturating_add(bonus_mb),
            None => base_memory_mb, // No adjustment
        }
    }
}

/// A command written either as one whitespace-separated string or as an array
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawCommand {
    Line(String),
    Parts(Vec<String>),
}

impl RawCommand {
    fn into_template(self) -> CommandTemplate {
        match self {
            RawCommand::Line(line) => CommandTemplate(into_command(&line)),
            RawCommand::Parts(parts) => CommandTemplate(parts),
        }
    }
}

/// Raw TOML configuration for a language
#[derive(Debug, Deserialize)]
struct RawLanguageConfig {
    source_file: String,
    #[serde(default)]
    binary: Option<String>,
    compile_command: Option<RawCommand>,
    run_command: RawCommand,
    #[serde(default)]
    time_limit: Vec<String>,
    #[serde(default)]
    memory_limit: Vec<String>,
    #[serde(default)]
    aliases: Vec<String>,
    #[serde(default = "default_true")]
    address_space_limit: bool,
}

fn default_true() -> bool {
    true
}

/// Read-only language lookup table
#[derive(Debug, Clone, Default)]
pub struct LanguageRegistry {
    strategies: HashMap<String, Arc<RunnerStrategy>>,
    canonical: Vec<String>,
}

impl LanguageRegistry {
    /// Registry built from the language table shipped with the crate
    pub fn bundled() -> anyhow::Result<Self> {
        Self::from_toml_str(BUNDLED_LANGUAGES).context("Failed to parse bundled languages.toml")
    }

    /// Load language configurations from a TOML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read language config {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse language config {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let raw_configs: HashMap<String, RawLanguageConfig> = toml::from_str(content)?;

        let mut registry = Self::default();
        for (name, raw) in raw_configs {
            let parse_limit =
                |raw_limit: Vec<String>, kind: &str| -> anyhow::Result<Option<(u32, u32)>> {
                    if raw_limit.is_empty() {
                        return Ok(None);
                    }
                    if raw_limit.len() != 2 {
                        anyhow::bail!("Invalid {} limit for {}: {:?}", kind, name, raw_limit);
                    }
                    let multiplier = raw_limit[0].parse::<u32>().with_context(|| {
                        format!("Invalid {} multiplier for {}: {}", kind, name, raw_limit[0])
                    })?;
                    let offset = raw_limit[1].parse::<u32>().with_context(|| {
                        format!("Invalid {} offset for {}: {}", kind, name, raw_limit[1])
                    })?;
                    Ok(Some((multiplier, offset)))
                };

            let run = raw.run_command.into_template();
            if run.parts().is_empty() {
                anyhow::bail!("Empty run_command for {}", name);
            }
            let toolchain = match raw.compile_command.map(RawCommand::into_template) {
                Some(compile) if compile.parts().is_empty() => {
                    anyhow::bail!("Empty compile_command for {}", name)
                }
                Some(compile) => Toolchain::Compiled { compile },
                None => Toolchain::Interpreted,
            };

            let strategy = RunnerStrategy {
                name: name.to_lowercase(),
                source_file: raw.source_file,
                binary: raw.binary.unwrap_or_else(|| "main".to_string()),
                toolchain,
                run,
                time_limit: parse_limit(raw.time_limit, "time")?,
                memory_limit: parse_limit(raw.memory_limit, "memory")?,
                address_space_limit: raw.address_space_limit,
            };

            let aliases = raw.aliases;
            registry.register(strategy, &aliases)?;
        }

        registry.canonical.sort();
        Ok(registry)
    }

    /// Add a strategy under its name and aliases
    pub fn register(&mut self, strategy: RunnerStrategy, aliases: &[String]) -> anyhow::Result<()> {
        let strategy = Arc::new(strategy);
        let name = strategy.name.clone();

        for key in std::iter::once(&name).chain(aliases.iter()) {
            let key = key.to_lowercase();
            if let Some(existing) = self.strategies.get(&key) {
                anyhow::bail!(
                    "Language identifier {:?} is used by both {} and {}",
                    key,
                    existing.name,
                    name
                );
            }
            self.strategies.insert(key, Arc::clone(&strategy));
        }
        self.canonical.push(name);
        Ok(())
    }

    /// Get the strategy for a language identifier
    pub fn resolve(&self, language: &str) -> Result<Arc<RunnerStrategy>, JudgeError> {
        self.strategies
            .get(&language.trim().to_lowercase())
            .cloned()
            .ok_or_else(|| JudgeError::UnsupportedLanguage(language.to_string()))
    }

    /// Get all canonical language names
    pub fn supported_languages(&self) -> &[String] {
        &self.canonical
    }
}

fn into_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_test_config() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[c]
source_file = "main.c"
compile_command = "gcc -o {{binary}} {{source}}"
run_command = "{{binary}}"

[python]
source_file = "main.py"
run_command = "python3 {{source}}"
time_limit = ["3", "2"]
memory_limit = ["2", "32"]
aliases = ["py", "Python3", "71"]

[shell]
source_file = "main.sh"
compile_command = ["sh", "-c", "sh -n {{source}} && cp {{source}} {{binary}}"]
run_command = ["sh", "{{binary}}"]
address_space_limit = false
"#
        )
        .unwrap();
        file
    }

    #[test]
    fn test_load_languages() {
        let config_file = create_test_config();
        let registry = LanguageRegistry::load(config_file.path()).unwrap();

        assert_eq!(registry.supported_languages(), ["c", "python", "shell"]);
        assert_eq!(registry.resolve("py").unwrap().name, "python");
        assert_eq!(registry.resolve("PYTHON3").unwrap().name, "python");
        assert_eq!(registry.resolve("71").unwrap().name, "python");
    }

    #[test]
    fn test_unknown_language_is_unsupported() {
        let registry = LanguageRegistry::load(create_test_config().path()).unwrap();
        let err = registry.resolve("cobol").unwrap_err();
        assert!(matches!(err, JudgeError::UnsupportedLanguage(ref l) if l == "cobol"));
    }

    #[test]
    fn test_toolchain_kinds() {
        let registry = LanguageRegistry::load(create_test_config().path()).unwrap();
        assert!(registry.resolve("c").unwrap().needs_build());
        assert!(!registry.resolve("python").unwrap().needs_build());

        let shell = registry.resolve("shell").unwrap();
        assert!(!shell.address_space_limit);
        match &shell.toolchain {
            Toolchain::Compiled { compile } => {
                assert_eq!(compile.parts().len(), 3);
                assert_eq!(compile.parts()[2], "sh -n {source} && cp {source} {binary}");
            }
            Toolchain::Interpreted => panic!("shell should have a build step"),
        }
    }

    #[test]
    fn test_render_template() {
        let template = CommandTemplate(into_command("gcc -o {binary} {source}"));
        let vars = TemplateVars {
            source: "main.c",
            binary: "/tmp/x/main",
            workdir: "/tmp/x",
        };
        assert_eq!(
            template.render(&vars),
            vec!["gcc", "-o", "/tmp/x/main", "main.c"]
        );
    }

    #[test]
    fn test_strategy_argv() {
        let registry = LanguageRegistry::load(create_test_config().path()).unwrap();
        let dir = Path::new("/scratch/job-1");

        let c = registry.resolve("c").unwrap();
        assert_eq!(
            c.compile_argv(dir).unwrap(),
            vec!["gcc", "-o", "/scratch/job-1/main", "main.c"]
        );
        assert_eq!(c.run_argv(dir), vec!["/scratch/job-1/main"]);

        let python = registry.resolve("python").unwrap();
        assert!(python.compile_argv(dir).is_none());
        assert_eq!(python.run_argv(dir), vec!["python3", "main.py"]);
    }

    #[test]
    fn test_limit_adjustment() {
        let registry = LanguageRegistry::load(create_test_config().path()).unwrap();
        let python = registry.resolve("python").unwrap();
        assert_eq!(python.calculate_time_limit(1000), 5000);
        assert_eq!(python.calculate_memory_limit(256), 544);

        let c = registry.resolve("c").unwrap();
        assert_eq!(c.calculate_time_limit(1000), 1000);
        assert_eq!(c.source_extension(), Some("c"));
    }

    #[test]
    fn test_duplicate_alias_rejected() {
        let toml = r#"
[a]
source_file = "a.txt"
run_command = "cat a.txt"
aliases = ["x"]

[b]
source_file = "b.txt"
run_command = "cat b.txt"
aliases = ["x"]
"#;
        assert!(LanguageRegistry::from_toml_str(toml).is_err());
    }

    #[test]
    fn test_bundled_languages() {
        let registry = LanguageRegistry::bundled().unwrap();
        for lang in ["c", "cpp", "python"] {
            assert!(registry.resolve(lang).is_ok(), "{} should be bundled", lang);
        }
    }
}
