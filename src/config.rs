use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cli::{Cli, OutputFormat};

const ENV_PREFIX: &str = "VALIDATE_NS_";
const MAX_THREADS: usize = 1000;
const CONFIG_NAMES: [&str; 4] = [
    "validate-ns.toml",
    "validate-ns.json",
    ".validate-ns.toml",
    ".validate-ns.json",
];

/// Source of environment variables, replaceable in tests.
pub trait EnvProvider {
    fn get(&self, key: &str) -> Option<String>;
}

pub struct SystemEnvProvider;

impl EnvProvider for SystemEnvProvider {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid TOML configuration: {0}")]
    TomlParsing(#[from] toml::de::Error),

    #[error("invalid JSON configuration: {0}")]
    JsonParsing(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Validation(String),

    #[error("invalid environment override: {0}")]
    Environment(String),

    #[error("unsupported configuration file extension: {0}")]
    UnsupportedFormat(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub validation: ValidationConfig,
    pub cache: CacheConfig,
    pub output: OutputConfig,
    pub files: FileConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ValidationConfig {
    /// Documents validated at once; the number of CPUs when unset.
    pub threads: Option<usize>,
    pub fail_fast: bool,
    /// ID/IDREF soundness checking for schemas that declare identifier attributes.
    pub check_id_idref: bool,
    pub show_progress: bool,
    /// Per-document limit.
    pub timeout_seconds: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            threads: None,
            fail_fast: false,
            check_id_idref: true,
            show_progress: false,
            timeout_seconds: 30,
        }
    }
}

/// In-memory cache of compiled schemas.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub max_schemas: u64,
    pub ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_schemas: 100,
            ttl_seconds: 24 * 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct OutputConfig {
    pub format: OutputFormat,
    pub verbose: bool,
    pub quiet: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FileConfig {
    pub extensions: Vec<String>,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            extensions: vec!["xml".to_string()],
            include_patterns: vec![],
            exclude_patterns: vec![],
        }
    }
}

impl Config {
    pub fn thread_count(&self) -> usize {
        self.validation.threads.unwrap_or_else(num_cpus::get)
    }

    pub fn validation_timeout(&self) -> Duration {
        Duration::from_secs(self.validation.timeout_seconds)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_seconds)
    }
}

/// Loads configuration with precedence defaults < file < environment < command line.
pub struct ConfigManager;

impl ConfigManager {
    pub async fn load_config(cli: &Cli) -> Result<Config> {
        Self::load_config_with(cli, &SystemEnvProvider).await
    }

    pub async fn load_config_with(cli: &Cli, env: &impl EnvProvider) -> Result<Config> {
        let config = match &cli.config {
            Some(path) => Self::load_from_file(path).await?,
            None => Self::find_config_file().await?.unwrap_or_default(),
        };
        let config = Self::apply_environment_overrides_with(env, config)?;
        let config = Self::merge_with_cli(config, cli);
        Self::validate_config(&config)?;
        Ok(config)
    }

    /// Reads a TOML or JSON file; without an extension TOML is tried first.
    pub async fn load_from_file(path: &Path) -> Result<Config> {
        let content = tokio::fs::read_to_string(path).await?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Ok(toml::from_str(&content)?),
            Some("json") => Ok(serde_json::from_str(&content)?),
            Some(ext) => Err(ConfigError::UnsupportedFormat(ext.to_string())),
            None => match toml::from_str::<Config>(&content) {
                Ok(config) => Ok(config),
                Err(_) => Ok(serde_json::from_str(&content)?),
            },
        }
    }

    /// Looks in the current directory, then in the user configuration directory.
    pub async fn find_config_file() -> Result<Option<Config>> {
        let mut candidates: Vec<PathBuf> = CONFIG_NAMES.iter().map(PathBuf::from).collect();
        if let Some(config_dir) = dirs::config_dir() {
            let app_dir = config_dir.join("validate-ns");
            candidates.extend(CONFIG_NAMES.iter().map(|name| app_dir.join(name)));
        }
        for path in candidates {
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Ok(Some(Self::load_from_file(&path).await?));
            }
        }
        Ok(None)
    }

    pub fn apply_environment_overrides(config: Config) -> Result<Config> {
        Self::apply_environment_overrides_with(&SystemEnvProvider, config)
    }

    pub fn apply_environment_overrides_with(
        env: &impl EnvProvider,
        mut config: Config,
    ) -> Result<Config> {
        if let Some(threads) = parse_env(env, "THREADS")? {
            config.validation.threads = Some(threads);
        }
        if let Some(fail_fast) = parse_env(env, "FAIL_FAST")? {
            config.validation.fail_fast = fail_fast;
        }
        if let Some(check) = parse_env(env, "CHECK_ID_IDREF")? {
            config.validation.check_id_idref = check;
        }
        if let Some(timeout) = parse_env(env, "TIMEOUT")? {
            config.validation.timeout_seconds = timeout;
        }
        if let Some(max_schemas) = parse_env(env, "MAX_SCHEMAS")? {
            config.cache.max_schemas = max_schemas;
        }
        if let Some(ttl) = parse_env(env, "CACHE_TTL")? {
            config.cache.ttl_seconds = ttl;
        }
        if let Some(verbose) = parse_env(env, "VERBOSE")? {
            config.output.verbose = verbose;
        }
        if let Some(quiet) = parse_env(env, "QUIET")? {
            config.output.quiet = quiet;
        }
        if let Some(format) = env.get(&format!("{}FORMAT", ENV_PREFIX)) {
            config.output.format = match format.to_lowercase().as_str() {
                "human" => OutputFormat::Human,
                "json" => OutputFormat::Json,
                "summary" => OutputFormat::Summary,
                _ => {
                    return Err(ConfigError::Environment(format!(
                        "Invalid {}FORMAT value: {}",
                        ENV_PREFIX, format
                    )));
                }
            };
        }
        if let Some(extensions) = env.get(&format!("{}EXTENSIONS", ENV_PREFIX)) {
            config.files.extensions = extensions
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        Ok(config)
    }

    /// Flags given on the command line win; flags left out keep the configured value.
    pub fn merge_with_cli(mut config: Config, cli: &Cli) -> Config {
        if cli.threads.is_some() {
            config.validation.threads = cli.threads;
        }
        if cli.fail_fast {
            config.validation.fail_fast = true;
        }
        if cli.no_id_check {
            config.validation.check_id_idref = false;
        }
        if cli.progress {
            config.validation.show_progress = true;
        }
        if let Some(timeout) = cli.timeout {
            config.validation.timeout_seconds = timeout;
        }
        if let Some(max_schemas) = cli.max_schemas {
            config.cache.max_schemas = max_schemas;
        }
        if let Some(format) = cli.output_format {
            config.output.format = format;
        }
        if cli.verbose {
            config.output.verbose = true;
            config.output.quiet = false;
        }
        if cli.quiet {
            config.output.quiet = true;
            config.output.verbose = false;
        }
        if let Some(extensions) = cli.get_extensions() {
            config.files.extensions = extensions;
        }
        if !cli.include_patterns.is_empty() {
            config.files.include_patterns = cli.include_patterns.clone();
        }
        if !cli.exclude_patterns.is_empty() {
            config.files.exclude_patterns = cli.exclude_patterns.clone();
        }
        config
    }

    /// Rejects settings the validator cannot run with.
    pub fn validate_config(config: &Config) -> Result<()> {
        let invalid = |message: String| -> Result<()> { Err(ConfigError::Validation(message)) };

        match config.validation.threads {
            Some(0) => return invalid("thread count must be at least 1".to_string()),
            Some(threads) if threads > MAX_THREADS => {
                return invalid(format!(
                    "thread count {} exceeds the limit of {}",
                    threads, MAX_THREADS
                ));
            }
            _ => {}
        }
        if config.validation.timeout_seconds == 0 {
            return invalid("validation timeout must be at least one second".to_string());
        }
        if config.cache.max_schemas == 0 {
            return invalid("schema cache must hold at least one schema".to_string());
        }
        if config.cache.ttl_seconds == 0 {
            return invalid("schema cache TTL must be at least one second".to_string());
        }
        if config.output.verbose && config.output.quiet {
            return invalid("verbose and quiet output are mutually exclusive".to_string());
        }
        if config.files.extensions.is_empty() {
            return invalid("no file extensions configured".to_string());
        }
        if let Some(extension) = config
            .files
            .extensions
            .iter()
            .find(|extension| extension.contains(['/', '\\', '.']))
        {
            return invalid(format!("invalid file extension \"{}\"", extension));
        }
        Ok(())
    }
}

fn parse_env<T: FromStr>(env: &impl EnvProvider, name: &str) -> Result<Option<T>> {
    let key = format!("{}{}", ENV_PREFIX, name);
    env.get(&key)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Environment(format!("Invalid {} value: {}", key, value)))
        })
        .transpose()
}
