use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// One line per problem, colored on a terminal
    #[default]
    Human,
    /// Machine-readable results
    Json,
    /// Counts only
    Summary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum VerbosityLevel {
    Quiet,
    #[default]
    Normal,
    Verbose,
}

/// Validate XML documents against an XML Schema or a namespace dispatch rules document
#[derive(Parser, Debug, Clone)]
#[command(name = "validate-ns")]
#[command(version)]
pub struct Cli {
    /// Schema to validate against: an XSD, or a rules document dispatching namespaces to schemas
    #[arg(short = 's', long = "schema")]
    pub schema: PathBuf,

    /// Directory or file to validate
    pub path: PathBuf,

    /// File extensions to process, comma-separated (e.g. 'xml,cmdi')
    #[arg(short = 'e', long = "extensions")]
    pub extensions: Option<String>,

    /// Number of documents validated at once
    #[arg(short = 't', long = "threads")]
    pub threads: Option<usize>,

    #[arg(short = 'v', long = "verbose", conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only report problems
    #[arg(short = 'q', long = "quiet")]
    pub quiet: bool,

    #[arg(long = "format", value_enum)]
    pub output_format: Option<OutputFormat>,

    /// Stop at the first invalid document
    #[arg(long = "fail-fast")]
    pub fail_fast: bool,

    /// Skip ID/IDREF checking
    #[arg(long = "no-id-check")]
    pub no_id_check: bool,

    /// Only validate files matching this glob (repeatable)
    #[arg(long = "include", action = clap::ArgAction::Append)]
    pub include_patterns: Vec<String>,

    /// Skip files matching this glob (repeatable)
    #[arg(long = "exclude", action = clap::ArgAction::Append)]
    pub exclude_patterns: Vec<String>,

    /// Configuration file (TOML or JSON)
    #[arg(long = "config")]
    pub config: Option<PathBuf>,

    /// Report progress on stderr
    #[arg(long = "progress")]
    pub progress: bool,

    /// Per-document timeout in seconds
    #[arg(long = "timeout")]
    pub timeout: Option<u64>,

    /// Maximum number of compiled schemas kept in memory
    #[arg(long = "max-schemas")]
    pub max_schemas: Option<u64>,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn get_extensions(&self) -> Option<Vec<String>> {
        self.extensions.as_ref().map(|extensions| {
            extensions
                .split(',')
                .map(|s| s.trim().trim_start_matches('.').to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
    }

    /// Checks what clap cannot: that the paths exist and the thread count is usable.
    pub fn validate(&self) -> Result<(), String> {
        if !self.path.exists() {
            return Err(format!("Path does not exist: {}", self.path.display()));
        }
        if !self.schema.is_file() {
            return Err(format!("Schema file does not exist: {}", self.schema.display()));
        }
        if let Some(threads) = self.threads
            && threads == 0
        {
            return Err("Number of threads must be greater than 0".to_string());
        }
        Ok(())
    }

    pub fn verbosity(&self) -> VerbosityLevel {
        if self.quiet {
            VerbosityLevel::Quiet
        } else if self.verbose {
            VerbosityLevel::Verbose
        } else {
            VerbosityLevel::Normal
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_arguments() {
        let cli = Cli::try_parse_from(["validate-ns", "--schema", "rules.xml", "/tmp"]).unwrap();
        assert_eq!(cli.schema, PathBuf::from("rules.xml"));
        assert_eq!(cli.path, PathBuf::from("/tmp"));
        assert_eq!(cli.get_extensions(), None);
        assert_eq!(cli.output_format, None);
        assert_eq!(cli.verbosity(), VerbosityLevel::Normal);
    }

    #[test]
    fn test_all_arguments() {
        let cli = Cli::try_parse_from([
            "validate-ns",
            "-s",
            "a.xsd",
            "docs",
            "-e",
            "xml, .cmdi",
            "-t",
            "4",
            "-q",
            "--format",
            "json",
            "--fail-fast",
            "--no-id-check",
            "--include",
            "**/a/*.xml",
            "--exclude",
            "**/tmp/**",
            "--exclude",
            "**/old/**",
        ])
        .unwrap();
        assert_eq!(
            cli.get_extensions(),
            Some(vec!["xml".to_string(), "cmdi".to_string()])
        );
        assert_eq!(cli.threads, Some(4));
        assert_eq!(cli.output_format, Some(OutputFormat::Json));
        assert!(cli.fail_fast && cli.no_id_check);
        assert_eq!(cli.exclude_patterns.len(), 2);
        assert_eq!(cli.verbosity(), VerbosityLevel::Quiet);
    }

    #[test]
    fn test_schema_is_required() {
        assert!(Cli::try_parse_from(["validate-ns", "/tmp"]).is_err());
    }

    #[test]
    fn test_verbose_conflicts_with_quiet() {
        assert!(Cli::try_parse_from(["validate-ns", "-s", "a.xsd", "/tmp", "-v", "-q"]).is_err());
    }

    #[test]
    fn test_validate_rejects_missing_paths() {
        let cli = Cli::try_parse_from(["validate-ns", "-s", "a.xsd", "/definitely/missing"]).unwrap();
        assert!(cli.validate().unwrap_err().contains("Path does not exist"));

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().to_str().unwrap();
        let cli = Cli::try_parse_from(["validate-ns", "-s", "/no/schema.xsd", path]).unwrap();
        assert!(cli.validate().unwrap_err().contains("Schema file does not exist"));
    }
}
