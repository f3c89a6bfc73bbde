//! Rendering of batch results.

use std::time::Duration;

use crate::batch::{FileValidationResult, ValidationResults, ValidationStatus};
use crate::cli::{OutputFormat, VerbosityLevel};
use crate::sink::Severity;

pub struct Output {
    format: OutputFormat,
    verbosity: VerbosityLevel,
    show_colors: bool,
}

impl Output {
    pub fn new(format: OutputFormat, verbosity: VerbosityLevel) -> Self {
        Self {
            format,
            verbosity,
            show_colors: atty::is(atty::Stream::Stdout),
        }
    }

    pub fn with_colors(mut self, show_colors: bool) -> Self {
        self.show_colors = show_colors;
        self
    }

    pub fn render(&self, results: &ValidationResults) -> serde_json::Result<String> {
        match self.format {
            OutputFormat::Human => Ok(self.format_results(results)),
            OutputFormat::Json => serde_json::to_string_pretty(results),
            OutputFormat::Summary => Ok(self.format_summary(results)),
        }
    }

    fn colorize(&self, text: &str, color: &str) -> String {
        if self.show_colors {
            format!("\x1b[{}m{}\x1b[0m", color, text)
        } else {
            text.to_string()
        }
    }

    /// Failing files with their diagnostics, then the summary. Valid files are listed only when
    /// verbose; quiet drops the summary.
    pub fn format_results(&self, results: &ValidationResults) -> String {
        let mut output = String::new();
        for file_result in &results.file_results {
            if file_result.status.is_valid() && self.verbosity < VerbosityLevel::Verbose {
                continue;
            }
            output.push_str(&self.format_file_result(file_result));
            output.push('\n');
        }
        if self.verbosity > VerbosityLevel::Quiet {
            if !output.is_empty() {
                output.push('\n');
            }
            output.push_str(&self.format_summary(results));
        }
        output
    }

    pub fn format_file_result(&self, result: &FileValidationResult) -> String {
        let path_display = result.path.display();
        let duration_str = format_duration(result.duration);

        let mut output = match &result.status {
            ValidationStatus::Valid => format!(
                "{}  {} ({})",
                self.colorize("✓ VALID", "32"),
                path_display,
                duration_str
            ),
            ValidationStatus::Invalid { error_count } => format!(
                "{}  {} ({}) - {} error{}",
                self.colorize("✗ INVALID", "31"),
                path_display,
                duration_str,
                error_count,
                if *error_count == 1 { "" } else { "s" }
            ),
            ValidationStatus::Error { message } => format!(
                "{}  {} ({}) - {}",
                self.colorize("⚠ ERROR", "33"),
                path_display,
                duration_str,
                message
            ),
            ValidationStatus::Skipped { reason } => format!(
                "{}  {} - {}",
                self.colorize("- SKIPPED", "36"),
                path_display,
                reason
            ),
        };

        for diagnostic in &result.diagnostics {
            if diagnostic.severity == Severity::Warning && self.verbosity < VerbosityLevel::Verbose
            {
                continue;
            }
            let position = diagnostic
                .location
                .as_ref()
                .map(|l| format!("{}:{}: ", l.line, l.column))
                .unwrap_or_default();
            output.push_str(&format!(
                "\n    {}{}: {}",
                position, diagnostic.severity, diagnostic.message
            ));
        }
        output
    }

    pub fn format_summary(&self, results: &ValidationResults) -> String {
        let mut output = String::new();
        output.push_str("Validation Summary:\n");
        if let Some(schema) = &results.schema {
            output.push_str(&format!("  Schema: {}\n", schema));
        }
        output.push_str(&format!("  Total files: {}\n", results.total_files));
        output.push_str(&format!(
            "  {} {}\n",
            self.colorize("Valid:", "32"),
            results.valid_files
        ));
        if results.invalid_files > 0 {
            output.push_str(&format!(
                "  {} {}\n",
                self.colorize("Invalid:", "31"),
                results.invalid_files
            ));
        }
        if results.error_files > 0 {
            output.push_str(&format!(
                "  {} {}\n",
                self.colorize("Errors:", "33"),
                results.error_files
            ));
        }
        if results.skipped_files > 0 {
            output.push_str(&format!(
                "  {} {}\n",
                self.colorize("Skipped:", "36"),
                results.skipped_files
            ));
        }
        output.push_str(&format!("  Success rate: {:.1}%\n", results.success_rate()));
        output.push_str(&format!(
            "  Duration: {}\n",
            format_duration(results.total_duration)
        ));
        if self.verbosity >= VerbosityLevel::Verbose {
            output.push_str(&format!(
                "  Average per file: {}\n",
                format_duration(results.average_duration)
            ));
        }
        output
    }
}

fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs_f64();
    if total_secs < 1.0 {
        format!("{:.0}ms", duration.as_millis())
    } else if total_secs < 60.0 {
        format!("{:.2}s", total_secs)
    } else {
        let mins = (total_secs / 60.0) as u64;
        let secs = total_secs % 60.0;
        format!("{}m{:.1}s", mins, secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Location;
    use crate::sink::Diagnostic;
    use std::path::PathBuf;

    fn results() -> ValidationResults {
        let valid = FileValidationResult {
            path: PathBuf::from("good.xml"),
            status: ValidationStatus::Valid,
            duration: Duration::from_millis(3),
            diagnostics: Vec::new(),
        };
        let invalid = FileValidationResult {
            path: PathBuf::from("bad.xml"),
            status: ValidationStatus::Invalid { error_count: 1 },
            duration: Duration::from_millis(4),
            diagnostics: vec![
                Diagnostic::error(
                    "element \"x\" not allowed here",
                    Some(&Location::new(None, 7, 3)),
                ),
                Diagnostic::warning("something odd", None),
            ],
        };
        ValidationResults::aggregate(
            Some("rules.xml".to_string()),
            vec![valid, invalid],
            Duration::from_millis(10),
        )
    }

    fn output(format: OutputFormat, verbosity: VerbosityLevel) -> Output {
        Output::new(format, verbosity).with_colors(false)
    }

    #[test]
    fn test_human_normal() {
        let text = output(OutputFormat::Human, VerbosityLevel::Normal)
            .render(&results())
            .unwrap();
        assert!(text.contains("✗ INVALID  bad.xml (4ms) - 1 error"));
        assert!(text.contains("    7:3: error: element \"x\" not allowed here"));
        assert!(!text.contains("something odd"));
        assert!(!text.contains("good.xml"));
        assert!(text.contains("Validation Summary:"));
        assert!(text.contains("  Schema: rules.xml"));
        assert!(text.contains("  Invalid: 1"));
    }

    #[test]
    fn test_human_verbose_and_quiet() {
        let text = output(OutputFormat::Human, VerbosityLevel::Verbose)
            .render(&results())
            .unwrap();
        assert!(text.contains("✓ VALID  good.xml"));
        assert!(text.contains("warning: something odd"));
        assert!(text.contains("Average per file"));

        let text = output(OutputFormat::Human, VerbosityLevel::Quiet)
            .render(&results())
            .unwrap();
        assert!(text.contains("bad.xml"));
        assert!(!text.contains("Validation Summary:"));
    }

    #[test]
    fn test_json() {
        let text = output(OutputFormat::Json, VerbosityLevel::Normal)
            .render(&results())
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["total_files"], 2);
        assert_eq!(value["file_results"][1]["status"]["status"], "invalid");
        assert_eq!(
            value["file_results"][1]["diagnostics"][0]["location"]["line"],
            7
        );
        assert_eq!(value["file_results"][1]["diagnostics"][0]["severity"], "error");
    }

    #[test]
    fn test_summary_only() {
        let text = output(OutputFormat::Summary, VerbosityLevel::Normal)
            .render(&results())
            .unwrap();
        assert!(text.starts_with("Validation Summary:"));
        assert!(!text.contains("bad.xml"));
        assert!(text.contains("Success rate: 50.0%"));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m30.0s");
    }
}
