//! Validating many documents against the loaded schema.
//!
//! Each file runs on tokio's blocking pool through
//! [`ValidationEngine::validate_concurrent_with_sink`], with its own collecting sink so that
//! diagnostics stay grouped by file. A semaphore bounds how many run at once.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures::future::try_join_all;
use serde::Serialize;
use tracing::{debug, info};

use crate::engine::ValidationEngine;
use crate::error::{Result, ValidationError};
use crate::file_discovery::FileDiscovery;
use crate::input::InputSource;
use crate::sink::{CollectingSink, Diagnostic};

#[derive(Debug, Clone, PartialEq)]
pub struct BatchConfig {
    pub max_concurrent_validations: usize,
    pub validation_timeout: Duration,
    /// Skip files not yet started once one file is invalid or fails.
    pub fail_fast: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_validations: num_cpus::get(),
            validation_timeout: Duration::from_secs(30),
            fail_fast: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ValidationStatus {
    Valid,
    /// Schema violations or identifier errors.
    Invalid { error_count: usize },
    /// The document could not be validated at all (I/O, malformed XML, timeout).
    Error { message: String },
    Skipped { reason: String },
}

impl ValidationStatus {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationStatus::Valid)
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, ValidationStatus::Invalid { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ValidationStatus::Error { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, ValidationStatus::Skipped { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FileValidationResult {
    pub path: PathBuf,
    pub status: ValidationStatus,
    pub duration: Duration,
    /// Everything reported while validating this file, in document order.
    pub diagnostics: Vec<Diagnostic>,
}

impl FileValidationResult {
    fn from_outcome(
        path: PathBuf,
        outcome: Result<bool>,
        diagnostics: Vec<Diagnostic>,
        duration: Duration,
    ) -> Self {
        let status = match outcome {
            Ok(true) => ValidationStatus::Valid,
            Ok(false) => ValidationStatus::Invalid {
                error_count: diagnostics.iter().filter(|d| d.is_error()).count().max(1),
            },
            Err(e) => ValidationStatus::Error {
                message: e.to_string(),
            },
        };
        Self {
            path,
            status,
            duration,
            diagnostics,
        }
    }

    pub fn error(path: PathBuf, error: ValidationError, duration: Duration) -> Self {
        Self {
            path,
            status: ValidationStatus::Error {
                message: error.to_string(),
            },
            duration,
            diagnostics: Vec::new(),
        }
    }

    pub fn skipped(path: PathBuf, reason: impl Into<String>) -> Self {
        Self {
            path,
            status: ValidationStatus::Skipped {
                reason: reason.into(),
            },
            duration: Duration::ZERO,
            diagnostics: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationPhase {
    Discovery,
    Validation,
    Complete,
}

#[derive(Debug, Clone)]
pub struct ValidationProgress {
    pub current_file: Option<PathBuf>,
    pub completed: usize,
    pub total: usize,
    pub phase: ValidationPhase,
}

pub type ProgressCallback = Arc<dyn Fn(ValidationProgress) + Send + Sync>;

/// Summary of a batch run.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationResults {
    pub schema: Option<String>,
    pub total_files: usize,
    pub valid_files: usize,
    pub invalid_files: usize,
    pub error_files: usize,
    pub skipped_files: usize,
    /// Wall-clock time of the whole run.
    pub total_duration: Duration,
    pub average_duration: Duration,
    pub file_results: Vec<FileValidationResult>,
}

impl ValidationResults {
    pub fn aggregate(
        schema: Option<String>,
        file_results: Vec<FileValidationResult>,
        total_duration: Duration,
    ) -> Self {
        let total_files = file_results.len();
        let mut valid_files = 0;
        let mut invalid_files = 0;
        let mut error_files = 0;
        let mut skipped_files = 0;
        let mut busy = Duration::ZERO;

        for result in &file_results {
            match result.status {
                ValidationStatus::Valid => valid_files += 1,
                ValidationStatus::Invalid { .. } => invalid_files += 1,
                ValidationStatus::Error { .. } => error_files += 1,
                ValidationStatus::Skipped { .. } => skipped_files += 1,
            }
            busy += result.duration;
        }

        let average_duration = if total_files > 0 {
            busy / total_files as u32
        } else {
            Duration::ZERO
        };

        Self {
            schema,
            total_files,
            valid_files,
            invalid_files,
            error_files,
            skipped_files,
            total_duration,
            average_duration,
            file_results,
        }
    }

    pub fn all_valid(&self) -> bool {
        self.valid_files == self.total_files && self.total_files > 0
    }

    pub fn has_failures(&self) -> bool {
        self.error_files > 0 || self.invalid_files > 0
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_files == 0 {
            0.0
        } else {
            (self.valid_files as f64 / self.total_files as f64) * 100.0
        }
    }
}

pub struct BatchValidator {
    engine: Arc<ValidationEngine>,
    config: BatchConfig,
}

impl BatchValidator {
    pub fn new(engine: Arc<ValidationEngine>, config: BatchConfig) -> Self {
        Self { engine, config }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub async fn validate_path(
        &self,
        path: &Path,
        discovery: &FileDiscovery,
    ) -> Result<ValidationResults> {
        self.validate_path_with_progress(path, discovery, None).await
    }

    /// Discovers the documents under `path` and validates them all.
    pub async fn validate_path_with_progress(
        &self,
        path: &Path,
        discovery: &FileDiscovery,
        progress: Option<ProgressCallback>,
    ) -> Result<ValidationResults> {
        let started = Instant::now();
        let schema = self
            .engine
            .loaded_schema()
            .map(|loaded| loaded.system_id().to_string());

        if let Some(callback) = &progress {
            callback(ValidationProgress {
                current_file: None,
                completed: 0,
                total: 0,
                phase: ValidationPhase::Discovery,
            });
        }
        let files = discovery.discover_files(path).await?;
        debug!(path = %path.display(), files = files.len(), "discovered documents");

        let total = files.len();
        let file_results = self.validate_files_with_progress(files, progress.clone()).await?;
        let results = ValidationResults::aggregate(schema, file_results, started.elapsed());

        if let Some(callback) = &progress {
            callback(ValidationProgress {
                current_file: None,
                completed: total,
                total,
                phase: ValidationPhase::Complete,
            });
        }
        info!(
            total = results.total_files,
            valid = results.valid_files,
            invalid = results.invalid_files,
            errors = results.error_files,
            skipped = results.skipped_files,
            "validation finished"
        );
        Ok(results)
    }

    pub async fn validate_files(&self, files: Vec<PathBuf>) -> Result<Vec<FileValidationResult>> {
        self.validate_files_with_progress(files, None).await
    }

    /// Validates `files` concurrently. Results come back in the order of `files`.
    pub async fn validate_files_with_progress(
        &self,
        files: Vec<PathBuf>,
        progress: Option<ProgressCallback>,
    ) -> Result<Vec<FileValidationResult>> {
        if files.is_empty() {
            return Ok(Vec::new());
        }
        if self.engine.loaded_schema().is_none() {
            return Err(ValidationError::NoSchemaLoaded);
        }

        let total = files.len();
        let completed = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicBool::new(false));
        let semaphore = Arc::new(tokio::sync::Semaphore::new(
            self.config.max_concurrent_validations.max(1),
        ));

        let tasks: Vec<_> = files
            .into_iter()
            .map(|path| {
                let engine = Arc::clone(&self.engine);
                let semaphore = Arc::clone(&semaphore);
                let completed = Arc::clone(&completed);
                let stopped = Arc::clone(&stopped);
                let progress = progress.clone();
                let timeout = self.config.validation_timeout;
                let fail_fast = self.config.fail_fast;

                tokio::spawn(async move {
                    let _permit = semaphore.acquire().await.map_err(|_| {
                        ValidationError::Concurrency {
                            details: "validation semaphore closed".to_string(),
                        }
                    })?;

                    let result = if stopped.load(Ordering::SeqCst) {
                        FileValidationResult::skipped(path.clone(), "stopped after first failure")
                    } else {
                        validate_one(engine, path.clone(), timeout).await
                    };
                    if fail_fast && (result.status.is_invalid() || result.status.is_error()) {
                        stopped.store(true, Ordering::SeqCst);
                    }

                    let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                    if let Some(callback) = &progress {
                        callback(ValidationProgress {
                            current_file: Some(path),
                            completed: done,
                            total,
                            phase: ValidationPhase::Validation,
                        });
                    }
                    Ok::<FileValidationResult, ValidationError>(result)
                })
            })
            .collect();

        let joined = try_join_all(tasks)
            .await
            .map_err(|e| ValidationError::Concurrency {
                details: format!("validation task failed: {}", e),
            })?;
        joined.into_iter().collect()
    }
}

async fn validate_one(
    engine: Arc<ValidationEngine>,
    path: PathBuf,
    timeout: Duration,
) -> FileValidationResult {
    let started = Instant::now();
    let task_path = path.clone();
    let handle = tokio::task::spawn_blocking(move || {
        let sink = Arc::new(CollectingSink::new());
        let outcome = InputSource::from_path(&task_path)
            .and_then(|source| engine.validate_concurrent_with_sink(&source, sink.clone()));
        (outcome, sink.take())
    });

    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok((outcome, diagnostics))) => {
            FileValidationResult::from_outcome(path, outcome, diagnostics, started.elapsed())
        }
        Ok(Err(join_error)) => FileValidationResult::error(
            path,
            ValidationError::Concurrency {
                details: format!("Join error: {}", join_error),
            },
            started.elapsed(),
        ),
        Err(_) => FileValidationResult::error(
            path,
            ValidationError::Concurrency {
                details: format!("Validation timeout after {:?}", timeout),
            },
            timeout,
        ),
    }
}
