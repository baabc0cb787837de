//! Backup engine - orchestrates per-source, per-repository backups
//!
//! For every configured source: connect, list repositories, then run the
//! clone -> fetch -> reconcile pipeline per repository on a bounded worker
//! pool. Repositories are independent; one failure never stops the batch.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use regex::Regex;
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

use crate::config::{Config, SourceEntry};
use crate::git::LocalClone;
use crate::reconcile::{ReconcileReport, Reconciler, ReplaceWithBackup};
use crate::sources::{CredentialConfig, GitSource, RemoteRepo};

/// Result of backing up one repository
#[derive(Debug)]
pub enum BackupResult {
    /// The pipeline ran; the report may still carry per-reference failures
    Completed {
        repo: RemoteRepo,
        report: ReconcileReport,
    },
    /// Clone, fetch or reconciliation failed outright
    Failed { repo: RemoteRepo, error: String },
}

/// A source that could not be connected or listed
#[derive(Debug)]
pub struct SourceFailure {
    pub source: String,
    pub error: String,
}

/// Results from a complete backup run
#[derive(Debug)]
pub struct BackupSummary {
    pub duration: Duration,
    pub results: Vec<BackupResult>,
    pub failed_sources: Vec<SourceFailure>,
}

impl BackupSummary {
    pub fn repos_completed(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r, BackupResult::Completed { .. }))
            .count()
    }

    pub fn repos_failed(&self) -> usize {
        self.results.len() - self.repos_completed()
    }

    fn sum_refs(&self, count: impl Fn(&ReconcileReport) -> usize) -> usize {
        self.results
            .iter()
            .filter_map(|r| match r {
                BackupResult::Completed { report, .. } => Some(count(report)),
                BackupResult::Failed { .. } => None,
            })
            .sum()
    }

    pub fn refs_created(&self) -> usize {
        self.sum_refs(|r| r.created())
    }

    pub fn refs_unchanged(&self) -> usize {
        self.sum_refs(|r| r.unchanged())
    }

    pub fn refs_fast_forwarded(&self) -> usize {
        self.sum_refs(|r| r.fast_forwarded())
    }

    pub fn refs_replaced(&self) -> usize {
        self.sum_refs(|r| r.replaced())
    }

    pub fn refs_skipped(&self) -> usize {
        self.sum_refs(|r| r.skipped())
    }

    pub fn ref_failures(&self) -> usize {
        self.sum_refs(|r| r.failures.len())
    }

    pub fn is_clean(&self) -> bool {
        self.failed_sources.is_empty() && self.repos_failed() == 0 && self.ref_failures() == 0
    }
}

/// Options for one backup run
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Only process the source with this name
    pub source: Option<String>,

    /// Overwrite diverged refs after backing up the old target
    pub accept_diverged: bool,
}

/// The main engine driving clone -> fetch -> reconcile across all sources
pub struct BackupEngine {
    config: Arc<Config>,
    exclude: Vec<Regex>,
}

impl BackupEngine {
    pub fn new(config: Config) -> Result<Self> {
        let exclude = config
            .backup
            .exclude_patterns
            .iter()
            .map(|pattern| glob_to_regex(pattern))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            config: Arc::new(config),
            exclude,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run a complete backup across the configured sources
    pub async fn run(&self, options: &RunOptions) -> Result<BackupSummary> {
        let start = Instant::now();
        let base_dir = PathBuf::from(&self.config.clone_base_dir);

        let accept_diverged = options.accept_diverged || self.config.backup.accept_diverged;

        let mut results = Vec::new();
        let mut failed_sources = Vec::new();
        let mut matched = false;

        for entry in &self.config.sources {
            if let Some(filter) = &options.source {
                if &entry.name != filter {
                    continue;
                }
            }
            matched = true;

            info!("Backing up repos from source {}", entry.name);
            match self
                .backup_source(entry, &base_dir, accept_diverged)
                .await
            {
                Ok(mut source_results) => results.append(&mut source_results),
                Err(err) => {
                    error!("Source {} failed: {:#}", entry.name, err);
                    failed_sources.push(SourceFailure {
                        source: entry.name.clone(),
                        error: format!("{:#}", err),
                    });
                }
            }
        }

        if let Some(filter) = &options.source {
            if !matched {
                bail!("no source named {:?} in the configuration", filter);
            }
        }

        let summary = BackupSummary {
            duration: start.elapsed(),
            results,
            failed_sources,
        };

        info!(
            "Backup completed in {:.2}s: {} repos backed up, {} failed, refs: {} created, {} fast-forwarded, {} replaced, {} diverged-skipped",
            summary.duration.as_secs_f64(),
            summary.repos_completed(),
            summary.repos_failed(),
            summary.refs_created(),
            summary.refs_fast_forwarded(),
            summary.refs_replaced(),
            summary.refs_skipped(),
        );

        Ok(summary)
    }

    async fn backup_source(
        &self,
        entry: &SourceEntry,
        base_dir: &Path,
        accept_diverged: bool,
    ) -> Result<Vec<BackupResult>> {
        let source = GitSource::connect(&entry.provider)
            .await
            .context("failed to connect to source")?;
        let repos = source
            .list_repos()
            .await
            .context("failed to list repositories")?;
        info!("Source {} has {} repositories", entry.name, repos.len());

        let creds = source.credentials();
        let source_dir = base_dir.join(&entry.name);
        let semaphore = Arc::new(Semaphore::new(self.config.backup.max_parallel.max(1)));

        let mut futures = FuturesUnordered::new();
        for repo in repos {
            if self.is_excluded(&repo.full_name) {
                debug!("Excluding repository {}", repo.full_name);
                continue;
            }

            let semaphore = Arc::clone(&semaphore);
            let creds = creds.clone();
            let source_dir = source_dir.clone();
            futures.push(async move {
                let _permit = semaphore.acquire().await.expect("Semaphore closed");

                let task_repo = repo.clone();
                let joined = tokio::task::spawn_blocking(move || {
                    backup_one(&task_repo, &source_dir, &creds, accept_diverged)
                })
                .await;
                (repo, joined)
            });
        }

        let mut outcomes = Vec::new();
        while let Some((repo, joined)) = futures.next().await {
            match joined {
                Ok(Ok(report)) => {
                    info!(
                        "Backed up {}: {} created, {} fast-forwarded, {} replaced, {} skipped, {} failed",
                        repo.full_name,
                        report.created(),
                        report.fast_forwarded(),
                        report.replaced(),
                        report.skipped(),
                        report.failures.len(),
                    );
                    outcomes.push(BackupResult::Completed { repo, report });
                }
                Ok(Err(err)) => {
                    error!("Backup of {} failed: {:#}", repo.full_name, err);
                    outcomes.push(BackupResult::Failed {
                        repo,
                        error: format!("{:#}", err),
                    });
                }
                Err(join_err) => {
                    error!("Backup task for {} panicked: {}", repo.full_name, join_err);
                    outcomes.push(BackupResult::Failed {
                        repo,
                        error: join_err.to_string(),
                    });
                }
            }
        }

        Ok(outcomes)
    }

    fn is_excluded(&self, full_name: &str) -> bool {
        self.exclude.iter().any(|re| re.is_match(full_name))
    }
}

/// Clone, fetch and reconcile one repository. Blocking.
fn backup_one(
    repo: &RemoteRepo,
    source_dir: &Path,
    creds: &CredentialConfig,
    accept_diverged: bool,
) -> Result<ReconcileReport> {
    let clone = LocalClone::new(repo, source_dir)?;
    let git_repo = clone.ensure()?;
    clone.fetch(&git_repo, creds)?;

    let reconciler = Reconciler::new(&git_repo);
    if accept_diverged {
        reconciler.reconcile(Some(&ReplaceWithBackup))
    } else {
        reconciler.reconcile(None)
    }
}

fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let escaped = pattern.replace('.', r"\.").replace('*', ".*");
    Regex::new(&format!("^{}$", escaped))
        .with_context(|| format!("invalid exclude pattern {:?}", pattern))
}
