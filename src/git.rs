//! Git transport adapter: the [`RefStore`] implementation backed by libgit2
//! and the clone manager that keeps one local bare mirror per remote
//! repository.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use git2::{AutotagOption, ErrorCode, FetchOptions, FetchPrune, Oid, ReferenceType, Repository};
use path_clean::PathClean;
use thiserror::Error;
use tracing::{debug, info};

use crate::refs::{RefStore, RefTarget, STAGING_PREFIX, TRACKED_PREFIXES};
use crate::sources::{CredentialConfig, RemoteRepo};

/// Fatal per-repository errors from the clone manager.
///
/// Each of these aborts the owning repository's backup and nothing else.
#[derive(Debug, Error)]
pub enum CloneError {
    #[error("destination path {path:?} escapes the backup directory")]
    UnsafePath { path: PathBuf },

    #[error("repository at {path:?} does not have an 'origin' remote")]
    MissingOrigin { path: PathBuf },

    #[error("'origin' remote at {path:?} has URL {actual:?} instead of {expected:?}")]
    OriginUrlMismatch {
        path: PathBuf,
        actual: String,
        expected: String,
    },

    #[error("failed to create backup directory {path:?}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Git(#[from] git2::Error),
}

fn ref_target(reference: &git2::Reference<'_>) -> Result<RefTarget> {
    if reference.kind() == Some(ReferenceType::Symbolic) {
        let dest = reference
            .symbolic_target()
            .context("symbolic reference target is not valid UTF-8")?;
        Ok(RefTarget::Symbolic(dest.to_string()))
    } else {
        let oid = reference
            .target()
            .context("direct reference has no target")?;
        Ok(RefTarget::Direct(oid))
    }
}

impl RefStore for Repository {
    fn ref_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for reference in self.references()? {
            let reference = reference?;
            if let Some(name) = reference.name() {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    fn lookup(&self, name: &str) -> Result<Option<RefTarget>> {
        match self.find_reference(name) {
            Ok(reference) => Ok(Some(ref_target(&reference)?)),
            Err(err) if err.code() == ErrorCode::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn create(&self, name: &str, target: &RefTarget, log_message: &str) -> Result<()> {
        match target {
            RefTarget::Direct(oid) => {
                self.reference(name, *oid, false, log_message)?;
            }
            RefTarget::Symbolic(dest) => {
                self.reference_symbolic(name, dest, false, log_message)?;
            }
        }
        Ok(())
    }

    fn force_set(&self, name: &str, target: &RefTarget, log_message: &str) -> Result<()> {
        match target {
            RefTarget::Direct(oid) => {
                self.reference(name, *oid, true, log_message)?;
            }
            RefTarget::Symbolic(dest) => {
                self.reference_symbolic(name, dest, true, log_message)?;
            }
        }
        Ok(())
    }

    fn is_descendant(&self, commit: Oid, ancestor: Oid) -> Result<bool> {
        Ok(self.graph_descendant_of(commit, ancestor)?)
    }
}

/// One remote repository's local bare mirror.
///
/// Ensures the clone exists, belongs to the expected remote and has the
/// staging fetch configuration, then fetches. All published-namespace writes
/// are left to the reconciler.
pub struct LocalClone {
    repo: RemoteRepo,
    dest_path: PathBuf,
}

impl LocalClone {
    pub fn new(repo: &RemoteRepo, base_dir: &Path) -> Result<Self, CloneError> {
        let dest_path = base_dir.join(format!("{}.git", repo.full_name));

        // `full_name` comes from a remote API; it must stay under base_dir.
        let bad_component = repo
            .full_name
            .split('/')
            .any(|part| part.is_empty() || part == "." || part == "..");
        if bad_component || !dest_path.clean().starts_with(base_dir.clean()) {
            return Err(CloneError::UnsafePath { path: dest_path });
        }

        Ok(Self {
            repo: repo.clone(),
            dest_path,
        })
    }

    pub fn dest_path(&self) -> &Path {
        &self.dest_path
    }

    /// Open the local mirror, creating a bare repository tracking the remote
    /// if none exists yet. Does not touch the network.
    pub fn ensure(&self) -> Result<Repository, CloneError> {
        if self.dest_path.exists() {
            self.open_existing()
        } else {
            self.init_new()
        }
    }

    fn init_new(&self) -> Result<Repository, CloneError> {
        debug!(
            "New bare clone of {} at {:?}",
            self.repo.full_name, self.dest_path
        );
        if let Some(parent) = self.dest_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| CloneError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let repo = Repository::init_bare(&self.dest_path)?;
        repo.remote("origin", &self.repo.url)?;
        Ok(repo)
    }

    fn open_existing(&self) -> Result<Repository, CloneError> {
        debug!(
            "Repo {} is already cloned at {:?}",
            self.repo.full_name, self.dest_path
        );
        let repo = Repository::open(&self.dest_path)?;
        {
            let origin = match repo.find_remote("origin") {
                Ok(remote) => remote,
                Err(err) if err.code() == ErrorCode::NotFound => {
                    return Err(CloneError::MissingOrigin {
                        path: self.dest_path.clone(),
                    })
                }
                Err(err) => return Err(err.into()),
            };
            let actual = origin.url().unwrap_or_default().to_string();
            if actual != self.repo.url {
                // Never silently repoint a clone at a different remote.
                return Err(CloneError::OriginUrlMismatch {
                    path: self.dest_path.clone(),
                    actual,
                    expected: self.repo.url.clone(),
                });
            }
        }
        Ok(repo)
    }

    /// Rewrite the origin fetch refspecs so every branch and tag is staged
    /// under [`STAGING_PREFIX`], with pruning and tag auto-follow disabled.
    ///
    /// Idempotent: the configuration is only rewritten when the current
    /// refspec set differs from the expected one.
    pub fn configure_fetch(&self, repo: &Repository) -> Result<(), CloneError> {
        let mut config = repo.config()?;

        let expected: Vec<String> = TRACKED_PREFIXES
            .iter()
            .map(|prefix| format!("+refs/{}/*:{}{}/*", prefix, STAGING_PREFIX, prefix))
            .collect();

        let mut current = Vec::new();
        match config.multivar("remote.origin.fetch", None) {
            Ok(mut entries) => {
                while let Some(entry) = entries.next() {
                    let entry = entry?;
                    if let Some(value) = entry.value() {
                        current.push(value.to_string());
                    }
                }
            }
            Err(err) if err.code() == ErrorCode::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        let mut current_sorted = current.clone();
        current_sorted.sort();
        let mut expected_sorted = expected.clone();
        expected_sorted.sort();

        if current_sorted != expected_sorted {
            debug!(
                "Replacing fetch refspecs of {:?}: {:?} -> {:?}",
                self.dest_path, current, expected
            );
            if !current.is_empty() {
                config.remove_multivar("remote.origin.fetch", ".*")?;
            }
            for refspec in &expected {
                // `^$` matches no existing line, so each call appends.
                config.set_multivar("remote.origin.fetch", "^$", refspec)?;
            }
        }

        config.set_bool("remote.origin.prune", false)?;
        config.set_str("remote.origin.tagOpt", "--no-tags")?;
        Ok(())
    }

    /// Fetch all remote branches and tags into the staging namespace.
    ///
    /// Staging refs are force-updated: they are a transient scratch area and
    /// divergence is only ever judged against the published namespace.
    pub fn fetch(&self, repo: &Repository, creds: &CredentialConfig) -> Result<(), CloneError> {
        self.configure_fetch(repo)?;

        let mut remote = repo.find_remote("origin")?;
        info!(
            "Fetching {} from 'origin' ({:?})",
            self.repo.full_name,
            remote.url().unwrap_or_default()
        );

        let mut opts = FetchOptions::new();
        opts.prune(FetchPrune::Off);
        opts.download_tags(AutotagOption::None);
        opts.remote_callbacks(creds.callbacks());
        remote.fetch(&[] as &[&str], Some(&mut opts), None)?;
        Ok(())
    }
}
