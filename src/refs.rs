//! Reference model and naming conventions.
//!
//! Everything fetched from a remote lands in the private staging namespace
//! `refs/git-backup/origin/` and is only promoted into the published
//! `refs/heads/*` / `refs/tags/*` namespace by the reconciler. Both the
//! staging prefix and the `_replaced_<timestamp>` backup pattern are part of
//! the on-disk contract shared with existing backups and must not change.

use anyhow::Result;
use chrono::{DateTime, Utc};
use git2::Oid;

/// Namespace prefix for staging references written by `git fetch`.
pub const STAGING_PREFIX: &str = "refs/git-backup/origin/";

/// Reference kinds mirrored from the remote.
pub const TRACKED_PREFIXES: &[&str] = &["heads", "tags"];

/// Target of a reference: a direct object id or a symbolic alias.
///
/// Equality is strict: variant and payload must both match. A direct id and a
/// symbolic alias are never equal, even if the alias resolves to the same
/// commit, so a reconcile pass never silently converts one into the other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefTarget {
    Direct(Oid),
    Symbolic(String),
}

impl RefTarget {
    /// The object id, if this is a direct target.
    pub fn oid(&self) -> Option<Oid> {
        match self {
            RefTarget::Direct(oid) => Some(*oid),
            RefTarget::Symbolic(_) => None,
        }
    }
}

impl std::fmt::Display for RefTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RefTarget::Direct(oid) => write!(f, "{}", oid),
            RefTarget::Symbolic(name) => write!(f, "ref: {}", name),
        }
    }
}

/// A named reference paired with its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedRef {
    pub name: String,
    pub target: RefTarget,
}

impl NamedRef {
    pub fn new(name: impl Into<String>, target: RefTarget) -> Self {
        Self {
            name: name.into(),
            target,
        }
    }
}

/// Whether `name` lives in the staging namespace.
pub fn is_staging_ref(name: &str) -> bool {
    name.starts_with(STAGING_PREFIX)
}

/// Derive the published name for a staging reference.
///
/// `refs/git-backup/origin/heads/master` becomes `refs/heads/master`. Returns
/// `None` for names outside the staging namespace.
pub fn published_name(staging_name: &str) -> Option<String> {
    staging_name
        .strip_prefix(STAGING_PREFIX)
        .map(|rest| format!("refs/{}", rest))
}

/// Capability surface the reconciler and clone manager need from a reference
/// store. Implemented for [`git2::Repository`] in [`crate::git`].
#[cfg_attr(test, mockall::automock)]
pub trait RefStore {
    /// All reference names currently in the store.
    fn ref_names(&self) -> Result<Vec<String>>;

    /// Target of the named reference, or `None` if it does not exist.
    fn lookup(&self, name: &str) -> Result<Option<RefTarget>>;

    /// Create a reference that must not already exist.
    fn create(&self, name: &str, target: &RefTarget, log_message: &str) -> Result<()>;

    /// Point an existing reference at a new target, recording `log_message`.
    fn force_set(&self, name: &str, target: &RefTarget, log_message: &str) -> Result<()>;

    /// Whether `commit` has `ancestor` in its history (strictly: equal ids
    /// are not descendants of each other).
    fn is_descendant(&self, commit: Oid, ancestor: Oid) -> Result<bool>;
}

/// Pick an unused name for backing up `original` before a diverged overwrite.
///
/// The candidate is `<original>_replaced_<UTC timestamp>`; numeric suffixes
/// `_1`, `_2`, ... resolve same-second collisions. The search is bounded only
/// by the number of existing references and terminates on the first free name.
pub fn backup_ref_name<S: RefStore + ?Sized>(store: &S, original: &str) -> Result<String> {
    backup_ref_name_at(store, original, Utc::now())
}

fn backup_ref_name_at<S: RefStore + ?Sized>(
    store: &S,
    original: &str,
    now: DateTime<Utc>,
) -> Result<String> {
    let base = format!("{}_replaced_{}", original, now.format("%Y-%m-%d_%H-%M-%S"));
    if store.lookup(&base)?.is_none() {
        return Ok(base);
    }
    for n in 1u64.. {
        let candidate = format!("{}_{}", base, n);
        if store.lookup(&candidate)?.is_none() {
            return Ok(candidate);
        }
    }
    unreachable!("ran out of numeric backup suffixes")
}
