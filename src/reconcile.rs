//! Reference reconciler.
//!
//! Merges the staging namespace written by the last fetch into the published
//! reference namespace. Four outcomes per reference: create a ref that never
//! existed, leave an identical ref alone, fast-forward when the new target
//! provably contains the old one, or treat the update as diverged. Diverged
//! updates never happen implicitly: without a conflict policy the published
//! ref is left untouched, and an accepted replacement is always preceded by a
//! timestamped backup of the old target.

use anyhow::{anyhow, Context, Result};
use tracing::{debug, error, info, warn};

use crate::refs::{backup_ref_name, is_staging_ref, published_name, NamedRef, RefStore};

/// Decision callback for diverged (non-fast-forward) updates.
///
/// Invoked with the staging ref, the published ref it would replace, and the
/// backup name the old target would be preserved under. Returning `true`
/// accepts the replacement. Policies only report a decision; they must not
/// mutate the reference store being reconciled.
pub trait ConflictPolicy {
    fn accept(&self, staging: &NamedRef, published: &NamedRef, backup_name: &str) -> bool;
}

impl<F> ConflictPolicy for F
where
    F: Fn(&NamedRef, &NamedRef, &str) -> bool,
{
    fn accept(&self, staging: &NamedRef, published: &NamedRef, backup_name: &str) -> bool {
        self(staging, published, backup_name)
    }
}

/// Accept every diverged update. The old target is still backed up first.
pub struct ReplaceWithBackup;

impl ConflictPolicy for ReplaceWithBackup {
    fn accept(&self, staging: &NamedRef, published: &NamedRef, backup_name: &str) -> bool {
        info!(
            "Accepting diverged update of {} from {}; old target will be kept as {}",
            published.name, staging.name, backup_name
        );
        true
    }
}

/// What happened to one published reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefOutcome {
    /// No published ref existed; it was created from the staging target.
    Created,
    /// Staging and published targets were already identical.
    Unchanged,
    /// The published ref was fast-forwarded to the staging target.
    FastForwarded,
    /// Diverged update accepted: old target preserved under `backup_name`.
    Replaced { backup_name: String },
    /// Diverged update declined (or no policy); the published ref is intact.
    Skipped,
}

#[derive(Debug, Clone)]
pub struct RefUpdate {
    pub name: String,
    pub outcome: RefOutcome,
}

#[derive(Debug, Clone)]
pub struct RefFailure {
    pub name: String,
    pub error: String,
}

/// Aggregate result of one reconcile pass.
///
/// Failures are per-reference: one bad reference never aborts the batch.
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub updates: Vec<RefUpdate>,
    pub failures: Vec<RefFailure>,
}

impl ReconcileReport {
    fn count(&self, matches: impl Fn(&RefOutcome) -> bool) -> usize {
        self.updates.iter().filter(|u| matches(&u.outcome)).count()
    }

    pub fn created(&self) -> usize {
        self.count(|o| matches!(o, RefOutcome::Created))
    }

    pub fn unchanged(&self) -> usize {
        self.count(|o| matches!(o, RefOutcome::Unchanged))
    }

    pub fn fast_forwarded(&self) -> usize {
        self.count(|o| matches!(o, RefOutcome::FastForwarded))
    }

    pub fn replaced(&self) -> usize {
        self.count(|o| matches!(o, RefOutcome::Replaced { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, RefOutcome::Skipped))
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Applies the staging namespace to the published namespace of one store.
pub struct Reconciler<'a, S: RefStore + ?Sized> {
    store: &'a S,
}

impl<'a, S: RefStore + ?Sized> Reconciler<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Reconcile every staging reference into its published counterpart.
    ///
    /// Running this twice without an intervening fetch leaves the published
    /// set unchanged (everything lands on [`RefOutcome::Unchanged`]).
    pub fn reconcile(&self, policy: Option<&dyn ConflictPolicy>) -> Result<ReconcileReport> {
        let mut staging: Vec<String> = self
            .store
            .ref_names()
            .context("failed to list references")?
            .into_iter()
            .filter(|name| is_staging_ref(name))
            .collect();
        staging.sort();

        let mut report = ReconcileReport::default();
        for staging_name in staging {
            // The filter above guarantees the prefix is present.
            let Some(dest_name) = published_name(&staging_name) else {
                continue;
            };
            match self.update_one(&staging_name, &dest_name, policy) {
                Ok(outcome) => report.updates.push(RefUpdate {
                    name: dest_name,
                    outcome,
                }),
                Err(err) => {
                    error!("Failed to update {} from {}: {:#}", dest_name, staging_name, err);
                    report.failures.push(RefFailure {
                        name: dest_name,
                        error: format!("{:#}", err),
                    });
                }
            }
        }
        Ok(report)
    }

    fn update_one(
        &self,
        staging_name: &str,
        dest_name: &str,
        policy: Option<&dyn ConflictPolicy>,
    ) -> Result<RefOutcome> {
        let staging_target = self
            .store
            .lookup(staging_name)?
            .ok_or_else(|| anyhow!("staging ref {} vanished during reconciliation", staging_name))?;

        let Some(dest_target) = self.store.lookup(dest_name)? else {
            debug!("Copy staging ref {} to new ref {}", staging_name, dest_name);
            self.store
                .create(
                    dest_name,
                    &staging_target,
                    &format!("gitvault: create {} from {}", dest_name, staging_name),
                )
                .with_context(|| format!("failed to create {}", dest_name))?;
            return Ok(RefOutcome::Created);
        };

        if staging_target == dest_target {
            debug!("{} and {} are already equal", staging_name, dest_name);
            return Ok(RefOutcome::Unchanged);
        }

        if let (Some(new), Some(old)) = (staging_target.oid(), dest_target.oid()) {
            if self.store.is_descendant(new, old)? {
                info!("Fast-forward {} to {}", dest_name, staging_name);
                self.store
                    .force_set(
                        dest_name,
                        &staging_target,
                        &format!("gitvault: fast-forward {} to {}", dest_name, staging_name),
                    )
                    .with_context(|| format!("failed to fast-forward {}", dest_name))?;
                return Ok(RefOutcome::FastForwarded);
            }
        }

        // Diverged, or one side is symbolic. Nothing is overwritten without
        // an explicit decision and a backup of the old target.
        let backup_name = backup_ref_name(self.store, dest_name)?;
        let staging = NamedRef::new(staging_name, staging_target.clone());
        let published = NamedRef::new(dest_name, dest_target.clone());

        match policy {
            None => {
                warn!(
                    "{} and {} have diverged; leaving {} untouched",
                    staging_name, dest_name, dest_name
                );
                return Ok(RefOutcome::Skipped);
            }
            Some(policy) if !policy.accept(&staging, &published, &backup_name) => {
                info!("Skip diverged staging ref {}", staging_name);
                return Ok(RefOutcome::Skipped);
            }
            Some(_) => {}
        }

        self.store
            .create(
                &backup_name,
                &dest_target,
                &format!("gitvault: back up {} before replacement", dest_name),
            )
            .with_context(|| format!("failed to back up {} as {}", dest_name, backup_name))?;
        info!("Backed up old ref to {}", backup_name);
        self.store
            .force_set(
                dest_name,
                &staging_target,
                &format!(
                    "gitvault: replace {} with {}, old target backed up as {}",
                    dest_name, staging_name, backup_name
                ),
            )
            .with_context(|| format!("failed to replace {}", dest_name))?;
        Ok(RefOutcome::Replaced { backup_name })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refs::{MockRefStore, RefTarget};
    use assert_matches::assert_matches;
    use git2::Oid;
    use mockall::predicate::{always, eq};
    use std::cell::RefCell;
    use std::collections::{BTreeMap, HashMap};

    const STAGING_MASTER: &str = "refs/git-backup/origin/heads/master";
    const PUBLISHED_MASTER: &str = "refs/heads/master";

    fn oid(n: u8) -> Oid {
        Oid::from_str(&format!("{:040x}", n)).unwrap()
    }

    /// In-memory reference store with an explicit ancestry graph.
    #[derive(Default)]
    struct MemStore {
        refs: RefCell<BTreeMap<String, RefTarget>>,
        parents: HashMap<Oid, Vec<Oid>>,
    }

    impl MemStore {
        fn link(&mut self, child: Oid, parent: Oid) {
            self.parents.entry(child).or_default().push(parent);
        }

        fn set_ref(&self, name: &str, target: RefTarget) {
            self.refs.borrow_mut().insert(name.to_string(), target);
        }

        fn get(&self, name: &str) -> Option<RefTarget> {
            self.refs.borrow().get(name).cloned()
        }

        fn backup_names(&self) -> Vec<String> {
            self.refs
                .borrow()
                .keys()
                .filter(|k| k.contains("_replaced_"))
                .cloned()
                .collect()
        }
    }

    impl RefStore for MemStore {
        fn ref_names(&self) -> Result<Vec<String>> {
            Ok(self.refs.borrow().keys().cloned().collect())
        }

        fn lookup(&self, name: &str) -> Result<Option<RefTarget>> {
            Ok(self.get(name))
        }

        fn create(&self, name: &str, target: &RefTarget, _log: &str) -> Result<()> {
            let mut refs = self.refs.borrow_mut();
            if refs.contains_key(name) {
                return Err(anyhow!("ref {} already exists", name));
            }
            refs.insert(name.to_string(), target.clone());
            Ok(())
        }

        fn force_set(&self, name: &str, target: &RefTarget, _log: &str) -> Result<()> {
            self.refs
                .borrow_mut()
                .insert(name.to_string(), target.clone());
            Ok(())
        }

        fn is_descendant(&self, commit: Oid, ancestor: Oid) -> Result<bool> {
            // Strict ancestry walk: a commit is not its own descendant.
            let mut queue: Vec<Oid> = self
                .parents
                .get(&commit)
                .cloned()
                .unwrap_or_default();
            while let Some(id) = queue.pop() {
                if id == ancestor {
                    return Ok(true);
                }
                if let Some(parents) = self.parents.get(&id) {
                    queue.extend(parents.iter().copied());
                }
            }
            Ok(false)
        }
    }

    /// C1 <- C2 linear history, C3 unrelated.
    fn history() -> (MemStore, Oid, Oid, Oid) {
        let mut store = MemStore::default();
        let (c1, c2, c3) = (oid(1), oid(2), oid(3));
        store.link(c2, c1);
        (store, c1, c2, c3)
    }

    #[test]
    fn brand_new_ref_is_created() {
        let (store, _, c2, _) = history();
        store.set_ref(
            "refs/git-backup/origin/heads/newbranch",
            RefTarget::Direct(c2),
        );

        let report = Reconciler::new(&store).reconcile(None).unwrap();

        assert_eq!(report.created(), 1);
        assert!(report.is_clean());
        assert_eq!(
            store.get("refs/heads/newbranch"),
            Some(RefTarget::Direct(c2))
        );
    }

    #[test]
    fn identical_refs_are_left_alone() {
        let (store, c1, _, _) = history();
        store.set_ref(STAGING_MASTER, RefTarget::Direct(c1));
        store.set_ref(PUBLISHED_MASTER, RefTarget::Direct(c1));

        let report = Reconciler::new(&store).reconcile(None).unwrap();

        assert_eq!(report.unchanged(), 1);
        assert_eq!(report.created(), 0);
        assert_eq!(store.get(PUBLISHED_MASTER), Some(RefTarget::Direct(c1)));
    }

    #[test]
    fn fast_forward_updates_without_backup() {
        let (store, c1, c2, _) = history();
        store.set_ref(STAGING_MASTER, RefTarget::Direct(c2));
        store.set_ref(PUBLISHED_MASTER, RefTarget::Direct(c1));

        let report = Reconciler::new(&store).reconcile(None).unwrap();

        assert_eq!(report.fast_forwarded(), 1);
        assert_eq!(store.get(PUBLISHED_MASTER), Some(RefTarget::Direct(c2)));
        assert!(store.backup_names().is_empty());
    }

    #[test]
    fn reconcile_is_idempotent() {
        let (store, c1, c2, _) = history();
        store.set_ref(STAGING_MASTER, RefTarget::Direct(c2));
        store.set_ref(PUBLISHED_MASTER, RefTarget::Direct(c1));

        let first = Reconciler::new(&store).reconcile(None).unwrap();
        let snapshot = store.refs.borrow().clone();
        let second = Reconciler::new(&store).reconcile(None).unwrap();

        assert_eq!(first.fast_forwarded(), 1);
        assert_eq!(second.fast_forwarded(), 0);
        assert_eq!(second.unchanged(), second.updates.len());
        assert_eq!(*store.refs.borrow(), snapshot);
    }

    #[test]
    fn diverged_ref_without_policy_is_never_touched() {
        let (store, c1, _, c3) = history();
        store.set_ref(STAGING_MASTER, RefTarget::Direct(c3));
        store.set_ref(PUBLISHED_MASTER, RefTarget::Direct(c1));

        for _ in 0..3 {
            let report = Reconciler::new(&store).reconcile(None).unwrap();
            assert_eq!(report.skipped(), 1);
            assert_eq!(store.get(PUBLISHED_MASTER), Some(RefTarget::Direct(c1)));
            assert!(store.backup_names().is_empty());
        }
    }

    #[test]
    fn accepted_divergence_backs_up_old_target_first() {
        let (store, c1, _, c3) = history();
        store.set_ref(STAGING_MASTER, RefTarget::Direct(c3));
        store.set_ref(PUBLISHED_MASTER, RefTarget::Direct(c1));

        let report = Reconciler::new(&store)
            .reconcile(Some(&ReplaceWithBackup))
            .unwrap();

        assert_eq!(report.replaced(), 1);
        assert_eq!(store.get(PUBLISHED_MASTER), Some(RefTarget::Direct(c3)));

        let backups = store.backup_names();
        assert_eq!(backups.len(), 1);
        assert!(backups[0].starts_with("refs/heads/master_replaced_"));
        // The backup preserves the target the published ref had before.
        assert_eq!(store.get(&backups[0]), Some(RefTarget::Direct(c1)));
    }

    #[test]
    fn declined_divergence_leaves_ref_and_creates_no_backup() {
        let (store, c1, _, c3) = history();
        store.set_ref(STAGING_MASTER, RefTarget::Direct(c3));
        store.set_ref(PUBLISHED_MASTER, RefTarget::Direct(c1));

        let seen: RefCell<Vec<(String, String, String)>> = RefCell::new(Vec::new());
        let decline = |staging: &NamedRef, published: &NamedRef, backup: &str| {
            seen.borrow_mut().push((
                staging.name.clone(),
                published.name.clone(),
                backup.to_string(),
            ));
            false
        };

        let report = Reconciler::new(&store).reconcile(Some(&decline)).unwrap();

        assert_eq!(report.skipped(), 1);
        assert_eq!(store.get(PUBLISHED_MASTER), Some(RefTarget::Direct(c1)));
        assert!(store.backup_names().is_empty());

        let calls = seen.borrow();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, STAGING_MASTER);
        assert_eq!(calls[0].1, PUBLISHED_MASTER);
        assert!(calls[0].2.starts_with("refs/heads/master_replaced_"));
    }

    #[test]
    fn symbolic_published_ref_counts_as_diverged() {
        let (store, _, c2, _) = history();
        store.set_ref(STAGING_MASTER, RefTarget::Direct(c2));
        store.set_ref(
            PUBLISHED_MASTER,
            RefTarget::Symbolic("refs/heads/main".to_string()),
        );

        let report = Reconciler::new(&store).reconcile(None).unwrap();

        assert_eq!(report.skipped(), 1);
        assert_eq!(
            store.get(PUBLISHED_MASTER),
            Some(RefTarget::Symbolic("refs/heads/main".to_string()))
        );
    }

    #[test]
    fn equal_symbolic_targets_are_left_alone() {
        let (store, _, _, _) = history();
        let alias = RefTarget::Symbolic("refs/heads/main".to_string());
        store.set_ref(STAGING_MASTER, alias.clone());
        store.set_ref(PUBLISHED_MASTER, alias.clone());

        let report = Reconciler::new(&store).reconcile(None).unwrap();

        assert_eq!(report.unchanged(), 1);
        assert_eq!(store.get(PUBLISHED_MASTER), Some(alias));
    }

    #[test]
    fn one_failing_ref_does_not_abort_the_batch() {
        let broken = "refs/git-backup/origin/heads/broken";
        let healthy = "refs/git-backup/origin/heads/healthy";

        let mut store = MockRefStore::new();
        store
            .expect_ref_names()
            .returning(move || Ok(vec![broken.to_string(), healthy.to_string()]));
        store
            .expect_lookup()
            .with(eq(broken))
            .returning(|_| Ok(Some(RefTarget::Direct(oid(1)))));
        store
            .expect_lookup()
            .with(eq(healthy))
            .returning(|_| Ok(Some(RefTarget::Direct(oid(2)))));
        store
            .expect_lookup()
            .with(eq("refs/heads/broken"))
            .returning(|_| Ok(None));
        store
            .expect_lookup()
            .with(eq("refs/heads/healthy"))
            .returning(|_| Ok(None));
        store
            .expect_create()
            .with(eq("refs/heads/broken"), always(), always())
            .returning(|_, _, _| Err(anyhow!("disk full")));
        store
            .expect_create()
            .with(eq("refs/heads/healthy"), always(), always())
            .returning(|_, _, _| Ok(()));

        let report = Reconciler::new(&store).reconcile(None).unwrap();

        assert_eq!(report.created(), 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].name, "refs/heads/broken");
        assert!(report.failures[0].error.contains("disk full"));
        assert_matches!(report.updates[0].outcome, RefOutcome::Created);
    }
}
