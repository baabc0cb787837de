//! Common test fixtures for gitvault tests

#![allow(dead_code)]

use git2::{Oid, Repository, Signature};
use gitvault::sources::RemoteRepo;
use tempfile::TempDir;

/// A scratch "remote" repository built with libgit2 and served over the
/// local file transport, so backup cycles run without any network.
pub struct SourceRepo {
    pub dir: TempDir,
    pub repo: Repository,
    pub c1: Oid,
    pub c2: Oid,
}

impl SourceRepo {
    /// master with two commits, a fork branch at the first commit, and two
    /// lightweight tags.
    pub fn simple() -> Self {
        let dir = TempDir::new().expect("create temp dir");
        let repo = Repository::init_bare(dir.path()).expect("init source repo");

        let c1 = commit_file(
            &repo,
            &[],
            Some("refs/heads/master"),
            "README.md",
            "# Simple repo\n",
            "Initial commit",
        );
        let c2 = commit_file(
            &repo,
            &[c1],
            Some("refs/heads/master"),
            "CHANGES.md",
            "changes\n",
            "Add CHANGES.md",
        );

        repo.reference("refs/heads/fork1", c1, true, "test branch")
            .unwrap();
        repo.reference("refs/tags/initial_commit", c1, true, "test tag")
            .unwrap();
        repo.reference("refs/tags/latest", c2, true, "test tag")
            .unwrap();

        Self { dir, repo, c1, c2 }
    }

    pub fn url(&self) -> String {
        self.dir.path().to_str().expect("utf-8 path").to_string()
    }

    pub fn remote(&self, full_name: &str) -> RemoteRepo {
        RemoteRepo {
            url: self.url(),
            full_name: full_name.to_string(),
            name: full_name.rsplit('/').next().unwrap().to_string(),
        }
    }

    /// Append a commit on top of a branch and return its id.
    pub fn add_commit(&self, branch: &str, file: &str, content: &str, message: &str) -> Oid {
        let refname = format!("refs/heads/{}", branch);
        let parent = self
            .repo
            .find_reference(&refname)
            .ok()
            .and_then(|r| r.target());
        let parents: Vec<Oid> = parent.into_iter().collect();
        commit_file(&self.repo, &parents, Some(&refname), file, content, message)
    }

    /// Rewrite a branch to an unrelated root commit, as a force-push would.
    pub fn rewrite_branch(&self, branch: &str, file: &str, content: &str, message: &str) -> Oid {
        let oid = commit_file(&self.repo, &[], None, file, content, message);
        self.force_ref(&format!("refs/heads/{}", branch), oid);
        oid
    }

    pub fn force_ref(&self, refname: &str, oid: Oid) {
        self.repo
            .reference(refname, oid, true, "test reset")
            .unwrap();
    }

    pub fn delete_ref(&self, refname: &str) {
        let mut reference = self.repo.find_reference(refname).unwrap();
        reference.delete().unwrap();
    }

    pub fn tip(&self, refname: &str) -> Oid {
        self.repo
            .find_reference(refname)
            .unwrap()
            .target()
            .unwrap()
    }
}

/// Write `file` into a tree layered on the first parent's tree and commit it,
/// optionally updating `update_ref`.
pub fn commit_file(
    repo: &Repository,
    parents: &[Oid],
    update_ref: Option<&str>,
    file: &str,
    content: &str,
    message: &str,
) -> Oid {
    let sig = Signature::now("Test Author", "test@example.com").unwrap();
    let blob = repo.blob(content.as_bytes()).unwrap();

    let base_tree = parents
        .first()
        .map(|oid| repo.find_commit(*oid).unwrap().tree().unwrap());
    let mut builder = repo.treebuilder(base_tree.as_ref()).unwrap();
    builder.insert(file, blob, 0o100644).unwrap();
    let tree_id = builder.write().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();

    let parent_commits: Vec<_> = parents
        .iter()
        .map(|oid| repo.find_commit(*oid).unwrap())
        .collect();
    let parent_refs: Vec<&git2::Commit> = parent_commits.iter().collect();

    repo.commit(update_ref, &sig, &sig, message, &tree, &parent_refs)
        .unwrap()
}
