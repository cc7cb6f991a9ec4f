use std::{
    fs,
    path::{Path, PathBuf},
};

use log::{info, warn};

use crate::defaults::GIT_ORIGIN;

use super::git_lowlevel::capture_git_output;
use super::git_types::{GitError, GitOutput};

/// Handle to one local working copy. Every operation is a single `git`
/// invocation rooted at the held path; nothing depends on the process
/// current directory.
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Git {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn run(&self, args: &[&str]) -> Result<GitOutput, GitError> {
        capture_git_output(args, &self.workdir)
    }

    pub fn current_branch(&self) -> Result<String, GitError> {
        let name = self
            .run(&["rev-parse", "--abbrev-ref", "HEAD"])?
            .stdout
            .trim()
            .to_owned();
        if name == "HEAD" {
            return Err(GitError::DetachedHead);
        }
        Ok(name)
    }

    pub fn hash_of(&self, reference: &str) -> Result<String, GitError> {
        self.run(&["rev-parse", "--verify", "-q", reference])
            .map_err(|_e| GitError::MissingRef {
                reference: reference.into(),
            })
            .map(|s| s.stdout.trim().to_owned())
    }

    pub fn branch_exists(&self, name: &str) -> bool {
        let reference = format!("refs/heads/{name}");
        self.run(&["show-ref", "--verify", "--quiet", &reference])
            .is_ok()
    }

    pub fn new_branch(&self, name: &str, at: &str, force: bool) -> Result<(), GitError> {
        let mut args = vec!["branch", name, at];
        if force {
            args.push("--force");
        }
        self.run(&args).map(|_| ())
    }

    pub fn delete_branch(&self, names: &[&str], force: bool) -> Result<(), GitError> {
        let mut args = vec!["branch", if force { "-D" } else { "-d" }];
        args.extend(names);
        self.run(&args).map(|_| ())
    }

    pub fn checkout(&self, name: &str) -> Result<(), GitError> {
        self.run(&["checkout", name]).map(|_| ())
    }

    /// Scoped checkout: switches to `branch`, runs `f`, and switches back to
    /// the previously current branch on every path. When `f` failed, its
    /// error wins over a failing restore (which is only logged).
    pub fn switched_branch<T, F>(&self, branch: &str, f: F) -> Result<T, GitError>
    where
        F: FnOnce() -> Result<T, GitError>,
    {
        let previous = self.current_branch()?;
        self.checkout(branch)?;
        let result = f();
        let restored = self.checkout(&previous);
        match (result, restored) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(restore_err)) => Err(restore_err),
            (Err(err), restored) => {
                if let Err(restore_err) = restored {
                    warn!("failed to restore branch {previous}: {restore_err}");
                }
                Err(err)
            }
        }
    }

    /// Like [`Git::switched_branch`], but recreates `branch` from `source`
    /// first, force-deleting any existing branch of that name.
    pub fn switched_branch_anew<T, F>(
        &self,
        branch: &str,
        source: &str,
        f: F,
    ) -> Result<T, GitError>
    where
        F: FnOnce() -> Result<T, GitError>,
    {
        if self.branch_exists(branch) {
            self.delete_branch(&[branch], true)?;
        }
        let previous = self.current_branch()?;
        self.run(&["checkout", "-B", branch, source])?;
        let result = f();
        let restored = self.checkout(&previous);
        match (result, restored) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(restore_err)) => Err(restore_err),
            (Err(err), restored) => {
                if let Err(restore_err) = restored {
                    warn!("failed to restore branch {previous}: {restore_err}");
                }
                Err(err)
            }
        }
    }

    /// For each commit reachable from `head`, newest first, yields
    /// `(full hash, [local branches at that commit])`. Commits without any
    /// local branch decoration are skipped.
    pub fn log(&self, head: &str) -> Result<Vec<(String, Vec<String>)>, GitError> {
        let output = self.run(&["log", "--format=%H%x00%D", head])?;
        let mut result = Vec::new();
        for line in output.stdout.lines() {
            let Some((hash, decorations)) = line.split_once('\0') else {
                continue;
            };
            let branches = extract_branches_from_line(decorations, &[GIT_ORIGIN]);
            if !branches.is_empty() {
                result.push((hash.to_owned(), branches));
            }
        }
        Ok(result)
    }

    pub fn branches_at_ref(&self, reference: &str) -> Result<Vec<String>, GitError> {
        let output = self.run(&["branch", "--points-at", reference])?;
        // first 2 symbols are either `* ` for the current branch or `  ` for the rest
        Ok(output
            .stdout
            .lines()
            .filter(|line| line.len() > 2)
            .map(|line| line[2..].to_owned())
            .collect())
    }

    /// Rebases the current branch onto `onto`. A stopped rebase is aborted
    /// before the error is returned, so the working copy never stays in a
    /// rebase-in-progress state.
    pub fn rebase(&self, onto: &str) -> Result<(), GitError> {
        match self.run(&["rebase", onto]) {
            Ok(_) => Ok(()),
            Err(GitError::ExecError { output, .. }) => {
                if let Err(abort_err) = self.run(&["rebase", "--abort"]) {
                    warn!("failed to abort stopped rebase: {abort_err}");
                }
                Err(GitError::RebaseConflict {
                    onto: onto.to_owned(),
                    output,
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Merges `what` into the current branch as a merge commit with distinct
    /// author and committer. Plain `git merge` cannot set the author, so this
    /// is `--no-ff --no-commit` followed by an explicit commit. An
    /// incomplete merge is aborted before the error is returned.
    pub fn merge(
        &self,
        what: &str,
        message: &str,
        author: &str,
        committer_name: &str,
        committer_email: &str,
    ) -> Result<(), GitError> {
        let name = format!("user.name={committer_name}");
        let email = format!("user.email={committer_email}");
        let merge = self.run(&[
            "-c", &name, "-c", &email, "merge", what, "--no-ff", "--no-commit",
        ]);
        if let Err(err) = merge {
            if let GitError::ExecError { output, .. } = err {
                if let Err(abort_err) = self.run(&["merge", "--abort"]) {
                    warn!("failed to abort incomplete merge: {abort_err}");
                }
                return Err(GitError::MergeConflict {
                    what: what.to_owned(),
                    output,
                });
            }
            return Err(err);
        }
        // `--no-commit` leaves MERGE_HEAD behind. When it is absent the
        // merge was a no-op (the branch is already contained) and the tip
        // stays put; re-enqueues of unchanged PRs hit this path.
        if self.run(&["rev-parse", "-q", "--verify", "MERGE_HEAD"]).is_err() {
            info!("merge of {what}: already up to date");
            return Ok(());
        }
        let committed = self.run(&[
            "-c",
            &name,
            "-c",
            &email,
            "commit",
            "--author",
            author,
            "--cleanup=whitespace",
            "-m",
            message,
        ]);
        if let Err(err) = committed {
            if let Err(abort_err) = self.run(&["merge", "--abort"]) {
                warn!("failed to abort incomplete merge: {abort_err}");
            }
            return Err(err);
        }
        Ok(())
    }

    pub fn push(&self, name: &str, force: bool) -> Result<(), GitError> {
        let mut args = vec!["push", "-u", GIT_ORIGIN, name];
        if force {
            args.push("--force");
        }
        self.run(&args).map(|_| ())
    }

    pub fn push_delete(&self, name: &str) -> Result<(), GitError> {
        self.run(&["push", GIT_ORIGIN, "--delete", name, "--force"])
            .map(|_| ())
    }

    pub fn fetch(&self) -> Result<(), GitError> {
        self.run(&["fetch"]).map(|_| ())
    }

    /// Populates the (empty) workdir from `origin`.
    pub fn clone_from(&self, origin: &str) -> Result<(), GitError> {
        self.run(&["clone", origin, "."]).map(|_| ())
    }

    pub fn remote_url(&self) -> Result<String, GitError> {
        self.run(&["remote", "get-url", GIT_ORIGIN])
            .map(|s| s.stdout.trim().to_owned())
    }

    /// Sets the repo-local committer identity. Rebasing and merging create
    /// commits, and a fresh clone has no identity configured.
    pub fn set_identity(&self, name: &str, email: &str) -> Result<(), GitError> {
        self.run(&["config", "user.name", name])?;
        self.run(&["config", "user.email", email])?;
        Ok(())
    }

    /// Writes a file named after `name` and commits it. Used to produce
    /// synthetic history for generated pull requests.
    pub fn commit_new_file(&self, name: &str) -> Result<(), GitError> {
        fs::write(self.workdir.join(name), format!("{name}\n")).map_err(GitError::IoError)?;
        self.run(&["add", name])?;
        self.run(&["commit", "-m", name])?;
        Ok(())
    }
}

/// Extracts local branch names from a `%D` decoration line, dropping
/// remote-tracking refs, tags, a bare HEAD, and the `HEAD -> x` arrow.
pub fn extract_branches_from_line(line: &str, remotes: &[&str]) -> Vec<String> {
    let remote_prefixes: Vec<String> = remotes
        .iter()
        .map(|r| format!("{}/", r.trim_end_matches('/')))
        .collect();
    let mut result = Vec::new();
    for item in line.trim().split(", ") {
        let mut item = item;
        if item.is_empty() || item == "HEAD" {
            continue;
        }
        if item.starts_with("tag: ") {
            continue;
        }
        if remote_prefixes.iter().any(|p| item.starts_with(p.as_str())) {
            continue;
        }
        if let Some((_, target)) = item.split_once("->") {
            item = target;
        }
        result.push(item.trim().to_owned());
    }
    result
}

/// Clears any clone at `path` and clones `origin` into it afresh.
pub fn reclone(path: &Path, origin: &str) -> Result<Git, GitError> {
    if path.exists() {
        info!("path {} exists, removing", path.display());
        fs::remove_dir_all(path).map_err(GitError::IoError)?;
    }
    fs::create_dir_all(path).map_err(GitError::IoError)?;
    let git = Git::new(path);
    git.clone_from(origin)?;
    Ok(git)
}
