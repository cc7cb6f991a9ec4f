use regex::Regex;

use crate::config::RepoConfig;

/// Marker suffix recording the untouched tip of the PR's head branch
pub const POSTFIX_SOURCE: &str = "source";

/// Marker suffix pointing at the queue tip a PR was rebased onto
pub const POSTFIX_REBASE: &str = "rebase-target";

/// Marker suffix identifying a PR's merge commit on the queue. This value is
/// the key by which queue slots are recognized, so it is wire-level.
pub const POSTFIX_MERGE: &str = "merge-after-rebase";

/// Marker suffix present iff CI passed on the merge commit
pub const POSTFIX_GOOD: &str = "good";

/// Marker suffix present iff CI failed on the merge commit
pub const POSTFIX_BAD: &str = "bad";

/// Name of the queue branch inside the configured folder
pub const QUEUE_NAME: &str = "queue";

/// Canonical ref names for one repository: the queue branch, the target
/// branch, and per-PR marker names. Pure; no repository access.
pub struct BranchFormatter {
    folder: String,
    pub queue: String,
    pub target: String,
}

impl BranchFormatter {
    pub fn new(config: &RepoConfig) -> Self {
        let folder = config.branching.branch_folder.trim_end_matches('/').to_owned();
        let queue = format!("{folder}/{QUEUE_NAME}");
        BranchFormatter {
            folder,
            queue,
            target: config.branching.target_branch.clone(),
        }
    }

    pub fn pr(&self, pr: u64) -> PrBranches {
        let folder = &self.folder;
        PrBranches {
            source: format!("{folder}/pr{pr}/{POSTFIX_SOURCE}"),
            rebase: format!("{folder}/pr{pr}/{POSTFIX_REBASE}"),
            merge: format!("{folder}/pr{pr}/{POSTFIX_MERGE}"),
            good: format!("{folder}/pr{pr}/{POSTFIX_GOOD}"),
            bad: format!("{folder}/pr{pr}/{POSTFIX_BAD}"),
        }
    }

    /// Finds the merge marker among a commit's branch decorations and
    /// extracts the PR number embedded in it. `None` when no decoration is a
    /// merge marker; an error when a decoration pretends to be one but does
    /// not parse (a repository inconsistency the caller must not ignore).
    pub fn extract_pr_from_branches(
        &self,
        branches: &[String],
    ) -> Result<Option<u64>, MalformedMarkerError> {
        let regex = self.merge_marker_regex();
        for branch in branches {
            if !branch.ends_with(POSTFIX_MERGE) {
                continue;
            }
            let number = regex
                .captures(branch)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse::<u64>().ok())
                .ok_or_else(|| MalformedMarkerError {
                    branch: branch.clone(),
                })?;
            return Ok(Some(number));
        }
        Ok(None)
    }

    fn merge_marker_regex(&self) -> Regex {
        let folder = regex::escape(&self.folder);
        let postfix = regex::escape(POSTFIX_MERGE);
        Regex::new(&format!(r"^{folder}/pr(\d+)/{postfix}$"))
            .expect("merge marker regex must compile")
    }
}

#[derive(Debug, Clone)]
pub struct PrBranches {
    pub source: String,
    pub rebase: String,
    pub merge: String,
    pub good: String,
    pub bad: String,
}

#[derive(Debug, thiserror::Error)]
#[error("branch {branch} looks like a merge marker but does not parse")]
pub struct MalformedMarkerError {
    pub branch: String,
}
