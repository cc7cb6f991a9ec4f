use log::{error, info, warn};
use minijinja::{context, Environment};

use crate::config::RepoConfig;
use crate::formatter::{BranchFormatter, MalformedMarkerError, POSTFIX_MERGE};
use crate::git::{Git, GitError};
use crate::provider::{Pr, RepoProvider};

/// Failures of the staging engine. The `is_expected` variants are normal
/// operational outcomes (an event raced a verdict, an operator asked for an
/// impossible promotion) that the dispatcher logs and drops; the rest are
/// repository inconsistencies or transport failures and fail the event
/// loudly.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error("cannot merge PR #{pr}: it has not been prepared yet")]
    NotPrepared { pr: u64 },

    #[error("cannot merge PR #{pr}: it is not marked as good")]
    NotMarkedGood { pr: u64 },

    #[error("cannot merge PR #{pr}: it is marked as bad")]
    MarkedBad { pr: u64 },

    #[error("cannot merge PR #{pr}: other PRs present in queue: {obstacles:?}")]
    NotHeadOfQueue { pr: u64, obstacles: Vec<String> },

    #[error("both {good} and {bad} are present on {commit}")]
    ConflictingVerdicts {
        commit: String,
        good: String,
        bad: String,
    },

    #[error("no merge marker among branches at {commit}: {branches:?}")]
    MissingMergeMarker {
        commit: String,
        branches: Vec<String>,
    },

    #[error(transparent)]
    MalformedMarker(#[from] MalformedMarkerError),

    #[error("failed to render the merge message template")]
    Template(#[from] minijinja::Error),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Provider(anyhow::Error),
}

impl FlowError {
    /// True for precondition violations the queue just keeps running over.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            FlowError::NotPrepared { .. }
                | FlowError::NotMarkedGood { .. }
                | FlowError::MarkedBad { .. }
                | FlowError::NotHeadOfQueue { .. }
        )
    }
}

/// Enqueues PR `pr_num` at the tail of the staging queue: snapshots its
/// pristine tip as the source marker (first enqueue only), rebases the head
/// branch on the queue tip, records a merge commit on the queue, and clears
/// any stale CI verdicts. Idempotent across re-enqueues because the head
/// branch is always reset to the source marker first.
pub fn prepare(
    git: &Git,
    pr_num: u64,
    provider: &dyn RepoProvider,
    config: &RepoConfig,
) -> Result<(), FlowError> {
    info!("stage started for #{pr_num}");
    let pr = provider.get_pr(pr_num).map_err(FlowError::Provider)?;
    let branches_global = BranchFormatter::new(config);
    let branches_pr = branches_global.pr(pr_num);

    // mark the original branch location as source, to use it for rebases later
    info!("remember source");
    if !git.branch_exists(&branches_pr.source) {
        git.new_branch(&branches_pr.source, &pr.branch_head, false)?;
    }

    // create the merge queue branch if it does not exist yet
    info!("ensure queue exists");
    if !git.branch_exists(&branches_global.queue) {
        git.new_branch(&branches_global.queue, &branches_global.target, false)?;
    }

    // drop whatever state the head branch is in right now, restage from source
    info!("move head to source");
    git.new_branch(&pr.branch_head, &branches_pr.source, true)?;

    info!("rebase onto queue");
    git.switched_branch(&pr.branch_head, || {
        // mark the current queue head as target for the rebase
        git.new_branch(&branches_pr.rebase, &branches_global.queue, true)?;
        git.rebase(&branches_pr.rebase)
    })?;

    info!("create merge-commit");
    let message = format_merge_message(&pr, config)?;
    let author = format_author(&pr);
    git.switched_branch(&branches_global.queue, || {
        git.merge(
            &pr.branch_head,
            &message,
            &author,
            &config.merge_template.author.name,
            &config.merge_template.author.email,
        )?;
        git.new_branch(&branches_pr.merge, "HEAD", true)
    })?;

    info!("push new queue");
    git.push(&branches_global.queue, true)?;

    // once the branch is enqueued, it is no longer bad nor good until CI
    // reports on the new merge commit
    info!("remove ci markers");
    let mut to_delete: Vec<&str> = Vec::new();
    if git.branch_exists(&branches_pr.bad) {
        to_delete.push(&branches_pr.bad);
    }
    if git.branch_exists(&branches_pr.good) {
        to_delete.push(&branches_pr.good);
    }
    if !to_delete.is_empty() {
        git.delete_branch(&to_delete, true)?;
    }
    info!("stage completed for #{pr_num}");
    Ok(())
}

/// Records a CI verdict for PR `pr_num` by planting the matching marker on
/// its merge commit and removing the opposite one.
pub fn mark(git: &Git, pr_num: u64, config: &RepoConfig, ci_ok: bool) -> Result<(), FlowError> {
    info!("mark started for #{pr_num}");
    let branches_pr = BranchFormatter::new(config).pr(pr_num);
    if !git.branch_exists(&branches_pr.merge) {
        return Err(FlowError::NotPrepared { pr: pr_num });
    }
    let (add, remove) = if ci_ok {
        (&branches_pr.good, &branches_pr.bad)
    } else {
        (&branches_pr.bad, &branches_pr.good)
    };
    git.new_branch(add, &branches_pr.merge, true)?;
    if git.branch_exists(remove) {
        git.delete_branch(&[remove], true)?;
    }
    info!("mark completed for #{pr_num}");
    Ok(())
}

/// Promotes PR `pr_num` to the target branch. Only valid for the slot
/// directly above the target, marked good and not bad; `shake` is the
/// normal caller.
pub fn merge(
    git: &Git,
    pr_num: u64,
    provider: &dyn RepoProvider,
    config: &RepoConfig,
) -> Result<(), FlowError> {
    info!("merge started for #{pr_num}");
    let pr = provider.get_pr(pr_num).map_err(FlowError::Provider)?;
    let branches_global = BranchFormatter::new(config);
    let branches_pr = branches_global.pr(pr_num);

    info!("checking branch preconditions");
    if !git.branch_exists(&branches_pr.merge) {
        return Err(FlowError::NotPrepared { pr: pr_num });
    }
    if !git.branch_exists(&branches_pr.good) {
        return Err(FlowError::NotMarkedGood { pr: pr_num });
    }
    if git.branch_exists(&branches_pr.bad) {
        return Err(FlowError::MarkedBad { pr: pr_num });
    }
    let below = format!("{}~1", branches_pr.merge);
    let obstacles = collect_staging(git, &below, &branches_global.target)?;
    if !obstacles.is_empty() {
        return Err(FlowError::NotHeadOfQueue {
            pr: pr_num,
            obstacles: obstacles.into_iter().map(|(hash, _)| hash).collect(),
        });
    }

    // switch away in case we are currently on the target branch: the
    // checked-out branch cannot be reset
    info!("moving target to HEAD");
    git.switched_branch(&branches_pr.merge, || {
        git.new_branch(&branches_global.target, "HEAD", true)
    })?;

    // First push the pr branch, then push the target, in 2 separate pushes.
    // Otherwise github loses its head and displays sillyness in the PR
    // commit list.
    info!("pushing head");
    git.push(&pr.branch_head, true)?;
    info!("pushing target");
    git.push(&branches_global.target, false)?;

    git.delete_branch(
        &[
            branches_pr.merge.as_str(),
            branches_pr.source.as_str(),
            branches_pr.rebase.as_str(),
            branches_pr.good.as_str(),
            pr.branch_head.as_str(),
        ],
        true,
    )?;
    git.push_delete(&pr.branch_head)?;
    info!("merge completed for #{pr_num}");
    Ok(())
}

/// Drains consecutive good slots from the head of the queue, promoting each
/// in turn. A bad slot is evicted and the tail rebuilt on the advanced
/// target; a slot without a verdict ends the walk untouched.
pub fn shake(
    git: &Git,
    provider: &dyn RepoProvider,
    config: &RepoConfig,
) -> Result<(), FlowError> {
    info!("shake started");
    let branches_global = BranchFormatter::new(config);
    if !git.branch_exists(&branches_global.queue) {
        info!("no queue branch yet, nothing to shake");
        return Ok(());
    }
    let mut stage = collect_staging(git, &branches_global.queue, &branches_global.target)?;
    stage.reverse(); // queue order: the oldest slot sits directly above the target
    let stage_str: String = stage
        .iter()
        .map(|(hash, branches)| format!("\n - {hash} {branches:?}"))
        .collect();
    info!("stage collected: {stage_str}");

    for (idx, (hash, branches)) in stage.iter().enumerate() {
        let pr = branches_global
            .extract_pr_from_branches(branches)?
            .ok_or_else(|| FlowError::MissingMergeMarker {
                commit: hash.clone(),
                branches: branches.clone(),
            })?;
        info!("check {hash} - #{pr}");
        let branches_pr = branches_global.pr(pr);
        verdicts_consistent(hash, branches, &branches_pr.good, &branches_pr.bad)?;

        if branches.contains(&branches_pr.good) {
            info!("pr is good, merge it");
            merge(git, pr, provider, config)?;
        } else if branches.contains(&branches_pr.bad) {
            // the only way to get here is that every previous slot was good
            // and has been merged, so the target now points at the last
            // merge; rebuild the remainder on top of it
            info!("pr is bad, rebase remaining queue");
            discard(git, pr, provider, config)?;
            rebase_queue_onto(git, &stage[idx + 1..], provider, config)?;
            info!("shake completed, ignore rest of queue");
            return Ok(());
        } else {
            // no verdict yet: CI is still running on this slot, leave
            // everything downstream alone
            info!("shake completed, ignore rest of queue");
            return Ok(());
        }
    }
    info!("shake completed, nothing left");
    Ok(())
}

fn verdicts_consistent(
    commit: &str,
    branches: &[String],
    good: &str,
    bad: &str,
) -> Result<(), FlowError> {
    if branches.iter().any(|b| b == good) && branches.iter().any(|b| b == bad) {
        let err = FlowError::ConflictingVerdicts {
            commit: commit.to_owned(),
            good: good.to_owned(),
            bad: bad.to_owned(),
        };
        error!("{err}");
        return Err(err);
    }
    Ok(())
}

/// Rebuilds the queue on the current target and re-prepares every remaining
/// PR in original order, dropping the ones marked bad at this point.
fn rebase_queue_onto(
    git: &Git,
    remaining: &[(String, Vec<String>)],
    provider: &dyn RepoProvider,
    config: &RepoConfig,
) -> Result<(), FlowError> {
    info!("queue rebase started");
    let branches_global = BranchFormatter::new(config);
    git.new_branch(&branches_global.queue, &branches_global.target, true)?;
    for (hash, branches) in remaining {
        let pr = branches_global
            .extract_pr_from_branches(branches)?
            .ok_or_else(|| FlowError::MissingMergeMarker {
                commit: hash.clone(),
                branches: branches.clone(),
            })?;
        info!("rebasing {hash} - #{pr}");
        let branches_pr = branches_global.pr(pr);
        verdicts_consistent(hash, branches, &branches_pr.good, &branches_pr.bad)?;
        if branches.contains(&branches_pr.bad) {
            info!("pr was marked bad, drop it");
            discard(git, pr, provider, config)?;
            continue;
        }
        info!("pr is not bad, re-enqueue it");
        prepare(git, pr, provider, config)?;
    }
    info!("queue rebase completed");
    Ok(())
}

/// Removes every local trace of an evicted PR: its marker branches and its
/// local head branch. The remote head branch belongs to the author and is
/// kept. Dropping the local head matters for a later re-enqueue: the next
/// `prepare` then snapshots a fresh source from the remote-tracking ref
/// instead of a stale rebased tip.
fn discard(
    git: &Git,
    pr_num: u64,
    provider: &dyn RepoProvider,
    config: &RepoConfig,
) -> Result<(), FlowError> {
    info!("discarding #{pr_num}");
    let branches_pr = BranchFormatter::new(config).pr(pr_num);
    let mut doomed: Vec<String> = Vec::new();
    for name in [
        &branches_pr.source,
        &branches_pr.rebase,
        &branches_pr.merge,
        &branches_pr.good,
        &branches_pr.bad,
    ] {
        if git.branch_exists(name) {
            doomed.push(name.clone());
        }
    }
    match provider.get_pr(pr_num) {
        Ok(pr) => {
            if git.branch_exists(&pr.branch_head) {
                doomed.push(pr.branch_head);
            }
        }
        Err(err) => warn!("cannot resolve the head branch of #{pr_num}: {err:#}"),
    }
    if !doomed.is_empty() {
        let refs: Vec<&str> = doomed.iter().map(String::as_str).collect();
        git.delete_branch(&refs, true)?;
    }
    Ok(())
}

/// Walks the history from `staging_branch` until the first commit decorated
/// with `target_branch` and collects the commits carrying a merge marker,
/// newest first. Side branches reachable through second parents carry no
/// markers, so only queue slots survive the filter.
pub fn collect_staging(
    git: &Git,
    staging_branch: &str,
    target_branch: &str,
) -> Result<Vec<(String, Vec<String>)>, FlowError> {
    let log = git.log(staging_branch)?;
    let mut result = Vec::new();
    for (commit, branches) in log {
        if branches.iter().any(|b| b == target_branch) {
            break;
        }
        if branches.iter().any(|b| b.ends_with(POSTFIX_MERGE)) {
            result.push((commit, branches));
        }
    }
    Ok(result)
}

/// Maps a commit reported by CI back to the PR whose merge marker sits on
/// it. `None` when the commit is unknown locally or carries no marker — CI
/// also runs on plain branch pushes.
pub fn find_pr_matching_commit(
    git: &Git,
    commit: &str,
    config: &RepoConfig,
) -> Result<Option<u64>, FlowError> {
    if git.hash_of(commit).is_err() {
        return Ok(None);
    }
    let branches = git.branches_at_ref(commit)?;
    Ok(BranchFormatter::new(config).extract_pr_from_branches(&branches)?)
}

fn format_merge_message(pr: &Pr, config: &RepoConfig) -> Result<String, FlowError> {
    let env = Environment::new();
    let rendered = env
        .template_from_str(&config.merge_template.template)?
        .render(context! { pr => pr, cfg => config })?;
    Ok(rendered.trim().to_owned())
}

/// The author line for the merge commit. GitHub attributes commits through
/// its noreply address scheme; with a numeric user id the id-qualified form
/// links the commit to the account even after renames.
fn format_author(pr: &Pr) -> String {
    let username = &pr.author.username;
    let mut email = format!("{username}@users.noreply.github.com");
    if let Some(id) = pr.author.id {
        email = format!("{id}+{email}");
    }
    format!("{username} <{email}>")
}
