use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use log::{debug, error, info, warn};

use crate::config::{read_repo_config, RepoConfig};
use crate::defaults::{COMMAND_PREFIX, COMMAND_REACTION, GIT_ORIGIN};
use crate::events::{Event, EventKind, EventReceiver};
use crate::flow::{self, FlowError};
use crate::git::{reclone, Git};
use crate::provider::Provider;

/// Single consumer of the event queue. Owns the working directory all
/// clones live under; processing one event at a time is what guarantees the
/// flow engine an exclusively-owned repository.
pub struct Dispatcher<P: Provider> {
    workdir: PathBuf,
    provider: P,
}

impl<P: Provider> Dispatcher<P> {
    pub fn new(workdir: impl Into<PathBuf>, provider: P) -> Self {
        Dispatcher {
            workdir: workdir.into(),
            provider,
        }
    }

    /// Consumes events until a `Stop` arrives or every producer is gone.
    /// Failed events never end the loop: expected flow failures are demoted
    /// to warnings, everything else is logged as an error.
    pub fn run(&self, events: &EventReceiver) {
        while let Ok(event) = events.recv() {
            debug!("processing event {} (cause: {})", event.id, event.cause);
            let stop = matches!(event.kind, EventKind::Stop);
            if let Err(err) = self.process(&event) {
                match err.downcast_ref::<FlowError>() {
                    Some(flow_err) if flow_err.is_expected() => {
                        warn!("event {} failed: {flow_err}", event.id);
                    }
                    _ => error!("event {} failed: {err:#}", event.id),
                }
            }
            if stop {
                break;
            }
            debug!("next event...");
        }
        info!("done with the queue");
    }

    fn process(&self, event: &Event) -> Result<()> {
        match &event.kind {
            EventKind::Initialize => {
                info!("initializing available repos");
                self.handle_initialize()
            }
            EventKind::Ping => {
                info!("Pong!");
                Ok(())
            }
            EventKind::Stop => {
                info!("requested to stop; qram will now exit");
                Ok(())
            }
            EventKind::PrComment {
                repo,
                pr,
                comment_id,
                body,
            } => {
                info!("a comment was posted on PR #{pr}");
                self.handle_pr_comment(repo, *pr, *comment_id, body)
            }
            EventKind::CheckCompleted { repo, commit, good } => {
                info!("a check completed on {commit}");
                self.handle_check_completed(repo, commit, *good)
            }
        }
    }

    fn handle_initialize(&self) -> Result<()> {
        let repos = self.provider.list_repositories()?;
        for full_name in repos {
            info!("--- cloning {full_name}");
            let path = self.repo_path(&full_name)?;
            let clone_url = self.provider.repo_clone_url(&full_name)?;
            let git = reclone(&path, &clone_url)
                .with_context(|| format!("cloning {full_name}"))?;
            // Rebases and merges create commits; a fresh clone has no
            // committer identity configured.
            let config = read_repo_config(&path)?;
            git.set_identity(
                &config.merge_template.author.name,
                &config.merge_template.author.email,
            )?;
            info!("--- {full_name} cloned");
        }
        Ok(())
    }

    fn handle_pr_comment(
        &self,
        repo: &str,
        pr: u64,
        comment_id: u64,
        body: &str,
    ) -> Result<()> {
        let body = body.trim();
        if !body.starts_with(COMMAND_PREFIX) {
            info!("it is just some comment");
            return Ok(());
        }
        info!("it is meant for us!");

        let repo_api = self.provider.repo(repo)?;
        // The reaction is an acknowledgement, nothing depends on it.
        info!("reacting \"{COMMAND_REACTION}\" to comment {comment_id} in {repo}");
        if let Err(err) = repo_api.post_reaction(comment_id, COMMAND_REACTION) {
            warn!("reaction to comment failed: {err:#}");
        }

        let command = body[COMMAND_PREFIX.len()..].trim();
        if command == "go" || command.starts_with("go ") {
            let (git, config) = self.open_repo(repo)?;
            git.fetch()?;
            // The engine expects the head branch to resolve locally; a fetch
            // only updates the remote-tracking ref.
            let head = repo_api.get_pr(pr)?.branch_head;
            if !git.branch_exists(&head) {
                git.new_branch(&head, &format!("{GIT_ORIGIN}/{head}"), false)?;
            }
            flow::prepare(&git, pr, repo_api.as_ref(), &config)?;
        } else {
            info!("unknown command: {command}");
        }
        Ok(())
    }

    fn handle_check_completed(&self, repo: &str, commit: &str, good: bool) -> Result<()> {
        let (git, config) = self.open_repo(repo)?;
        match flow::find_pr_matching_commit(&git, commit, &config)? {
            None => {
                // CI also reports on plain branch pushes.
                info!("no queue slot at {commit}, ignoring");
                Ok(())
            }
            Some(pr) => {
                let repo_api = self.provider.repo(repo)?;
                flow::mark(&git, pr, &config, good)?;
                flow::shake(&git, repo_api.as_ref(), &config)?;
                Ok(())
            }
        }
    }

    fn open_repo(&self, full_name: &str) -> Result<(Git, RepoConfig)> {
        let path = self.repo_path(full_name)?;
        if !path.is_dir() {
            bail!("repository {full_name} has not been initialized");
        }
        let config = read_repo_config(&path)?;
        Ok((Git::new(path), config))
    }

    /// Maps `owner/repo` below the working directory, rejecting anything
    /// that could escape it.
    fn repo_path(&self, full_name: &str) -> Result<PathBuf> {
        let mut parts = full_name.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(owner), Some(name), None)
                if !owner.is_empty() && !name.is_empty() && owner != ".." && name != ".." =>
            {
                Ok(self.workdir.join(owner).join(name))
            }
            _ => bail!("suspicious repository name: {full_name}"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::provider::{Pr, RepoProvider};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingProvider {
        reactions: AtomicUsize,
    }

    struct CountingRepo<'a> {
        parent: &'a CountingProvider,
    }

    impl RepoProvider for CountingRepo<'_> {
        fn get_pr(&self, _number: u64) -> Result<Pr> {
            bail!("not expected in this test")
        }

        fn create_pr(&self, _branch: &str, _title: &str, _base: &str) -> Result<u64> {
            bail!("not expected in this test")
        }

        fn post_reaction(&self, _comment_id: u64, _content: &str) -> Result<()> {
            self.parent.reactions.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl Provider for CountingProvider {
        fn repo<'a>(&'a self, _full_name: &str) -> Result<Box<dyn RepoProvider + 'a>> {
            Ok(Box::new(CountingRepo { parent: self }))
        }

        fn repo_clone_url(&self, _full_name: &str) -> Result<String> {
            bail!("not expected in this test")
        }

        fn list_repositories(&self) -> Result<Vec<String>> {
            Ok(vec![])
        }

        fn configure_webhook(&self, _url: &str, _secret: Option<&str>) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_plain_comment_is_ignored() {
        let dispatcher = Dispatcher::new("unused", CountingProvider::default());
        dispatcher
            .handle_pr_comment("acme/widgets", 1, 77, "nice work!")
            .unwrap();
        assert_eq!(dispatcher.provider.reactions.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unknown_command_still_gets_reaction() {
        let dispatcher = Dispatcher::new("unused", CountingProvider::default());
        dispatcher
            .handle_pr_comment("acme/widgets", 1, 77, "!qram dance")
            .unwrap();
        assert_eq!(dispatcher.provider.reactions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_repo_path_rejects_traversal() {
        let dispatcher = Dispatcher::new("/work", CountingProvider::default());
        assert!(dispatcher.repo_path("owner/repo").is_ok());
        assert!(dispatcher.repo_path("../escape").is_err());
        assert!(dispatcher.repo_path("owner/../escape").is_err());
        assert!(dispatcher.repo_path("owner/repo/extra").is_err());
        assert!(dispatcher.repo_path("owner").is_err());
        assert!(dispatcher.repo_path("/repo").is_err());
    }

    #[test]
    fn test_stop_ends_the_loop() {
        let dispatcher = Dispatcher::new("unused", CountingProvider::default());
        let (sender, receiver) = crate::events::event_channel();
        sender
            .send(Event::new(EventKind::Ping).caused_by("test"))
            .unwrap();
        sender
            .send(Event::new(EventKind::Stop).caused_by("test"))
            .unwrap();
        // Events queued after Stop must not be processed.
        sender
            .send(
                Event::new(EventKind::PrComment {
                    repo: "acme/widgets".to_owned(),
                    pr: 1,
                    comment_id: 1,
                    body: "!qram go".to_owned(),
                })
                .caused_by("test"),
            )
            .unwrap();
        dispatcher.run(&receiver);
        assert_eq!(dispatcher.provider.reactions.load(Ordering::SeqCst), 0);
    }
}
