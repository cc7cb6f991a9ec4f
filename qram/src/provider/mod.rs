use anyhow::Result;
use serde::Serialize;

pub mod github;

/// Pull request metadata as the flow engine needs it. Serializable because
/// the merge message template receives it as `pr`.
#[derive(Debug, Clone, Serialize)]
pub struct Pr {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub branch_head: String,
    pub author: Author,
}

#[derive(Debug, Clone, Serialize)]
pub struct Author {
    pub username: String,
    pub id: Option<u64>,
}

/// Provider capabilities scoped to one repository.
pub trait RepoProvider {
    fn get_pr(&self, number: u64) -> Result<Pr>;

    fn create_pr(&self, branch: &str, title: &str, base: &str) -> Result<u64>;

    /// Records a reaction on an issue comment. Callers never depend on the
    /// outcome beyond logging.
    fn post_reaction(&self, comment_id: u64, content: &str) -> Result<()>;
}

/// Provider capabilities for the whole installation.
pub trait Provider {
    fn repo<'a>(&'a self, full_name: &str) -> Result<Box<dyn RepoProvider + 'a>>;

    /// Clone URL for `full_name` with access credentials embedded.
    fn repo_clone_url(&self, full_name: &str) -> Result<String>;

    fn list_repositories(&self) -> Result<Vec<String>>;

    fn configure_webhook(&self, url: &str, secret: Option<&str>) -> Result<()>;
}
