//! Centralized default values and wire constants.
//!
//! Defaults apply when neither the repository config nor the environment
//! provides a value. The command prefix and reaction are wire-level: the
//! former is what authors type in PR comments, the latter is what GitHub
//! accepts as a reaction content string.

/// Default folder all queue and marker branches live under.
pub const DEFAULT_BRANCH_FOLDER: &str = "mq";

/// Default protected branch PRs are promoted into.
pub const DEFAULT_TARGET_BRANCH: &str = "main";

/// Default committer identity for merge commits on the queue.
pub const DEFAULT_MERGE_AUTHOR_NAME: &str = "qram";
pub const DEFAULT_MERGE_AUTHOR_EMAIL: &str = "qram@no.email";

/// Default merge commit message template (minijinja, `pr` and `cfg` in
/// scope).
pub const DEFAULT_MERGE_TEMPLATE: &str =
    "Merge PR #{{ pr.number }}: {{ pr.title }}\n\n{{ pr.body }}";

/// Comment command prefix the dispatcher reacts to.
pub const COMMAND_PREFIX: &str = "!qram";

/// Reaction recorded on every command comment.
pub const COMMAND_REACTION: &str = "rocket";

/// Default webhook server bind address.
pub const DEFAULT_BIND_TO: &str = "127.0.0.1";

/// Default webhook server port.
pub const DEFAULT_PORT: u16 = 7890;

/// Timeout for outbound provider HTTP calls, in seconds.
pub const DEFAULT_HTTP_TIMEOUT_SECONDS: u64 = 30;

/// Maximum elapsed time for exponential backoff around provider token
/// acquisition, in seconds.
pub const DEFAULT_BACKOFF_MAX_ELAPSED_SECONDS: u64 = 60;

/// The standard git remote name.
pub const GIT_ORIGIN: &str = "origin";
