pub mod git_driver;
pub mod git_lowlevel;
pub mod git_types;

pub use git_driver::{extract_branches_from_line, reclone, Git};
pub use git_lowlevel::check_git_version;
pub use git_types::{GitError, GitOutput};
