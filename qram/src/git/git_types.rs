use std::io;

#[derive(Debug)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("Git failed to execute.\n\nstdout:\n{0}\nstderr:\n{1}", output.stdout, output.stderr)]
    ExecError { command: String, output: GitOutput },

    #[error("Failed to resolve {reference}")]
    MissingRef { reference: String },

    #[error("Not currently on a branch (detached HEAD)")]
    DetachedHead,

    #[error("Rebase onto {onto} stopped and was aborted:\n{0}\n{1}", output.stdout, output.stderr)]
    RebaseConflict { onto: String, output: GitOutput },

    #[error("Merge of {what} did not complete and was aborted:\n{0}\n{1}", output.stdout, output.stderr)]
    MergeConflict { what: String, output: GitOutput },

    #[error("Failed to execute git command")]
    IoError(#[from] io::Error),
}
