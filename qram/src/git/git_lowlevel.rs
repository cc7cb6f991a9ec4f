use super::git_types::{GitError, GitOutput};

use std::{
    io::{self, BufWriter, Write},
    path::Path,
    process::{self, Child, Stdio},
};

use anyhow::{anyhow, bail, Context, Result};
use itertools::Itertools;
use log::{debug, trace};

/// Min supported git version. `git branch --points-at` and
/// `commit --cleanup=whitespace` have been around far longer, but rebase
/// behaviour around empty commits only settled in this series.
pub const EXPECTED_VERSION: (i32, i32, i32) = (2, 30, 0);

pub(super) fn spawn_git_command(
    args: &[&str],
    working_dir: &Path,
    stdin: Option<Stdio>,
) -> Result<Child, io::Error> {
    // Disable git's automatic maintenance so a background gc never holds
    // locks while the engine rewrites refs.
    let default_pre_args = ["-c", "gc.auto=0", "-c", "maintenance.auto=0"];
    let stdin = stdin.unwrap_or(Stdio::null());
    let all_args: Vec<_> = default_pre_args.iter().chain(args.iter()).collect();
    debug!("execute: git {} (in {})", all_args.iter().join(" "), working_dir.display());
    process::Command::new("git")
        .env("LANG", "C.UTF-8")
        .env("LC_ALL", "C.UTF-8")
        .env("LANGUAGE", "C.UTF-8")
        .stdin(stdin)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .current_dir(working_dir)
        .args(all_args)
        .spawn()
}

pub(super) fn capture_git_output(args: &[&str], working_dir: &Path) -> Result<GitOutput, GitError> {
    feed_git_command(args, working_dir, None)
}

pub(super) fn feed_git_command(
    args: &[&str],
    working_dir: &Path,
    input: Option<&str>,
) -> Result<GitOutput, GitError> {
    let stdin = input.map(|_| Stdio::piped());

    let child = spawn_git_command(args, working_dir, stdin)?;

    let output = match child.stdin {
        Some(ref stdin) => {
            let mut writer = BufWriter::new(stdin);
            writer.write_all(input.unwrap_or_default().as_bytes())?;
            drop(writer);
            child.wait_with_output()
        }
        None => child.wait_with_output(),
    }?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    trace!("stdout: {stdout}");

    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    trace!("stderr: {stderr}");

    let git_output = GitOutput { stdout, stderr };

    if output.status.success() {
        trace!("exec succeeded");
        Ok(git_output)
    } else {
        trace!("exec failed");
        Err(GitError::ExecError {
            command: args.join(" "),
            output: git_output,
        })
    }
}

pub(super) fn parse_git_version(version: &str) -> Result<(i32, i32, i32)> {
    let version = version
        .split_whitespace()
        .nth(2)
        .ok_or(anyhow!("Could not find git version in string {version}"))?;
    match version.split('.').collect_vec()[..] {
        [major, minor, patch] => Ok((major.parse()?, minor.parse()?, patch.parse()?)),
        _ => Err(anyhow!("Failed determine semantic version from {version}")),
    }
}

fn get_git_version() -> Result<(i32, i32, i32)> {
    let version = capture_git_output(&["--version"], Path::new("."))
        .context("Determine git version")?
        .stdout;
    parse_git_version(&version)
}

fn concat_version(version_tuple: (i32, i32, i32)) -> String {
    format!(
        "{}.{}.{}",
        version_tuple.0, version_tuple.1, version_tuple.2
    )
}

pub fn check_git_version() -> Result<()> {
    let version_tuple = get_git_version().context("Determining compatible git version")?;
    if version_tuple < EXPECTED_VERSION {
        bail!(
            "Version {} is smaller than {}",
            concat_version(version_tuple),
            concat_version(EXPECTED_VERSION)
        )
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_git_version() {
        let version = parse_git_version("git version 2.52.0");
        assert_eq!(version.unwrap(), (2, 52, 0));

        let version = parse_git_version("git version 2.52.0\n");
        assert_eq!(version.unwrap(), (2, 52, 0));
    }

    #[test]
    fn test_parse_git_version_rejects_garbage() {
        assert!(parse_git_version("git version").is_err());
        assert!(parse_git_version("").is_err());
    }

    #[test]
    fn test_capture_reports_failure() {
        let err = capture_git_output(&["no-such-subcommand"], Path::new(".")).unwrap_err();
        match err {
            GitError::ExecError { command, .. } => {
                assert_eq!(command, "no-such-subcommand");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
