use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use config::{Config, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::defaults;

/// File name of the per-repository configuration, read from the clone root.
pub const REPO_CONFIG_FILE: &str = "qram.toml";

/// Per-repository configuration: where queue branches live, which branch is
/// protected, and how merge commits are rendered. Serializable because the
/// merge message template gets it in scope as `cfg`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RepoConfig {
    pub branching: Branching,
    pub merge_template: MergeTemplate,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Branching {
    pub branch_folder: String,
    pub target_branch: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MergeTemplate {
    pub template: String,
    pub author: MergeAuthor,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MergeAuthor {
    pub name: String,
    pub email: String,
}

impl Default for RepoConfig {
    fn default() -> Self {
        RepoConfig {
            branching: Branching {
                branch_folder: defaults::DEFAULT_BRANCH_FOLDER.to_owned(),
                target_branch: defaults::DEFAULT_TARGET_BRANCH.to_owned(),
            },
            merge_template: MergeTemplate {
                template: defaults::DEFAULT_MERGE_TEMPLATE.to_owned(),
                author: MergeAuthor {
                    name: defaults::DEFAULT_MERGE_AUTHOR_NAME.to_owned(),
                    email: defaults::DEFAULT_MERGE_AUTHOR_EMAIL.to_owned(),
                },
            },
        }
    }
}

fn system_config_path() -> Option<PathBuf> {
    if let Ok(xdg_config_home) = env::var("XDG_CONFIG_HOME") {
        return Some(Path::new(&xdg_config_home).join("qram").join("config.toml"));
    }
    dirs_next::home_dir().map(|home| home.join(".config").join("qram").join("config.toml"))
}

/// Reads the hierarchical repository configuration: built-in defaults, then
/// the system config, then `qram.toml` in the clone root, later sources
/// overriding earlier ones.
pub fn read_repo_config(repo_path: &Path) -> Result<RepoConfig> {
    let mut builder = Config::builder()
        .set_default("branching.branch_folder", defaults::DEFAULT_BRANCH_FOLDER)?
        .set_default("branching.target_branch", defaults::DEFAULT_TARGET_BRANCH)?
        .set_default("merge_template.template", defaults::DEFAULT_MERGE_TEMPLATE)?
        .set_default(
            "merge_template.author.name",
            defaults::DEFAULT_MERGE_AUTHOR_NAME,
        )?
        .set_default(
            "merge_template.author.email",
            defaults::DEFAULT_MERGE_AUTHOR_EMAIL,
        )?;

    if let Some(system_path) = system_config_path() {
        builder = builder.add_source(
            File::from(system_path)
                .format(FileFormat::Toml)
                .required(false),
        );
    }

    builder = builder.add_source(
        File::from(repo_path.join(REPO_CONFIG_FILE))
            .format(FileFormat::Toml)
            .required(false),
    );

    builder
        .build()
        .with_context(|| format!("reading configuration for {}", repo_path.display()))?
        .try_deserialize()
        .with_context(|| format!("invalid configuration for {}", repo_path.display()))
}

/// GitHub App credentials and webhook settings.
#[derive(Debug, Clone)]
pub struct GithubConfig {
    pub app_id: String,
    pub installation_id: String,
    pub pem: String,
    pub hmac: Option<String>,
    pub webhook_url: Option<String>,
}

/// Process-level configuration, read from `QRAM_*` environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_to: String,
    pub port: u16,
    pub workdir: PathBuf,
    pub github: Option<GithubConfig>,
}

impl AppConfig {
    pub fn from_env() -> Result<AppConfig> {
        let bind_to =
            env::var("QRAM_BIND_TO").unwrap_or_else(|_| defaults::DEFAULT_BIND_TO.to_owned());
        let port = match env::var("QRAM_PORT") {
            Ok(value) => value
                .parse::<u16>()
                .with_context(|| format!("QRAM_PORT is not a port number: {value}"))?,
            Err(_) => defaults::DEFAULT_PORT,
        };
        let workdir =
            PathBuf::from(env::var("QRAM_WORKDIR").unwrap_or_else(|_| "qram-repos".to_owned()));

        let github = match env::var("QRAM_PROVIDER").ok().as_deref() {
            None => None,
            Some("github") => Some(GithubConfig {
                app_id: required_env("QRAM_GITHUB_APP_ID")?,
                installation_id: required_env("QRAM_GITHUB_INSTALLATION_ID")?,
                pem: secret_from_env("QRAM_GITHUB_PEM")?
                    .ok_or_else(|| anyhow::anyhow!("QRAM_GITHUB_PEM is not set"))?,
                hmac: secret_from_env("QRAM_GITHUB_HMAC")?,
                webhook_url: env::var("QRAM_GITHUB_WEBHOOK_URL").ok(),
            }),
            Some(other) => bail!("unsupported provider: {other}"),
        };

        Ok(AppConfig {
            bind_to,
            port,
            workdir,
            github,
        })
    }
}

fn required_env(name: &str) -> Result<String> {
    env::var(name).with_context(|| format!("{name} is not set"))
}

/// Reads a secret either literally from `<name>` or, failing that, from the
/// file named by `<name>_FILE`. The literal always wins.
fn secret_from_env(name: &str) -> Result<Option<String>> {
    if let Ok(literal) = env::var(name) {
        return Ok(Some(literal));
    }
    let file_var = format!("{name}_FILE");
    let Ok(path) = env::var(&file_var) else {
        return Ok(None);
    };
    let content =
        fs::read_to_string(&path).with_context(|| format!("{file_var}: invalid file {path}"))?;
    if content.trim().is_empty() {
        bail!("{file_var}: file is empty: {path}");
    }
    // Secret files are newline-terminated by about every way of writing
    // them; the trailing whitespace is not part of the secret.
    Ok(Some(content.trim_end().to_owned()))
}

#[cfg(test)]
mod test {
    use super::*;
    use serial_test::serial;
    use tempfile::tempdir;

    fn clear_env() {
        for key in [
            "QRAM_BIND_TO",
            "QRAM_PORT",
            "QRAM_WORKDIR",
            "QRAM_PROVIDER",
            "QRAM_GITHUB_APP_ID",
            "QRAM_GITHUB_INSTALLATION_ID",
            "QRAM_GITHUB_PEM",
            "QRAM_GITHUB_PEM_FILE",
            "QRAM_GITHUB_HMAC",
            "QRAM_GITHUB_HMAC_FILE",
            "QRAM_GITHUB_WEBHOOK_URL",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_defaults_without_env() {
        clear_env();
        let cfg = AppConfig::from_env().unwrap();
        assert_eq!(cfg.bind_to, "127.0.0.1");
        assert_eq!(cfg.port, 7890);
        assert!(cfg.github.is_none());
    }

    #[test]
    #[serial]
    fn test_can_load_literal_secrets() {
        clear_env();
        env::set_var("QRAM_PROVIDER", "github");
        env::set_var("QRAM_GITHUB_APP_ID", "42");
        env::set_var("QRAM_GITHUB_INSTALLATION_ID", "67");
        env::set_var("QRAM_GITHUB_PEM", "ppp");
        env::set_var("QRAM_GITHUB_HMAC", "hhh");

        let cfg = AppConfig::from_env().unwrap();

        let github = cfg.github.unwrap();
        assert_eq!(github.app_id, "42");
        assert_eq!(github.installation_id, "67");
        assert_eq!(github.pem, "ppp");
        assert_eq!(github.hmac.as_deref(), Some("hhh"));
    }

    #[test]
    #[serial]
    fn test_missing_required_env_var_names_it() {
        clear_env();
        env::set_var("QRAM_PROVIDER", "github");
        env::set_var("QRAM_GITHUB_INSTALLATION_ID", "1");
        env::set_var("QRAM_GITHUB_PEM", "pem");

        let err = AppConfig::from_env().unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("QRAM_GITHUB_APP_ID"));
        assert!(!message.contains("QRAM_GITHUB_INSTALLATION_ID"));
    }

    #[test]
    #[serial]
    fn test_unsupported_provider() {
        clear_env();
        env::set_var("QRAM_PROVIDER", "whatever");
        let err = AppConfig::from_env().unwrap_err();
        assert!(format!("{err:#}").contains("unsupported provider"));
    }

    #[test]
    #[serial]
    fn test_can_load_secrets_from_files() {
        clear_env();
        let dir = tempdir().unwrap();
        let pem_file = dir.path().join("pem.txt");
        let hmac_file = dir.path().join("hmac.txt");
        fs::write(&pem_file, "ppp").unwrap();
        // `echo secret > file` and secret mounts terminate the file with a
        // newline; it must not become part of the value.
        fs::write(&hmac_file, "hhh\n").unwrap();

        env::set_var("QRAM_PROVIDER", "github");
        env::set_var("QRAM_GITHUB_APP_ID", "100");
        env::set_var("QRAM_GITHUB_INSTALLATION_ID", "200");
        env::set_var("QRAM_GITHUB_PEM_FILE", &pem_file);
        env::set_var("QRAM_GITHUB_HMAC_FILE", &hmac_file);

        let cfg = AppConfig::from_env().unwrap();
        let github = cfg.github.unwrap();
        assert_eq!(github.pem, "ppp");
        assert_eq!(github.hmac.as_deref(), Some("hhh"));
    }

    #[test]
    #[serial]
    fn test_missing_secret_file() {
        clear_env();
        let dir = tempdir().unwrap();
        env::set_var("QRAM_PROVIDER", "github");
        env::set_var("QRAM_GITHUB_APP_ID", "100");
        env::set_var("QRAM_GITHUB_INSTALLATION_ID", "200");
        env::set_var("QRAM_GITHUB_PEM_FILE", dir.path().join("nosuchfile.txt"));

        let err = AppConfig::from_env().unwrap_err();
        assert!(format!("{err:#}").contains("invalid file"));
    }

    #[test]
    #[serial]
    fn test_empty_secret_file() {
        clear_env();
        let dir = tempdir().unwrap();
        let pem_file = dir.path().join("empty.txt");
        fs::write(&pem_file, "").unwrap();
        env::set_var("QRAM_PROVIDER", "github");
        env::set_var("QRAM_GITHUB_APP_ID", "300");
        env::set_var("QRAM_GITHUB_INSTALLATION_ID", "400");
        env::set_var("QRAM_GITHUB_PEM_FILE", &pem_file);

        let err = AppConfig::from_env().unwrap_err();
        assert!(format!("{err:#}").contains("file is empty"));
    }

    #[test]
    #[serial]
    fn test_literal_takes_precedence_over_file() {
        clear_env();
        let dir = tempdir().unwrap();
        let pem_file = dir.path().join("pem.txt");
        fs::write(&pem_file, "file_pem").unwrap();
        env::set_var("QRAM_PROVIDER", "github");
        env::set_var("QRAM_GITHUB_APP_ID", "500");
        env::set_var("QRAM_GITHUB_INSTALLATION_ID", "600");
        env::set_var("QRAM_GITHUB_PEM", "literal_pem");
        env::set_var("QRAM_GITHUB_PEM_FILE", &pem_file);

        let cfg = AppConfig::from_env().unwrap();
        assert_eq!(cfg.github.unwrap().pem, "literal_pem");
    }

    #[test]
    #[serial]
    fn test_repo_config_defaults() {
        env::set_var("XDG_CONFIG_HOME", tempdir().unwrap().path());
        let dir = tempdir().unwrap();
        let cfg = read_repo_config(dir.path()).unwrap();
        assert_eq!(cfg.branching.branch_folder, "mq");
        assert_eq!(cfg.branching.target_branch, "main");
        assert_eq!(cfg.merge_template.author.email, "qram@no.email");
        env::remove_var("XDG_CONFIG_HOME");
    }

    #[test]
    #[serial]
    fn test_repo_config_overrides() {
        env::set_var("XDG_CONFIG_HOME", tempdir().unwrap().path());
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(REPO_CONFIG_FILE),
            r#"
[branching]
target_branch = "a"
branch_folder = "b/"
"#,
        )
        .unwrap();
        let cfg = read_repo_config(dir.path()).unwrap();
        assert_eq!(cfg.branching.target_branch, "a");
        assert_eq!(cfg.branching.branch_folder, "b/");
        // defaults survive for the untouched table
        assert_eq!(cfg.merge_template.author.name, "qram");
        env::remove_var("XDG_CONFIG_HOME");
    }

    #[test]
    #[serial]
    fn test_repo_config_rejects_unknown_fields() {
        env::set_var("XDG_CONFIG_HOME", tempdir().unwrap().path());
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(REPO_CONFIG_FILE), "omg = 0\n").unwrap();
        assert!(read_repo_config(dir.path()).is_err());
        env::remove_var("XDG_CONFIG_HOME");
    }
}
