use std::path::Path;

use anyhow::{bail, Result};

use crate::config::FixwrightConfig;

const CONFIG_PATH: &str = "fixwright.toml";

/// `fixwright init`: write a commented configuration scaffold.
pub struct InitCommand {
    force: bool,
}

impl InitCommand {
    pub fn new(force: bool) -> Self {
        Self { force }
    }

    pub async fn execute(&self) -> Result<i32> {
        if Path::new(CONFIG_PATH).exists() && !self.force {
            bail!("{CONFIG_PATH} already exists (use --force to overwrite)");
        }

        let mut config = FixwrightConfig::default();
        // Seed owner/repo from the checkout when possible.
        if let Ok(repo) = git2::Repository::discover(".") {
            if let Some((owner, name)) = origin_owner_repo(&repo) {
                config.host.owner = owner;
                config.host.repo = name;
            }
        }

        config.save_to_file(CONFIG_PATH)?;
        println!("✅ wrote {CONFIG_PATH}");
        if config.host.owner.is_empty() {
            println!("   ⚠️  host.owner / host.repo could not be inferred; fill them in");
        } else {
            println!("   host: {}/{}", config.host.owner, config.host.repo);
        }
        println!("   set FIXWRIGHT_HOST_TOKEN (or GITHUB_TOKEN) before running autofix");
        Ok(0)
    }
}

/// Owner/repo from the origin remote, handling SSH and HTTPS URL shapes.
fn origin_owner_repo(repo: &git2::Repository) -> Option<(String, String)> {
    let remote = repo.find_remote("origin").ok()?;
    let url = remote.url()?;
    let path = url
        .strip_prefix("git@github.com:")
        .or_else(|| url.strip_prefix("https://github.com/"))?;
    let path = path.strip_suffix(".git").unwrap_or(path);
    let mut parts = path.splitn(2, '/');
    let owner = parts.next()?.to_string();
    let name = parts.next()?.trim_end_matches('/').to_string();
    if owner.is_empty() || name.is_empty() {
        None
    } else {
        Some((owner, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worktree::test_support::scratch_repo;

    #[test]
    fn origin_parsing_handles_both_url_shapes() {
        let (_dir, root) = scratch_repo();
        let repo = git2::Repository::open(&root).unwrap();
        repo.remote("origin", "git@github.com:acme/rocket.git")
            .unwrap();
        let (owner, name) = origin_owner_repo(&repo).unwrap();
        assert_eq!(owner, "acme");
        assert_eq!(name, "rocket");

        repo.remote_set_url("origin", "https://github.com/acme/rocket")
            .unwrap();
        let repo = git2::Repository::open(&root).unwrap();
        let (owner, name) = origin_owner_repo(&repo).unwrap();
        assert_eq!(owner, "acme");
        assert_eq!(name, "rocket");
    }

    #[test]
    fn non_github_remote_is_ignored() {
        let (_dir, root) = scratch_repo();
        let repo = git2::Repository::open(&root).unwrap();
        repo.remote("origin", "https://gitlab.com/acme/rocket.git")
            .unwrap();
        assert!(origin_owner_repo(&repo).is_none());
    }
}
