//! Hosting-provider sources.
//!
//! A source knows two things: which repositories an account can see, and
//! which transport credentials reach them. Providers are a closed set of
//! variants constructed from configuration at startup; there is no global
//! registry.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::PathBuf;

use anyhow::{Context, Result};
use git2::{Cred, CredentialType, RemoteCallbacks};
use octocrab::Octocrab;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::ProviderConfig;

/// Immutable identity of one remote repository.
///
/// `full_name` is unique within a source and derives the local clone path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRepo {
    pub url: String,
    pub full_name: String,
    pub name: String,
}

/// Transport credentials for one source, resolved once and materialized into
/// [`git2::RemoteCallbacks`] just before each fetch.
#[derive(Debug, Clone)]
pub enum CredentialConfig {
    /// Offer nothing; anonymous transports only.
    Default,
    /// Answer SSH-key requests with a keypair (`<key>.pub` alongside).
    SshKey { private_key: PathBuf },
    /// Answer userpass requests, but only for `https://<host>/...` URLs.
    Token {
        host: String,
        username: String,
        token: String,
    },
}

impl CredentialConfig {
    pub fn callbacks(&self) -> RemoteCallbacks<'static> {
        let creds = self.clone();
        let mut callbacks = RemoteCallbacks::new();
        callbacks.credentials(move |url, username_from_url, allowed| {
            creds.resolve(url, username_from_url, allowed)
        });
        callbacks
    }

    fn resolve(
        &self,
        url: &str,
        username_from_url: Option<&str>,
        allowed: CredentialType,
    ) -> std::result::Result<Cred, git2::Error> {
        match self {
            CredentialConfig::Default => Err(git2::Error::from_str("no credentials configured")),
            CredentialConfig::SshKey { private_key } => {
                if !allowed.contains(CredentialType::SSH_KEY) {
                    return Err(git2::Error::from_str("ssh key credentials not accepted"));
                }
                let mut raw = OsString::from(private_key.as_os_str());
                raw.push(".pub");
                let public_key = PathBuf::from(raw);
                Cred::ssh_key(
                    username_from_url.unwrap_or("git"),
                    Some(public_key.as_path()),
                    private_key,
                    None,
                )
            }
            CredentialConfig::Token {
                host,
                username,
                token,
            } => {
                if !allowed.contains(CredentialType::USER_PASS_PLAINTEXT) {
                    return Err(git2::Error::from_str("userpass credentials not accepted"));
                }
                if !url_matches_https_host(url, host) {
                    warn!("Refusing to send {} credentials to {:?}", host, url);
                    return Err(git2::Error::from_str("credential host mismatch"));
                }
                Cred::userpass_plaintext(username, token)
            }
        }
    }
}

/// `true` when `url` is an https URL whose authority is exactly `host`.
fn url_matches_https_host(url: &str, host: &str) -> bool {
    let Some(rest) = url.strip_prefix("https://") else {
        return false;
    };
    let authority = rest.split('/').next().unwrap_or("");
    let without_userinfo = authority.rsplit('@').next().unwrap_or(authority);
    without_userinfo == host
}

fn host_of(url: &str) -> String {
    let rest = url.split("://").nth(1).unwrap_or(url);
    let authority = rest.split('/').next().unwrap_or("");
    authority
        .rsplit('@')
        .next()
        .unwrap_or(authority)
        .to_string()
}

/// One configured repository source.
pub enum GitSource {
    PlainGit(PlainGitSource),
    Github(GithubSource),
    Gitlab(GitlabSource),
}

impl GitSource {
    /// Build a source from its configuration, resolving whatever account
    /// identity the provider needs for transport credentials.
    pub async fn connect(config: &ProviderConfig) -> Result<Self> {
        match config {
            ProviderConfig::PlainGit { repos, key_path } => Ok(GitSource::PlainGit(
                PlainGitSource::new(repos, key_path.as_deref())?,
            )),
            ProviderConfig::Github { token } => {
                Ok(GitSource::Github(GithubSource::connect(token.clone()).await?))
            }
            ProviderConfig::Gitlab { token, url } => Ok(GitSource::Gitlab(
                GitlabSource::connect(url.clone(), token.clone()).await?,
            )),
        }
    }

    pub async fn list_repos(&self) -> Result<Vec<RemoteRepo>> {
        match self {
            GitSource::PlainGit(source) => Ok(source.list_repos()),
            GitSource::Github(source) => source.list_repos().await,
            GitSource::Gitlab(source) => source.list_repos().await,
        }
    }

    pub fn credentials(&self) -> CredentialConfig {
        match self {
            GitSource::PlainGit(source) => source.credentials(),
            GitSource::Github(source) => source.credentials(),
            GitSource::Gitlab(source) => source.credentials(),
        }
    }
}

/// Explicitly configured repositories reachable with plain git transport.
pub struct PlainGitSource {
    repos: Vec<RemoteRepo>,
    key_path: Option<PathBuf>,
}

impl PlainGitSource {
    pub fn new(repos: &BTreeMap<String, String>, key_path: Option<&str>) -> Result<Self> {
        let key_path = key_path
            .map(|raw| shellexpand::full(raw).map(|expanded| PathBuf::from(expanded.into_owned())))
            .transpose()
            .context("failed to expand ssh key path")?;

        let repos = repos
            .iter()
            .map(|(name, url)| RemoteRepo {
                url: url.clone(),
                full_name: name.clone(),
                name: name.clone(),
            })
            .collect();

        Ok(Self { repos, key_path })
    }

    pub fn list_repos(&self) -> Vec<RemoteRepo> {
        self.repos.clone()
    }

    pub fn credentials(&self) -> CredentialConfig {
        match &self.key_path {
            Some(private_key) => CredentialConfig::SshKey {
                private_key: private_key.clone(),
            },
            None => CredentialConfig::Default,
        }
    }
}

/// Repositories of the authenticated GitHub user.
pub struct GithubSource {
    client: Octocrab,
    username: String,
    token: String,
}

impl GithubSource {
    pub async fn connect(token: String) -> Result<Self> {
        let client = Octocrab::builder()
            .personal_token(token.clone())
            .build()
            .context("failed to create GitHub client")?;

        let user = client
            .current()
            .user()
            .await
            .context("failed to look up the authenticated GitHub user")?;

        info!("Authenticated to GitHub as {}", user.login);
        Ok(Self {
            client,
            username: user.login,
            token,
        })
    }

    pub async fn list_repos(&self) -> Result<Vec<RemoteRepo>> {
        debug!("Fetching GitHub repositories for {}", self.username);

        let mut repos = Vec::new();
        let mut page = 1u8;

        loop {
            let page_repos = self
                .client
                .current()
                .list_repos_for_authenticated_user()
                .per_page(100)
                .page(page)
                .send()
                .await
                .with_context(|| format!("failed to fetch repositories page {}", page))?;

            let items = page_repos.items;
            if items.is_empty() {
                break;
            }

            for repo in items {
                let full_name = repo.full_name.clone().unwrap_or_else(|| repo.name.clone());
                let url = repo
                    .clone_url
                    .as_ref()
                    .map(|u| u.to_string())
                    .or_else(|| repo.ssh_url.clone());
                let Some(url) = url else {
                    warn!("Repository {} has no usable clone URL", full_name);
                    continue;
                };
                repos.push(RemoteRepo {
                    url,
                    full_name,
                    name: repo.name.clone(),
                });
            }

            // GitHub API pagination limit for u8
            if page >= 255 {
                warn!("Reached maximum pagination limit (255 pages)");
                break;
            }
            page += 1;
        }

        info!("Found {} GitHub repositories", repos.len());
        Ok(repos)
    }

    pub fn credentials(&self) -> CredentialConfig {
        CredentialConfig::Token {
            host: "github.com".to_string(),
            username: self.username.clone(),
            token: self.token.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GitlabProject {
    path: String,
    path_with_namespace: String,
    http_url_to_repo: String,
}

#[derive(Debug, Deserialize)]
struct GitlabUser {
    username: String,
}

/// Projects owned by the authenticated GitLab user.
pub struct GitlabSource {
    http: reqwest::Client,
    base_url: String,
    username: String,
    token: String,
}

impl GitlabSource {
    pub async fn connect(base_url: String, token: String) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let http = reqwest::Client::new();

        let user: GitlabUser = http
            .get(format!("{}/api/v4/user", base_url))
            .header("PRIVATE-TOKEN", &token)
            .send()
            .await
            .with_context(|| format!("failed to reach GitLab at {}", base_url))?
            .error_for_status()
            .context("GitLab authentication failed")?
            .json()
            .await
            .context("failed to parse GitLab user")?;

        info!("Authenticated to GitLab as {}", user.username);
        Ok(Self {
            http,
            base_url,
            username: user.username,
            token,
        })
    }

    pub async fn list_repos(&self) -> Result<Vec<RemoteRepo>> {
        debug!("Fetching GitLab projects for {}", self.username);

        let mut repos = Vec::new();
        let mut page = 1u32;

        loop {
            let page_string = page.to_string();
            let projects: Vec<GitlabProject> = self
                .http
                .get(format!("{}/api/v4/projects", self.base_url))
                .query(&[
                    ("owned", "true"),
                    ("simple", "true"),
                    ("per_page", "100"),
                    ("page", page_string.as_str()),
                ])
                .header("PRIVATE-TOKEN", &self.token)
                .send()
                .await
                .with_context(|| format!("failed to fetch GitLab projects page {}", page))?
                .error_for_status()
                .context("GitLab project listing failed")?
                .json()
                .await
                .context("failed to parse GitLab projects")?;

            if projects.is_empty() {
                break;
            }

            repos.extend(projects.into_iter().map(|project| RemoteRepo {
                url: project.http_url_to_repo,
                full_name: project.path_with_namespace,
                name: project.path,
            }));
            page += 1;
        }

        info!("Found {} GitLab projects", repos.len());
        Ok(repos)
    }

    pub fn credentials(&self) -> CredentialConfig {
        CredentialConfig::Token {
            host: host_of(&self.base_url),
            username: self.username.clone(),
            token: self.token.clone(),
        }
    }
}
