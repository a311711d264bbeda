//! Configuration for a Mender run.
//!
//! Built once at process start from built-in defaults, an optional
//! `mender.toml`, and the process environment (highest precedence), then
//! passed by reference to every component.

use crate::git_ops::is_valid_git_ref;
use chrono::Utc;
use mender_core::BackoffPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "mender.toml";

pub const DEFAULT_MODEL: &str = "gpt-4o";
pub const DEFAULT_REASONING_API_URL: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";
pub const DEFAULT_GITHUB_SERVER_URL: &str = "https://github.com";
pub const DEFAULT_BASE_BRANCH: &str = "main";
pub const DEFAULT_BRANCH_PREFIX: &str = "fix/ai-heal";

/// Every invalid or missing setting, reported together.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid configuration: {}", .problems.join("; "))]
pub struct ConfigurationError {
    pub problems: Vec<String>,
}

/// A credential whose value never appears in `Debug` output.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("Secret(<unset>)")
        } else {
            f.write_str("Secret(***)")
        }
    }
}

/// Which command the configuration is for. `Cleanup` never talks to the
/// reasoning service, so its credential is optional.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigScope {
    Heal,
    Cleanup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct ReasoningSettings {
    pub api_key: Secret,
    pub model: String,
    pub api_url: String,
    pub max_context_chars: usize,
    pub max_response_tokens: u32,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositorySlug {
    pub owner: String,
    pub name: String,
}

impl RepositorySlug {
    pub fn parse(value: &str) -> Option<Self> {
        let (owner, name) = value.trim().split_once('/')?;
        let valid = |s: &str| {
            !s.is_empty()
                && s
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        };
        if valid(owner) && valid(name) {
            Some(Self {
                owner: owner.to_string(),
                name: name.to_string(),
            })
        } else {
            None
        }
    }
}

impl fmt::Display for RepositorySlug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

#[derive(Debug, Clone)]
pub struct HostingSettings {
    pub token: Secret,
    pub repository: RepositorySlug,
    pub api_url: String,
    pub server_url: String,
    pub base_branch: String,
    pub branch_prefix: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub reasoning: ReasoningSettings,
    pub hosting: HostingSettings,
    pub retry: BackoffPolicy,
    /// CI run identity used in branch naming and commit trailers.
    pub run_id: String,
    /// Whole-run timeout; `None` disables it.
    pub healing_timeout: Option<Duration>,
    pub stale_branch_days: u32,
    pub push_disabled: bool,
    pub log_level: String,
    pub log_format: LogOutput,
}

/// Non-secret settings accepted from `mender.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub model: Option<String>,
    pub reasoning_api_url: Option<String>,
    pub github_api_url: Option<String>,
    pub github_server_url: Option<String>,
    pub base_branch: Option<String>,
    pub branch_prefix: Option<String>,
    pub max_retry_attempts: Option<u32>,
    pub retry_base_delay_ms: Option<u64>,
    pub retry_max_delay_ms: Option<u64>,
    pub retry_jitter_ms: Option<u64>,
    pub max_context_chars: Option<usize>,
    pub max_response_tokens: Option<u32>,
    pub healing_timeout: Option<u64>,
    pub stale_branch_days: Option<u32>,
    pub log_level: Option<String>,
    pub log_format: Option<LogOutput>,
}

impl FileConfig {
    /// Load `explicit` (which must exist), or `<repo_root>/mender.toml` when present.
    pub fn load(explicit: Option<&Path>, repo_root: &Path) -> Result<Self, ConfigurationError> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => {
                let default = repo_root.join(DEFAULT_CONFIG_FILE);
                if !default.exists() {
                    return Ok(Self::default());
                }
                default
            }
        };
        let content = std::fs::read_to_string(&path).map_err(|e| ConfigurationError {
            problems: vec![format!("cannot read {}: {}", path.display(), e)],
        })?;
        toml::from_str(&content).map_err(|e| ConfigurationError {
            problems: vec![format!("cannot parse {}: {}", path.display(), e)],
        })
    }
}

/// Collects problems while reading settings so they can be reported at once.
struct Reader<'a, F> {
    lookup: &'a F,
    problems: Vec<String>,
}

impl<F: Fn(&str) -> Option<String>> Reader<'_, F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&mut self, key: &str) -> String {
        match self.get(key) {
            Some(value) => value,
            None => {
                self.problems.push(format!("{} is not set", key));
                String::new()
            }
        }
    }

    fn string(&self, key: &str, file: Option<String>, default: &str) -> String {
        self.get(key)
            .or(file)
            .unwrap_or_else(|| default.to_string())
    }

    fn number<T>(&mut self, key: &str, file: Option<T>, default: T) -> T
    where
        T: std::str::FromStr + Copy,
    {
        match self.get(key) {
            Some(raw) => match raw.parse::<T>() {
                Ok(value) => value,
                Err(_) => {
                    self.problems
                        .push(format!("{} must be a non-negative integer (got '{}')", key, raw));
                    default
                }
            },
            None => file.unwrap_or(default),
        }
    }

    fn url(&mut self, key: &str, value: String) -> String {
        match url::Url::parse(&value) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {
                value.trim_end_matches('/').to_string()
            }
            _ => {
                self.problems
                    .push(format!("{} must be an http(s) URL (got '{}')", key, value));
                value
            }
        }
    }
}

fn truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Run identity: the CI run id when available, else a timestamp plus random suffix.
pub fn generate_run_id(ci_run_id: Option<&str>) -> String {
    match ci_run_id.map(str::trim).filter(|s| !s.is_empty()) {
        Some(id) => id.to_string(),
        None => {
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            format!("{}-{}", Utc::now().format("%Y%m%d%H%M%S"), &suffix[..6])
        }
    }
}

impl Config {
    /// Build from the real process environment. Only the binary calls this.
    pub fn from_env(
        scope: ConfigScope,
        config_path: Option<&Path>,
        repo_root: &Path,
    ) -> Result<Self, ConfigurationError> {
        let file = FileConfig::load(config_path, repo_root)?;
        Self::from_lookup(scope, |key| std::env::var(key).ok(), file)
    }

    pub fn from_lookup<F>(
        scope: ConfigScope,
        lookup: F,
        file: FileConfig,
    ) -> Result<Self, ConfigurationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut r = Reader {
            lookup: &lookup,
            problems: Vec::new(),
        };

        let api_key = match scope {
            ConfigScope::Heal => Secret::new(r.required("OPENAI_API_KEY")),
            ConfigScope::Cleanup => Secret::new(r.get("OPENAI_API_KEY").unwrap_or_default()),
        };
        let token = Secret::new(r.required("GITHUB_TOKEN"));
        let repository_raw = r.required("GITHUB_REPOSITORY");
        let repository = if repository_raw.is_empty() {
            None
        } else {
            let parsed = RepositorySlug::parse(&repository_raw);
            if parsed.is_none() {
                r.problems.push(format!(
                    "GITHUB_REPOSITORY must be in owner/name form (got '{}')",
                    repository_raw
                ));
            }
            parsed
        };

        let model = r.string("OPENAI_MODEL", file.model.clone(), DEFAULT_MODEL);
        let api_url = r.string(
            "REASONING_API_URL",
            file.reasoning_api_url.clone(),
            DEFAULT_REASONING_API_URL,
        );
        let api_url = r.url("REASONING_API_URL", api_url);
        let github_api = r.string(
            "GITHUB_API_URL",
            file.github_api_url.clone(),
            DEFAULT_GITHUB_API_URL,
        );
        let github_api = r.url("GITHUB_API_URL", github_api);
        let server_url = r.string(
            "GITHUB_SERVER_URL",
            file.github_server_url.clone(),
            DEFAULT_GITHUB_SERVER_URL,
        );
        let server_url = r.url("GITHUB_SERVER_URL", server_url);
        let base_branch = r.string(
            "GITHUB_BASE_BRANCH",
            file.base_branch.clone(),
            DEFAULT_BASE_BRANCH,
        );
        let branch_prefix = r
            .string("BRANCH_PREFIX", file.branch_prefix.clone(), DEFAULT_BRANCH_PREFIX)
            .trim_end_matches('/')
            .to_string();
        if !is_valid_git_ref(&branch_prefix) {
            r.problems.push(format!(
                "BRANCH_PREFIX is not a valid git ref prefix (got '{}')",
                branch_prefix
            ));
        }
        if !is_valid_git_ref(&base_branch) {
            r.problems.push(format!(
                "GITHUB_BASE_BRANCH is not a valid branch name (got '{}')",
                base_branch
            ));
        }

        let max_attempts = r.number("MAX_RETRY_ATTEMPTS", file.max_retry_attempts, 3u32);
        if max_attempts == 0 {
            r.problems
                .push("MAX_RETRY_ATTEMPTS must be at least 1".to_string());
        }
        let base_delay = r.number("RETRY_BASE_DELAY_MS", file.retry_base_delay_ms, 1000u64);
        let max_delay = r.number("RETRY_MAX_DELAY_MS", file.retry_max_delay_ms, 30_000u64);
        let jitter = r.number("RETRY_JITTER_MS", file.retry_jitter_ms, 500u64);
        let max_context_chars = r.number("MAX_CONTEXT_CHARS", file.max_context_chars, 12_000usize);
        let max_response_tokens =
            r.number("MAX_RESPONSE_TOKENS", file.max_response_tokens, 4096u32);
        let healing_timeout = r.number("HEALING_TIMEOUT", file.healing_timeout, 300u64);
        let stale_branch_days = r.number("STALE_BRANCH_DAYS", file.stale_branch_days, 14u32);

        let log_level = r.string("LOG_LEVEL", file.log_level.clone(), "info");
        let log_format = match r.get("LOG_FORMAT").as_deref().map(str::to_ascii_lowercase) {
            Some(ref v) if v == "json" => LogOutput::Json,
            Some(ref v) if v == "text" || v == "pretty" => LogOutput::Text,
            Some(other) => {
                r.problems
                    .push(format!("LOG_FORMAT must be 'text' or 'json' (got '{}')", other));
                LogOutput::Text
            }
            None => file.log_format.unwrap_or(LogOutput::Text),
        };

        let push_disabled = r
            .get("MENDER_DISABLE_PUSH")
            .map(|v| truthy(&v))
            .unwrap_or(false);
        let run_id = generate_run_id(r.get("GITHUB_RUN_ID").as_deref());

        if !r.problems.is_empty() {
            return Err(ConfigurationError {
                problems: r.problems,
            });
        }
        let Some(repository) = repository else {
            return Err(ConfigurationError {
                problems: vec!["GITHUB_REPOSITORY is not set".to_string()],
            });
        };

        Ok(Config {
            reasoning: ReasoningSettings {
                api_key,
                model,
                api_url,
                max_context_chars,
                max_response_tokens,
                request_timeout: Duration::from_secs(120),
            },
            hosting: HostingSettings {
                token,
                repository,
                api_url: github_api,
                server_url,
                base_branch,
                branch_prefix,
            },
            retry: BackoffPolicy {
                max_attempts,
                base_delay: Duration::from_millis(base_delay),
                max_delay: Duration::from_millis(max_delay.max(base_delay)),
                jitter: Duration::from_millis(jitter),
            },
            run_id,
            healing_timeout: (healing_timeout > 0).then(|| Duration::from_secs(healing_timeout)),
            stale_branch_days,
            push_disabled,
            log_level,
            log_format,
        })
    }

    pub fn stale_branch_window(&self) -> Duration {
        Duration::from_secs(u64::from(self.stale_branch_days) * 24 * 60 * 60)
    }
}
