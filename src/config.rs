use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::compiler::DEFAULT_PAGE_SIZE;

pub const DEFAULT_URL: &str = "https://aflow.org/API/aflux/?";

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// AFLUX endpoint, including the trailing `?`.
    pub url: String,
    pub page_size: usize,
    /// Retries per page for transient failures.
    pub max_retries: usize,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Whether to verify TLS certificates.
    pub verify: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            max_retries: 5,
            timeout: Duration::from_secs(60),
            verify: true,
        }
    }
}

#[derive(Debug, Default, PartialEq)]
struct RcConfig {
    url: Option<String>,
    page_size: Option<usize>,
    max_retries: Option<usize>,
    timeout: Option<u64>,
    verify: Option<bool>,
}

impl RcConfig {
    fn from_env(env: &impl Fn(&str) -> Option<String>) -> Result<Self> {
        Ok(Self {
            url: env("AFLOW_URL"),
            page_size: env_number(env, "AFLOW_PAGE_SIZE")?,
            max_retries: env_number(env, "AFLOW_MAX_RETRIES")?,
            timeout: env_number(env, "AFLOW_TIMEOUT")?,
            verify: None,
        })
    }

    /// Fills unset fields from `other`.
    fn or(self, other: RcConfig) -> RcConfig {
        RcConfig {
            url: self.url.or(other.url),
            page_size: self.page_size.or(other.page_size),
            max_retries: self.max_retries.or(other.max_retries),
            timeout: self.timeout.or(other.timeout),
            verify: self.verify.or(other.verify),
        }
    }
}

fn env_number<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>> {
    match env(name) {
        Some(v) => match v.trim().parse() {
            Ok(n) => Ok(Some(n)),
            Err(_) => bail!("{} must be a non-negative integer, got `{}`", name, v),
        },
        None => Ok(None),
    }
}

/// Resolves configuration from (in order of precedence) explicit arguments,
/// `AFLOW_*` environment variables, the first `.aflowrc` found, defaults.
pub(crate) fn load_config(url: Option<String>, verify: Option<bool>) -> Result<ClientConfig> {
    load_config_with(
        url,
        verify,
        |name| std::env::var(name).ok(),
        std::env::current_dir().ok(),
        dirs::home_dir(),
    )
}

fn load_config_with(
    url: Option<String>,
    verify: Option<bool>,
    env: impl Fn(&str) -> Option<String>,
    cwd: Option<PathBuf>,
    home: Option<PathBuf>,
) -> Result<ClientConfig> {
    let explicit = RcConfig {
        url,
        verify,
        ..RcConfig::default()
    };
    let mut merged = explicit.or(RcConfig::from_env(&env)?);

    for rc_path in rc_candidates(&env, cwd, home) {
        if rc_path.exists() {
            let file = read_rc(&rc_path).with_context(|| {
                format!("failed to read configuration file {}", rc_path.display())
            })?;
            merged = merged.or(file);
            break;
        }
    }

    let defaults = ClientConfig::default();
    let page_size = merged.page_size.unwrap_or(defaults.page_size);
    if page_size == 0 {
        bail!("page_size must be greater than 0");
    }

    Ok(ClientConfig {
        url: merged.url.unwrap_or(defaults.url),
        page_size,
        max_retries: merged.max_retries.unwrap_or(defaults.max_retries),
        timeout: merged
            .timeout
            .map(Duration::from_secs)
            .unwrap_or(defaults.timeout),
        verify: merged.verify.unwrap_or(defaults.verify),
    })
}

fn read_rc(path: &Path) -> Result<RcConfig> {
    let text = std::fs::read_to_string(path)?;
    parse_rc(&text)
}

fn parse_rc(text: &str) -> Result<RcConfig> {
    let mut cfg = RcConfig::default();

    // `key:` may stand alone with its value on the following line.
    let mut pending_key: Option<&str> = None;

    for (n, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (k, v) = match (pending_key.take(), line.split_once(':')) {
            (Some(pk), _) if !looks_like_entry(line) => (pk, strip_quotes(line)),
            (_, Some((k, v))) => (k.trim(), strip_quotes(v.trim())),
            (_, None) => continue,
        };

        if v.is_empty() {
            pending_key = Some(k);
            continue;
        }

        let bad = || format!("line {}: invalid value for `{}`: {}", n + 1, k, v);
        match k {
            "url" => cfg.url = Some(v.to_string()),
            "page_size" => cfg.page_size = Some(v.parse().with_context(bad)?),
            "max_retries" => cfg.max_retries = Some(v.parse().with_context(bad)?),
            "timeout" => cfg.timeout = Some(v.parse().with_context(bad)?),
            "verify" => cfg.verify = Some(v != "0" && !v.eq_ignore_ascii_case("false")),
            _ => {}
        }
    }

    Ok(cfg)
}

/// A `key: value` line, as opposed to a bare value continuing the
/// previous key (URLs contain `:` too).
fn looks_like_entry(line: &str) -> bool {
    line.split_once(':').is_some_and(|(k, _)| {
        let k = k.trim();
        !k.is_empty() && k.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') && k != "http" && k != "https"
    })
}

fn strip_quotes(s: &str) -> &str {
    let s = s.trim();
    if (s.starts_with('"') && s.ends_with('"') && s.len() >= 2)
        || (s.starts_with('\'') && s.ends_with('\'') && s.len() >= 2)
    {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

fn rc_candidates(
    env: &impl Fn(&str) -> Option<String>,
    cwd: Option<PathBuf>,
    home: Option<PathBuf>,
) -> Vec<PathBuf> {
    // 1) AFLOW_RC (explicit)
    // 2) ./.aflowrc
    // 3) ~/.aflowrc
    if let Some(p) = env("AFLOW_RC") {
        return vec![PathBuf::from(p)];
    }

    cwd.into_iter()
        .chain(home)
        .map(|dir| dir.join(".aflowrc"))
        .collect()
}
