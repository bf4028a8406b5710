use std::path::Path;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::client::{FetchSettings, RateLimit, DEFAULT_USER_AGENT};
use crate::executor::BackoffPolicy;
use crate::request::Method;

/// Default config file location, overridable with `SAFE_FETCH_CONFIG`.
pub const DEFAULT_CONFIG_PATH: &str = "safe-fetch.toml";

/// Fetch one URL through the SSRF-hardened client and print the response
/// envelope as JSON.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Config {
    /// URL to fetch (http or https only)
    pub url: String,

    /// HTTP method (GET, POST, PUT, PATCH, DELETE)
    #[arg(short = 'X', long, default_value = "GET")]
    pub method: Method,

    /// Extra request header as 'Name: value' (repeatable)
    #[arg(short = 'H', long = "header")]
    pub headers: Vec<String>,

    /// Request body
    #[arg(short, long)]
    pub data: Option<String>,

    /// Send the body as JSON (must parse as JSON)
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// Connect timeout in milliseconds
    #[arg(long, env = "SAFE_FETCH_CONNECT_TIMEOUT_MS", default_value_t = 3050)]
    pub connect_timeout_ms: u64,

    /// Read timeout in seconds
    #[arg(long, env = "SAFE_FETCH_READ_TIMEOUT", default_value_t = 10)]
    pub read_timeout_secs: u64,

    /// Maximum redirects followed per attempt
    #[arg(long, env = "SAFE_FETCH_MAX_REDIRECTS", default_value_t = 5)]
    pub max_redirects: u32,

    /// Attempts per fetch, including the first
    #[arg(long, env = "SAFE_FETCH_MAX_RETRIES", default_value_t = 3)]
    pub max_retries: u32,

    /// Backoff unit in milliseconds (waits are unit * 2^attempt)
    #[arg(long, env = "SAFE_FETCH_BACKOFF_UNIT_MS", default_value_t = 1000)]
    pub backoff_unit_ms: u64,

    /// Backoff cap in milliseconds (unset leaves backoff uncapped)
    #[arg(long, env = "SAFE_FETCH_BACKOFF_MAX_MS")]
    pub backoff_max_ms: Option<u64>,

    /// DNS cache TTL in seconds (0 disables)
    #[arg(long, env = "SAFE_FETCH_DNS_CACHE_TTL", default_value_t = 60)]
    pub dns_cache_ttl_secs: u64,

    /// DNS cache capacity (entries)
    #[arg(long, env = "SAFE_FETCH_DNS_CACHE_CAPACITY", default_value_t = 1024)]
    pub dns_cache_capacity: usize,

    /// Maximum response body size in bytes
    #[arg(long, env = "SAFE_FETCH_MAX_BODY_BYTES", default_value_t = 10 * 1024 * 1024)]
    pub max_body_bytes: usize,

    /// User-Agent header
    #[arg(long, env = "SAFE_FETCH_USER_AGENT")]
    pub user_agent: Option<String>,

    /// Static bearer token sent as Authorization header
    #[arg(long, env = "SAFE_FETCH_BEARER_TOKEN", hide_env_values = true)]
    pub bearer_token: Option<String>,

    /// Additional hostnames to refuse (comma-separated)
    #[arg(long, env = "SAFE_FETCH_DENY_HOSTS", value_delimiter = ',')]
    pub deny_hosts: Vec<String>,

    /// Rate limit in requests per second (unset disables)
    #[arg(long, env = "SAFE_FETCH_RATE_LIMIT")]
    pub rate_limit_per_sec: Option<f64>,

    /// Rate limit burst size
    #[arg(long, env = "SAFE_FETCH_RATE_LIMIT_BURST", default_value_t = 1)]
    pub rate_limit_burst: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "SAFE_FETCH_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "SAFE_FETCH_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

impl Config {
    /// Reject settings that cannot produce a working client.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_retries == 0 {
            anyhow::bail!("max_retries must be at least 1");
        }
        if self.connect_timeout_ms == 0 || self.read_timeout_secs == 0 {
            anyhow::bail!("timeouts must be greater than zero");
        }
        if self.max_body_bytes == 0 {
            anyhow::bail!("max_body_bytes must be greater than zero");
        }
        if let Some(max) = self.backoff_max_ms {
            if max < self.backoff_unit_ms {
                anyhow::bail!(
                    "backoff_max_ms ({}) is smaller than backoff_unit_ms ({})",
                    max,
                    self.backoff_unit_ms
                );
            }
        }
        if let Some(rate) = self.rate_limit_per_sec {
            if !rate.is_finite() || rate <= 0.0 {
                anyhow::bail!("rate_limit_per_sec must be a positive number, got {rate}");
            }
        }
        for header in &self.headers {
            parse_header(header)?;
        }
        if self.json {
            if let Some(data) = &self.data {
                serde_json::from_str::<serde_json::Value>(data)
                    .map_err(|e| anyhow::anyhow!("--data is not valid JSON: {e}"))?;
            }
        }
        Ok(())
    }

    pub fn settings(&self) -> FetchSettings {
        FetchSettings {
            base_url: None,
            user_agent: self
                .user_agent
                .clone()
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            bearer_token: self.bearer_token.clone(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            max_redirects: self.max_redirects,
            max_retries: self.max_retries,
            backoff: BackoffPolicy {
                unit: Duration::from_millis(self.backoff_unit_ms),
                max: self.backoff_max_ms.map(Duration::from_millis),
            },
            dns_cache_ttl: Duration::from_secs(self.dns_cache_ttl_secs),
            dns_cache_capacity: self.dns_cache_capacity,
            max_body_bytes: self.max_body_bytes,
            denied_hosts: self.deny_hosts.clone(),
            rate_limit: self.rate_limit_per_sec.map(|per_sec| RateLimit {
                per_sec,
                burst: self.rate_limit_burst,
            }),
        }
    }
}

/// Split a `Name: value` header argument.
pub fn parse_header(raw: &str) -> anyhow::Result<(String, String)> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("header '{raw}' must look like 'Name: value'"))?;
    let name = name.trim();
    if name.is_empty() {
        anyhow::bail!("header '{raw}' has an empty name");
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// Optional TOML config file. Every field is optional; only present
/// values are injected.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_redirects: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_unit_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_max_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_cache_ttl_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_cache_capacity: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_body_bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deny_hosts: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_per_sec: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_burst: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_json: Option<bool>,
}

impl ConfigFile {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Inject values as environment variables so clap picks them up.
    ///
    /// Only sets variables that are **not** already present in the
    /// environment, preserving the precedence: CLI > env > config file.
    pub fn inject_env(&self) {
        macro_rules! set {
            ($env:expr, $val:expr) => {
                if let Some(ref v) = $val {
                    if std::env::var($env).is_err() {
                        std::env::set_var($env, v.to_string());
                    }
                }
            };
        }

        set!("SAFE_FETCH_CONNECT_TIMEOUT_MS", self.connect_timeout_ms);
        set!("SAFE_FETCH_READ_TIMEOUT", self.read_timeout_secs);
        set!("SAFE_FETCH_MAX_REDIRECTS", self.max_redirects);
        set!("SAFE_FETCH_MAX_RETRIES", self.max_retries);
        set!("SAFE_FETCH_BACKOFF_UNIT_MS", self.backoff_unit_ms);
        set!("SAFE_FETCH_BACKOFF_MAX_MS", self.backoff_max_ms);
        set!("SAFE_FETCH_DNS_CACHE_TTL", self.dns_cache_ttl_secs);
        set!("SAFE_FETCH_DNS_CACHE_CAPACITY", self.dns_cache_capacity);
        set!("SAFE_FETCH_MAX_BODY_BYTES", self.max_body_bytes);
        set!("SAFE_FETCH_USER_AGENT", self.user_agent);
        set!("SAFE_FETCH_BEARER_TOKEN", self.bearer_token);
        set!("SAFE_FETCH_RATE_LIMIT", self.rate_limit_per_sec);
        set!("SAFE_FETCH_RATE_LIMIT_BURST", self.rate_limit_burst);
        set!("SAFE_FETCH_LOG_LEVEL", self.log_level);
        set!("SAFE_FETCH_LOG_JSON", self.log_json);

        // comma-separated for clap's value_delimiter
        if let Some(ref hosts) = self.deny_hosts {
            if std::env::var("SAFE_FETCH_DENY_HOSTS").is_err() {
                std::env::set_var("SAFE_FETCH_DENY_HOSTS", hosts.join(","));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["safe-fetch"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_cli_args() {
        let config = parse(&[
            "https://example.com/api",
            "-X",
            "post",
            "-H",
            "X-Trace: 1",
            "--header",
            "Accept: text/html",
            "--data",
            r#"{"a":1}"#,
            "--json",
            "--deny-hosts",
            "a.internal,b.internal",
        ]);
        assert_eq!(config.url, "https://example.com/api");
        assert_eq!(config.method, Method::Post);
        assert_eq!(config.headers.len(), 2);
        assert_eq!(config.deny_hosts, vec!["a.internal", "b.internal"]);
        config.validate().unwrap();
    }

    #[test]
    fn test_settings_from_config() {
        let config = parse(&[
            "https://example.com",
            "--max-retries",
            "5",
            "--rate-limit-per-sec",
            "2.5",
        ]);
        let settings = config.settings();
        assert_eq!(settings.max_retries, 5);
        assert_eq!(settings.max_redirects, 5);
        assert_eq!(settings.connect_timeout, Duration::from_millis(3050));
        assert_eq!(settings.read_timeout, Duration::from_secs(10));
        assert_eq!(settings.backoff, BackoffPolicy::default());
        assert_eq!(
            settings.rate_limit,
            Some(RateLimit {
                per_sec: 2.5,
                burst: 1
            })
        );
        assert_eq!(settings.user_agent, DEFAULT_USER_AGENT);
    }

    #[test]
    fn test_backoff_cap_is_opt_in() {
        let config = parse(&["https://example.com", "--backoff-max-ms", "30000"]);
        config.validate().unwrap();
        assert_eq!(
            config.settings().backoff.max,
            Some(Duration::from_secs(30))
        );

        assert!(parse(&["https://x.example", "--backoff-max-ms", "10"])
            .validate()
            .is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(parse(&["https://x.example", "--max-retries", "0"])
            .validate()
            .is_err());
        assert!(parse(&["https://x.example", "--read-timeout-secs", "0"])
            .validate()
            .is_err());
        assert!(parse(&["https://x.example", "--rate-limit-per-sec", "0"])
            .validate()
            .is_err());
        assert!(parse(&["https://x.example", "-H", "no-colon"])
            .validate()
            .is_err());
        assert!(parse(&["https://x.example", "--json", "--data", "{nope"])
            .validate()
            .is_err());
    }

    #[test]
    fn test_parse_header() {
        assert_eq!(
            parse_header("Accept:  application/json ").unwrap(),
            ("Accept".to_string(), "application/json".to_string())
        );
        assert_eq!(
            parse_header("X-Empty:").unwrap(),
            ("X-Empty".to_string(), String::new())
        );
        assert!(parse_header(": v").is_err());
    }

    #[test]
    fn test_config_file_load() {
        let path = std::env::temp_dir().join(format!("safe-fetch-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            "max_retries = 4\ndeny_hosts = [\"metadata.internal\"]\nlog_json = true\n",
        )
        .unwrap();
        let file = ConfigFile::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(file.max_retries, Some(4));
        assert_eq!(file.deny_hosts, Some(vec!["metadata.internal".to_string()]));
        assert_eq!(file.log_json, Some(true));
        assert_eq!(file.read_timeout_secs, None);
    }
}
