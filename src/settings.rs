use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use config::{Config, ConfigError, Environment, File};
use http::Uri;
use serde::Deserialize;

use crate::cli::{Cli, LogFormat};

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_client_timeout() -> u64 {
    30
}

fn default_upstream_connect_timeout() -> u64 {
    120
}

fn default_upstream_timeout() -> u64 {
    120
}

fn default_upstream_idle_timeout() -> u64 {
    120
}

fn default_upstream_max_idle() -> usize {
    100
}

fn default_max_request_header_size() -> usize {
    32 * 1024
}

fn default_max_response_header_size() -> usize {
    32 * 1024
}

fn default_max_request_body_size() -> usize {
    64 * 1024 * 1024
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    #[default]
    Fs,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub upstream: Option<String>,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default)]
    pub cache_backend: CacheBackend,
    #[serde(default)]
    pub cache_max_entry_size: Option<u64>,
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    #[serde(default = "default_client_timeout")]
    pub client_timeout: u64,
    #[serde(default = "default_upstream_connect_timeout")]
    pub upstream_connect_timeout: u64,
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout: u64,
    #[serde(default = "default_upstream_idle_timeout")]
    pub upstream_idle_timeout: u64,
    #[serde(default = "default_upstream_max_idle")]
    pub upstream_max_idle: usize,
    #[serde(default = "default_max_request_header_size")]
    pub max_request_header_size: usize,
    #[serde(default = "default_max_response_header_size")]
    pub max_response_header_size: usize,
    #[serde(default = "default_max_request_body_size")]
    pub max_request_body_size: usize,
    #[serde(default)]
    pub metrics_listen: Option<SocketAddr>,
}

impl Settings {
    /// Layers an optional config file, `CACHEPROXY__*` environment variables
    /// and command-line flags, in increasing precedence.
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(config_path) = resolve_config_path(cli) {
            builder = builder.add_source(File::from(config_path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("CACHEPROXY")
                .separator("__")
                .try_parsing(true),
        );

        builder = builder
            .set_override_option("upstream", cli.upstream.clone())
            .map_err(to_anyhow)?
            .set_override_option(
                "cache_dir",
                cli.cache_dir.as_ref().map(|dir| dir.display().to_string()),
            )
            .map_err(to_anyhow)?
            .set_override_option("listen", cli.listen.clone())
            .map_err(to_anyhow)?
            .set_override_option("log", cli.log.map(|format| format.as_str()))
            .map_err(to_anyhow)?;

        let cfg = builder.build().map_err(to_anyhow)?;
        let settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Returns the parsed upstream, failing when none is configured.
    pub fn upstream_target(&self) -> Result<UpstreamTarget> {
        let raw = self.upstream.as_deref().ok_or_else(|| {
            anyhow!("no upstream configured; pass --upstream or set CACHEPROXY__UPSTREAM")
        })?;
        UpstreamTarget::parse(raw)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout)
    }

    pub fn upstream_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_connect_timeout)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout)
    }

    pub fn upstream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_idle_timeout)
    }

    pub fn validate(&self) -> Result<()> {
        self.upstream_target()?;
        ensure!(
            !self.cache_dir.as_os_str().is_empty(),
            "cache_dir must not be empty"
        );
        let sizes = [
            ("max_request_header_size", self.max_request_header_size),
            ("max_response_header_size", self.max_response_header_size),
            ("max_request_body_size", self.max_request_body_size),
        ];
        for (name, bytes) in sizes {
            ensure!(bytes > 0, "{name} must be greater than 0");
        }
        let timeouts = [
            ("client_timeout", self.client_timeout),
            ("upstream_connect_timeout", self.upstream_connect_timeout),
            ("upstream_timeout", self.upstream_timeout),
            ("upstream_idle_timeout", self.upstream_idle_timeout),
        ];
        for (name, secs) in timeouts {
            ensure!(secs > 0, "{name} must be at least one second");
        }
        ensure!(
            self.cache_max_entry_size != Some(0),
            "cache_max_entry_size must be greater than 0 when set"
        );
        ensure!(
            self.metrics_listen != Some(self.listen),
            "metrics_listen must differ from listen ({})",
            self.listen
        );
        Ok(())
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

fn resolve_config_path(cli: &Cli) -> Option<PathBuf> {
    if let Some(path) = cli.config.as_deref() {
        return Some(path.to_path_buf());
    }
    let candidate = Path::new("cacheproxy.toml");
    candidate.exists().then(|| candidate.to_path_buf())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub const fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// The single server every request is forwarded to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    /// The configured URL without a trailing slash.
    pub base: String,
    pub scheme: Scheme,
    /// Host name or address, IPv6 brackets removed.
    pub host: String,
    pub port: u16,
    /// `host[:port]` as written in URLs and the Host header.
    pub authority: String,
}

impl UpstreamTarget {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        ensure!(!trimmed.is_empty(), "upstream URL must not be empty");
        let uri: Uri = trimmed
            .parse()
            .with_context(|| format!("invalid upstream URL '{trimmed}'"))?;

        let scheme = match uri.scheme_str() {
            Some(value) if value.eq_ignore_ascii_case("http") => Scheme::Http,
            Some(value) if value.eq_ignore_ascii_case("https") => Scheme::Https,
            Some(other) => bail!("unsupported upstream scheme '{other}'"),
            None => bail!("upstream URL '{trimmed}' must start with http:// or https://"),
        };
        let authority = uri
            .authority()
            .ok_or_else(|| anyhow!("upstream URL '{trimmed}' has no host"))?;
        ensure!(
            !authority.as_str().contains('@'),
            "upstream URL must not embed credentials"
        );
        let host = authority.host();
        ensure!(!host.is_empty(), "upstream URL '{trimmed}' has no host");

        let explicit_port = authority.port_u16();
        let authority = match explicit_port {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let port = explicit_port.unwrap_or(scheme.default_port());
        let host = host.trim_start_matches('[').trim_end_matches(']').to_string();

        Ok(Self {
            base: trimmed.trim_end_matches('/').to_string(),
            scheme,
            host,
            port,
            authority,
        })
    }
}
