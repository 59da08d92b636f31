//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    fmt::Write as _,
    net::SocketAddr,
    num::{NonZeroU64, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "raffica";
const DEFAULT_LISTEN_ADDRS: &str = "0.0.0.0:8098";
const DEFAULT_STATS_PATH: &str = "/static_proxy_stats";
const DEFAULT_CACHE_CAPACITY_BYTES: u64 = 100 * 1024 * 1024;
const DEFAULT_CACHE_MAX_ITEMS: usize = 100_000;
const DEFAULT_CACHE_GET_TIMEOUT_MS: u64 = 1000;
const DEFAULT_MAX_IDLE_UPSTREAM_CONNS: usize = 50;

/// Command-line arguments for the Raffica binary.
#[derive(Debug, Parser)]
#[command(name = "raffica", version, about = "Raffica caching reverse proxy")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "RAFFICA_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the proxy listeners.
    Serve(Box<ServeArgs>),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the upstream host to proxy data from; may include a port.
    #[arg(long = "upstream-host", value_name = "HOST")]
    pub upstream_host: Option<String>,

    /// Override the protocol used when talking to the upstream (http|https).
    #[arg(long = "upstream-protocol", value_name = "PROTOCOL")]
    pub upstream_protocol: Option<String>,

    /// Use the client-supplied Host header in upstream requests instead
    /// of the configured upstream host.
    #[arg(
        long = "use-client-request-host",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub use_client_request_host: Option<bool>,

    /// Override the maximum idle connections kept to the upstream host.
    #[arg(long = "max-idle-upstream-conns", value_name = "COUNT")]
    pub max_idle_upstream_conns: Option<usize>,

    /// Override the HTTP listen addresses (comma-separated).
    #[arg(long = "listen-addrs", value_name = "ADDRS")]
    pub listen_addrs: Option<String>,

    /// Override the HTTPS listen addresses (comma-separated).
    #[arg(long = "https-listen-addrs", value_name = "ADDRS")]
    pub https_listen_addrs: Option<String>,

    /// Override the path to the HTTPS server certificate.
    #[arg(long = "https-cert-file", value_name = "PATH")]
    pub https_cert_file: Option<PathBuf>,

    /// Override the path to the HTTPS server key.
    #[arg(long = "https-key-file", value_name = "PATH")]
    pub https_key_file: Option<PathBuf>,

    /// Override the statistics page path.
    #[arg(long = "stats-path", value_name = "PATH")]
    pub stats_path: Option<String>,

    /// Override the total cache capacity in bytes.
    #[arg(long = "cache-capacity-bytes", value_name = "BYTES")]
    pub cache_capacity_bytes: Option<u64>,

    /// Override the maximum number of cached items.
    #[arg(long = "cache-max-items", value_name = "COUNT")]
    pub cache_max_items: Option<usize>,

    /// Override the cache shard file paths (comma-separated; empty for
    /// an anonymous non-persistent cache).
    #[arg(long = "cache-file-paths", value_name = "PATHS")]
    pub cache_file_paths: Option<String>,

    /// Override the cache lookup timeout in milliseconds.
    #[arg(long = "cache-get-timeout-ms", value_name = "MS")]
    pub cache_get_timeout_ms: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub upstream: UpstreamSettings,
    pub cache: CacheSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub http_addrs: Vec<SocketAddr>,
    pub https_addrs: Vec<SocketAddr>,
    pub tls: Option<TlsSettings>,
    pub stats_path: String,
}

#[derive(Debug, Clone)]
pub struct TlsSettings {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub host: String,
    pub protocol: UpstreamProtocol,
    pub use_client_request_host: bool,
    pub max_idle_connections: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamProtocol {
    Http,
    Https,
}

impl UpstreamProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub capacity_bytes: NonZeroU64,
    pub max_items: NonZeroUsize,
    pub file_paths: Vec<PathBuf>,
    pub get_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Parse CLI arguments and load settings in one step.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let cli = CliArgs::parse();
    let settings = load(&cli)?;
    Ok((cli, settings))
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("RAFFICA").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    upstream: RawUpstreamSettings,
    cache: RawCacheSettings,
    logging: RawLoggingSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    listen_addrs: Option<String>,
    https_listen_addrs: Option<String>,
    https_cert_file: Option<PathBuf>,
    https_key_file: Option<PathBuf>,
    stats_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawUpstreamSettings {
    host: Option<String>,
    protocol: Option<String>,
    use_client_request_host: Option<bool>,
    max_idle_connections: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    capacity_bytes: Option<u64>,
    max_items: Option<usize>,
    file_paths: Option<String>,
    get_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.upstream_host.as_ref() {
            self.upstream.host = Some(host.clone());
        }
        if let Some(protocol) = overrides.upstream_protocol.as_ref() {
            self.upstream.protocol = Some(protocol.clone());
        }
        if let Some(value) = overrides.use_client_request_host {
            self.upstream.use_client_request_host = Some(value);
        }
        if let Some(value) = overrides.max_idle_upstream_conns {
            self.upstream.max_idle_connections = Some(value);
        }
        if let Some(addrs) = overrides.listen_addrs.as_ref() {
            self.server.listen_addrs = Some(addrs.clone());
        }
        if let Some(addrs) = overrides.https_listen_addrs.as_ref() {
            self.server.https_listen_addrs = Some(addrs.clone());
        }
        if let Some(path) = overrides.https_cert_file.as_ref() {
            self.server.https_cert_file = Some(path.clone());
        }
        if let Some(path) = overrides.https_key_file.as_ref() {
            self.server.https_key_file = Some(path.clone());
        }
        if let Some(path) = overrides.stats_path.as_ref() {
            self.server.stats_path = Some(path.clone());
        }
        if let Some(bytes) = overrides.cache_capacity_bytes {
            self.cache.capacity_bytes = Some(bytes);
        }
        if let Some(items) = overrides.cache_max_items {
            self.cache.max_items = Some(items);
        }
        if let Some(paths) = overrides.cache_file_paths.as_ref() {
            self.cache.file_paths = Some(paths.clone());
        }
        if let Some(ms) = overrides.cache_get_timeout_ms {
            self.cache.get_timeout_ms = Some(ms);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            upstream,
            cache,
            logging,
        } = raw;

        let server = build_server_settings(server)?;
        let upstream = build_upstream_settings(upstream)?;
        let cache = build_cache_settings(cache)?;
        let logging = build_logging_settings(logging)?;

        Ok(Self {
            server,
            upstream,
            cache,
            logging,
        })
    }

    /// One-line-per-field echo of the resolved configuration, rendered
    /// on the statistics page.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "listen_addrs={}",
            join_addrs(&self.server.http_addrs)
        );
        let _ = writeln!(
            out,
            "https_listen_addrs={}",
            join_addrs(&self.server.https_addrs)
        );
        let _ = writeln!(out, "stats_path={}", self.server.stats_path);
        let _ = writeln!(out, "upstream_host={}", self.upstream.host);
        let _ = writeln!(out, "upstream_protocol={}", self.upstream.protocol.as_str());
        let _ = writeln!(
            out,
            "use_client_request_host={}",
            self.upstream.use_client_request_host
        );
        let _ = writeln!(
            out,
            "max_idle_upstream_conns={}",
            self.upstream.max_idle_connections
        );
        let _ = writeln!(out, "cache_capacity_bytes={}", self.cache.capacity_bytes);
        let _ = writeln!(out, "cache_max_items={}", self.cache.max_items);
        let _ = writeln!(
            out,
            "cache_file_paths={}",
            self.cache
                .file_paths
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(",")
        );
        let _ = writeln!(
            out,
            "cache_get_timeout_ms={}",
            self.cache.get_timeout.as_millis()
        );
        out
    }
}

fn join_addrs(addrs: &[SocketAddr]) -> String {
    addrs
        .iter()
        .map(SocketAddr::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let http_addrs = parse_addr_list(
        server.listen_addrs.as_deref().unwrap_or(DEFAULT_LISTEN_ADDRS),
        "server.listen_addrs",
    )?;
    let https_addrs = parse_addr_list(
        server.https_listen_addrs.as_deref().unwrap_or(""),
        "server.https_listen_addrs",
    )?;

    if http_addrs.is_empty() && https_addrs.is_empty() {
        return Err(LoadError::invalid(
            "server.listen_addrs",
            "at least one HTTP or HTTPS listen address is required",
        ));
    }

    let tls = match (server.https_cert_file, server.https_key_file) {
        (Some(cert_file), Some(key_file)) => Some(TlsSettings {
            cert_file,
            key_file,
        }),
        (None, None) => None,
        _ => {
            return Err(LoadError::invalid(
                "server.https_cert_file",
                "certificate and key must be configured together",
            ));
        }
    };

    if !https_addrs.is_empty() && tls.is_none() {
        return Err(LoadError::invalid(
            "server.https_listen_addrs",
            "HTTPS listeners require https_cert_file and https_key_file",
        ));
    }

    let stats_path = server
        .stats_path
        .unwrap_or_else(|| DEFAULT_STATS_PATH.to_string());
    if !stats_path.starts_with('/') {
        return Err(LoadError::invalid(
            "server.stats_path",
            "path must start with `/`",
        ));
    }

    Ok(ServerSettings {
        http_addrs,
        https_addrs,
        tls,
        stats_path,
    })
}

fn build_upstream_settings(upstream: RawUpstreamSettings) -> Result<UpstreamSettings, LoadError> {
    let host = upstream
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| LoadError::invalid("upstream.host", "upstream host is required"))?;

    let protocol = match upstream.protocol.as_deref().unwrap_or("http") {
        "http" => UpstreamProtocol::Http,
        "https" => UpstreamProtocol::Https,
        other => {
            return Err(LoadError::invalid(
                "upstream.protocol",
                format!("expected `http` or `https`, got `{other}`"),
            ));
        }
    };

    Ok(UpstreamSettings {
        host,
        protocol,
        use_client_request_host: upstream.use_client_request_host.unwrap_or(false),
        max_idle_connections: upstream
            .max_idle_connections
            .unwrap_or(DEFAULT_MAX_IDLE_UPSTREAM_CONNS),
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let capacity_bytes = cache
        .capacity_bytes
        .unwrap_or(DEFAULT_CACHE_CAPACITY_BYTES);
    let capacity_bytes = NonZeroU64::new(capacity_bytes)
        .ok_or_else(|| LoadError::invalid("cache.capacity_bytes", "must be greater than zero"))?;

    let max_items = cache.max_items.unwrap_or(DEFAULT_CACHE_MAX_ITEMS);
    let max_items = NonZeroUsize::new(max_items)
        .ok_or_else(|| LoadError::invalid("cache.max_items", "must be greater than zero"))?;

    let file_paths = cache
        .file_paths
        .as_deref()
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(PathBuf::from)
        .collect();

    let timeout_ms = cache.get_timeout_ms.unwrap_or(DEFAULT_CACHE_GET_TIMEOUT_MS);
    if timeout_ms == 0 {
        return Err(LoadError::invalid(
            "cache.get_timeout_ms",
            "must be greater than zero",
        ));
    }

    Ok(CacheSettings {
        capacity_bytes,
        max_items,
        file_paths,
        get_timeout: Duration::from_millis(timeout_ms),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn parse_addr_list(list: &str, key: &'static str) -> Result<Vec<SocketAddr>, LoadError> {
    list.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            SocketAddr::from_str(part)
                .map_err(|err| LoadError::invalid(key, format!("`{part}`: {err}")))
        })
        .collect()
}
