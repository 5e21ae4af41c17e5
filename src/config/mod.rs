//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;
#[cfg(test)]
mod tests;

use std::{
    num::{NonZeroU32, NonZeroUsize},
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::domain::types::{SortKey, WorkloadKind};

pub use cli::{
    CliArgs, ClusterOverrides, Command, DemoArgs, LoggingOverrides, SessionOverrides, WatchArgs,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "tailview";
const ENV_PREFIX: &str = "TAILVIEW";
const DEFAULT_DASHBOARD_URL: &str = "http://localhost:7500/";
const DEFAULT_BASE_PATH: &str = "/";
const DEFAULT_CLUSTER_API_NAMESPACE: &str = "kubetail-system";
const DEFAULT_CLUSTER_API_SERVICE: &str = "kubetail-cluster-api";
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 2_000;
const DEFAULT_RECONNECT_DELAY_MS: u64 = 3_000;
const DEFAULT_PAGE_LIMIT: u64 = 100;
const DEFAULT_DEMO_PODS: u64 = 12;
const DEFAULT_DEMO_CONTAINERS_PER_POD: u64 = 2;
const DEFAULT_DEMO_TICK_MS: u64 = 500;

#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cluster: ClusterSettings,
    pub session: SessionSettings,
    pub demo: DemoSettings,
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

/// Where the dashboard and the cluster API live.
#[derive(Debug, Clone)]
pub struct ClusterSettings {
    pub dashboard_url: Url,
    /// Direct cluster-API endpoint; when unset the dashboard proxy is used.
    pub cluster_api_url: Option<Url>,
    /// Path prefix the dashboard is served under, always `/`-delimited.
    pub base_path: String,
    pub kube_context: Option<String>,
    pub cluster_api_namespace: String,
    pub cluster_api_service: String,
    pub wait_for_cluster_api: bool,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Empty means every namespace.
    pub namespace: String,
    pub kinds: Vec<WorkloadKind>,
    pub flush_interval: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: Option<NonZeroU32>,
    pub keepalive_interval: Option<Duration>,
    pub page_limit: NonZeroU32,
    pub sort: SortKey,
    pub offload_sort: bool,
    pub row_limit: Option<NonZeroUsize>,
}

#[derive(Debug, Clone)]
pub struct DemoSettings {
    pub pods: NonZeroU32,
    pub containers_per_pod: NonZeroU32,
    pub tick: Duration,
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

impl ClusterSettings {
    /// GraphQL endpoint of the dashboard itself.
    pub fn dashboard_graphql_url(&self) -> Url {
        self.dashboard_endpoint(&["graphql"])
    }

    /// GraphQL endpoint of the cluster API for `kube_context`.
    pub fn cluster_api_graphql_url(&self, kube_context: &str) -> Url {
        if let Some(url) = self.cluster_api_url.as_ref() {
            return url.clone();
        }
        self.dashboard_endpoint(&[
            "cluster-api-proxy",
            kube_context,
            self.cluster_api_namespace.as_str(),
            self.cluster_api_service.as_str(),
            "graphql",
        ])
    }

    fn dashboard_endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.dashboard_url.clone();
        let prefix: Vec<&str> = self
            .base_path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect();
        // http(s) URLs always have a base, validated at load time.
        if let Ok(mut path) = url.path_segments_mut() {
            path.clear().extend(prefix).extend(segments);
        }
        url
    }
}

/// `ws`/`wss` counterpart of an `http`/`https` endpoint.
pub fn websocket_url(endpoint: &Url) -> Url {
    let mut url = endpoint.clone();
    let scheme = match endpoint.scheme() {
        "https" => "wss",
        "http" => "ws",
        _ => return url,
    };
    // Switching between special schemes is always accepted.
    let _ = url.set_scheme(scheme);
    url
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Watch(args)) => raw.apply_watch_overrides(args),
        Some(Command::Demo(args)) => raw.apply_demo_overrides(args),
        None => raw.apply_watch_overrides(&WatchArgs::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cluster: RawClusterSettings,
    session: RawSessionSettings,
    demo: RawDemoSettings,
}

impl RawSettings {
    fn apply_watch_overrides(&mut self, args: &WatchArgs) {
        self.apply_logging_overrides(&args.logging);
        self.apply_session_overrides(&args.session);

        let overrides = &args.cluster;
        if let Some(url) = overrides.dashboard_url.as_ref() {
            self.cluster.dashboard_url = Some(url.clone());
        }
        if let Some(url) = overrides.cluster_api_url.as_ref() {
            self.cluster.cluster_api_url = Some(url.clone());
        }
        if let Some(path) = overrides.base_path.as_ref() {
            self.cluster.base_path = Some(path.clone());
        }
        if let Some(context) = overrides.kube_context.as_ref() {
            self.cluster.kube_context = Some(context.clone());
        }
        if let Some(wait) = overrides.wait_for_cluster_api {
            self.cluster.wait_for_cluster_api = Some(wait);
        }
    }

    fn apply_demo_overrides(&mut self, args: &DemoArgs) {
        self.apply_logging_overrides(&args.logging);
        self.apply_session_overrides(&args.session);

        if let Some(pods) = args.pods {
            self.demo.pods = Some(u64::from(pods));
        }
        if let Some(containers) = args.containers_per_pod {
            self.demo.containers_per_pod = Some(u64::from(containers));
        }
        if let Some(tick) = args.tick_ms {
            self.demo.tick_ms = Some(tick);
        }
    }

    fn apply_logging_overrides(&mut self, overrides: &LoggingOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }

    fn apply_session_overrides(&mut self, overrides: &SessionOverrides) {
        if let Some(namespace) = overrides.namespace.as_ref() {
            self.session.namespace = Some(namespace.clone());
        }
        if let Some(kinds) = overrides.kinds.as_ref() {
            self.session.kinds = Some(RawKinds::Many(kinds.clone()));
        }
        if let Some(sort) = overrides.sort.as_ref() {
            self.session.sort = Some(sort.clone());
        }
        if let Some(ms) = overrides.flush_interval_ms {
            self.session.flush_interval_ms = Some(ms);
        }
        if let Some(ms) = overrides.reconnect_delay_ms {
            self.session.reconnect_delay_ms = Some(ms);
        }
        if let Some(attempts) = overrides.max_reconnect_attempts {
            self.session.max_reconnect_attempts = Some(u64::from(attempts));
        }
        if let Some(ms) = overrides.keepalive_interval_ms {
            self.session.keepalive_interval_ms = Some(ms);
        }
        if let Some(limit) = overrides.page_limit {
            self.session.page_limit = Some(u64::from(limit));
        }
        if let Some(offload) = overrides.offload_sort {
            self.session.offload_sort = Some(offload);
        }
        if let Some(limit) = overrides.row_limit {
            self.session.row_limit = Some(limit as u64);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            cluster,
            session,
            demo,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            cluster: build_cluster_settings(cluster)?,
            session: build_session_settings(session)?,
            demo: build_demo_settings(demo)?,
        })
    }
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

fn build_cluster_settings(cluster: RawClusterSettings) -> Result<ClusterSettings, LoadError> {
    let dashboard_url = parse_http_url(
        cluster.dashboard_url.as_deref().unwrap_or(DEFAULT_DASHBOARD_URL),
        "cluster.dashboard_url",
    )?;
    let cluster_api_url = non_empty(cluster.cluster_api_url)
        .map(|value| parse_http_url(&value, "cluster.cluster_api_url"))
        .transpose()?;

    let base_path = normalize_base_path(
        cluster.base_path.as_deref().unwrap_or(DEFAULT_BASE_PATH),
    );

    let cluster_api_namespace = non_empty(cluster.cluster_api_namespace)
        .unwrap_or_else(|| DEFAULT_CLUSTER_API_NAMESPACE.to_string());
    let cluster_api_service = non_empty(cluster.cluster_api_service)
        .unwrap_or_else(|| DEFAULT_CLUSTER_API_SERVICE.to_string());

    Ok(ClusterSettings {
        dashboard_url,
        cluster_api_url,
        base_path,
        kube_context: non_empty(cluster.kube_context),
        cluster_api_namespace,
        cluster_api_service,
        wait_for_cluster_api: cluster.wait_for_cluster_api.unwrap_or(true),
    })
}

fn build_session_settings(session: RawSessionSettings) -> Result<SessionSettings, LoadError> {
    let namespace = session
        .namespace
        .map(|value| value.trim().to_string())
        .unwrap_or_default();

    let kinds = match session.kinds {
        Some(raw) => parse_kinds(raw)?,
        None => WorkloadKind::ALL.to_vec(),
    };

    let flush_interval = duration_ms(
        session
            .flush_interval_ms
            .unwrap_or(DEFAULT_FLUSH_INTERVAL_MS),
        "session.flush_interval_ms",
    )?;
    let reconnect_delay = duration_ms(
        session
            .reconnect_delay_ms
            .unwrap_or(DEFAULT_RECONNECT_DELAY_MS),
        "session.reconnect_delay_ms",
    )?;
    let max_reconnect_attempts = session
        .max_reconnect_attempts
        .map(|value| non_zero_u32(value, "session.max_reconnect_attempts"))
        .transpose()?;
    let keepalive_interval = session
        .keepalive_interval_ms
        .map(|value| duration_ms(value, "session.keepalive_interval_ms"))
        .transpose()?;
    let page_limit = non_zero_u32(
        session.page_limit.unwrap_or(DEFAULT_PAGE_LIMIT),
        "session.page_limit",
    )?;

    let sort = match non_empty(session.sort) {
        Some(value) => SortKey::from_str(&value)
            .map_err(|err| LoadError::invalid("session.sort", err.to_string()))?,
        None => SortKey::Recency,
    };

    let row_limit = session
        .row_limit
        .map(|value| {
            usize::try_from(value)
                .ok()
                .and_then(NonZeroUsize::new)
                .ok_or_else(|| LoadError::invalid("session.row_limit", "must be greater than zero"))
        })
        .transpose()?;

    Ok(SessionSettings {
        namespace,
        kinds,
        flush_interval,
        reconnect_delay,
        max_reconnect_attempts,
        keepalive_interval,
        page_limit,
        sort,
        offload_sort: session.offload_sort.unwrap_or(false),
        row_limit,
    })
}

fn build_demo_settings(demo: RawDemoSettings) -> Result<DemoSettings, LoadError> {
    Ok(DemoSettings {
        pods: non_zero_u32(demo.pods.unwrap_or(DEFAULT_DEMO_PODS), "demo.pods")?,
        containers_per_pod: non_zero_u32(
            demo.containers_per_pod
                .unwrap_or(DEFAULT_DEMO_CONTAINERS_PER_POD),
            "demo.containers_per_pod",
        )?,
        tick: duration_ms(demo.tick_ms.unwrap_or(DEFAULT_DEMO_TICK_MS), "demo.tick_ms")?,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawClusterSettings {
    dashboard_url: Option<String>,
    cluster_api_url: Option<String>,
    base_path: Option<String>,
    kube_context: Option<String>,
    cluster_api_namespace: Option<String>,
    cluster_api_service: Option<String>,
    wait_for_cluster_api: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSessionSettings {
    namespace: Option<String>,
    kinds: Option<RawKinds>,
    sort: Option<String>,
    flush_interval_ms: Option<u64>,
    reconnect_delay_ms: Option<u64>,
    max_reconnect_attempts: Option<u64>,
    keepalive_interval_ms: Option<u64>,
    page_limit: Option<u64>,
    offload_sort: Option<bool>,
    row_limit: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDemoSettings {
    pods: Option<u64>,
    containers_per_pod: Option<u64>,
    tick_ms: Option<u64>,
}

/// Environment variables carry a comma separated string; files carry a list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawKinds {
    One(String),
    Many(Vec<String>),
}

fn parse_kinds(raw: RawKinds) -> Result<Vec<WorkloadKind>, LoadError> {
    let names: Vec<String> = match raw {
        RawKinds::One(value) => value.split(',').map(str::to_string).collect(),
        RawKinds::Many(values) => values,
    };

    let mut kinds = Vec::new();
    for name in names.iter().map(|name| name.trim()).filter(|name| !name.is_empty()) {
        let kind = WorkloadKind::from_str(name)
            .map_err(|err| LoadError::invalid("session.kinds", err.to_string()))?;
        if !kinds.contains(&kind) {
            kinds.push(kind);
        }
    }

    if kinds.is_empty() {
        return Err(LoadError::invalid(
            "session.kinds",
            "at least one workload kind is required",
        ));
    }
    Ok(kinds)
}

fn parse_http_url(value: &str, key: &'static str) -> Result<Url, LoadError> {
    let url = Url::parse(value.trim())
        .map_err(|err| LoadError::invalid(key, format!("invalid URL `{value}`: {err}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(LoadError::invalid(
            key,
            format!("unsupported scheme `{other}`, expected http or https"),
        )),
    }
}

fn normalize_base_path(value: &str) -> String {
    let trimmed = value.trim().trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{trimmed}/")
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn duration_ms(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_millis(value))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
