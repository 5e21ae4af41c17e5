use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the tailview binary.
#[derive(Debug, Parser)]
#[command(
    name = "tailview",
    version,
    about = "Live view of Kubernetes workloads and their container log files"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "TAILVIEW_CONFIG_FILE",
        value_name = "PATH",
        value_hint = ValueHint::FilePath
    )]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Watch a cluster through the dashboard and cluster-API endpoints (default).
    Watch(Box<WatchArgs>),
    /// Run the live view against a synthetic in-process feed.
    Demo(DemoArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct WatchArgs {
    #[command(flatten)]
    pub logging: LoggingOverrides,

    #[command(flatten)]
    pub cluster: ClusterOverrides,

    #[command(flatten)]
    pub session: SessionOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct DemoArgs {
    #[command(flatten)]
    pub logging: LoggingOverrides,

    #[command(flatten)]
    pub session: SessionOverrides,

    /// Override the number of synthetic pods.
    #[arg(long = "demo-pods", value_name = "COUNT")]
    pub pods: Option<u32>,

    /// Override the number of containers per synthetic pod.
    #[arg(long = "demo-containers-per-pod", value_name = "COUNT")]
    pub containers_per_pod: Option<u32>,

    /// Override the synthetic event period.
    #[arg(long = "demo-tick-ms", value_name = "MS")]
    pub tick_ms: Option<u64>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct LoggingOverrides {
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

#[derive(Debug, Args, Default, Clone)]
pub struct ClusterOverrides {
    /// Override the dashboard base URL.
    #[arg(long = "dashboard-url", value_name = "URL", value_hint = ValueHint::Url)]
    pub dashboard_url: Option<String>,

    /// Use this cluster-API GraphQL endpoint instead of the dashboard proxy.
    #[arg(long = "cluster-api-url", value_name = "URL", value_hint = ValueHint::Url)]
    pub cluster_api_url: Option<String>,

    /// Override the path prefix the dashboard is served under.
    #[arg(long = "base-path", value_name = "PATH")]
    pub base_path: Option<String>,

    /// Use this kube context instead of asking the dashboard for the current one.
    #[arg(long = "kube-context", value_name = "NAME")]
    pub kube_context: Option<String>,

    /// Toggle waiting for the cluster API to report ready before fetching.
    #[arg(
        long = "wait-for-cluster-api",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub wait_for_cluster_api: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct SessionOverrides {
    /// Only show workloads in this namespace (empty for all).
    #[arg(long = "namespace", short = 'n', value_name = "NAMESPACE")]
    pub namespace: Option<String>,

    /// Workload kinds to show, comma separated.
    #[arg(long = "kinds", value_name = "KINDS", value_delimiter = ',')]
    pub kinds: Option<Vec<String>>,

    /// Row order: `recency` or `<field>[:asc|desc]`.
    #[arg(long = "sort", value_name = "KEY")]
    pub sort: Option<String>,

    /// Override the flush period.
    #[arg(long = "flush-interval-ms", value_name = "MS")]
    pub flush_interval_ms: Option<u64>,

    /// Override the delay before reconnecting a lost subscription.
    #[arg(long = "reconnect-delay-ms", value_name = "MS")]
    pub reconnect_delay_ms: Option<u64>,

    /// Give up after this many consecutive reconnect attempts.
    #[arg(long = "max-reconnect-attempts", value_name = "COUNT")]
    pub max_reconnect_attempts: Option<u32>,

    /// Send client pings at this period.
    #[arg(long = "keepalive-interval-ms", value_name = "MS")]
    pub keepalive_interval_ms: Option<u64>,

    /// Override the list page size used by the bulk fetch.
    #[arg(long = "page-limit", value_name = "COUNT")]
    pub page_limit: Option<u32>,

    /// Toggle maintaining the row order on a background task.
    #[arg(
        long = "offload-sort",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub offload_sort: Option<bool>,

    /// Show at most this many rows.
    #[arg(long = "row-limit", value_name = "COUNT")]
    pub row_limit: Option<usize>,
}
