use std::time::Duration;

use clap::{Args, Parser};

#[derive(Parser, Debug)]
#[command(version)]
#[command(about = "Export metrics about container images in a Kubernetes cluster.", long_about = None)]
pub struct Cli {
    #[arg(
        long,
        env = "METRICS_BIND_ADDRESS",
        default_value = ":8080",
        help = "The address the metric endpoint binds to, `0` disables it."
    )]
    pub(crate) metrics_bind_address: String,

    #[arg(
        long,
        env = "HEALTH_PROBE_BIND_ADDRESS",
        default_value = ":8081",
        help = "The address the probe endpoint binds to, `0` disables it."
    )]
    pub(crate) health_probe_bind_address: String,

    /// An empty value disables platform selection, multi-arch images then
    /// resolve to the first entry of their index.
    #[arg(long, env = "PLATFORM", default_value = "linux/amd64", help = "The default platform to resolve multi-arch images to.")]
    pub(crate) platform: String,

    #[arg(
        long,
        env = "CACHE_DURATION",
        default_value = "1h",
        value_parser = humantime::parse_duration,
        help = "How long to cache image details for before querying the registry again, `0s` disables periodic re-checks."
    )]
    pub(crate) cache_duration: Duration,

    #[command(flatten)]
    pub(crate) controller: ControllerOptions,

    #[arg(long, short, help = "Activates debug logging.")]
    pub(crate) debug: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ControllerOptions {
    #[arg(long, env = "WORKERS", default_value_t = 4, help = "How many objects of each kind are reconciled in parallel.")]
    pub(crate) workers: u16,

    #[arg(
        long,
        default_value = "2m",
        value_parser = humantime::parse_duration,
        help = "Upper bound for reconciling a single object."
    )]
    pub(crate) reconcile_timeout: Duration,

    #[arg(
        long,
        default_value = "30s",
        value_parser = humantime::parse_duration,
        help = "Upper bound for a single registry request."
    )]
    pub(crate) registry_timeout: Duration,

    /// Registries listed here are reached over plain HTTP.
    #[arg(
        long = "insecure-registry",
        env = "INSECURE_REGISTRIES",
        value_delimiter = ',',
        help = "Registry hosts (host[:port]) that do not serve TLS."
    )]
    pub(crate) insecure_registries: Vec<String>,
}
