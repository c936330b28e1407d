//! podwatch: keep a cache of pods and log every create, update and delete.
//!
//! On startup every existing pod is reported as created, since it is being
//! added to the cache. Updates are also reported at every resync period,
//! even when nothing changed.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use k8s_openapi::api::core::v1::Pod;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, ResourceExt};
use kubecache_core::{InformerConfig, Selector};
use kubecache_informer::{EventHandler, Informer};
use kubecache_kubehub::{KubeListWatch, KubeObject};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod diff;

#[derive(Parser, Debug)]
#[command(name = "podwatch", version, about = "Watch pods and log their lifecycle")]
struct Cli {
    /// Path to the kubeconfig file (default: $HOME/.kube/config)
    #[arg(long = "kubeconfig", env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Namespace to watch (default: all namespaces)
    #[arg(long = "namespace", short = 'n')]
    namespace: Option<String>,

    /// Label selector to filter on, e.g. "foo=bar,baz=quux"
    #[arg(long = "selector", short = 'l')]
    selector: Option<String>,

    /// Print pod details and update diffs
    #[arg(long = "details", action = ArgAction::SetTrue)]
    details: bool,

    /// Seconds between cache resyncs (0 disables)
    #[arg(long = "resync-secs", default_value_t = 300)]
    resync_secs: u64,

    /// First retry delay after a failed list/watch
    #[arg(long = "initial-backoff-ms", default_value_t = 800)]
    initial_backoff_ms: u64,

    /// Ceiling for retry delays
    #[arg(long = "max-backoff-secs", default_value_t = 30)]
    max_backoff_secs: u64,
}

impl Cli {
    /// An empty namespace means all namespaces.
    fn namespace(&self) -> Option<&str> { self.namespace.as_deref().filter(|ns| !ns.is_empty()) }

    fn informer_config(&self) -> InformerConfig {
        let mut selector = Selector::default();
        if let Some(ns) = self.namespace() {
            selector = selector.namespace(ns);
        }
        if let Some(labels) = &self.selector {
            selector = selector.labels(labels.clone());
        }
        let resync = (self.resync_secs > 0).then(|| Duration::from_secs(self.resync_secs));
        InformerConfig::default()
            .selector(selector)
            .resync_period(resync)
            .backoff(Duration::from_millis(self.initial_backoff_ms), Duration::from_secs(self.max_backoff_secs))
    }
}

fn init_tracing() {
    let env = std::env::var("PODWATCH_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("PODWATCH_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid PODWATCH_METRICS_ADDR; expected host:port");
        }
    }
}

fn default_kubeconfig() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(|home| PathBuf::from(home).join(".kube").join("config"))
}

/// In-cluster service account first, then the kubeconfig file.
async fn connect(kubeconfig: Option<PathBuf>) -> Result<kube::Client> {
    let config = match kube::Config::incluster() {
        Ok(config) => {
            info!("using in-cluster configuration");
            config
        }
        Err(e) => {
            debug!(error = %e, "not running in a cluster; trying kubeconfig");
            let path = kubeconfig
                .or_else(default_kubeconfig)
                .context("no kubeconfig path: pass --kubeconfig or set HOME")?;
            let kc = Kubeconfig::read_from(&path).with_context(|| format!("reading kubeconfig {}", path.display()))?;
            kube::Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
                .await
                .with_context(|| format!("loading kubeconfig {}", path.display()))?
        }
    };
    kube::Client::try_from(config).context("building kubernetes client")
}

fn render_age(pod: &Pod) -> String {
    let Some(created) = pod.creation_timestamp() else { return "-".to_string() };
    let mut secs = (chrono::Utc::now() - created.0).num_seconds().max(0);
    let days = secs / 86_400;
    secs %= 86_400;
    let hours = secs / 3600;
    secs %= 3600;
    let mins = secs / 60;
    secs %= 60;
    if days > 0 {
        format!("{}d{}h", days, hours)
    } else if hours > 0 {
        format!("{}h{}m", hours, mins)
    } else if mins > 0 {
        format!("{}m", mins)
    } else {
        format!("{}s", secs)
    }
}

/// Logs pod lifecycle; with `details`, dumps objects and update diffs.
struct PodLogger {
    details: bool,
}

impl PodLogger {
    fn dump(&self, pod: &KubeObject<Pod>) -> Result<()> {
        if self.details {
            println!("{}", serde_json::to_string_pretty(pod)?);
        }
        Ok(())
    }
}

impl EventHandler<KubeObject<Pod>> for PodLogger {
    // Pods are created with few fields populated; expect several updates right after.
    fn on_add(&self, pod: &KubeObject<Pod>) -> Result<()> {
        info!(namespace = ?pod.namespace(), age = %render_age(pod), "Pod created: {}", pod.name_any());
        self.dump(pod)
    }

    fn on_update(&self, old: &KubeObject<Pod>, new: &KubeObject<Pod>) -> Result<()> {
        info!(namespace = ?new.namespace(), "Pod updated: {}", new.name_any());
        if self.details {
            let changes = diff::changed_paths(&serde_json::to_value(old)?, &serde_json::to_value(new)?);
            if changes.is_empty() {
                info!("No difference, just a cache update");
            } else {
                info!(changes = changes.len(), "Difference:");
                for line in changes {
                    println!("  {}", line);
                }
            }
        }
        Ok(())
    }

    // A pod gets a deletion timestamp in an update before it is finally deleted.
    fn on_delete(&self, pod: &KubeObject<Pod>) -> Result<()> {
        info!(namespace = ?pod.namespace(), "Pod deleted: {}", pod.name_any());
        self.dump(pod)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let config = cli.informer_config();

    let client = connect(cli.kubeconfig.clone()).await?;
    let api: Api<Pod> = match cli.namespace() {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let informer = Informer::new(KubeListWatch::new(api), config, PodLogger { details: cli.details })
        .context("invalid informer configuration")?;
    let handle = informer.handle();

    let token = CancellationToken::new();
    let run = tokio::spawn(informer.run(token.clone()));
    tokio::spawn({
        let token = token.clone();
        async move {
            if handle.wait_for_sync(&token).await {
                info!(pods = handle.store().len(), "cache synced");
            }
        }
    });

    signal::ctrl_c().await.context("listening for ctrl-c")?;
    info!("interrupt received; shutting down");
    token.cancel();
    run.await.context("informer task")?;
    Ok(())
}
