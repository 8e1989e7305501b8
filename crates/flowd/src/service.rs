//! Service wiring: one producer, the enabled backends and the metrics
//! server, joined by an [`EventBus`].
//!
//! ## Shutdown
//! - Every task watches the same [`CancellationToken`]
//! - A backend that fails fatally cancels the token for everyone
//! - Tasks get `daemon.join_timeout_secs` to finish, then are aborted
//! - The bus is closed after all tasks are joined

use crate::backends::firefly::{FireflyBackend, FireflyEncoder};
use crate::backends::{BackendKind, PrometheusBackend};
use crate::bus::{EventBus, Subscription};
use crate::config::{Config, RegistryConfig};
use crate::discovery::{Discovery, IpConfig};
use crate::http;
use crate::metrics::Metrics;
use crate::registry::Registry;
use crate::snapshot::{ProcNetSource, SnapshotSource, SsSource};
use crate::socket::DualStackSocket;
use crate::sources::{FireflyListener, SourceKind};
use crate::tracker::ConnectionTracker;
use anyhow::{Context, Result};
use log::{error, info, warn};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::lookup_host;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Task {
    name: &'static str,
    handle: JoinHandle<Result<()>>,
}

/// Load the experiment/activity registry once.
pub async fn load_registry(config: &RegistryConfig) -> Result<Registry> {
    let registry = match (&config.file, &config.url) {
        (Some(file), _) => Registry::load_file(shellexpand::tilde(file).into_owned())?,
        (None, Some(url)) => Registry::fetch(url, config.insecure).await?,
        (None, None) => anyhow::bail!("registry.url or registry.file is required"),
    };
    if registry.is_empty() {
        warn!("Registry contains no experiments");
    }
    Ok(registry)
}

/// Run until `cancel` fires or a task fails fatally.
pub async fn run(config: Config, cancel: CancellationToken) -> Result<()> {
    config.validate()?;
    let source = config.source_kind()?;
    let backends = config.backend_kinds()?;
    info!(
        "flowd v{} starting: source={}, backends={:?}",
        env!("CARGO_PKG_VERSION"),
        source,
        backends.iter().map(|b| b.as_str()).collect::<Vec<_>>()
    );

    let registry = Arc::new(load_registry(&config.registry).await?);
    let metrics = Metrics::new();
    let bus = EventBus::new();
    let mut tasks = Vec::new();

    let startup = async {
        // Subscriptions are registered before the producer publishes anything
        for kind in &backends {
            let subscription = bus.register();
            start_backend(*kind, &config, subscription, &registry, &metrics, &cancel, &mut tasks)
                .await
                .with_context(|| format!("Failed to start {} backend", kind))?;
        }
        start_source(source, &config, &bus, &metrics, &cancel, &mut tasks).await
    }
    .await;
    if startup.is_err() {
        // Stop whatever already started
        cancel.cancel();
    }

    cancel.cancelled().await;
    info!("Shutting down");

    let join_timeout = Duration::from_secs(config.daemon.join_timeout_secs);
    let mut failed = false;
    for mut task in tasks {
        match tokio::time::timeout(join_timeout, &mut task.handle).await {
            Ok(Ok(Ok(()))) => info!("{} stopped", task.name),
            Ok(Ok(Err(_))) => failed = true,
            Ok(Err(e)) => {
                error!("{} panicked: {}", task.name, e);
                failed = true;
            }
            Err(_) => {
                warn!("{} did not stop within {:?}, aborting", task.name, join_timeout);
                task.handle.abort();
            }
        }
    }
    bus.close();

    startup?;
    if failed {
        anyhow::bail!("flowd stopped after a fatal error");
    }
    info!("flowd stopped");
    Ok(())
}

fn spawn<F>(tasks: &mut Vec<Task>, name: &'static str, cancel: &CancellationToken, fut: F)
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    let cancel = cancel.clone();
    let handle = tokio::spawn(async move {
        let result = fut.await;
        if let Err(e) = &result {
            error!("{} failed: {:#}", name, e);
            cancel.cancel();
        }
        result
    });
    tasks.push(Task { name, handle });
}

async fn start_backend(
    kind: BackendKind,
    config: &Config,
    subscription: Subscription,
    registry: &Arc<Registry>,
    metrics: &Arc<Metrics>,
    cancel: &CancellationToken,
    tasks: &mut Vec<Task>,
) -> Result<()> {
    match kind {
        BackendKind::FlowLabel => {
            start_flow_label(config, subscription, registry, metrics, cancel, tasks)
        }
        BackendKind::Firefly => {
            let ip_config = if config.discovery.enabled {
                Some(
                    Discovery::new(config.discovery.stun_servers.clone())
                        .discover()
                        .await,
                )
            } else {
                None::<IpConfig>
            };
            let encoder = FireflyEncoder::new(Arc::clone(registry))
                .with_ip_config(ip_config)
                .with_overrides(config.firefly.overrides());
            let collector = match &config.firefly.collector {
                Some(host) => Some(resolve_collector(host, config.firefly.port).await?),
                None => None,
            };
            let backend = FireflyBackend::new(encoder, DualStackSocket::bind().await?, config.firefly.port)
                .with_collector(collector)
                .with_metrics(Arc::clone(metrics));
            let token = cancel.clone();
            spawn(tasks, "firefly backend", cancel, async move {
                Ok(backend.run(subscription, token).await?)
            });
            Ok(())
        }
        BackendKind::Prometheus => {
            let listener = http::bind_metrics(config.prometheus.port).await?;
            let server_metrics = Arc::clone(metrics);
            let token = cancel.clone();
            spawn(tasks, "metrics server", cancel, async move {
                http::serve_metrics(listener, server_metrics, token).await;
                Ok(())
            });

            // Producers report statistics only with start and end
            let backend = PrometheusBackend::new(Arc::clone(registry), Arc::clone(metrics))
                .with_refresher(
                    Box::new(SsSource::new(&config.source.ss_path)),
                    config.source.interval(),
                );
            let token = cancel.clone();
            spawn(tasks, "prometheus backend", cancel, async move {
                Ok(backend.run(subscription, token).await?)
            });
            Ok(())
        }
    }
}

#[cfg(all(target_os = "linux", feature = "ebpf"))]
fn start_flow_label(
    config: &Config,
    subscription: Subscription,
    registry: &Arc<Registry>,
    metrics: &Arc<Metrics>,
    cancel: &CancellationToken,
    tasks: &mut Vec<Task>,
) -> Result<()> {
    use crate::backends::ebpf::{detect_interfaces, TcMarkingTable};
    use crate::backends::FlowLabelEncoder;

    let interfaces = if config.flow_label.interfaces.is_empty() {
        detect_interfaces()?
    } else {
        config.flow_label.interfaces.clone()
    };
    let object = shellexpand::tilde(&config.flow_label.object).to_string();
    let table = TcMarkingTable::load(std::path::Path::new(&object), &interfaces)?;
    info!("Flow label classifier on {:?}", table.attached_interfaces());

    let encoder = FlowLabelEncoder::new(table, Arc::clone(registry)).with_metrics(Arc::clone(metrics));
    let token = cancel.clone();
    spawn(tasks, "flow label backend", cancel, async move {
        Ok(encoder.run(subscription, token).await?)
    });
    Ok(())
}

#[cfg(not(all(target_os = "linux", feature = "ebpf")))]
fn start_flow_label(
    _config: &Config,
    _subscription: Subscription,
    _registry: &Arc<Registry>,
    _metrics: &Arc<Metrics>,
    _cancel: &CancellationToken,
    _tasks: &mut Vec<Task>,
) -> Result<()> {
    anyhow::bail!("the flow-label backend needs Linux and the `ebpf` feature")
}

async fn start_source(
    kind: SourceKind,
    config: &Config,
    bus: &EventBus,
    metrics: &Arc<Metrics>,
    cancel: &CancellationToken,
    tasks: &mut Vec<Task>,
) -> Result<()> {
    let bus = bus.clone();
    let token = cancel.clone();
    match kind {
        SourceKind::Netstat | SourceKind::Netlink | SourceKind::Iperf => {
            let snapshot: Box<dyn SnapshotSource> = match kind {
                SourceKind::Netlink => Box::new(SsSource::new(&config.source.ss_path)),
                _ => Box::new(ProcNetSource::default()),
            };
            let tracker = ConnectionTracker::new(
                config.internal_networks()?,
                config.source.tracker_mode(),
                config.identifier_policy()?,
            )
            .with_metrics(Arc::clone(metrics));
            let interval = config.source.interval();
            spawn(tasks, "tracker", cancel, async move {
                tracker.run(snapshot, bus, interval, token).await;
                Ok(())
            });
        }
        SourceKind::Firefly => {
            let listener = FireflyListener::bind(config.source.listen_addr()?)
                .await?
                .with_metrics(Arc::clone(metrics));
            spawn(tasks, "firefly listener", cancel, async move {
                listener.run(bus, token).await;
                Ok(())
            });
        }
        SourceKind::NpApi => start_pipe(config, bus, metrics, cancel, token, tasks)?,
    }
    Ok(())
}

#[cfg(unix)]
fn start_pipe(
    config: &Config,
    bus: EventBus,
    metrics: &Arc<Metrics>,
    cancel: &CancellationToken,
    token: CancellationToken,
    tasks: &mut Vec<Task>,
) -> Result<()> {
    let pipe = crate::sources::NpApiPipe::create(&config.source.pipe_path)?
        .with_metrics(Arc::clone(metrics));
    spawn(tasks, "np-api pipe", cancel, pipe.run(bus, token));
    Ok(())
}

#[cfg(not(unix))]
fn start_pipe(
    _config: &Config,
    _bus: EventBus,
    _metrics: &Arc<Metrics>,
    _cancel: &CancellationToken,
    _token: CancellationToken,
    _tasks: &mut Vec<Task>,
) -> Result<()> {
    anyhow::bail!("the np-api source needs a Unix named pipe")
}

/// First IPv4 address of the collector host.
async fn resolve_collector(host: &str, port: u16) -> Result<SocketAddr> {
    lookup_host((host, port))
        .await
        .with_context(|| format!("Failed to resolve firefly collector {}", host))?
        .find(SocketAddr::is_ipv4)
        .with_context(|| format!("Firefly collector {} has no IPv4 address", host))
}
