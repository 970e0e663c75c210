use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use kube::Client;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    config::ForwarderConfig,
    controller::{ControllerContext, run_controller},
    delivery::{DeliveryClient, DeliveryError, LokiTransport},
    leader::{LeaderState, Leadership, LeaseElector},
    metrics::forwarder_metrics,
    reconcile::Reconciler,
    source::KubeEventSource,
    web::{ProbeState, run_probe_server},
};

/// Compute the probe server bind address based on config.
pub fn compute_http_addr(cfg: &ForwarderConfig) -> SocketAddr {
    ([0, 0, 0, 0], cfg.http_port).into()
}

/// Spawn the liveness/readiness HTTP server.
pub fn spawn_probe_server(
    addr: SocketAddr,
    state: ProbeState,
) -> JoinHandle<anyhow::Result<()>> {
    tokio::spawn(async move { run_probe_server(addr, state).await })
}

/// Log every failed delivery reported by the delivery client.
pub fn spawn_error_drain(
    errors: flume::Receiver<DeliveryError>,
) -> JoinHandle<()> {
    let metrics = forwarder_metrics();
    tokio::spawn(async move {
        while let Ok(err) = errors.recv_async().await {
            let kind = match &err {
                DeliveryError::Retryable { .. } => "retryable",
                DeliveryError::Fatal(_) => "fatal",
                DeliveryError::Closed => "closed",
                DeliveryError::Unreachable(_) => "unreachable",
            };
            metrics.record_delivery_error(kind);
            error!(error = %err, kind, "loki delivery error");
        }
    })
}

/// Run `work` only while this replica leads.
///
/// Each leadership term starts a fresh `work()` future. When leadership is
/// lost the future is dropped on the spot, abandoning whatever it was doing;
/// the next term starts over. Returns on shutdown or when `work` finishes
/// by itself.
pub async fn run_while_leader<F, Fut>(
    leadership: LeaderState,
    shutdown: CancellationToken,
    mut work: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let term = Arc::new(Mutex::new(CancellationToken::new()));
    {
        let term = term.clone();
        leadership.on_leadership_lost(Box::new(move || {
            term.lock().unwrap_or_else(|e| e.into_inner()).cancel();
        }));
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = leadership.wait_for_leader() => {}
        }
        let token = CancellationToken::new();
        *term.lock().unwrap_or_else(|e| e.into_inner()) = token.clone();
        // Lost again before the new token was installed.
        if !leadership.is_leader() {
            continue;
        }

        info!("leading; starting event controller");
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("shutdown requested; stopping event controller");
                return;
            }
            _ = token.cancelled() => {
                warn!("leadership lost; abandoning in-flight events");
            }
            _ = work() => {
                warn!("event controller exited");
                return;
            }
        }
    }
}

/// Drive `work` to completion unless the probe server stops first. Any
/// probe server exit is an error.
pub async fn run_with_probe_server<Fut>(
    http: &mut JoinHandle<anyhow::Result<()>>,
    work: Fut,
) -> anyhow::Result<()>
where
    Fut: Future<Output = ()>,
{
    tokio::select! {
        _ = work => Ok(()),
        res = http => {
            let err = match res {
                Ok(Ok(())) => anyhow::anyhow!("probe server stopped"),
                Ok(Err(e)) => e,
                Err(e) => e.into(),
            };
            error!(error = %err, "probe server failed; shutting down");
            Err(err)
        }
    }
}

/// Wire the forwarder together and run until a shutdown signal arrives.
pub async fn run_all(client: Client, cfg: ForwarderConfig) -> anyhow::Result<()> {
    cfg.validate()?;
    let common_labels = cfg.common_labels()?;

    let probe = ProbeState::new();
    let mut http = spawn_probe_server(compute_http_addr(&cfg), probe.clone());

    let transport =
        LokiTransport::from_url(&cfg.loki_push_url, cfg.request_timeout())?;
    let delivery = match DeliveryClient::connect(transport, cfg.backoff_policy()).await {
        Ok(d) => Arc::new(d),
        Err(e) => {
            error!(url = %cfg.loki_push_url, error = %e, "loki is not reachable; refusing to start");
            return Err(e.into());
        }
    };
    probe.set_ready(true);
    let drain = spawn_error_drain(delivery.errors());

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.cancel();
        });
    }

    let (leadership, elector) = if cfg.leader.enabled {
        let (writer, state) = LeaderState::channel();
        let elector = LeaseElector::new(client.clone(), cfg.lease_config(), writer);
        (state, Some(tokio::spawn(elector.run(shutdown.clone()))))
    } else {
        (LeaderState::always(), None)
    };

    let reconciler = Reconciler::new(
        Arc::new(KubeEventSource::new(client.clone())),
        delivery.clone(),
        Arc::new(leadership.clone()),
        common_labels,
    );
    let ctx = Arc::new(ControllerContext {
        reconciler,
        requeue_after: cfg.requeue_after(),
    });
    let watch_namespace = cfg.watch_namespace.clone();

    let served = run_with_probe_server(
        &mut http,
        run_while_leader(leadership, shutdown.clone(), || {
            run_controller(client.clone(), watch_namespace.clone(), ctx.clone())
        }),
    )
    .await;

    probe.set_ready(false);
    shutdown.cancel();
    if let Some(elector) = elector {
        let _ = elector.await;
    }
    delivery.close().await;
    drain.abort();
    http.abort();
    info!("event forwarder stopped");
    served
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(
            tokio::signal::unix::SignalKind::terminate(),
        )
        .expect("failed to install signal handler")
        .recv()
        .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
