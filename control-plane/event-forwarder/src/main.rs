use envconfig::Envconfig;
use event_forwarder::{config::ForwarderConfig, init_tracing, metrics, runtime};
use kube::Client;
use tracing::info;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    init_tracing("info");

    // kube and reqwest both pull in rustls; pin the provider so neither
    // trips over an ambiguous default.
    if let Err(e) = rustls::crypto::CryptoProvider::install_default(
        rustls::crypto::aws_lc_rs::default_provider(),
    ) {
        tracing::debug!(
            ?e,
            "CryptoProvider already installed or incompatible; proceeding"
        );
    }

    let meter_provider =
        match metrics::init_otlp_metrics_if_configured("event-forwarder") {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to initialize OTLP metrics exporter");
                None
            }
        };

    let cfg = ForwarderConfig::init_from_env()?;
    info!(?cfg, "Starting event forwarder");

    let client = Client::try_default().await?;
    let res = runtime::run_all(client, cfg).await;

    if let Some(provider) = meter_provider {
        if let Err(e) = provider.shutdown() {
            tracing::debug!(error = %e, "metrics provider shutdown");
        }
    }
    res
}
