pub mod cli;
pub mod io_util;
pub mod logging;
pub mod metrics;
pub mod proxy;
pub mod settings;
pub mod util;

use std::sync::Arc;

use anyhow::{Result, ensure};
use rustls::crypto::ring;
use rustls::{RootCertStore, client::ClientConfig};
use rustls_native_certs as native_certs;
use tracing::warn;

use crate::settings::{Scheme, Settings};

pub async fn run(settings: Settings) -> Result<()> {
    settings.validate()?;
    let settings = Arc::new(settings);
    if let Some(addr) = settings.metrics_listen {
        tokio::spawn(async move {
            tracing::info!(address = %addr, "metrics endpoint starting");
            if let Err(err) = crate::metrics::serve(addr).await {
                tracing::error!(error = %err, "metrics endpoint failed");
            }
        });
    }

    let tls = match settings.upstream_target()?.scheme {
        Scheme::Https => Some(build_tls_client_config()?),
        Scheme::Http => None,
    };
    let app = proxy::AppContext::assemble(settings, tls).await?;
    proxy::run(app).await
}

/// Client config for an `https` upstream, trusting the system roots.
pub fn build_tls_client_config() -> Result<Arc<ClientConfig>> {
    let provider = ring::default_provider();
    let builder = ClientConfig::builder_with_provider(provider.into());
    let builder = builder.with_safe_default_protocol_versions()?;

    let mut root_store = RootCertStore::empty();
    let native = native_certs::load_native_certs();
    for err in &native.errors {
        warn!(error = %err, "failed to load some system trust anchors");
    }
    let (added, ignored) = root_store.add_parsable_certificates(native.certs);
    if ignored > 0 {
        warn!(ignored, "ignored {ignored} invalid system trust anchors");
    }

    ensure!(
        added > 0,
        "no trust anchors available; install system certificates to reach an https upstream"
    );

    let mut config = builder
        .with_root_certificates(Arc::new(root_store))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}
