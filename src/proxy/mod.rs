pub mod cache;
pub mod capture;
pub mod forward_error;
pub mod forward_limits;
pub mod headers;
pub mod http;
pub mod listener;
pub mod message;
pub mod transport;
pub mod upstream;

use std::sync::Arc;

use anyhow::Result;
use rustls::client::ClientConfig;
use tracing::info;

use crate::settings::{Settings, UpstreamTarget};

use self::capture::{ResponseCapture, ResponseModifier};
use self::transport::{CachedTransport, Transport};

/// Everything a connection task needs, shared behind `Arc`s.
#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub upstream: Arc<UpstreamTarget>,
    pub transport: Arc<dyn Transport>,
    pub modifier: Arc<dyn ResponseModifier>,
}

impl AppContext {
    pub fn new(
        settings: Arc<Settings>,
        upstream: Arc<UpstreamTarget>,
        transport: Arc<dyn Transport>,
        modifier: Arc<dyn ResponseModifier>,
    ) -> Self {
        Self {
            settings,
            upstream,
            transport,
            modifier,
        }
    }

    /// Opens the configured store and stacks the cache layer over the network transport.
    pub async fn assemble(settings: Arc<Settings>, tls: Option<Arc<ClientConfig>>) -> Result<Self> {
        let upstream = Arc::new(settings.upstream_target()?);
        let store = cache::open_store(&settings).await?;
        let network: Arc<dyn Transport> =
            Arc::new(http::HttpTransport::new(upstream.clone(), tls, &settings));
        let transport = Arc::new(CachedTransport::new(store.clone(), network));
        let modifier = Arc::new(ResponseCapture::new(
            store,
            upstream.clone(),
            settings.cache_max_entry_size,
        ));
        info!(upstream = %upstream.base, "proxying to upstream");
        Ok(Self::new(settings, upstream, transport, modifier))
    }
}

pub async fn run(app: AppContext) -> Result<()> {
    listener::start_listener(app).await
}
