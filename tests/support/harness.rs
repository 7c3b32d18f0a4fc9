use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Result;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use cacheproxy::{
    cli::LogFormat,
    proxy::{self, AppContext},
    settings::{CacheBackend, Settings},
};

use super::dirs::TestDirs;

fn default_test_settings(upstream: &str, dirs: &TestDirs) -> Settings {
    Settings {
        upstream: Some(upstream.to_string()),
        cache_dir: dirs.cache_dir.clone(),
        cache_backend: CacheBackend::Fs,
        cache_max_entry_size: None,
        listen: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
        log: LogFormat::Text,
        client_timeout: 10,
        upstream_connect_timeout: 5,
        upstream_timeout: 10,
        upstream_idle_timeout: 30,
        upstream_max_idle: 8,
        max_request_header_size: 32 * 1024,
        max_response_header_size: 32 * 1024,
        max_request_body_size: 1024 * 1024,
        metrics_listen: None,
    }
}

pub struct ProxyHarness {
    pub dirs: TestDirs,
    pub addr: SocketAddr,
    pub settings: Arc<Settings>,
    handle: JoinHandle<()>,
}

impl ProxyHarness {
    pub async fn connect(&self) -> Result<TcpStream> {
        Ok(TcpStream::connect(self.addr).await?)
    }

    pub async fn shutdown(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }
}

pub struct ProxyHarnessBuilder {
    dirs: TestDirs,
    upstream: String,
    settings_override: Option<Box<dyn FnOnce(&mut Settings) + Send>>,
}

impl ProxyHarnessBuilder {
    pub fn new(upstream: impl Into<String>) -> Result<Self> {
        Ok(Self {
            dirs: TestDirs::new()?,
            upstream: upstream.into(),
            settings_override: None,
        })
    }

    pub fn with_settings<F>(mut self, func: F) -> Self
    where
        F: FnOnce(&mut Settings) + Send + 'static,
    {
        self.settings_override = Some(Box::new(func));
        self
    }

    pub async fn spawn(mut self) -> Result<ProxyHarness> {
        let mut settings = default_test_settings(&self.upstream, &self.dirs);
        if let Some(override_fn) = self.settings_override.take() {
            override_fn(&mut settings);
        }
        settings.validate()?;
        let settings = Arc::new(settings);

        let listener = TcpListener::bind(settings.listen).await?;
        let addr = listener.local_addr()?;
        let app = AppContext::assemble(settings.clone(), None).await?;

        let handle = tokio::spawn(async move {
            if let Err(err) = proxy::listener::serve(listener, app).await {
                tracing::error!(error = ?err, "proxy run failed");
            }
        });

        Ok(ProxyHarness {
            dirs: self.dirs,
            addr,
            settings,
            handle,
        })
    }
}
