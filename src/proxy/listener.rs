use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use super::{AppContext, http};

pub async fn start_listener(app: AppContext) -> Result<()> {
    let addr = app.settings.listen;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding client listener on {addr}"))?;
    serve(listener, app).await
}

/// Accepts connections on an already bound listener, one task per connection.
pub async fn serve(listener: TcpListener, app: AppContext) -> Result<()> {
    info!(addr = %listener.local_addr()?, "accepting client connections");
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(error = %err, "accept failed");
                continue;
            }
        };
        if let Err(err) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %err, "could not disable Nagle on client stream");
        }
        let app = app.clone();
        tokio::spawn(async move {
            if let Err(err) = http::handle_http(stream, peer, app).await {
                debug!(
                    peer = %peer,
                    error = %format!("{err:#}"),
                    "client connection ended with error"
                );
            }
        });
    }
}
