use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use crate::cache::ResponseCache;

mod service;

pub use service::handle_request;

#[derive(Clone)]
pub struct AppContext {
    pub cache: ResponseCache,
    pub max_body_size: usize,
}

impl AppContext {
    pub fn new(cache: ResponseCache) -> Self {
        let max_body_size = cache.config().max_body_size;
        Self {
            cache,
            max_body_size,
        }
    }
}

pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind listener on {addr}"))?;
    let local_addr = listener.local_addr().unwrap_or(addr);
    info!(address = %local_addr, "gateway listener started");
    Ok(listener)
}

/// Accepts connections until `shutdown` resolves. Connections already accepted run to completion.
pub async fn serve<F>(listener: TcpListener, app: AppContext, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    loop {
        let (stream, peer_addr) = tokio::select! {
            _ = &mut shutdown => {
                info!("gateway listener stopping");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    error!(error = %err, "failed to accept incoming connection");
                    continue;
                }
            },
        };
        debug!(peer = %peer_addr, "accepted connection");
        if let Err(err) = stream.set_nodelay(true) {
            debug!(
                peer = %peer_addr,
                error = %err,
                "failed to set TCP_NODELAY on downstream stream"
            );
        }
        let connection_app = app.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, peer_addr, connection_app).await {
                debug!(peer = %peer_addr, error = %err, "connection closed with error");
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, app: AppContext) -> Result<()> {
    let service = service_fn(move |request| {
        let app = app.clone();
        async move { Ok::<_, Infallible>(handle_request(&app, peer, request).await) }
    });
    http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await
        .context("serving http/1.1 connection")
}
