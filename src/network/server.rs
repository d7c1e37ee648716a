//! TCP capture server.
//!
//! Owns the listening socket, the single process-wide [`SessionStore`], and
//! the set of active connections. Connections are accepted concurrently and
//! each runs its own [`handle_client`] task; a periodic reporter logs
//! throughput and feeds registered observers.

use crate::config::Settings;
use crate::error::AppResult;
use crate::network::connection::handle_client;
use crate::store::{SessionStore, StatsSnapshot};
use crate::unix_now;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinSet;
use tokio::time::interval;
use tracing::{error, info, warn};

/// How long shutdown waits for connection tasks to finish their notices.
const CONNECTION_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Observer invoked by the periodic stats reporter.
pub trait StatsObserver: Send + Sync {
    fn on_stats(&self, stats: &StatsSnapshot);
}

#[derive(Debug, Clone)]
pub struct ClientMeta {
    pub addr: SocketAddr,
    pub connected_at: f64,
}

/// State shared between the accept loop and the connection tasks.
pub struct ServerContext {
    pub settings: crate::config::ServerSettings,
    pub store: Arc<SessionStore>,
    clients: RwLock<HashMap<String, ClientMeta>>,
}

impl ServerContext {
    pub async fn register(&self, id: String, addr: SocketAddr) {
        let meta = ClientMeta {
            addr,
            connected_at: unix_now(),
        };
        self.clients.write().await.insert(id, meta);
    }

    pub async fn unregister(&self, id: &str) {
        self.clients.write().await.remove(id);
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }
}

/// Handle used to request a graceful shutdown from outside the run loop
/// (the ctrl-c task in `main`, or a test).
#[derive(Clone)]
pub struct ShutdownHandle(broadcast::Sender<()>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.0.send(());
    }
}

pub struct CaptureServer {
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    observers: Vec<Box<dyn StatsObserver>>,
    shutdown: broadcast::Sender<()>,
    stats_interval: Duration,
}

impl CaptureServer {
    /// Bind the listening socket and build the session store. Bind or
    /// directory-creation failures are fatal and propagate to the caller.
    pub async fn bind(settings: Settings) -> AppResult<Self> {
        let server = settings.server;
        let addr = format!("{}:{}", server.host, server.port);
        let listener = TcpListener::bind(&addr).await?;

        let drain_timeout = Duration::from_secs(server.drain_timeout_secs);
        let store = Arc::new(SessionStore::new(
            server.captures_dir.clone(),
            server.writer_workers,
            drain_timeout,
        )?);

        info!(
            addr = %listener.local_addr()?,
            captures = %server.captures_dir.display(),
            "capture server listening"
        );

        let (shutdown, _) = broadcast::channel(1);
        let stats_interval = Duration::from_secs(server.stats_interval_secs.max(1));

        Ok(Self {
            listener,
            ctx: Arc::new(ServerContext {
                settings: server,
                store,
                clients: RwLock::new(HashMap::new()),
            }),
            observers: Vec::new(),
            shutdown,
            stats_interval,
        })
    }

    /// The bound address, useful when the configured port was 0.
    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// The process-wide session store.
    pub fn store(&self) -> Arc<SessionStore> {
        Arc::clone(&self.ctx.store)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown.clone())
    }

    /// Register an observer for the periodic stats reporter.
    pub fn on_stats(&mut self, observer: impl StatsObserver + 'static) {
        self.observers.push(Box::new(observer));
    }

    /// Accept connections until shutdown is requested, then wind down:
    /// notify clients, stop accepting, give the image queue a bounded drain
    /// window, and finalize any still-open session.
    pub async fn run(mut self) -> AppResult<()> {
        let observers = std::mem::take(&mut self.observers);
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut report_timer = interval(self.stats_interval);
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                result = self.listener.accept() => match result {
                    Ok((stream, addr)) => {
                        let ctx = Arc::clone(&self.ctx);
                        let shutdown = self.shutdown.subscribe();
                        connections.spawn(handle_client(stream, addr, ctx, shutdown));
                    }
                    Err(e) => error!("accept error: {e}"),
                },
                _ = report_timer.tick() => {
                    if let Some(stats) = self.ctx.store.stats().await {
                        if stats.frame_count > 0 {
                            info!(
                                frames = stats.frame_count,
                                fps = stats.fps,
                                latency_ms = stats.avg_latency_ms,
                                queue = stats.queue_size,
                                total_mb = stats.total_mb,
                                "session throughput"
                            );
                            for observer in &observers {
                                observer.on_stats(&stats);
                            }
                        }
                    }
                },
                _ = shutdown_rx.recv() => {
                    info!("shutdown requested");
                    break;
                }
            }
        }

        // Connection tasks received the same broadcast: each sends its
        // shutdown notice and exits after the in-flight message.
        let close_all = async {
            while connections.join_next().await.is_some() {}
        };
        if tokio::time::timeout(CONNECTION_CLOSE_TIMEOUT, close_all)
            .await
            .is_err()
        {
            warn!("some connections did not close in time");
            connections.shutdown().await;
        }

        // Force-finalize regardless of whether the drain completes; bounding
        // shutdown latency wins over durability of in-flight image writes.
        self.ctx.store.shutdown().await;

        info!("server stopped");
        Ok(())
    }
}
