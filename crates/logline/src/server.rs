//! TCP acceptor and server lifecycle.
//!
//! `LogServer::start` wires the whole pipeline together: storage sink,
//! ring buffer, processor pool, the accept loop and a periodic stats
//! reporter. `shutdown` tears it down in order - stop accepting, wait for
//! handlers (10 s budget), let the processors drain and flush (30 s
//! budget), stop the stats reporter (5 s budget), then close the buffer
//! and the storage sink. Records still buffered past the budget are lost;
//! durability across shutdown is explicitly not guaranteed.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::buffer::CircularBuffer;
use crate::config::Config;
use crate::errors::ServerError;
use crate::handler::ConnectionHandler;
use crate::processor::{ProcessorMetrics, ProcessorPool};
use crate::storage::FileStorage;

const HANDLER_SHUTDOWN_BUDGET: Duration = Duration::from_secs(10);
const PROCESSOR_SHUTDOWN_BUDGET: Duration = Duration::from_secs(30);
const STATS_SHUTDOWN_BUDGET: Duration = Duration::from_secs(5);
const STATS_INTERVAL: Duration = Duration::from_secs(30);

pub struct LogServer {
    buffer: Arc<CircularBuffer>,
    storage: Arc<FileStorage>,
    processors: ProcessorPool,
    cancel: CancellationToken,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
    handlers: TaskTracker,
    active_clients: Arc<AtomicUsize>,
    stats_task: JoinHandle<()>,
}

impl LogServer {
    /// Builds the pipeline and starts listening. A bind failure is the one
    /// startup error that is fatal to the process.
    pub async fn start(config: Arc<Config>) -> Result<Self, ServerError> {
        let storage = Arc::new(FileStorage::new(&config.storage_directory).await?);
        let buffer = Arc::new(CircularBuffer::new(config.buffer_size));
        let cancel = CancellationToken::new();

        let processors = ProcessorPool::start(
            Arc::clone(&buffer),
            Arc::clone(&storage),
            config.thread_pool_size,
            cancel.child_token(),
        );

        let addr = format!("0.0.0.0:{}", config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;
        info!(
            "log server listening on {local_addr} - buffer: {}, processors: {}, max clients: {}",
            config.buffer_size, config.thread_pool_size, config.max_clients
        );

        let handlers = TaskTracker::new();
        let active_clients = Arc::new(AtomicUsize::new(0));

        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&buffer),
            cancel.clone(),
            handlers.clone(),
            Arc::clone(&active_clients),
            config.max_clients,
        ));

        let stats_task = tokio::spawn(stats_loop(
            Arc::clone(&buffer),
            Arc::clone(&storage),
            processors.metrics(),
            Arc::clone(&active_clients),
            cancel.clone(),
        ));

        Ok(LogServer {
            buffer,
            storage,
            processors,
            cancel,
            local_addr,
            accept_task,
            handlers,
            active_clients,
            stats_task,
        })
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub fn buffer(&self) -> Arc<CircularBuffer> {
        Arc::clone(&self.buffer)
    }

    #[must_use]
    pub fn storage(&self) -> Arc<FileStorage> {
        Arc::clone(&self.storage)
    }

    #[must_use]
    pub fn processor_metrics(&self) -> Arc<ProcessorMetrics> {
        self.processors.metrics()
    }

    #[must_use]
    pub fn active_clients(&self) -> usize {
        self.active_clients.load(Ordering::Relaxed)
    }

    /// Graceful shutdown with bounded waits per pool.
    pub async fn shutdown(mut self) {
        info!("shutting down log server");
        self.cancel.cancel();

        if let Err(err) = self.accept_task.await {
            debug!("accept loop task failed: {err}");
        }

        self.handlers.close();
        if tokio::time::timeout(HANDLER_SHUTDOWN_BUDGET, self.handlers.wait())
            .await
            .is_err()
        {
            warn!("handler shutdown budget exceeded, abandoning remaining connections");
        }

        // workers drain whatever the handlers managed to enqueue
        self.processors.shutdown(PROCESSOR_SHUTDOWN_BUDGET).await;

        if tokio::time::timeout(STATS_SHUTDOWN_BUDGET, &mut self.stats_task)
            .await
            .is_err()
        {
            warn!("stats task shutdown budget exceeded, aborting it");
            self.stats_task.abort();
        }

        self.buffer.close();
        self.storage.close().await;
        info!("log server stopped");
    }
}

/// Holds one admission slot for the lifetime of a connection. Dropping the
/// guard releases the slot, so the count stays correct even when a handler
/// task panics or is aborted.
struct ConnectionSlot {
    active_clients: Arc<AtomicUsize>,
}

impl ConnectionSlot {
    fn claim(active_clients: &Arc<AtomicUsize>) -> Self {
        active_clients.fetch_add(1, Ordering::Relaxed);
        ConnectionSlot {
            active_clients: Arc::clone(active_clients),
        }
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.active_clients.fetch_sub(1, Ordering::Relaxed);
    }
}

async fn accept_loop(
    listener: TcpListener,
    buffer: Arc<CircularBuffer>,
    cancel: CancellationToken,
    handlers: TaskTracker,
    active_clients: Arc<AtomicUsize>,
    max_clients: usize,
) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            () = cancel.cancelled() => break,
        };
        match accepted {
            Ok((stream, peer)) => {
                if active_clients.load(Ordering::Relaxed) >= max_clients {
                    warn!("client limit reached, turning away {peer}");
                    drop(stream);
                    continue;
                }
                let slot = ConnectionSlot::claim(&active_clients);

                let handler = ConnectionHandler::new(stream, peer, Arc::clone(&buffer));
                debug!("accepted {peer} as {}", handler.client_id());

                let cancel = cancel.clone();
                handlers.spawn(async move {
                    let _slot = slot;
                    handler.run(cancel).await;
                });
            }
            Err(err) => {
                if cancel.is_cancelled() {
                    break;
                }
                error!("failed to accept connection: {err}");
            }
        }
    }
    // dropping the listener here closes the listening socket
    debug!("acceptor stopped");
}

async fn stats_loop(
    buffer: Arc<CircularBuffer>,
    storage: Arc<FileStorage>,
    metrics: Arc<ProcessorMetrics>,
    active_clients: Arc<AtomicUsize>,
    cancel: CancellationToken,
) {
    let started = Instant::now();
    let mut interval = tokio::time::interval(STATS_INTERVAL);
    interval.tick().await; // discard the immediate first tick

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let storage_stats = storage.stats().await;
                info!(
                    "server stats - uptime: {}s, clients: {}, {}, {}, processed: {}, batches: {}",
                    started.elapsed().as_secs(),
                    active_clients.load(Ordering::Relaxed),
                    buffer.stats(),
                    storage_stats,
                    metrics.records_processed(),
                    metrics.batches_flushed(),
                );
            }
            () = cancel.cancelled() => break,
        }
    }
}
