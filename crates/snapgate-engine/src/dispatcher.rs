//! Bounded render-task queue and the matching loop that pairs tasks
//! with idle pool handles.
//!
//! Concurrency is bounded by handle scarcity: the loop will not pull a
//! task until it can also pull a handle, and each matched pair runs as
//! one tracked execution. Completion order is not guaranteed; result
//! delivery is at-most-once through a oneshot the caller may abandon.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use snapgate_core::cache::{CacheBackend, RenderCache};
use snapgate_core::config::RenderOptions;
use snapgate_core::error::AppError;
use snapgate_core::model::{CachedRender, RenderResult};
use snapgate_core::traits::{BrowserDriver, KvStore};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::executor::{RenderExecutor, should_short_circuit};
use crate::handle::BrowserHandle;
use crate::pool::BrowserPool;

/// Headroom over the executor's own timeout so the driver-level
/// timeout fires first and stuck CDP calls are still caught.
const EXECUTION_TIMEOUT_MARGIN: Duration = Duration::from_secs(1);

/// One queued render request with its single-use result channel.
pub struct RenderTask {
    pub id: Uuid,
    pub url: String,
    pub options: RenderOptions,
    reply: oneshot::Sender<RenderResult>,
}

pub struct Dispatcher<D: BrowserDriver, K: KvStore> {
    pool: Arc<BrowserPool<D>>,
    executor: RenderExecutor,
    cache: Arc<CacheBackend<K>>,
    queue_tx: mpsc::Sender<RenderTask>,
    queue_depth: Arc<AtomicUsize>,
    cancel: CancellationToken,
    executions: TaskTracker,
}

impl<D: BrowserDriver, K: KvStore> Dispatcher<D, K> {
    pub fn new(
        pool: Arc<BrowserPool<D>>,
        executor: RenderExecutor,
        cache: Arc<CacheBackend<K>>,
        queue_capacity: usize,
        queue_depth: Arc<AtomicUsize>,
        cancel: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<RenderTask>) {
        let (queue_tx, queue_rx) = mpsc::channel(queue_capacity.max(1));
        let dispatcher = Arc::new(Self {
            pool,
            executor,
            cache,
            queue_tx,
            queue_depth,
            cancel,
            executions: TaskTracker::new(),
        });
        (dispatcher, queue_rx)
    }

    /// The matching loop: pull a task, pull an idle handle, spawn one
    /// execution per pair. Exits on cancellation; queued tasks are
    /// dropped with it, which resolves their callers with
    /// [`AppError::Cancelled`].
    pub async fn run(self: Arc<Self>, mut queue_rx: mpsc::Receiver<RenderTask>) {
        loop {
            let task = tokio::select! {
                () = self.cancel.cancelled() => break,
                task = queue_rx.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            };
            self.queue_depth.fetch_sub(1, Ordering::SeqCst);

            let handle = tokio::select! {
                () = self.cancel.cancelled() => break,
                handle = self.pool.acquire() => match handle {
                    Ok(handle) => handle,
                    Err(_) => break,
                },
            };

            let dispatcher = Arc::clone(&self);
            self.executions.spawn(async move {
                dispatcher.execute_task(task, handle).await;
            });
        }
        tracing::debug!("Dispatcher loop stopped");
    }

    /// Enqueue a render and wait for its result, bypassing the cache.
    /// Used by the crawler (traversal must see live DOM) and internally
    /// by the cached path.
    pub async fn render(
        &self,
        url: &str,
        options: &RenderOptions,
    ) -> Result<RenderResult, AppError> {
        let (reply, receiver) = oneshot::channel();
        let task = RenderTask {
            id: Uuid::new_v4(),
            url: url.to_string(),
            options: options.clone(),
            reply,
        };

        self.queue_depth.fetch_add(1, Ordering::SeqCst);
        if self.queue_tx.send(task).await.is_err() {
            self.queue_depth.fetch_sub(1, Ordering::SeqCst);
            return Err(AppError::Cancelled);
        }

        receiver.await.map_err(|_| AppError::Cancelled)
    }

    /// The full render path: cache lookup, then short-circuit, then a
    /// queued render. A failing cache never fails the request — the
    /// live path degrades to uncached rendering.
    pub async fn render_with_cache(
        &self,
        url: &str,
        options: &RenderOptions,
    ) -> Result<CachedRender, AppError> {
        match self.cache.get(url).await {
            Ok(Some(result)) => {
                return Ok(CachedRender {
                    result,
                    hit_cache: true,
                });
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(%url, error = %e, "Cache lookup failed; rendering without cache");
            }
        }

        if should_short_circuit(url) {
            return Ok(CachedRender {
                result: RenderResult::ok(String::new()),
                hit_cache: false,
            });
        }

        let result = self.render(url, options).await?;
        Ok(CachedRender {
            result,
            hit_cache: false,
        })
    }

    /// Wait for every in-flight execution to finish.
    pub async fn shutdown(&self) {
        self.executions.close();
        self.executions.wait().await;
    }

    async fn execute_task(&self, task: RenderTask, mut handle: BrowserHandle<D::Session>) {
        let deadline = self.executor.effective_timeout(&task.options) + EXECUTION_TIMEOUT_MARGIN;

        // The render runs in its own task so a panic is isolated from
        // the dispatcher and surfaces as a JoinError here.
        let executor = self.executor.clone();
        let session = Arc::clone(&handle.session);
        let url = task.url.clone();
        let options = task.options.clone();
        let work = tokio::spawn(async move { executor.execute(session.as_ref(), &url, &options).await });
        let abort = work.abort_handle();

        let result = match tokio::time::timeout(deadline, work).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) if join_err.is_panic() => {
                tracing::error!(task = %task.id, url = %task.url, "Render execution panicked");
                handle.mark_unhealthy();
                RenderResult::failed("render execution panicked")
            }
            Ok(Err(_)) => RenderResult::failed("render execution aborted"),
            Err(_) => {
                abort.abort();
                RenderResult::failed(format!(
                    "render timed out after {}s",
                    deadline.as_secs()
                ))
            }
        };

        if result.success {
            handle.record_success();
        } else {
            handle.record_failure();
        }

        // Populate the cache here, not in the caller, so work already
        // committed to a handle is kept even when the caller has gone.
        if result.is_cacheable() {
            if let Err(e) = self.cache.put(&task.url, &result).await {
                tracing::warn!(url = %task.url, error = %e, "Cache write failed");
            }
        }

        let _ = task.reply.send(result);

        self.pool.release(handle).await;
    }
}
