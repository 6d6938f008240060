//! Elastic pool of headless-browser handles.
//!
//! Idle handles sit in a deque guarded by an async mutex; a semaphore
//! mirrors the deque length so acquirers can wait without spinning.
//! Every deque mutation pairs with permit bookkeeping: a push adds one
//! permit, a removal consumes (and forgets) one. Locks are never held
//! across driver I/O.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use snapgate_core::config::{PoolConfig, ScalingConfig};
use snapgate_core::error::AppError;
use snapgate_core::traits::{BrowserDriver, BrowserSession};
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::handle::{BrowserHandle, HandleSnapshot, HandleStatus, ReplaceReason};

/// Queue-depth samples the scaling pass looks back over; scale-up
/// requires pressure across the whole window.
const DEPTH_WINDOW: usize = 3;

/// Size counters for the engine's stats surface.
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub working: usize,
}

struct PoolState<S: BrowserSession> {
    idle: VecDeque<BrowserHandle<S>>,
    total: usize,
}

pub struct BrowserPool<D: BrowserDriver> {
    driver: D,
    config: PoolConfig,
    scaling: ScalingConfig,
    state: Mutex<PoolState<D::Session>>,
    idle_permits: Semaphore,
    /// Dispatcher queue-depth gauge, sampled by the scaling pass.
    queue_depth: Arc<AtomicUsize>,
    depth_history: Mutex<VecDeque<usize>>,
    closed: AtomicBool,
}

impl<D: BrowserDriver> BrowserPool<D> {
    pub fn new(
        driver: D,
        config: PoolConfig,
        scaling: ScalingConfig,
        queue_depth: Arc<AtomicUsize>,
    ) -> Arc<Self> {
        Arc::new(Self {
            driver,
            config,
            scaling,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                total: 0,
            }),
            idle_permits: Semaphore::new(0),
            queue_depth,
            depth_history: Mutex::new(VecDeque::with_capacity(DEPTH_WINDOW)),
            closed: AtomicBool::new(false),
        })
    }

    /// Launch the initial handle set. Partial launch failures are
    /// tolerated (later passes top the pool up); launching nothing at
    /// all is fatal to engine start.
    pub async fn init(&self) -> Result<(), AppError> {
        let mut launched = 0;
        let mut last_error = None;
        for _ in 0..self.config.initial_size.max(1) {
            match self.driver.launch().await {
                Ok(session) => {
                    self.push_new(session).await;
                    launched += 1;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Browser launch failed during pool init");
                    last_error = Some(e);
                }
            }
        }
        if launched == 0 {
            return Err(AppError::PoolInit(format!(
                "no browser could be launched: {}",
                last_error.map(|e| e.to_string()).unwrap_or_default()
            )));
        }
        tracing::info!(size = launched, "Browser pool initialized");
        Ok(())
    }

    /// Wait for an idle handle. Returns [`AppError::Cancelled`] once
    /// the pool has been closed.
    pub async fn acquire(&self) -> Result<BrowserHandle<D::Session>, AppError> {
        let permit = self
            .idle_permits
            .acquire()
            .await
            .map_err(|_| AppError::Cancelled)?;
        permit.forget();

        let mut state = self.state.lock().await;
        match state.idle.pop_front() {
            Some(mut handle) => {
                handle.set_status(HandleStatus::Working);
                Ok(handle)
            }
            // Unreachable: a permit always pairs with an idle entry.
            None => Err(AppError::Generic("idle queue empty with permit held".into())),
        }
    }

    /// Return a handle after an execution. Healthy handles rejoin the
    /// idle set; unhealthy ones are replaced.
    pub async fn release(&self, handle: BrowserHandle<D::Session>) {
        if self.closed.load(Ordering::SeqCst) {
            let _ = handle.session.close().await;
            return;
        }
        match handle.replace_reason(&self.config) {
            Some(reason) => self.replace(handle, reason).await,
            None => self.push_idle(handle).await,
        }
    }

    /// Periodic health evaluation of idle handles. Working handles are
    /// judged on release instead.
    pub async fn health_pass(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut stale = Vec::new();
        {
            let mut state = self.state.lock().await;
            let mut kept = VecDeque::with_capacity(state.idle.len());
            while let Some(handle) = state.idle.pop_front() {
                match handle.replace_reason(&self.config) {
                    Some(reason) => match self.idle_permits.try_acquire() {
                        Ok(permit) => {
                            permit.forget();
                            stale.push((handle, reason));
                        }
                        // A racing acquirer owns this permit; leave the
                        // handle for it.
                        Err(_) => kept.push_back(handle),
                    },
                    None => kept.push_back(handle),
                }
            }
            state.idle = kept;
        }
        for (handle, reason) in stale {
            self.replace(handle, reason).await;
        }
        self.ensure_min().await;
    }

    /// Periodic elastic-scaling evaluation driven by the queue-depth
    /// history and the idle ratio.
    pub async fn scaling_pass(&self) {
        if !self.scaling.enabled || self.closed.load(Ordering::SeqCst) {
            return;
        }

        let depth = self.queue_depth.load(Ordering::SeqCst);
        let sustained_pressure = {
            let mut history = self.depth_history.lock().await;
            history.push_back(depth);
            if history.len() > DEPTH_WINDOW {
                history.pop_front();
            }
            history.len() == DEPTH_WINDOW && history.iter().all(|&d| d > 0)
        };

        let (total, idle) = {
            let state = self.state.lock().await;
            (state.total, state.idle.len())
        };

        if sustained_pressure && idle == 0 && total < self.config.max_size {
            let step = self.scale_step(total).min(self.config.max_size - total);
            tracing::info!(%depth, %total, %step, "Scaling pool up");
            for _ in 0..step {
                match self.driver.launch().await {
                    Ok(session) => self.push_new(session).await,
                    Err(e) => {
                        tracing::warn!(error = %e, "Scale-up launch failed");
                        break;
                    }
                }
            }
            self.depth_history.lock().await.clear();
        } else if total > self.config.min_size && idle * 10 > total * 3 {
            // Idle handles above 30% of the pool: shed some.
            let step = self.scale_step(total).min(total - self.config.min_size);
            let mut removed = Vec::new();
            {
                let mut state = self.state.lock().await;
                for _ in 0..step {
                    let Ok(permit) = self.idle_permits.try_acquire() else {
                        break;
                    };
                    match state.idle.pop_back() {
                        Some(handle) => {
                            permit.forget();
                            state.total -= 1;
                            removed.push(handle);
                        }
                        None => break,
                    }
                }
            }
            if !removed.is_empty() {
                tracing::info!(count = removed.len(), "Scaling pool down");
            }
            for handle in removed {
                let _ = handle.session.close().await;
            }
        }
    }

    /// Terminate every idle handle and wake all waiters with a
    /// cancellation error. In-flight handles are closed on release.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.idle_permits.close();
        let handles: Vec<_> = {
            let mut state = self.state.lock().await;
            state.total = 0;
            state.idle.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.session.close().await;
        }
        tracing::info!("Browser pool closed");
    }

    pub async fn run_health_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.health_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => self.health_pass().await,
            }
        }
    }

    pub async fn run_scaling_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.scaling.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => self.scaling_pass().await,
            }
        }
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        PoolStats {
            total: state.total,
            idle: state.idle.len(),
            working: state.total - state.idle.len(),
        }
    }

    /// Snapshots of the currently idle handles.
    pub async fn snapshot(&self) -> Vec<HandleSnapshot> {
        let state = self.state.lock().await;
        state.idle.iter().map(HandleSnapshot::from).collect()
    }

    fn scale_step(&self, current: usize) -> usize {
        ((current as f64 * self.scaling.factor).floor() as usize).max(1)
    }

    /// Replace `old` with a freshly launched handle. The new handle is
    /// launched first; if that fails the old one stays in service with
    /// its error streak cleared, so a flaky driver cannot start a
    /// replace-fail crash loop.
    async fn replace(&self, mut old: BrowserHandle<D::Session>, reason: ReplaceReason) {
        tracing::info!(handle = %old.id(), %reason, "Replacing browser handle");
        match self.driver.launch().await {
            Ok(session) => {
                let _ = old.session.close().await;
                self.push_idle(BrowserHandle::new(session)).await;
            }
            Err(e) => {
                tracing::warn!(handle = %old.id(), error = %e, "Replacement launch failed; keeping old handle");
                old.reset_errors();
                self.push_idle(old).await;
            }
        }
    }

    /// Top the pool back up to the configured minimum.
    async fn ensure_min(&self) {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            let total = self.state.lock().await.total;
            if total >= self.config.min_size {
                return;
            }
            match self.driver.launch().await {
                Ok(session) => self.push_new(session).await,
                Err(e) => {
                    tracing::warn!(error = %e, "Min-size top-up launch failed; next pass retries");
                    return;
                }
            }
        }
    }

    async fn push_new(&self, session: D::Session) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let handle = BrowserHandle::new(session);
        {
            let mut state = self.state.lock().await;
            state.total += 1;
            state.idle.push_back(handle);
        }
        self.idle_permits.add_permits(1);
    }

    async fn push_idle(&self, mut handle: BrowserHandle<D::Session>) {
        if self.closed.load(Ordering::SeqCst) {
            let _ = handle.session.close().await;
            return;
        }
        handle.set_status(HandleStatus::Available);
        self.state.lock().await.idle.push_back(handle);
        self.idle_permits.add_permits(1);
    }
}
