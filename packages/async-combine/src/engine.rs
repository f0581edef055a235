//! Execution engine - owns the state machine of one instance.
//!
//! ```text
//!  source change ─┐                     ┌─ yield, drain, coalesce ─┐
//!  trigger() ─────┼──► intent queue ──► │ driver task              │──► start()
//!  slot trigger ──┘   (batch token)     └──────────────────────────┘      │
//!                                                                           ▼
//!     revoke token N ─► snapshot ─► not ready? stop ─► dedup? roll back ─► Pending
//!                                                                           │
//!                          commit(Ready | Idle | Error) ◄── chain(producer) ┘
//!                          (only if token N+1 is still live)
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use async_combine::{create, Cell, CombineConfig, Context, Failure};
//!
//! let page = Cell::new(1u32);
//! let items = create(page.clone(), |page: u32, ctx: Context<u32, Vec<Item>>| async move {
//!     let items = ctx.token().race(api.list(page)).await??;
//!     Ok::<_, Failure>(items)
//! }, CombineConfig::default());
//!
//! page.set(2);
//! items.settled().await;
//! assert!(items.state().get().is_ready());
//! ```
//!
//! # Latest Wins
//!
//! Starting attempt N+1 revokes attempt N's token before anything else, and
//! commits are only honoured while the committing attempt's token is the
//! live one. A slow attempt that finishes after a newer one started is
//! therefore never observed, regardless of completion order.
//!
//! # Two Token Scopes
//!
//! - the **execution token** gates whether a finished run may commit,
//! - the **batch token** gates whether queued intents may start a run at all;
//!   `set_data` revokes it so intents queued before the override are dropped.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use smallvec::SmallVec;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tokio::sync::Notify;
use tracing::{debug, error, trace};
use uuid::Uuid;

use crate::cell::{Cell, ReadCell};
use crate::config::{CombineConfig, ErrorSink, SourceFilter};
use crate::context::Extras;
use crate::error::{CombineError, Failure};
use crate::extension::{Chain, IntoPipeline, RunInput, SlotParams, TriggerPort};
use crate::source::{Source, Status};
use crate::state::CombineState;
use crate::token::CancelToken;

// =============================================================================
// Instance identity
// =============================================================================

/// Unique id of an engine instance, used as a structured logging field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(Uuid);

impl InstanceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<InstanceId> for Uuid {
    fn from(id: InstanceId) -> Uuid {
        id.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

// =============================================================================
// Inflight Tracking
// =============================================================================

/// Counts queued intents plus running attempts.
///
/// `settled()` waits for the count to reach zero.
#[derive(Default)]
pub(crate) struct InflightTracker {
    count: AtomicUsize,
    notify: Notify,
}

impl InflightTracker {
    pub(crate) fn inc(&self, n: usize) {
        self.count.fetch_add(n, Ordering::AcqRel);
    }

    pub(crate) fn dec(&self, n: usize) {
        let prev = self.count.fetch_sub(n, Ordering::AcqRel);
        if prev == n {
            self.notify.notify_waiters();
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Wait for the count to reach zero.
    ///
    /// Notify is edge-triggered, so register before checking and loop.
    pub(crate) async fn wait_zero(&self) {
        loop {
            let notified = self.notify.notified();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl fmt::Debug for InflightTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InflightTracker")
            .field("count", &self.count())
            .finish()
    }
}

/// RAII guard for decrementing the inflight count on drop.
///
/// Ensures the count is decremented even if the attempt panics or is
/// dropped, preventing hung `settled()` calls.
pub(crate) struct InflightGuard {
    tracker: Arc<InflightTracker>,
    count: usize,
}

impl InflightGuard {
    pub(crate) fn new(tracker: Arc<InflightTracker>, count: usize) -> Self {
        tracker.inc(count);
        Self { tracker, count }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.tracker.dec(self.count);
    }
}

// =============================================================================
// Intents
// =============================================================================

enum IntentKind {
    SourceChanged,
    Manual(Option<SlotParams>),
}

struct Intent {
    kind: IntentKind,
    batch: CancelToken,
}

impl Intent {
    fn is_manual(&self) -> bool {
        matches!(self.kind, IntentKind::Manual(_))
    }

    fn params(&self) -> Option<SlotParams> {
        match &self.kind {
            IntentKind::Manual(params) => params.clone(),
            IntentKind::SourceChanged => None,
        }
    }
}

/// Entry point for every triggering event.
struct IntentQueue {
    inflight: Arc<InflightTracker>,
    batch: Mutex<CancelToken>,
}

impl IntentQueue {
    fn new() -> Self {
        Self {
            inflight: Arc::new(InflightTracker::default()),
            batch: Mutex::new(CancelToken::new()),
        }
    }

    /// Enqueue an intent under the current batch token.
    ///
    /// Returns `false` once the driver has stopped.
    fn push(&self, sender: &UnboundedSender<Intent>, kind: IntentKind) -> bool {
        let batch = self
            .batch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        self.inflight.inc(1);
        if sender.send(Intent { kind, batch }).is_err() {
            self.inflight.dec(1);
            return false;
        }
        true
    }

    /// Drop every queued intent that has not started a run yet.
    fn reset_batch(&self) -> CancelToken {
        let mut batch = self.batch.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *batch, CancelToken::new())
    }
}

fn weak_push(queue: &Arc<IntentQueue>, sender: &WeakUnboundedSender<Intent>, kind: IntentKind) -> bool {
    match sender.upgrade() {
        Some(sender) => queue.push(&sender, kind),
        None => false,
    }
}

// =============================================================================
// Runner
// =============================================================================

/// Mutable execution bookkeeping, guarded by one lock.
struct Exec<V, D> {
    /// Token of the latest started attempt.
    token: CancelToken,
    /// Source value of the last successful run.
    prev_source: Option<V>,
    /// Last `Ready`, `Error` or `Idle` state, restored when a run is skipped.
    stable: CombineState<D>,
}

enum Settle<V, D> {
    Ready { data: D, source: V },
    Declined,
    Failed(CombineError),
}

/// Everything the driver and the attempts share. Typed by the source.
struct Runner<S: Source, D> {
    id: InstanceId,
    source: S,
    chain: Chain<S::Value, D>,
    state: Cell<CombineState<D>>,
    active_params: Cell<Option<SlotParams>>,
    exec: Mutex<Exec<S::Value, D>>,
    queue: Arc<IntentQueue>,
    filter: Option<SourceFilter<S::Value>>,
    on_error: Option<ErrorSink>,
    log_errors: bool,
}

/// Source-independent control surface held by the handle.
trait Control<D>: Send + Sync {
    fn set_data(&self, data: D);
}

impl<S, D> Runner<S, D>
where
    S: Source,
    D: Clone + Send + Sync + 'static,
{
    fn lock_exec(&self) -> std::sync::MutexGuard<'_, Exec<S::Value, D>> {
        self.exec.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn differs(&self, prev: &S::Value, next: &S::Value) -> bool {
        match &self.filter {
            Some(filter) => filter(prev, next),
            None => prev != next,
        }
    }

    /// Start one run for a coalesced batch.
    fn start(self: &Arc<Self>, skip_dedup: bool, params: Option<SlotParams>) {
        let token = CancelToken::new();
        let mut exec = self.lock_exec();
        let superseded = std::mem::replace(&mut exec.token, token.clone());

        let snapshot = self.source.snapshot();
        let value = match (snapshot.status, snapshot.value) {
            (Status::Ready, Some(value)) => value,
            (status, _) => {
                self.stand_down(&exec);
                drop(exec);
                superseded.cancel();
                trace!(instance = %self.id, status = ?status, "waiting for dependency");
                return;
            }
        };

        if !skip_dedup {
            if let Some(prev) = &exec.prev_source {
                if !self.differs(prev, &value) {
                    self.stand_down(&exec);
                    drop(exec);
                    superseded.cancel();
                    debug!(instance = %self.id, "source unchanged, run skipped");
                    return;
                }
            }
        }

        let current = self.state.get();
        let slot = params.as_ref().map(SlotParams::slot);
        let input = RunInput {
            source: value,
            prev_source: exec.prev_source.clone(),
            prev_data: current.data().cloned(),
            token: token.clone(),
            params: params.clone(),
        };
        self.active_params.set(params);
        self.state.set(current.to_pending());
        drop(exec);
        superseded.cancel();

        debug!(instance = %self.id, manual = skip_dedup, slot = ?slot, "run started");

        let guard = InflightGuard::new(self.queue.inflight.clone(), 1);
        let runner = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            runner.execute(input).await;
        });
    }

    /// Leave no run in flight: fall back to the last stable state.
    fn stand_down(&self, exec: &Exec<S::Value, D>) {
        if self.state.get().is_pending() {
            self.state.set(exec.stable.clone());
        }
        self.active_params.set(None);
    }

    async fn execute(self: Arc<Self>, input: RunInput<S::Value, D>) {
        let token = input.token.clone();
        let source = input.source.clone();

        // The chain runs on its own task so a revoked attempt can be left
        // running in the background while we stop waiting for it.
        let mut attempt = tokio::spawn(self.chain.run(input));
        let joined = tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!(instance = %self.id, "run superseded");
                return;
            }
            joined = &mut attempt => joined,
        };

        let result = match joined {
            Ok(result) => result,
            Err(join_error) if join_error.is_panic() => {
                Err(Failure::msg(format!("producer panicked: {join_error}")))
            }
            Err(_) => Err(Failure::from(crate::token::Cancelled)),
        };

        match result {
            Ok(outcome) => {
                self.commit(
                    &token,
                    Settle::Ready {
                        data: outcome.into_data(),
                        source,
                    },
                );
            }
            Err(Failure::Declined) => {
                if self.commit(&token, Settle::Declined) {
                    debug!(instance = %self.id, "producer declined");
                }
            }
            Err(failure) if failure.is_cancelled() && token.is_cancelled() => {
                debug!(instance = %self.id, "run cancelled");
            }
            Err(Failure::Failed(cause)) => {
                let error = CombineError::from_cause(cause);
                if self.commit(&token, Settle::Failed(error.clone())) {
                    self.report(&error);
                }
            }
        }

        token.cancel();
    }

    /// Publish the outcome of the attempt owning `token`, if it is still live.
    fn commit(&self, token: &CancelToken, settle: Settle<S::Value, D>) -> bool {
        let mut exec = self.lock_exec();
        if token.is_cancelled() || !exec.token.ptr_eq(token) {
            return false;
        }

        let next = match settle {
            Settle::Ready { data, source } => {
                exec.prev_source = Some(source);
                CombineState::Ready { data }
            }
            Settle::Declined => {
                exec.prev_source = None;
                CombineState::Idle
            }
            Settle::Failed(cause) => self.state.get().to_error(cause),
        };

        exec.stable = next.clone();
        self.active_params.set(None);
        self.state.set(next);
        true
    }

    fn report(&self, error: &CombineError) {
        if self.log_errors && error.mark_logged() {
            error!(instance = %self.id, error = %error.cause(), "async combine failed");
        }
        if let Some(on_error) = &self.on_error {
            on_error(error);
        }
    }
}

impl<S, D> Control<D> for Runner<S, D>
where
    S: Source,
    D: Clone + Send + Sync + 'static,
{
    fn set_data(&self, data: D) {
        let mut exec = self.lock_exec();
        let superseded = std::mem::replace(&mut exec.token, CancelToken::new());
        let batch = self.queue.reset_batch();
        exec.prev_source = None;

        let next = CombineState::Ready { data };
        exec.stable = next.clone();
        self.active_params.set(None);
        self.state.set(next);
        drop(exec);

        superseded.cancel();
        batch.cancel();
        debug!(instance = %self.id, "data set directly");
    }
}

async fn drive<S, D>(runner: Arc<Runner<S, D>>, mut intents: UnboundedReceiver<Intent>)
where
    S: Source,
    D: Clone + Send + Sync + 'static,
{
    while let Some(first) = intents.recv().await {
        // Let synchronous bursts of events land before deciding.
        tokio::task::yield_now().await;

        let mut batch: SmallVec<[Intent; 4]> = SmallVec::new();
        batch.push(first);
        while let Ok(intent) = intents.try_recv() {
            batch.push(intent);
        }
        let received = batch.len();

        let live: SmallVec<[Intent; 4]> = batch
            .into_iter()
            .filter(|intent| !intent.batch.is_cancelled())
            .collect();

        if let Some(last) = live.last() {
            let skip_dedup = live.iter().any(Intent::is_manual);
            trace!(
                instance = %runner.id,
                batch_size = live.len(),
                dropped = received - live.len(),
                "intents coalesced"
            );
            runner.start(skip_dedup, last.params());
        } else {
            trace!(instance = %runner.id, dropped = received, "batch revoked before start");
        }

        runner.queue.inflight.dec(received);
    }

    trace!(instance = %runner.id, "driver stopped");
}

// =============================================================================
// Public handle
// =============================================================================

struct Handle<D> {
    id: InstanceId,
    control: Arc<dyn Control<D>>,
    sender: UnboundedSender<Intent>,
    queue: Arc<IntentQueue>,
    state: ReadCell<CombineState<D>>,
    data: ReadCell<Option<D>>,
    is_error: ReadCell<bool>,
    is_pending: ReadCell<bool>,
    extras: Extras,
}

/// Handle to an engine instance.
///
/// Cheap to clone; clones control the same instance. The instance keeps
/// running while at least one handle (or a dependent instance) is alive.
///
/// State listeners run synchronously inside commits, so a listener must not
/// call [`Combine::set_data`] on the instance it is observing.
pub struct Combine<D> {
    handle: Arc<Handle<D>>,
}

/// Create an engine instance deriving from `source`.
///
/// `producer` is either a bare producer or a [`crate::Pipeline`] built with
/// [`crate::Extension::apply`]. Must be called inside a tokio runtime; the
/// instance runs once immediately if its source is ready.
pub fn create<S, D, P>(source: S, producer: P, config: CombineConfig<S::Value>) -> Combine<D>
where
    S: Source,
    D: Clone + Send + Sync + 'static,
    P: IntoPipeline<S::Value, D>,
{
    let id = InstanceId::new();
    let log_errors = config.log_errors();
    let state = Cell::new(CombineState::Idle);
    let active_params = Cell::new(None);
    let queue = Arc::new(IntentQueue::new());
    let (sender, intents) = mpsc::unbounded_channel();

    let port: TriggerPort = {
        let queue = queue.clone();
        let weak = sender.downgrade();
        Arc::new(move |params: Option<SlotParams>| {
            weak_push(&queue, &weak, IntentKind::Manual(params));
        })
    };

    let (chain, extras) =
        producer
            .into_pipeline()
            .build(state.read_only(), active_params.read_only(), port);

    debug!(instance = %id, extensions = chain.len(), "instance created");

    let runner = Arc::new(Runner {
        id,
        source,
        chain,
        state: state.clone(),
        active_params,
        exec: Mutex::new(Exec {
            token: CancelToken::new(),
            prev_source: None,
            stable: CombineState::Idle,
        }),
        queue: queue.clone(),
        filter: config.source_update_filter,
        on_error: config.on_error,
        log_errors,
    });

    {
        let queue = queue.clone();
        let weak = sender.downgrade();
        runner.source.subscribe(Arc::new(move || {
            weak_push(&queue, &weak, IntentKind::SourceChanged)
        }));
    }
    queue.push(&sender, IntentKind::SourceChanged);

    tokio::spawn(drive(runner.clone(), intents));

    let handle = Handle {
        id,
        control: runner,
        sender,
        queue,
        data: state.map(|state: &CombineState<D>| state.data().cloned()),
        is_error: state.map(CombineState::is_error),
        is_pending: state.map(CombineState::is_pending),
        state: state.read_only(),
        extras,
    };

    Combine {
        handle: Arc::new(handle),
    }
}

impl<D> Combine<D>
where
    D: Clone + Send + Sync + 'static,
{
    pub fn id(&self) -> InstanceId {
        self.handle.id
    }

    /// The published lifecycle state.
    pub fn state(&self) -> ReadCell<CombineState<D>> {
        self.handle.state.clone()
    }

    /// Last good data: the `Ready` data or the carried previous data.
    pub fn data(&self) -> ReadCell<Option<D>> {
        self.handle.data.clone()
    }

    pub fn is_error(&self) -> ReadCell<bool> {
        self.handle.is_error.clone()
    }

    pub fn is_pending(&self) -> ReadCell<bool> {
        self.handle.is_pending.clone()
    }

    /// Request a run that bypasses source deduplication.
    pub fn trigger(&self) {
        self.handle
            .queue
            .push(&self.handle.sender, IntentKind::Manual(None));
    }

    /// Commit `Ready(data)` immediately.
    ///
    /// Revokes the running attempt and every queued intent, and forgets the
    /// previous source value so the next natural run is never skipped.
    pub fn set_data(&self, data: D) {
        self.handle.control.set_data(data);
    }

    /// An extra contributed by an extension, e.g. its `SlotTrigger`.
    pub fn extra<T: 'static>(&self) -> Option<&T> {
        self.handle.extras.get::<T>()
    }

    /// Resolves once no intent is queued and no attempt is running.
    pub async fn settled(&self) {
        self.handle.queue.inflight.wait_zero().await;
    }
}

impl<D> Clone for Combine<D> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
        }
    }
}

impl<D: fmt::Debug + Clone + Send + Sync + 'static> fmt::Debug for Combine<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Combine")
            .field("id", &self.handle.id)
            .field("state", &self.handle.state.get())
            .finish()
    }
}
