//! Extensions - composable middleware around the producer.
//!
//! An extension is registered as a factory. The factory runs once per engine
//! instance and returns an [`ExtensionConfig`] contributing any of:
//!
//! - **context** fields merged into what inner handlers and the producer see,
//! - a **handler** wrapping the rest of the chain,
//! - **extras** exposed on the engine handle (typically a [`SlotTrigger`]).
//!
//! # The Onion
//!
//! ```text
//! run ──► handler[0] ──► handler[1] ──► ... ──► producer
//!             │  next.run(patch)│                   │
//!             ◄─────────────────◄───────────────────┘ Outcome
//! ```
//!
//! The chain is folded right-to-left, so handlers run in registration order,
//! outermost first, exactly once per execution. [`Next`] is consumed on use,
//! so a handler can continue the chain at most once.
//!
//! # Example: pagination
//!
//! ```ignore
//! #[derive(Clone)]
//! struct Page { offset: usize }
//!
//! #[derive(Clone)]
//! struct Offset(usize);
//!
//! let paginate = Extension::<Value>::define::<Page, _>(|scope| {
//!     ExtensionConfig::new()
//!         .with_extra(scope.trigger())
//!         .with_handler(|next, _ctx, page: Option<Page>| async move {
//!             let offset = Offset(page.as_ref().map_or(0, |p| p.offset));
//!             let mut outcome = next.run(Extras::new().with(offset)).await?;
//!             if page.is_some() {
//!                 outcome.merge_with_prev_data_at("items")?;
//!             }
//!             Ok(outcome)
//!         })
//! });
//!
//! let feed = create(query, paginate.apply(fetch_items), CombineConfig::default());
//! feed.extra::<SlotTrigger<Page>>().unwrap().fire(Page { offset: 20 });
//! ```

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::cell::ReadCell;
use crate::context::{ChainContext, Context, Extras};
use crate::error::{Failure, MergeError};
use crate::merge::{merge_value_at, Merge};
use crate::state::CombineState;
use crate::token::CancelToken;

/// What a handler (and the chain as a whole) resolves to.
pub type ChainResult<D> = Result<Outcome<D>, Failure>;

type ChainFuture<D> = BoxFuture<'static, ChainResult<D>>;

// =============================================================================
// Producer
// =============================================================================

/// The user function computing the derived value.
///
/// Implemented for every `Fn(V, Context<V, D>) -> impl Future<Output = Result<D, Failure>>`:
///
/// ```ignore
/// let doubled = create(count, |n: u32, _ctx: Context<u32, u32>| async move {
///     Ok::<_, Failure>(n * 2)
/// }, CombineConfig::default());
/// ```
#[async_trait]
pub trait Producer<V, D>: Send + Sync + 'static {
    async fn produce(&self, source: V, ctx: Context<V, D>) -> Result<D, Failure>;
}

#[async_trait]
impl<V, D, F, Fut> Producer<V, D> for F
where
    F: Fn(V, Context<V, D>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<D, Failure>> + Send + 'static,
    V: Send + 'static,
    D: Send + 'static,
{
    async fn produce(&self, source: V, ctx: Context<V, D>) -> Result<D, Failure> {
        (self)(source, ctx).await
    }
}

// =============================================================================
// Outcome
// =============================================================================

/// The chain's terminal result, as seen by handlers on the way out.
pub struct Outcome<D> {
    data: D,
    prev_data: Option<D>,
    merged: bool,
}

impl<D> Outcome<D> {
    pub(crate) fn new(data: D, prev_data: Option<D>) -> Self {
        Self {
            data,
            prev_data,
            merged: false,
        }
    }

    pub fn data(&self) -> &D {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut D {
        &mut self.data
    }

    pub fn prev_data(&self) -> Option<&D> {
        self.prev_data.as_ref()
    }

    pub fn into_data(self) -> D {
        self.data
    }

    /// Whether a merge already ran during this execution.
    pub fn is_merged(&self) -> bool {
        self.merged
    }
}

impl<D: Merge> Outcome<D> {
    /// Prepend the previous `Ready` data to the produced data.
    ///
    /// Runs at most once per execution, no matter how many handlers call it.
    /// Without previous data this is a no-op.
    pub fn merge_with_prev_data(&mut self) -> Result<(), MergeError> {
        if self.merged {
            return Ok(());
        }
        let Some(prev) = &self.prev_data else {
            return Ok(());
        };
        self.merged = true;
        self.data.merge_prev(prev)
    }
}

impl Outcome<Value> {
    /// Like [`Outcome::merge_with_prev_data`], for an array stored under `key`
    /// of a JSON object. Other fields keep the produced values.
    pub fn merge_with_prev_data_at(&mut self, key: &str) -> Result<(), MergeError> {
        if self.merged {
            return Ok(());
        }
        let Some(prev) = &self.prev_data else {
            return Ok(());
        };
        self.merged = true;
        merge_value_at(&mut self.data, prev, key)
    }
}

impl<D: fmt::Debug> fmt::Debug for Outcome<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outcome")
            .field("data", &self.data)
            .field("merged", &self.merged)
            .finish()
    }
}

// =============================================================================
// Next
// =============================================================================

/// Continuation of the chain handed to a handler.
pub struct Next<D> {
    link: Box<dyn FnOnce(Extras) -> ChainFuture<D> + Send>,
}

impl<D> Next<D> {
    /// Continue with `patch` merged over the current context.
    pub fn run(self, patch: Extras) -> BoxFuture<'static, ChainResult<D>> {
        (self.link)(patch)
    }

    /// Continue without changing the context.
    pub fn proceed(self) -> BoxFuture<'static, ChainResult<D>> {
        self.run(Extras::new())
    }
}

// =============================================================================
// Slots and triggers
// =============================================================================

/// Params of a manual trigger, tagged with the slot that fired it.
#[derive(Clone)]
pub(crate) struct SlotParams {
    slot: usize,
    params: Arc<dyn Any + Send + Sync>,
}

impl SlotParams {
    pub(crate) fn new<P: Send + Sync + 'static>(slot: usize, params: P) -> Self {
        Self {
            slot,
            params: Arc::new(params),
        }
    }

    pub(crate) fn slot(&self) -> usize {
        self.slot
    }

    /// The params, if they were fired by `slot`.
    pub(crate) fn get<P: Clone + 'static>(&self, slot: usize) -> Option<P> {
        if self.slot != slot {
            return None;
        }
        (*self.params).downcast_ref::<P>().cloned()
    }
}

impl fmt::Debug for SlotParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotParams").field("slot", &self.slot).finish()
    }
}

/// Queues a manual run on the owning instance.
pub(crate) type TriggerPort = Arc<dyn Fn(Option<SlotParams>) + Send + Sync>;

/// A manual trigger bound to one extension's slot.
///
/// Firing bypasses source deduplication, and `params` reach only the handler
/// of the extension that owns this trigger.
pub struct SlotTrigger<P> {
    slot: usize,
    port: TriggerPort,
    _params: PhantomData<fn(P)>,
}

impl<P: Send + Sync + 'static> SlotTrigger<P> {
    pub fn fire(&self, params: P) {
        (self.port)(Some(SlotParams::new(self.slot, params)));
    }

    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl<P> Clone for SlotTrigger<P> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot,
            port: self.port.clone(),
            _params: PhantomData,
        }
    }
}

impl<P> fmt::Debug for SlotTrigger<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotTrigger").field("slot", &self.slot).finish()
    }
}

// =============================================================================
// Factory input / output
// =============================================================================

/// What the engine hands every factory.
pub(crate) struct Seed<D> {
    pub(crate) slot: usize,
    pub(crate) state: ReadCell<CombineState<D>>,
    pub(crate) active: ReadCell<Option<SlotParams>>,
    pub(crate) port: TriggerPort,
}

/// The private view of the engine an extension factory receives.
pub struct ExtensionScope<D, P> {
    slot: usize,
    state: ReadCell<CombineState<D>>,
    active: ReadCell<Option<SlotParams>>,
    port: TriggerPort,
    _params: PhantomData<fn(P)>,
}

impl<D, P> ExtensionScope<D, P>
where
    D: Clone + Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
{
    fn new(seed: &Seed<D>) -> Self {
        Self {
            slot: seed.slot,
            state: seed.state.clone(),
            active: seed.active.clone(),
            port: seed.port.clone(),
            _params: PhantomData,
        }
    }

    /// The engine's published state.
    pub fn state(&self) -> ReadCell<CombineState<D>> {
        self.state.clone()
    }

    /// A trigger bound to this extension's slot.
    pub fn trigger(&self) -> SlotTrigger<P> {
        SlotTrigger {
            slot: self.slot,
            port: self.port.clone(),
            _params: PhantomData,
        }
    }

    /// Params of the run in flight, while it was fired by this extension.
    pub fn pending_params(&self) -> ReadCell<Option<P>> {
        let slot = self.slot;
        self.active
            .map(move |active| active.as_ref().and_then(|fired| fired.get::<P>(slot)))
    }

    pub fn slot(&self) -> usize {
        self.slot
    }
}

type ErasedHandler<D> =
    Arc<dyn Fn(Next<D>, ChainContext<D>, Option<SlotParams>, usize) -> ChainFuture<D> + Send + Sync>;

pub(crate) struct Layer<D> {
    slot: usize,
    context: Extras,
    handler: Option<ErasedHandler<D>>,
}

/// What an extension factory returns.
pub struct ExtensionConfig<D, P> {
    handler: Option<ErasedHandler<D>>,
    context: Extras,
    extras: Extras,
    _params: PhantomData<fn(P)>,
}

impl<D, P> ExtensionConfig<D, P>
where
    D: Send + 'static,
    P: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            handler: None,
            context: Extras::new(),
            extras: Extras::new(),
            _params: PhantomData,
        }
    }

    /// Wrap the rest of the chain.
    ///
    /// `params` is `Some` only when this extension's own trigger fired the run.
    pub fn with_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Next<D>, ChainContext<D>, Option<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ChainResult<D>> + Send + 'static,
    {
        let erased: ErasedHandler<D> = Arc::new(
            move |next: Next<D>, ctx: ChainContext<D>, fired: Option<SlotParams>, slot: usize| -> ChainFuture<D> {
                let params = fired.and_then(|fired| fired.get::<P>(slot));
                Box::pin(handler(next, ctx, params))
            },
        );
        self.handler = Some(erased);
        self
    }

    /// Contribute a context field, visible to this handler and everything inside it.
    pub fn with_context<T: Send + Sync + 'static>(mut self, value: T) -> Self {
        self.context.insert(value);
        self
    }

    /// Expose a value on the engine handle, readable via `Combine::extra`.
    pub fn with_extra<T: Send + Sync + 'static>(mut self, value: T) -> Self {
        self.extras.insert(value);
        self
    }

    fn into_parts(self, slot: usize) -> (Layer<D>, Extras) {
        let layer = Layer {
            slot,
            context: self.context,
            handler: self.handler,
        };
        (layer, self.extras)
    }
}

impl<D, P> Default for ExtensionConfig<D, P>
where
    D: Send + 'static,
    P: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Extension
// =============================================================================

pub(crate) type Factory<D> = Arc<dyn Fn(&Seed<D>) -> (Layer<D>, Extras) + Send + Sync>;

/// An ordered list of middleware factories.
pub struct Extension<D> {
    factories: Vec<Factory<D>>,
}

impl<D> Extension<D>
where
    D: Clone + Send + Sync + 'static,
{
    /// Define a single extension whose trigger carries params of type `P`.
    ///
    /// Use `P = ()` for extensions without a parameterised trigger.
    pub fn define<P, F>(factory: F) -> Self
    where
        P: Clone + Send + Sync + 'static,
        F: Fn(ExtensionScope<D, P>) -> ExtensionConfig<D, P> + Send + Sync + 'static,
    {
        let factory: Factory<D> = Arc::new(move |seed: &Seed<D>| {
            factory(ExtensionScope::new(seed)).into_parts(seed.slot)
        });
        Self {
            factories: vec![factory],
        }
    }

    /// Concatenate extensions, preserving order.
    ///
    /// A factory already present (e.g. a shared base) is kept once, at its
    /// first position.
    pub fn compose<I>(extensions: I) -> Self
    where
        I: IntoIterator<Item = Extension<D>>,
    {
        let mut factories = Vec::new();
        for extension in extensions {
            push_unique(&mut factories, extension.factories);
        }
        Self { factories }
    }

    /// Wrap `producer` with this extension.
    pub fn apply<V, P>(&self, producer: P) -> Pipeline<V, D>
    where
        V: Clone + Send + Sync + 'static,
        P: Producer<V, D>,
    {
        Pipeline {
            producer: Arc::new(producer),
            factories: self.factories.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    pub(crate) fn factories(&self) -> &[Factory<D>] {
        &self.factories
    }

    /// Put `base` in front of this extension's own factories.
    pub(crate) fn with_base(self, base: &[Factory<D>]) -> Self {
        let mut factories = Vec::with_capacity(base.len() + self.factories.len());
        push_unique(&mut factories, base.iter().cloned());
        push_unique(&mut factories, self.factories);
        Self { factories }
    }
}

impl<D> fmt::Debug for Extension<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extension")
            .field("factories", &self.factories.len())
            .finish()
    }
}

fn push_unique<D>(into: &mut Vec<Factory<D>>, factories: impl IntoIterator<Item = Factory<D>>) {
    for factory in factories {
        if !into.iter().any(|existing| Arc::ptr_eq(existing, &factory)) {
            into.push(factory);
        }
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// A producer together with the extensions wrapping it.
pub struct Pipeline<V, D> {
    producer: Arc<dyn Producer<V, D>>,
    factories: Vec<Factory<D>>,
}

impl<V, D> Pipeline<V, D>
where
    V: Clone + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
{
    /// A pipeline with no extensions.
    pub fn new<P: Producer<V, D>>(producer: P) -> Self {
        Self {
            producer: Arc::new(producer),
            factories: Vec::new(),
        }
    }

    pub(crate) fn with_base(mut self, base: &[Factory<D>]) -> Self {
        let mut factories = Vec::with_capacity(base.len() + self.factories.len());
        push_unique(&mut factories, base.iter().cloned());
        push_unique(&mut factories, self.factories);
        self.factories = factories;
        self
    }

    /// Run every factory once, assigning slots in order.
    pub(crate) fn build(
        self,
        state: ReadCell<CombineState<D>>,
        active: ReadCell<Option<SlotParams>>,
        port: TriggerPort,
    ) -> (Chain<V, D>, Extras) {
        let mut layers = Vec::with_capacity(self.factories.len());
        let mut extras = Extras::new();

        for (slot, factory) in self.factories.iter().enumerate() {
            let seed = Seed {
                slot,
                state: state.clone(),
                active: active.clone(),
                port: port.clone(),
            };
            let (layer, layer_extras) = factory(&seed);
            extras.extend(&layer_extras);
            layers.push(layer);
        }

        let chain = Chain {
            producer: self.producer,
            layers: layers.into(),
        };
        (chain, extras)
    }
}

/// Anything `create` accepts as the computation: a producer closure or a
/// [`Pipeline`] from [`Extension::apply`].
///
/// A hand-written [`Producer`] type goes through [`Pipeline::new`].
pub trait IntoPipeline<V, D> {
    fn into_pipeline(self) -> Pipeline<V, D>;
}

impl<V, D> IntoPipeline<V, D> for Pipeline<V, D> {
    fn into_pipeline(self) -> Pipeline<V, D> {
        self
    }
}

impl<V, D, F, Fut> IntoPipeline<V, D> for F
where
    V: Clone + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
    F: Fn(V, Context<V, D>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<D, Failure>> + Send + 'static,
{
    fn into_pipeline(self) -> Pipeline<V, D> {
        Pipeline::new(self)
    }
}

// =============================================================================
// Chain
// =============================================================================

/// Immutable inputs of one execution attempt.
pub(crate) struct RunInput<V, D> {
    pub(crate) source: V,
    pub(crate) prev_source: Option<V>,
    pub(crate) prev_data: Option<D>,
    pub(crate) token: CancelToken,
    pub(crate) params: Option<SlotParams>,
}

/// The built middleware chain of one engine instance.
pub(crate) struct Chain<V, D> {
    producer: Arc<dyn Producer<V, D>>,
    layers: Arc<[Layer<D>]>,
}

struct Run<V, D> {
    input: RunInput<V, D>,
    producer: Arc<dyn Producer<V, D>>,
    layers: Arc<[Layer<D>]>,
}

impl<V, D> Chain<V, D>
where
    V: Clone + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
{
    /// Run every handler once, outermost first, then the producer.
    pub(crate) fn run(&self, input: RunInput<V, D>) -> BoxFuture<'static, ChainResult<D>> {
        let run = Arc::new(Run {
            input,
            producer: self.producer.clone(),
            layers: self.layers.clone(),
        });
        link(run, 0, Extras::new()).proceed()
    }

    pub(crate) fn len(&self) -> usize {
        self.layers.len()
    }
}

impl<V, D> Run<V, D>
where
    V: Clone + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
{
    async fn produce(&self, fields: Extras) -> ChainResult<D> {
        let ctx = Context {
            token: self.input.token.clone(),
            prev_source: self.input.prev_source.clone(),
            prev_data: self.input.prev_data.clone(),
            fields,
        };
        let data = self
            .producer
            .produce(self.input.source.clone(), ctx)
            .await?;
        Ok(Outcome::new(data, self.input.prev_data.clone()))
    }
}

fn link<V, D>(run: Arc<Run<V, D>>, index: usize, acc: Extras) -> Next<D>
where
    V: Clone + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
{
    Next {
        link: Box::new(move |patch: Extras| -> ChainFuture<D> {
            let mut fields = acc;
            fields.extend(&patch);

            if index >= run.layers.len() {
                return Box::pin(async move { run.produce(fields).await });
            }

            let layer = &run.layers[index];
            fields.extend(&layer.context);

            match layer.handler.clone() {
                Some(handler) => {
                    let ctx = ChainContext {
                        token: run.input.token.clone(),
                        prev_data: run.input.prev_data.clone(),
                        fields: fields.clone(),
                    };
                    let params = run.input.params.clone();
                    let slot = layer.slot;
                    let next = link(run.clone(), index + 1, fields);
                    handler(next, ctx, params, slot)
                }
                None => link(run.clone(), index + 1, fields).proceed(),
            }
        }),
    }
}
