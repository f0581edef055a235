//! Instance configuration and shared defaults.
//!
//! # Per-instance
//!
//! ```ignore
//! let config = CombineConfig::default()
//!     .with_on_error(|err| metrics::failed(err))
//!     .with_source_update_filter(|prev: &Query, next: &Query| prev.text != next.text)
//!     .with_log_errors(false);
//! ```
//!
//! # Shared defaults
//!
//! [`configure`] binds a base extension and default settings once; every
//! instance created through the returned [`Configured`] gets them. Settings
//! passed to [`Configured::create`] override the defaults field by field.
//!
//! ```ignore
//! let api = configure(
//!     ConfigureOptions::new()
//!         .with_extension(auth)
//!         .with_on_error(|err| report(err)),
//! );
//!
//! let profile = api.create(user_id, fetch_profile, CombineConfig::default());
//! ```

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::engine::{self, Combine};
use crate::error::CombineError;
use crate::extension::{Extension, ExtensionConfig, ExtensionScope, Factory, IntoPipeline};
use crate::source::Source;

/// Sink called with the wrapped error whenever a run ends in `Error`.
pub type ErrorSink = Arc<dyn Fn(&CombineError) + Send + Sync>;

/// `true` means the values differ and a run should proceed.
pub type SourceFilter<V> = Arc<dyn Fn(&V, &V) -> bool + Send + Sync>;

/// Type-erased filter; `None` when the values are not of the filter's type.
type ErasedFilter = Arc<dyn Fn(&dyn Any, &dyn Any) -> Option<bool> + Send + Sync>;

// =============================================================================
// CombineConfig
// =============================================================================

/// Settings of one engine instance.
pub struct CombineConfig<V> {
    pub(crate) on_error: Option<ErrorSink>,
    pub(crate) source_update_filter: Option<SourceFilter<V>>,
    pub(crate) log_errors: Option<bool>,
}

impl<V> CombineConfig<V> {
    pub fn new() -> Self {
        Self {
            on_error: None,
            source_update_filter: None,
            log_errors: None,
        }
    }

    /// Called once per failed run. Never called for declines or cancellations.
    pub fn with_on_error<F>(mut self, on_error: F) -> Self
    where
        F: Fn(&CombineError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(on_error));
        self
    }

    /// Replace the default equality check used to skip natural source updates.
    ///
    /// Return `true` when `next` differs from `prev` and a run should start.
    pub fn with_source_update_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&V, &V) -> bool + Send + Sync + 'static,
    {
        self.source_update_filter = Some(Arc::new(filter));
        self
    }

    /// Log user-visible failures at `error` level (default `true`).
    pub fn with_log_errors(mut self, log_errors: bool) -> Self {
        self.log_errors = Some(log_errors);
        self
    }

    /// Resolved `log_errors` setting.
    pub fn log_errors(&self) -> bool {
        self.log_errors.unwrap_or(true)
    }
}

impl<V> Default for CombineConfig<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Clone for CombineConfig<V> {
    fn clone(&self) -> Self {
        Self {
            on_error: self.on_error.clone(),
            source_update_filter: self.source_update_filter.clone(),
            log_errors: self.log_errors,
        }
    }
}

impl<V> fmt::Debug for CombineConfig<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CombineConfig")
            .field("on_error", &self.on_error.is_some())
            .field("source_update_filter", &self.source_update_filter.is_some())
            .field("log_errors", &self.log_errors())
            .finish()
    }
}

// =============================================================================
// configure
// =============================================================================

/// Defaults bound by [`configure`].
pub struct ConfigureOptions<D> {
    extension: Option<Extension<D>>,
    on_error: Option<ErrorSink>,
    source_update_filter: Option<ErasedFilter>,
    log_errors: Option<bool>,
}

impl<D> ConfigureOptions<D> {
    pub fn new() -> Self {
        Self {
            extension: None,
            on_error: None,
            source_update_filter: None,
            log_errors: None,
        }
    }

    /// Base extension wrapped around every producer.
    ///
    /// The extension is moved in, so it cannot also be used elsewhere.
    pub fn with_extension(mut self, extension: Extension<D>) -> Self {
        self.extension = Some(extension);
        self
    }

    pub fn with_on_error<F>(mut self, on_error: F) -> Self
    where
        F: Fn(&CombineError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(on_error));
        self
    }

    /// Default filter for instances whose source value is a `V`.
    ///
    /// Instances with other source types keep the default equality check.
    pub fn with_source_update_filter<V, F>(mut self, filter: F) -> Self
    where
        V: 'static,
        F: Fn(&V, &V) -> bool + Send + Sync + 'static,
    {
        self.source_update_filter = Some(Arc::new(move |prev: &dyn Any, next: &dyn Any| {
            match (prev.downcast_ref::<V>(), next.downcast_ref::<V>()) {
                (Some(prev), Some(next)) => Some(filter(prev, next)),
                _ => None,
            }
        }));
        self
    }

    pub fn with_log_errors(mut self, log_errors: bool) -> Self {
        self.log_errors = Some(log_errors);
        self
    }
}

impl<D> Default for ConfigureOptions<D> {
    fn default() -> Self {
        Self::new()
    }
}

/// Factory for engine instances that share a base extension and defaults.
pub struct Configured<D> {
    base: Vec<Factory<D>>,
    on_error: Option<ErrorSink>,
    source_update_filter: Option<ErasedFilter>,
    log_errors: Option<bool>,
}

/// Bind `options` to every instance created through the result.
pub fn configure<D>(options: ConfigureOptions<D>) -> Configured<D>
where
    D: Clone + Send + Sync + 'static,
{
    Configured {
        base: options
            .extension
            .map(|extension| extension.factories().to_vec())
            .unwrap_or_default(),
        on_error: options.on_error,
        source_update_filter: options.source_update_filter,
        log_errors: options.log_errors,
    }
}

impl<D> Configured<D>
where
    D: Clone + Send + Sync + 'static,
{
    /// Create an instance with the base extension outermost.
    pub fn create<S, P>(&self, source: S, producer: P, config: CombineConfig<S::Value>) -> Combine<D>
    where
        S: Source,
        P: IntoPipeline<S::Value, D>,
    {
        let pipeline = producer.into_pipeline().with_base(&self.base);
        engine::create(source, pipeline, self.resolve(config))
    }

    /// Define an extension that already carries the base extension.
    pub fn define_extension<P, F>(&self, factory: F) -> Extension<D>
    where
        P: Clone + Send + Sync + 'static,
        F: Fn(ExtensionScope<D, P>) -> ExtensionConfig<D, P> + Send + Sync + 'static,
    {
        Extension::define(factory).with_base(&self.base)
    }

    /// Number of base extension factories.
    pub fn base_len(&self) -> usize {
        self.base.len()
    }

    fn resolve<V: PartialEq + 'static>(&self, config: CombineConfig<V>) -> CombineConfig<V> {
        let source_update_filter = config.source_update_filter.or_else(|| {
            self.source_update_filter.clone().map(|erased| {
                let filter: SourceFilter<V> = Arc::new(move |prev: &V, next: &V| {
                    erased(prev as &dyn Any, next as &dyn Any).unwrap_or_else(|| prev != next)
                });
                filter
            })
        });

        CombineConfig {
            on_error: config.on_error.or_else(|| self.on_error.clone()),
            source_update_filter,
            log_errors: config.log_errors.or(self.log_errors),
        }
    }
}

impl<D> fmt::Debug for Configured<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Configured")
            .field("base", &self.base.len())
            .field("on_error", &self.on_error.is_some())
            .field("source_update_filter", &self.source_update_filter.is_some())
            .field("log_errors", &self.log_errors)
            .finish()
    }
}
