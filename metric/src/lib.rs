//! An in-process metric registry.
//!
//! Instruments are registered once by name and shared: registering the same
//! name twice returns handles onto the same underlying storage. Observations
//! are scoped by an [`Attributes`] set, so a single instrument can carry one
//! counter per label combination.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use parking_lot::Mutex;
use std::any::Any;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A set of key-value attributes scoping an observation within an instrument.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Attributes(BTreeMap<&'static str, Cow<'static, str>>);

impl Attributes {
    /// Iterate over the attribute pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> + '_ {
        self.0.iter().map(|(k, v)| (*k, v.as_ref()))
    }
}

impl<const N: usize> From<&[(&'static str, &'static str); N]> for Attributes {
    fn from(pairs: &[(&'static str, &'static str); N]) -> Self {
        Self(
            pairs
                .iter()
                .map(|(k, v)| (*k, Cow::Borrowed(*v)))
                .collect(),
        )
    }
}

impl From<&[(&'static str, &'static str)]> for Attributes {
    fn from(pairs: &[(&'static str, &'static str)]) -> Self {
        Self(
            pairs
                .iter()
                .map(|(k, v)| (*k, Cow::Borrowed(*v)))
                .collect(),
        )
    }
}

/// Types that can record observations within a [`Metric`].
pub trait MetricObserver: Debug + Default + Clone + Send + Sync + 'static {}

/// A monotonic counter.
#[derive(Debug, Clone, Default)]
pub struct U64Counter {
    state: Arc<AtomicU64>,
}

impl U64Counter {
    /// Increment the counter by `count`.
    pub fn inc(&self, count: u64) {
        self.state.fetch_add(count, Ordering::Relaxed);
    }

    /// Read the current value.
    pub fn fetch(&self) -> u64 {
        self.state.load(Ordering::Relaxed)
    }
}

impl MetricObserver for U64Counter {}

/// A gauge that can move in both directions.
#[derive(Debug, Clone, Default)]
pub struct U64Gauge {
    state: Arc<AtomicU64>,
}

impl U64Gauge {
    /// Set the gauge to `value`.
    pub fn set(&self, value: u64) {
        self.state.store(value, Ordering::Relaxed);
    }

    /// Read the current value.
    pub fn fetch(&self) -> u64 {
        self.state.load(Ordering::Relaxed)
    }
}

impl MetricObserver for U64Gauge {}

/// A named instrument holding one observer per [`Attributes`] combination.
#[derive(Debug)]
pub struct Metric<T> {
    name: &'static str,
    description: &'static str,
    observers: Arc<Mutex<BTreeMap<Attributes, T>>>,
}

impl<T> Clone for Metric<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            description: self.description,
            observers: Arc::clone(&self.observers),
        }
    }
}

impl<T: MetricObserver> Metric<T> {
    fn new(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            observers: Default::default(),
        }
    }

    /// The instrument name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The help text this instrument was registered with.
    pub fn description(&self) -> &'static str {
        self.description
    }

    /// Returns the observer for the given attributes, creating it on first use.
    pub fn recorder(&self, attributes: impl Into<Attributes>) -> T {
        self.observers
            .lock()
            .entry(attributes.into())
            .or_default()
            .clone()
    }

    /// Returns the observer for the given attributes, if any observation has
    /// been recorded against them.
    pub fn get_observer(&self, attributes: &Attributes) -> Option<T> {
        self.observers.lock().get(attributes).cloned()
    }
}

/// The process-wide collection of instruments.
#[derive(Debug, Default)]
pub struct Registry {
    instruments: Mutex<BTreeMap<&'static str, Box<dyn Any + Send>>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an instrument, or return the existing one with this name.
    ///
    /// # Panics
    ///
    /// Panics if `name` was previously registered with a different observer
    /// type.
    pub fn register_metric<T: MetricObserver>(
        &self,
        name: &'static str,
        description: &'static str,
    ) -> Metric<T> {
        let mut instruments = self.instruments.lock();
        instruments
            .entry(name)
            .or_insert_with(|| Box::new(Metric::<T>::new(name, description)))
            .downcast_ref::<Metric<T>>()
            .unwrap_or_else(|| panic!("instrument \"{}\" registered with different type", name))
            .clone()
    }

    /// Look up a previously registered instrument.
    pub fn get_instrument<T: MetricObserver>(&self, name: &'static str) -> Option<Metric<T>> {
        self.instruments.lock().get(name).map(|instrument| {
            instrument
                .downcast_ref::<Metric<T>>()
                .unwrap_or_else(|| {
                    panic!("instrument \"{}\" registered with different type", name)
                })
                .clone()
        })
    }
}
