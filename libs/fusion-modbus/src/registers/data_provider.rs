//! Data providers
//!
//! A provider owns (or computes) the semantic value behind a register and reacts to
//! protocol traffic:
//!
//! - [`HoldingProvider`]: holds the value itself
//! - [`CallbackProvider`]: value lives with the host, reached through closures
//!
//! Providers are shared between the registry (protocol side) and the application
//! through `Arc`. Observer callbacks run on the thread that performed the access,
//! after the provider's own lock has been released.

use super::value::RegisterValue;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Observer invoked with the value that was read or written
pub type Observer<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// When a register takes part in unsolicited reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportPolicy {
    /// Reported after the application changed the value
    OnChange,
    /// Reported on every scan
    Always,
}

/// Protocol-facing side of a provider
pub trait DataProvider: Send + Sync {
    type Value: RegisterValue;

    /// Current value, without firing observers
    fn current(&self) -> Self::Value;

    /// Value for a protocol read; fires read observers
    fn on_read(&self) -> Self::Value {
        self.current()
    }

    /// Value arriving from a protocol write; fires write observers
    fn on_write(&self, value: Self::Value);

    /// Whether the register must be included in the next unsolicited report.
    /// Clears an edge-triggered flag.
    fn take_report(&self) -> bool {
        false
    }
}

struct Observers<T> {
    on_read: Mutex<Vec<Observer<T>>>,
    on_write: Mutex<Vec<Observer<T>>>,
}

impl<T> Default for Observers<T> {
    fn default() -> Self {
        Self {
            on_read: Mutex::new(Vec::new()),
            on_write: Mutex::new(Vec::new()),
        }
    }
}

impl<T> Observers<T> {
    fn notify(list: &Mutex<Vec<Observer<T>>>, value: &T) {
        let observers = list.lock().clone();
        for observer in observers {
            observer(value);
        }
    }
}

// ============================================================================
// Holding
// ============================================================================

/// Self-holding provider
pub struct HoldingProvider<T> {
    value: Mutex<T>,
    report: Option<ReportPolicy>,
    dirty: AtomicBool,
    observers: Observers<T>,
}

impl<T: RegisterValue> HoldingProvider<T> {
    /// Plain holding register, never reported unsolicited
    pub fn new(value: T) -> Arc<Self> {
        Self::build(value, None)
    }

    /// Reported after each application-side change
    pub fn unsolicited(value: T) -> Arc<Self> {
        Self::build(value, Some(ReportPolicy::OnChange))
    }

    /// Reported on every scan
    pub fn always_reported(value: T) -> Arc<Self> {
        Self::build(value, Some(ReportPolicy::Always))
    }

    fn build(value: T, report: Option<ReportPolicy>) -> Arc<Self> {
        Arc::new(Self {
            value: Mutex::new(value),
            report,
            // The first scan publishes the initial value
            dirty: AtomicBool::new(report.is_some()),
            observers: Observers::default(),
        })
    }

    pub fn get_value(&self) -> T {
        self.value.lock().clone()
    }

    /// Application-side update; marks the register dirty when the value changed
    pub fn update_value(&self, value: T) {
        let changed = {
            let mut current = self.value.lock();
            let changed = *current != value;
            *current = value;
            changed
        };
        if changed && self.report.is_some() {
            self.dirty.store(true, Ordering::Release);
        }
    }

    /// Application-side update that is reported even if the value is unchanged
    pub fn report(&self, value: T) {
        *self.value.lock() = value;
        if self.report.is_some() {
            self.dirty.store(true, Ordering::Release);
        }
    }

    pub fn add_read_callback<F>(&self, callback: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.observers.on_read.lock().push(Arc::new(callback));
    }

    pub fn add_write_callback<F>(&self, callback: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.observers.on_write.lock().push(Arc::new(callback));
    }
}

impl<T: RegisterValue> DataProvider for HoldingProvider<T> {
    type Value = T;

    fn current(&self) -> T {
        self.get_value()
    }

    fn on_read(&self) -> T {
        let value = self.get_value();
        Observers::notify(&self.observers.on_read, &value);
        value
    }

    fn on_write(&self, value: T) {
        *self.value.lock() = value.clone();
        Observers::notify(&self.observers.on_write, &value);
    }

    fn take_report(&self) -> bool {
        match self.report {
            None => false,
            Some(ReportPolicy::Always) => true,
            Some(ReportPolicy::OnChange) => self.dirty.swap(false, Ordering::AcqRel),
        }
    }
}

// ============================================================================
// Callbacks
// ============================================================================

type Getter<T> = Box<dyn Fn() -> T + Send + Sync>;
type Setter<T> = Box<dyn Fn(T) + Send + Sync>;

/// Host-owned value reached through closures
///
/// With reporting enabled, the register is reported whenever the getter returns a
/// value different from the last reported one.
pub struct CallbackProvider<T> {
    getter: Getter<T>,
    setter: Option<Setter<T>>,
    report: Option<ReportPolicy>,
    last_reported: Mutex<Option<T>>,
    observers: Observers<T>,
}

impl<T: RegisterValue> CallbackProvider<T> {
    /// Read-only register backed by `getter`; protocol writes are ignored
    pub fn new<G>(getter: G) -> Arc<Self>
    where
        G: Fn() -> T + Send + Sync + 'static,
    {
        Self::build(Box::new(getter), None, None)
    }

    pub fn with_setter<G, S>(getter: G, setter: S) -> Arc<Self>
    where
        G: Fn() -> T + Send + Sync + 'static,
        S: Fn(T) + Send + Sync + 'static,
    {
        Self::build(Box::new(getter), Some(Box::new(setter)), None)
    }

    /// Reported whenever the getter's value changes
    pub fn unsolicited<G>(getter: G) -> Arc<Self>
    where
        G: Fn() -> T + Send + Sync + 'static,
    {
        Self::build(Box::new(getter), None, Some(ReportPolicy::OnChange))
    }

    /// Reported on every scan
    pub fn always_reported<G>(getter: G) -> Arc<Self>
    where
        G: Fn() -> T + Send + Sync + 'static,
    {
        Self::build(Box::new(getter), None, Some(ReportPolicy::Always))
    }

    fn build(
        getter: Getter<T>,
        setter: Option<Setter<T>>,
        report: Option<ReportPolicy>,
    ) -> Arc<Self> {
        Arc::new(Self {
            getter,
            setter,
            report,
            last_reported: Mutex::new(None),
            observers: Observers::default(),
        })
    }

    pub fn add_read_callback<F>(&self, callback: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.observers.on_read.lock().push(Arc::new(callback));
    }

    pub fn add_write_callback<F>(&self, callback: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.observers.on_write.lock().push(Arc::new(callback));
    }
}

impl<T: RegisterValue> DataProvider for CallbackProvider<T> {
    type Value = T;

    fn current(&self) -> T {
        (self.getter)()
    }

    fn on_read(&self) -> T {
        let value = self.current();
        Observers::notify(&self.observers.on_read, &value);
        value
    }

    fn on_write(&self, value: T) {
        if let Some(setter) = &self.setter {
            setter(value.clone());
        }
        Observers::notify(&self.observers.on_write, &value);
    }

    fn take_report(&self) -> bool {
        match self.report {
            None => false,
            Some(ReportPolicy::Always) => true,
            Some(ReportPolicy::OnChange) => {
                let value = self.current();
                let mut last = self.last_reported.lock();
                if last.as_ref() == Some(&value) {
                    false
                } else {
                    *last = Some(value);
                    true
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_unsolicited_holding_is_edge_triggered() {
        let provider = HoldingProvider::unsolicited(0u16);
        assert!(provider.take_report(), "initial value is published once");
        assert!(!provider.take_report());

        provider.update_value(0);
        assert!(!provider.take_report(), "unchanged value is not reported");

        provider.update_value(3);
        assert!(provider.take_report());
        assert!(!provider.take_report());

        provider.report(3);
        assert!(provider.take_report(), "explicit report ignores equality");
    }

    #[test]
    fn test_protocol_write_fires_observers_but_not_report() {
        let provider = HoldingProvider::unsolicited(0u32);
        provider.take_report();
        let seen = Arc::new(AtomicU32::new(0));
        {
            let seen = seen.clone();
            provider.add_write_callback(move |v| seen.store(*v, Ordering::SeqCst));
        }
        provider.on_write(42);
        assert_eq!(seen.load(Ordering::SeqCst), 42);
        assert_eq!(provider.get_value(), 42);
        assert!(!provider.take_report());
    }

    #[test]
    fn test_callback_provider_reports_changes() {
        let source = Arc::new(AtomicU32::new(1));
        let provider = {
            let source = source.clone();
            CallbackProvider::unsolicited(move || source.load(Ordering::SeqCst))
        };
        assert!(provider.take_report());
        assert!(!provider.take_report());
        source.store(2, Ordering::SeqCst);
        assert!(provider.take_report());
    }

    #[test]
    fn test_callback_provider_setter() {
        let sink = Arc::new(AtomicU32::new(0));
        let provider = {
            let sink = sink.clone();
            CallbackProvider::with_setter(|| 0u32, move |v| sink.store(v, Ordering::SeqCst))
        };
        provider.on_write(9);
        assert_eq!(sink.load(Ordering::SeqCst), 9);
    }
}
