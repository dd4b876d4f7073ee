//! Progress observer registry

use std::any::type_name;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::warn;

/// Error returned by a failing observer
pub type ObserverError = Box<dyn std::error::Error + Send + Sync>;

/// Receives `(snapshot, current, total)` progress events
///
/// `current` and `total` are bytes; `total` is 0 while the size is unknown.
/// Implemented for every matching closure. Closures that cannot fail can
/// be wrapped in [`ProgressCallback`].
pub trait ProgressObserver: Send + Sync {
    /// Handle one progress event
    ///
    /// # Errors
    /// Errors are logged by the caller and otherwise ignored
    fn on_progress(&self, snapshot: &str, current: u64, total: u64) -> Result<(), ObserverError>;
}

impl<F> ProgressObserver for F
where
    F: Fn(&str, u64, u64) -> Result<(), ObserverError> + Send + Sync,
{
    fn on_progress(&self, snapshot: &str, current: u64, total: u64) -> Result<(), ObserverError> {
        self(snapshot, current, total)
    }
}

/// Observer made from a closure that cannot fail
///
/// ```
/// use zfsrepl_transport::{ProgressCallback, ProgressObservers};
///
/// let observers = ProgressObservers::new();
/// observers.add(ProgressCallback(|snapshot: &str, current: u64, total: u64| {
///     println!("{snapshot}: {current}/{total}");
/// }));
/// ```
#[derive(Debug, Clone, Copy)]
pub struct ProgressCallback<F>(pub F);

impl<F> ProgressObserver for ProgressCallback<F>
where
    F: Fn(&str, u64, u64) + Send + Sync,
{
    fn on_progress(&self, snapshot: &str, current: u64, total: u64) -> Result<(), ObserverError> {
        (self.0)(snapshot, current, total);
        Ok(())
    }
}

#[derive(Clone)]
struct Registered {
    name: &'static str,
    observer: Arc<dyn ProgressObserver>,
}

/// Ordered, shareable list of observers
///
/// Registration may race with notification; each notification pass
/// works on a copy of the list taken when it starts.
#[derive(Clone, Default)]
pub struct ProgressObservers {
    inner: Arc<Mutex<Vec<Registered>>>,
}

impl ProgressObservers {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an observer
    pub fn add<O: ProgressObserver + 'static>(&self, observer: O) {
        let registered = Registered {
            name: type_name::<O>(),
            observer: Arc::new(observer),
        };
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(registered);
    }

    /// Number of registered observers
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no observer is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call every observer in registration order
    ///
    /// Errors and panics raised by an observer are logged and do not
    /// stop the remaining observers from being called.
    pub fn notify(&self, source: &str, snapshot: &str, current: u64, total: u64) {
        let observers = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for (index, registered) in observers.iter().enumerate() {
            let result = catch_unwind(AssertUnwindSafe(|| {
                registered.observer.on_progress(snapshot, current, total)
            }));
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    process = %source,
                    observer = index,
                    observer_type = registered.name,
                    error = %e,
                    "error notifying replication progress observer"
                ),
                Err(panic) => warn!(
                    process = %source,
                    observer = index,
                    observer_type = registered.name,
                    panic = panic_message(panic.as_ref()),
                    "replication progress observer panicked"
                ),
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Calls = Arc<Mutex<Vec<(usize, String, u64, u64)>>>;

    fn recorder(calls: &Calls, index: usize) -> impl ProgressObserver + 'static {
        let calls = Arc::clone(calls);
        move |snapshot: &str, current: u64, total: u64| -> Result<(), ObserverError> {
            calls
                .lock()
                .unwrap()
                .push((index, snapshot.to_string(), current, total));
            Ok(())
        }
    }

    #[test]
    fn test_notifies_in_registration_order() {
        let calls = Calls::default();
        let observers = ProgressObservers::new();
        for index in 0..3 {
            observers.add(recorder(&calls, index));
        }

        observers.notify("test", "auto-2026-10-19", 10, 100);

        let calls = calls.lock().unwrap();
        let order: Vec<usize> = calls.iter().map(|c| c.0).collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert_eq!(calls[0], (0, "auto-2026-10-19".to_string(), 10, 100));
    }

    #[test]
    fn test_failing_observers_do_not_stop_the_rest() {
        let calls = Calls::default();
        let observers = ProgressObservers::new();
        observers.add(recorder(&calls, 0));
        observers.add(|_: &str, _: u64, _: u64| -> Result<(), ObserverError> {
            Err("progress bar closed".into())
        });
        observers.add(|_: &str, _: u64, _: u64| -> Result<(), ObserverError> {
            panic!("observer bug");
        });
        observers.add(recorder(&calls, 3));

        observers.notify("test", "snap", 1, 0);

        let order: Vec<usize> = calls.lock().unwrap().iter().map(|c| c.0).collect();
        assert_eq!(order, vec![0, 3]);
    }

    #[test]
    fn test_callback_observers_need_no_result() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let observers = ProgressObservers::new();
        let sink = Arc::clone(&seen);
        observers.add(ProgressCallback(move |snapshot: &str, current: u64, _: u64| {
            sink.lock().unwrap().push(format!("{snapshot}:{current}"));
        }));

        observers.notify("test", "snap", 5, 10);
        observers.notify("test", "snap", 10, 10);

        assert_eq!(*seen.lock().unwrap(), vec!["snap:5", "snap:10"]);
    }

    #[test]
    fn test_registration_during_notification() {
        let observers = ProgressObservers::new();
        let registry = observers.clone();
        observers.add(move |_: &str, _: u64, _: u64| -> Result<(), ObserverError> {
            registry.add(|_: &str, _: u64, _: u64| -> Result<(), ObserverError> { Ok(()) });
            Ok(())
        });

        observers.notify("test", "snap", 1, 0);
        assert_eq!(observers.len(), 2);
        // the observer added above is called, the one added now is not
        observers.notify("test", "snap", 2, 0);
        assert_eq!(observers.len(), 3);
    }
}
