//! Lifecycle callback invocation with per-listener fault isolation.

use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::warn;

/// Invoke every callback in registration order. A panicking callback is
/// caught and logged so later callbacks still run.
pub(crate) fn invoke_all<T: ?Sized>(
    what: &str,
    callbacks: &[std::sync::Arc<dyn Fn(&T) + Send + Sync>],
    arg: &T,
) {
    for callback in callbacks {
        if catch_unwind(AssertUnwindSafe(|| callback(arg))).is_err() {
            warn!("{what} callback panicked; continuing with remaining callbacks");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn panicking_callback_does_not_stop_later_ones() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c1 = counter.clone();
        let c2 = counter.clone();
        let callbacks: Vec<Arc<dyn Fn(&u32) + Send + Sync>> = vec![
            Arc::new(move |_| {
                c1.fetch_add(1, Ordering::SeqCst);
            }),
            Arc::new(|_| panic!("listener fault")),
            Arc::new(move |_| {
                c2.fetch_add(1, Ordering::SeqCst);
            }),
        ];
        invoke_all("test", &callbacks, &7);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn callbacks_run_in_registration_order() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        let callbacks: Vec<Arc<dyn Fn(&u32) + Send + Sync>> = vec![
            Arc::new(move |v| o1.lock().push(*v * 10)),
            Arc::new(move |v| o2.lock().push(*v * 20)),
        ];
        invoke_all("test", &callbacks, &1);
        assert_eq!(*order.lock(), vec![10, 20]);
    }
}
