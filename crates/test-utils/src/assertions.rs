//! Test assertion helpers.

use std::{
    thread,
    time::{Duration, Instant},
};

/// Default polling interval for [`assert_eventually`].
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Polls a condition until it returns true or the timeout expires.
///
/// Used by tests that wait on another thread, such as a writer blocked on
/// the table's writer gate, without relying on fixed sleeps.
///
/// Returns `true` if the condition became true before the timeout.
///
/// # Example
///
/// ```
/// use std::sync::{Arc, atomic::{AtomicBool, Ordering}};
/// use std::time::Duration;
/// use tabula_test_utils::assert_eventually;
///
/// let flag = Arc::new(AtomicBool::new(false));
/// let setter = Arc::clone(&flag);
/// std::thread::spawn(move || setter.store(true, Ordering::SeqCst));
///
/// assert!(assert_eventually(Duration::from_secs(2), || flag.load(Ordering::SeqCst)));
/// ```
pub fn assert_eventually<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let start = Instant::now();

    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        thread::sleep(DEFAULT_POLL_INTERVAL);
    }

    // Final check after timeout
    condition()
}

/// Sorts a list of keys so results from hash-ordered iteration can be
/// compared with expectations.
#[must_use]
pub fn sorted_keys<I, K>(keys: I) -> Vec<Vec<u8>>
where
    I: IntoIterator<Item = K>,
    K: AsRef<[u8]>,
{
    let mut keys: Vec<Vec<u8>> = keys.into_iter().map(|k| k.as_ref().to_vec()).collect();
    keys.sort();
    keys
}
