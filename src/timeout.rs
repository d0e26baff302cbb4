//! Deadlines racing against pending calls.

use std::sync::Arc;
use std::time::Duration;

use crate::bucket::BucketRange;
use crate::error::TimeoutError;
use crate::promise::Promise;
use crate::scheduler::Scheduler;

/// Arms a timer next to every pending call.
///
/// Whichever comes first, the call completing or the timer firing, decides
/// the result; the other one finds the promise already complete and does
/// nothing. The underlying work is never interrupted.
#[derive(Clone)]
pub struct TimeoutScheduler {
    scheduler: Arc<Scheduler>,
}

impl TimeoutScheduler {
    /// Creates a timeout scheduler on top of `scheduler`.
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }

    /// Wraps `supplier` so that the promise it returns fails with a
    /// [`TimeoutError`] for `bucket` if it is not complete after `timeout`.
    pub fn add_timeout<T, S>(
        &self,
        supplier: S,
        timeout: Duration,
        bucket: BucketRange,
    ) -> impl FnOnce() -> Promise<T>
    where
        T: Send + 'static,
        S: FnOnce() -> Promise<T>,
    {
        let scheduler = Arc::clone(&self.scheduler);
        move || {
            let promise = supplier();
            arm(&scheduler, &promise, timeout, bucket);
            promise
        }
    }
}

fn arm<T: Send + 'static>(
    scheduler: &Scheduler,
    promise: &Promise<T>,
    timeout: Duration,
    bucket: BucketRange,
) {
    let target = promise.share();
    let timer = scheduler.schedule(timeout, move || {
        target.complete(Err(TimeoutError::new(timeout, bucket).into()));
    });
    promise.on_complete(move |_| timer.cancel());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Failure;
    use std::thread;

    fn timeouts() -> TimeoutScheduler {
        TimeoutScheduler::new(Arc::new(Scheduler::new("test-timeouts").unwrap()))
    }

    #[test]
    fn slow_call_times_out() {
        let timeouts = timeouts();
        let guarded = timeouts.add_timeout(
            Promise::<u32>::new,
            Duration::from_millis(20),
            BucketRange::new(0, 49),
        );

        let failure = guarded().wait().unwrap_err();

        assert!(failure.is_timeout());
        assert!(failure.to_string().contains("for timeout bucket 0-49 ms"));
    }

    #[test]
    fn fast_call_keeps_its_result() {
        let timeouts = timeouts();
        let guarded = timeouts.add_timeout(
            || Promise::completed(Ok(5)),
            Duration::from_millis(20),
            BucketRange::ALL,
        );

        let promise = guarded();
        thread::sleep(Duration::from_millis(60));

        assert_eq!(promise.wait().unwrap(), 5);
    }

    #[test]
    fn supplier_runs_only_when_invoked() {
        let invoked = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&invoked);
        let guarded = timeouts().add_timeout(
            move || {
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
                Promise::<()>::completed(Err(Failure::Panicked("never".into())))
            },
            Duration::from_millis(20),
            BucketRange::ALL,
        );

        assert!(!invoked.load(std::sync::atomic::Ordering::SeqCst));
        drop(guarded);
        assert!(!invoked.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn completion_after_timeout_is_ignored() {
        let worker_side = Arc::new(parking_lot::Mutex::new(None));
        let slot = Arc::clone(&worker_side);
        let timeouts = timeouts();
        let guarded = timeouts.add_timeout(
            move || {
                let promise = Promise::new();
                *slot.lock() = Some(promise.share());
                promise
            },
            Duration::from_millis(10),
            BucketRange::ALL,
        );

        let promise = guarded();
        thread::sleep(Duration::from_millis(60));
        let late = worker_side.lock().take().unwrap();

        assert!(!late.complete(Ok("late")));
        assert!(promise.wait().unwrap_err().is_timeout());
    }

    #[test]
    fn dropping_the_scheduler_times_out_pending_calls() {
        let guarded = timeouts().add_timeout(
            Promise::<u32>::new,
            Duration::from_secs(60),
            BucketRange::ALL,
        );

        // the closure held the last handle to the scheduler
        let promise = guarded();

        let result = promise.wait_timeout(Duration::from_secs(2));
        assert!(result.unwrap().unwrap_err().is_timeout());
    }
}
