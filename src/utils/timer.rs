//! Timer/timeout utility implemented using `tokio::time::Sleep`.

use std::future;
use std::pin::Pin;

use tokio::time::{self, Duration, Instant, Sleep};

use crate::utils::DsdcError;

/// Timer utility for signalling after a given timeout. Supports reseting with
/// a different duration and cancellation.
///
/// Must be used within the context of a tokio runtime.
#[derive(Debug)]
pub struct Timer {
    /// Inner `tokio::time::Sleep` future, wrapped in a pinned box to support
    /// await multiple times.
    sleep: Pin<Box<Sleep>>,

    /// True if a kicked-off timeout has not yet fired nor been cancelled.
    armed: bool,
}

impl Timer {
    /// Creates a new timer utility in unarmed state.
    pub fn new() -> Self {
        Timer {
            sleep: Box::pin(time::sleep(Duration::ZERO)),
            armed: false,
        }
    }

    /// True if the timer currently has a pending timeout.
    pub fn armed(&self) -> bool {
        self.armed
    }

    /// Kicks off the timer with the given duration.
    pub fn kickoff(&mut self, dur: Duration) -> Result<(), DsdcError> {
        if dur.is_zero() {
            return Err(DsdcError::msg(format!(
                "invalid timeout duration {} ns",
                dur.as_nanos()
            )));
        }

        self.sleep.as_mut().reset(Instant::now() + dur);
        self.armed = true;
        Ok(())
    }

    /// Kicks off the timer to fire at the given deadline. A deadline already
    /// in the past fires (nearly) immediately.
    pub fn kickoff_until(&mut self, ddl: Instant) {
        self.sleep.as_mut().reset(ddl.max(Instant::now()));
        self.armed = true;
    }

    /// Cancels the pending timeout, if any.
    pub fn cancel(&mut self) {
        self.armed = false;
    }

    /// Waits for the timer to timeout; never resolves if the timer is not
    /// currently armed. Typically, this should be used as a branch of a
    /// `tokio::select!`.
    pub async fn timeout(&mut self) {
        if !self.armed {
            future::pending::<()>().await;
        }
        self.sleep.as_mut().await;
        self.armed = false;
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod timer_tests {
    use super::*;
    use tokio::time::{Duration, Instant};

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn timer_new() {
        let timer = Timer::new();
        assert!(!timer.armed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timer_kickoff() -> Result<(), DsdcError> {
        let mut timer = Timer::new();
        let start = Instant::now();
        timer.kickoff(Duration::from_millis(200))?;
        assert!(timer.armed());
        timer.timeout().await;
        let finish = Instant::now();
        assert!(finish.duration_since(start) >= Duration::from_millis(200));
        assert!(!timer.armed());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timer_deadline() -> Result<(), DsdcError> {
        let mut timer = Timer::new();
        let start = Instant::now();
        timer.kickoff_until(start + Duration::from_millis(150));
        timer.timeout().await;
        let finish = Instant::now();
        assert!(finish.duration_since(start) >= Duration::from_millis(150));
        // past deadlines fire immediately
        timer.kickoff_until(Instant::now() - Duration::from_millis(50));
        timer.timeout().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timer_cancel() -> Result<(), DsdcError> {
        let mut timer = Timer::new();
        timer.kickoff(Duration::from_millis(100))?;
        timer.cancel();
        assert!(!timer.armed());
        tokio::select! {
            _ = timer.timeout() => panic!("cancelled timer fired"),
            _ = time::sleep(Duration::from_millis(200)) => {}
        }
        Ok(())
    }
}
