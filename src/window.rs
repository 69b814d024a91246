use crate::error::{MuxError, Result};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// Outbound flow-control credit for one stream.
#[derive(Debug)]
pub(crate) struct WindowManager {
    state: Mutex<WindowState>,
    notify: Notify,
}

#[derive(Debug)]
struct WindowState {
    available: usize,
    max: usize,
    err: Option<MuxError>,
}

impl WindowManager {
    pub fn new(max: usize) -> Self {
        Self {
            state: Mutex::new(WindowState {
                available: max,
                max,
                err: None,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WindowState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits for at least one byte of credit and takes up to `n`.
    ///
    /// Returns the number of bytes granted, which may be less than `n`.
    pub async fn decrement(&self, n: usize) -> Result<usize> {
        if n == 0 {
            return Ok(0);
        }

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent increment is not missed
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(err) = &state.err {
                    return Err(err.clone());
                }
                if state.available > 0 {
                    let granted = n.min(state.available);
                    state.available -= granted;
                    return Ok(granted);
                }
            }

            notified.await;
        }
    }

    /// Returns credit, never going above the configured maximum.
    pub fn increment(&self, n: usize) {
        {
            let mut state = self.lock();
            state.available = state.available.saturating_add(n).min(state.max);
        }
        self.notify.notify_waiters();
    }

    /// Fails every current and future `decrement`. The first error sticks.
    pub fn set_error(&self, err: MuxError) {
        {
            let mut state = self.lock();
            if state.err.is_none() {
                state.err = Some(err);
            }
        }
        self.notify.notify_waiters();
    }

    #[cfg(test)]
    pub fn available(&self) -> usize {
        self.lock().available
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, time::Duration};

    #[tokio::test]
    async fn test_partial_grant() {
        let window = WindowManager::new(10);
        assert_eq!(window.decrement(4).await.unwrap(), 4);
        assert_eq!(window.decrement(100).await.unwrap(), 6);
        assert_eq!(window.available(), 0);
        assert_eq!(window.decrement(0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_decrement_waits_for_increment() {
        let window = Arc::new(WindowManager::new(8));
        window.decrement(8).await.unwrap();

        let waiter = {
            let window = Arc::clone(&window);
            tokio::spawn(async move { window.decrement(5).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        window.increment(3);
        assert_eq!(waiter.await.unwrap().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_increment_is_clamped() {
        let window = WindowManager::new(16);
        window.decrement(6).await.unwrap();
        window.increment(100);
        assert_eq!(window.available(), 16);
    }

    #[tokio::test]
    async fn test_set_error_wakes_waiters() {
        let window = Arc::new(WindowManager::new(1));
        window.decrement(1).await.unwrap();

        let waiter = {
            let window = Arc::clone(&window);
            tokio::spawn(async move { window.decrement(1).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        window.set_error(MuxError::SessionClosed);
        window.set_error(MuxError::StreamClosed);
        assert!(matches!(
            waiter.await.unwrap(),
            Err(MuxError::SessionClosed)
        ));

        // Errors win even when credit is available again
        window.increment(1);
        assert!(window.decrement(1).await.is_err());
    }
}
