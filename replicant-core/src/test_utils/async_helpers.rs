//! Async test helpers
//!
//! Timeouts around channel receives and store events, so a broken test
//! fails instead of hanging.

use std::future::Future;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{timeout, Duration};

use crate::core_sync::{ReplicatedStore, StoreEvent, Version};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvTimeoutError {
    Timeout,
    Closed,
}

impl std::fmt::Display for RecvTimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecvTimeoutError::Timeout => write!(f, "receive operation timed out"),
            RecvTimeoutError::Closed => write!(f, "channel closed"),
        }
    }
}

impl std::error::Error for RecvTimeoutError {}

/// Receive from an unbounded channel with a timeout
pub async fn recv_timeout<T>(
    rx: &mut mpsc::UnboundedReceiver<T>,
    duration: Duration,
) -> Result<T, RecvTimeoutError> {
    timeout(duration, rx.recv())
        .await
        .map_err(|_| RecvTimeoutError::Timeout)?
        .ok_or(RecvTimeoutError::Closed)
}

/// Receive from a broadcast channel with a timeout, skipping lag notices
pub async fn recv_broadcast_timeout<T: Clone>(
    rx: &mut broadcast::Receiver<T>,
    duration: Duration,
) -> Result<T, RecvTimeoutError> {
    let next = async {
        loop {
            match rx.recv().await {
                Ok(value) => return Ok(value),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Err(RecvTimeoutError::Closed),
            }
        }
    };
    timeout(duration, next)
        .await
        .map_err(|_| RecvTimeoutError::Timeout)?
}

/// Wait until a watched value satisfies `predicate`
pub async fn wait_for_watch<T, F>(
    rx: &mut watch::Receiver<T>,
    duration: Duration,
    predicate: F,
) -> Result<T, RecvTimeoutError>
where
    T: Clone,
    F: Fn(&T) -> bool,
{
    let result = timeout(duration, rx.wait_for(|value| predicate(value)))
        .await
        .map_err(|_| RecvTimeoutError::Timeout)?;
    result
        .map(|value| value.clone())
        .map_err(|_| RecvTimeoutError::Closed)
}

/// Wait until the store reports a commit reaching `version`
pub async fn wait_for_version(
    store: &ReplicatedStore,
    version: Version,
    duration: Duration,
) -> Result<(), RecvTimeoutError> {
    let mut events = store.subscribe();
    if store.version() >= version {
        return Ok(());
    }
    loop {
        match recv_broadcast_timeout(&mut events, duration).await? {
            StoreEvent::Modified { version: reached } if reached >= version => return Ok(()),
            _ => continue,
        }
    }
}

/// Drain whatever is immediately available
pub fn try_drain<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Vec<T> {
    let mut items = Vec::new();
    while let Ok(item) = rx.try_recv() {
        items.push(item);
    }
    items
}

/// Drain a broadcast receiver without waiting, skipping lag notices
pub fn try_drain_broadcast<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Vec<T> {
    let mut items = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(item) => items.push(item),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return items,
        }
    }
}

/// Assert a future completes within duration
pub async fn assert_completes_within<F, T>(duration: Duration, future: F) -> T
where
    F: Future<Output = T>,
{
    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => panic!("Future did not complete within {:?}", duration),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_recv_timeout() {
        let (tx, mut rx) = mpsc::unbounded_channel::<u8>();
        assert_eq!(
            recv_timeout(&mut rx, Duration::from_millis(10)).await,
            Err(RecvTimeoutError::Timeout)
        );
        tx.send(1).unwrap();
        assert_eq!(recv_timeout(&mut rx, Duration::from_millis(10)).await, Ok(1));
        drop(tx);
        assert_eq!(
            recv_timeout(&mut rx, Duration::from_millis(10)).await,
            Err(RecvTimeoutError::Closed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_watch() {
        let (tx, mut rx) = watch::channel(0u32);
        tokio::spawn(async move {
            for i in 1..=3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
                let _ = tx.send(i);
            }
        });
        let value = wait_for_watch(&mut rx, Duration::from_secs(1), |v| *v == 3).await;
        assert_eq!(value, Ok(3));
    }

    #[test]
    fn test_try_drain() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(1).unwrap();
        tx.send(2).unwrap();
        assert_eq!(try_drain(&mut rx), vec![1, 2]);
        assert!(try_drain(&mut rx).is_empty());
    }
}
