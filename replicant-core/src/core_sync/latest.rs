//! Publish/subscribe channel that retains the last published value.
//!
//! New subscribers immediately observe the current value and then every
//! subsequent change. Built on `tokio::sync::watch`.

use tokio::sync::watch;

/// Last-value channel
#[derive(Debug)]
pub struct Latest<T> {
    tx: watch::Sender<T>,
}

impl<T: Clone + PartialEq> Latest<T> {
    pub fn new(initial: T) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Current value.
    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Publish a value. Subscribers are only woken if it differs from the
    /// current one. Returns whether the value changed.
    pub fn publish(&self, value: T) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<T: Clone + PartialEq + Default> Default for Latest<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_sees_current_value() {
        let latest = Latest::new(1u32);
        latest.publish(2);

        let rx = latest.subscribe();
        assert_eq!(*rx.borrow(), 2);
        assert_eq!(latest.get(), 2);
    }

    #[tokio::test]
    async fn test_change_notification() {
        let latest = Latest::new("a".to_string());
        let mut rx = latest.subscribe();

        assert!(latest.publish("b".to_string()));
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), "b");
    }

    #[test]
    fn test_same_value_is_not_a_change() {
        let latest = Latest::new(5u8);
        let rx = latest.subscribe();
        assert!(!latest.publish(5));
        assert!(!rx.has_changed().unwrap());
    }
}
