//! The bounded command queue between producers and the single consumer.
//!
//! Any number of producers (the polling ticker, API callers) hold a cloned
//! [`CommandQueue`]; exactly one [`CommandReceiver`] exists. Delivery is
//! FIFO and the consumer is the only source of ordering for bus traffic.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};

use crestbus_core::error::{Error, Result};

use crate::commands::Command;

/// Default number of commands the queue holds.
pub const COMMAND_QUEUE_CAPACITY: usize = 16;

/// Producer side of the command queue.
#[derive(Debug, Clone)]
pub struct CommandQueue {
    tx: mpsc::Sender<Command>,
}

/// Consumer side of the command queue.
#[derive(Debug)]
pub struct CommandReceiver {
    rx: mpsc::Receiver<Command>,
}

/// Create a queue holding at most `capacity` commands.
pub fn command_queue(capacity: usize) -> (CommandQueue, CommandReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (CommandQueue { tx }, CommandReceiver { rx })
}

impl CommandQueue {
    /// Enqueue `command`, waiting at most `wait` for room.
    pub async fn enqueue(&self, command: Command, wait: Duration) -> Result<()> {
        match self.tx.send_timeout(command, wait).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(Error::QueueFull),
            Err(SendTimeoutError::Closed(_)) => Err(Error::NotInitialized),
        }
    }

    /// Enqueue `command` only if there is room right now.
    pub fn try_enqueue(&self, command: Command) -> Result<()> {
        match self.tx.try_send(command) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(Error::QueueFull),
            Err(TrySendError::Closed(_)) => Err(Error::NotInitialized),
        }
    }

    /// Commands currently waiting.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CommandReceiver {
    /// Wait for the next command. Returns `None` once every producer is gone.
    pub async fn recv(&mut self) -> Option<Command> {
        self.rx.recv().await
    }

    /// Take the next command without waiting.
    pub fn try_recv(&mut self) -> Option<Command> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivery_is_fifo() {
        let (queue, mut rx) = command_queue(4);
        queue.try_enqueue(Command::Ping(0x0B)).unwrap();
        queue.try_enqueue(Command::Break).unwrap();
        queue.try_enqueue(Command::ConfigStep(0x0C)).unwrap();
        assert_eq!(queue.len(), 3);

        assert_eq!(rx.recv().await, Some(Command::Ping(0x0B)));
        assert_eq!(rx.recv().await, Some(Command::Break));
        assert_eq!(rx.try_recv(), Some(Command::ConfigStep(0x0C)));
        assert_eq!(rx.try_recv(), None);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn try_enqueue_fails_when_full() {
        let (queue, _rx) = command_queue(2);
        queue.try_enqueue(Command::Ping(1)).unwrap();
        queue.try_enqueue(Command::Ping(2)).unwrap();
        assert!(matches!(
            queue.try_enqueue(Command::Ping(3)),
            Err(Error::QueueFull)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_gives_up_after_wait() {
        let (queue, _rx) = command_queue(1);
        queue.try_enqueue(Command::Ping(1)).unwrap();
        let result = queue
            .enqueue(Command::Ping(2), Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(Error::QueueFull)));
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_succeeds_when_consumer_frees_room() {
        let (queue, mut rx) = command_queue(1);
        queue.try_enqueue(Command::Ping(1)).unwrap();

        let consumer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            rx.recv().await
        });
        queue
            .enqueue(Command::Ping(2), Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(consumer.await.unwrap(), Some(Command::Ping(1)));
    }

    #[tokio::test]
    async fn closed_queue_reports_not_initialized() {
        let (queue, rx) = command_queue(1);
        drop(rx);
        assert!(matches!(
            queue.try_enqueue(Command::Break),
            Err(Error::NotInitialized)
        ));
    }
}
