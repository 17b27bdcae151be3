//! Bounded FIFO used for every inter-thread hand-off in the core.

use crate::error::{Result, UsbdError};
use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use std::time::Duration;

/// Fixed-depth message queue. Cloning yields another handle to the same queue.
pub struct MessageQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    depth: usize,
}

impl<T> Clone for MessageQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            depth: self.depth,
        }
    }
}

impl<T> MessageQueue<T> {
    pub fn new(depth: usize) -> Result<Self> {
        if depth == 0 {
            return Err(UsbdError::BadParam("queue depth must be non-zero"));
        }
        let (tx, rx) = crossbeam_channel::bounded(depth);
        Ok(Self { tx, rx, depth })
    }

    /// Post a message. `None` blocks until there is room.
    pub fn post(&self, msg: T, timeout: Option<Duration>) -> Result<()> {
        match timeout {
            None => self
                .tx
                .send(msg)
                .map_err(|_| UsbdError::General("message queue disconnected".into())),
            Some(timeout) => self.tx.send_timeout(msg, timeout).map_err(|e| match e {
                SendTimeoutError::Timeout(_) => UsbdError::Timeout,
                SendTimeoutError::Disconnected(_) => {
                    UsbdError::General("message queue disconnected".into())
                }
            }),
        }
    }

    /// Take the oldest message. `None` blocks until one arrives.
    pub fn take(&self, timeout: Option<Duration>) -> Result<T> {
        match timeout {
            None => self
                .rx
                .recv()
                .map_err(|_| UsbdError::General("message queue disconnected".into())),
            Some(timeout) => self.rx.recv_timeout(timeout).map_err(|e| match e {
                RecvTimeoutError::Timeout => UsbdError::Timeout,
                RecvTimeoutError::Disconnected => {
                    UsbdError::General("message queue disconnected".into())
                }
            }),
        }
    }

    /// Take a message if one is already queued.
    pub fn try_take(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn sender(&self) -> Sender<T> {
        self.tx.clone()
    }

    pub fn receiver(&self) -> Receiver<T> {
        self.rx.clone()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
