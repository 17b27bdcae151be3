//! Blocking primitives: a one-shot completion flag and a binary gate.

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::time::Duration;

#[derive(Default)]
struct CompletionState {
    done: bool,
    wakers: Vec<Sender<()>>,
}

/// Set-once flag that waiters block on.
#[derive(Default)]
pub struct Completion {
    state: Mutex<CompletionState>,
    cond: Condvar,
}

impl Completion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        let mut state = self.state.lock();
        state.done = true;
        for waker in state.wakers.drain(..) {
            let _ = waker.try_send(());
        }
        self.cond.notify_all();
    }

    pub fn is_signaled(&self) -> bool {
        self.state.lock().done
    }

    pub fn wait(&self) {
        let mut state = self.state.lock();
        while !state.done {
            self.cond.wait(&mut state);
        }
    }

    /// Returns false if the timeout elapsed first.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if state.done {
            return true;
        }
        let _ = self.cond.wait_while_for(&mut state, |state| !state.done, timeout);
        state.done
    }

    /// Channel that becomes ready once the flag is set, for waiting on the
    /// completion alongside other channels.
    pub fn waker(&self) -> Receiver<()> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let mut state = self.state.lock();
        if state.done {
            let _ = tx.try_send(());
        } else {
            state.wakers.push(tx);
        }
        rx
    }
}

/// Binary semaphore. Acquire and release may happen on different threads,
/// so there is no guard type.
#[derive(Default)]
pub struct ControlGate {
    busy: Mutex<bool>,
    cond: Condvar,
}

impl ControlGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the gate is free, then take it.
    pub fn acquire(&self) {
        let mut busy = self.busy.lock();
        while *busy {
            self.cond.wait(&mut busy);
        }
        *busy = true;
    }

    pub fn try_acquire(&self) -> bool {
        let mut busy = self.busy.lock();
        if *busy {
            return false;
        }
        *busy = true;
        true
    }

    pub fn release(&self) {
        let mut busy = self.busy.lock();
        *busy = false;
        self.cond.notify_one();
    }

    pub fn is_busy(&self) -> bool {
        *self.busy.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_completion_crosses_threads() {
        let done = Arc::new(Completion::new());
        let signaller = done.clone();
        let t = thread::spawn(move || signaller.signal());
        done.wait();
        t.join().unwrap();
        assert!(done.is_signaled());
    }

    #[test]
    fn test_completion_timeout() {
        let done = Completion::new();
        assert!(!done.wait_timeout(Duration::from_millis(5)));
        done.signal();
        assert!(done.wait_timeout(Duration::from_millis(5)));
    }

    #[test]
    fn test_waker_fires_on_signal() {
        let done = Arc::new(Completion::new());
        let wake = done.waker();
        assert!(wake.try_recv().is_err());

        let signaller = done.clone();
        let t = thread::spawn(move || signaller.signal());
        assert!(wake.recv_timeout(Duration::from_secs(5)).is_ok());
        t.join().unwrap();

        // late subscribers see the flag straight away
        assert!(done.waker().try_recv().is_ok());
    }

    #[test]
    fn test_gate_released_from_other_thread() {
        let gate = Arc::new(ControlGate::new());
        gate.acquire();
        assert!(!gate.try_acquire());

        let releaser = gate.clone();
        let t = thread::spawn(move || releaser.release());
        gate.acquire();
        t.join().unwrap();
        assert!(gate.is_busy());
        gate.release();
        assert!(!gate.is_busy());
    }
}
