// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Why the worker loop woke up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Tick {
    /// The periodic interval elapsed.
    Interval,
    /// An out-of-schedule recompute was requested.
    Signal,
}

#[derive(Default)]
struct TriggerState {
    signal_pending: bool,
    shutdown: bool,
}

/// Wakes the worker loop on whichever comes first: the periodic deadline,
/// an out-of-schedule signal, or shutdown. Signals coalesce: while one is
/// pending, further signals are dropped, which at worst delays the next
/// recompute by one interval.
struct Trigger {
    state: Mutex<TriggerState>,
    notifier: Condvar,
}

impl Trigger {
    fn new() -> Self {
        Trigger {
            state: Mutex::new(TriggerState::default()),
            notifier: Condvar::new(),
        }
    }

    fn wait_until(&self, deadline: Instant) -> Option<Tick> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.shutdown {
                return None;
            }
            if state.signal_pending {
                state.signal_pending = false;
                return Some(Tick::Signal);
            }
            let now = Instant::now();
            if now >= deadline {
                return Some(Tick::Interval);
            }
            let (guard, _) = self.notifier.wait_timeout(state, deadline - now).unwrap();
            state = guard;
        }
    }

    fn signal(&self) {
        let mut state = self.state.lock().unwrap();
        state.signal_pending = true;
        self.notifier.notify_all();
    }

    fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.shutdown = true;
        self.notifier.notify_all();
    }

    fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.signal_pending = false;
        state.shutdown = false;
    }
}

/// One background recompute thread per sampler instance.
///
/// The job runs on every interval tick and on every signal; a signal pushes
/// the next scheduled tick a full interval out. `stop` joins the thread;
/// dropping the worker only signals it so an un-stopped sampler cannot
/// block teardown.
pub(crate) struct Worker {
    trigger: Arc<Trigger>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Worker {
    pub fn new() -> Self {
        Worker {
            trigger: Arc::new(Trigger::new()),
            handle: Mutex::new(None),
        }
    }

    /// Spawns the worker loop. A second call while the loop is running is
    /// ignored; after `stop` it spawns a fresh loop.
    pub fn start<F>(&self, interval: Duration, mut job: F)
    where
        F: FnMut(Tick) + Send + 'static,
    {
        let mut handle = self.handle.lock().unwrap();
        if handle.is_some() {
            return;
        }
        self.trigger.reset();
        let trigger = Arc::clone(&self.trigger);
        *handle = Some(thread::spawn(move || {
            let mut deadline = Instant::now() + interval;
            while let Some(tick) = trigger.wait_until(deadline) {
                job(tick);
                match tick {
                    Tick::Interval => {
                        deadline += interval;
                        // if the job overran a whole interval, re-anchor
                        // instead of firing a burst of catch-up ticks
                        let now = Instant::now();
                        if deadline < now {
                            deadline = now + interval;
                        }
                    }
                    Tick::Signal => deadline = Instant::now() + interval,
                }
            }
        }));
    }

    /// Requests an out-of-schedule run of the job. Never blocks.
    pub fn signal(&self) {
        self.trigger.signal();
    }

    /// Signals shutdown and waits for the loop to exit.
    pub fn stop(&self) {
        self.trigger.shutdown();
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.trigger.shutdown();
    }
}
