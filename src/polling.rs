//! A named background thread that runs one iteration at a time and pauses
//! between iterations for as long as the iteration asks.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Running,
    Stopping,
}

struct Shared {
    state: Mutex<LoopState>,
    wake: Condvar,
}

impl Shared {
    fn running(&self) -> bool {
        *self.state.lock() == LoopState::Running
    }

    /// Sleeps for `pause` unless the loop is asked to stop first.
    fn pause(&self, pause: Duration) {
        let deadline = Instant::now() + pause;
        let mut state = self.state.lock();
        while *state == LoopState::Running {
            if self.wake.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
    }
}

pub struct PollingLoop {
    name: &'static str,
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PollingLoop {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            shared: Arc::new(Shared {
                state: Mutex::new(LoopState::Idle),
                wake: Condvar::new(),
            }),
            handle: Mutex::new(None),
        }
    }

    pub fn state(&self) -> LoopState {
        *self.shared.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running()
    }

    /// Spawns the loop thread unless one is already running. `iteration`
    /// returns how long to pause before it is called again; if it panics the
    /// loop logs it and pauses for `panic_pause` instead.
    ///
    /// A loop that was asked to stop but is still inside an iteration is
    /// put back to work instead of being replaced, and keeps the iteration
    /// it was started with. Never waits on a running iteration.
    ///
    /// Returns `false` when the loop was already running.
    pub fn start<F>(&self, panic_pause: Duration, mut iteration: F) -> bool
    where
        F: FnMut() -> Duration + Send + 'static,
    {
        let mut handle = self.handle.lock();
        {
            let mut state = self.shared.state.lock();
            match *state {
                LoopState::Running => return false,
                LoopState::Stopping => {
                    debug!("{} loop resumed before it stopped", self.name);
                    *state = LoopState::Running;
                    return true;
                }
                LoopState::Idle => *state = LoopState::Running,
            }
        }
        // an idle loop's thread has made its last state change
        if let Some(previous) = handle.take() {
            let _ = previous.join();
        }

        let shared = Arc::clone(&self.shared);
        let name = self.name;
        let spawned = std::thread::Builder::new()
            .name(format!("fluidfeatures-{}", name))
            .spawn(move || {
                info!("{} loop started", name);
                loop {
                    {
                        let mut state = shared.state.lock();
                        if *state != LoopState::Running {
                            *state = LoopState::Idle;
                            break;
                        }
                    }
                    let pause = match catch_unwind(AssertUnwindSafe(&mut iteration)) {
                        Ok(pause) => pause,
                        Err(_) => {
                            error!("{} iteration panicked", name);
                            panic_pause
                        }
                    };
                    debug!("{} loop pausing for {:?}", name, pause);
                    shared.pause(pause);
                }
                info!("{} loop stopped", name);
            });

        match spawned {
            Ok(h) => {
                *handle = Some(h);
                true
            }
            Err(e) => {
                error!("failed to spawn {} loop: {}", name, e);
                *self.shared.state.lock() = LoopState::Idle;
                false
            }
        }
    }

    /// Asks the loop to stop after its current iteration. With `wait` the
    /// caller blocks until the thread has exited.
    pub fn stop(&self, wait: bool) {
        {
            let mut state = self.shared.state.lock();
            if *state == LoopState::Running {
                *state = LoopState::Stopping;
            }
            self.shared.wake.notify_all();
        }
        if wait {
            if let Some(handle) = self.handle.lock().take() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for PollingLoop {
    fn drop(&mut self) {
        self.stop(false);
    }
}
