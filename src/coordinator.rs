//! Turns the engine's one-shot train operation into continuous epochs.

use std::{num::NonZeroUsize, sync::Arc, thread};

use futures::executor::block_on;
use log::{debug, error, warn};
use parking_lot::{Condvar, Mutex};

use crate::{
    EngineErr, Result,
    engine::{LossCallback, TransferLearningEngine},
    model::RawModel,
};

/// A long-lived background loop that trains one epoch at a time whenever
/// training is enabled, and parks (blocked, not spinning) whenever it is not.
pub struct ContinuousTrainer {
    control: Arc<Control>,
    thread: Option<thread::JoinHandle<()>>,
}

struct Control {
    state: Mutex<ControlState>,
    signal: Condvar,
}

#[derive(Default)]
struct ControlState {
    enabled: bool,
    stopping: bool,
    on_epoch: Option<LossCallback>,
}

impl ContinuousTrainer {
    /// Spawns the coordinator thread, initially parked.
    ///
    /// # Errors
    /// An I/O error if the thread cannot be spawned.
    pub fn spawn<H>(engine: Arc<TransferLearningEngine<H>>) -> Result<Self>
    where
        H: RawModel,
    {
        let control = Arc::new(Control {
            state: Mutex::new(ControlState::default()),
            signal: Condvar::new(),
        });

        let shared = Arc::clone(&control);
        let thread = thread::Builder::new()
            .name("continuous-trainer".to_owned())
            .spawn(move || run_loop(engine, shared))?;

        Ok(Self {
            control,
            thread: Some(thread),
        })
    }

    /// Records the loss callback and unparks the loop.
    pub fn enable(&self, on_epoch: Option<LossCallback>) {
        let mut state = self.control.state.lock();
        state.enabled = true;
        state.on_epoch = on_epoch;
        self.control.signal.notify_one();
    }

    /// Re-parks the loop before its next train call. An epoch already in
    /// flight runs to completion.
    pub fn disable(&self) {
        let mut state = self.control.state.lock();
        state.enabled = false;
        self.control.signal.notify_one();
    }

    /// Stops the loop and joins the thread. Idempotent.
    pub fn stop(&mut self) {
        {
            let mut state = self.control.state.lock();
            state.stopping = true;
            self.control.signal.notify_one();
        }

        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ContinuousTrainer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop<H: RawModel>(engine: Arc<TransferLearningEngine<H>>, control: Arc<Control>) {
    const ONE_EPOCH: NonZeroUsize = NonZeroUsize::new(1).unwrap();

    loop {
        let on_epoch = {
            let mut state = control.state.lock();
            while !state.stopping && !state.enabled {
                control.signal.wait(&mut state);
            }
            if state.stopping {
                return;
            }
            state.on_epoch.clone()
        };

        let handle = match engine.train(ONE_EPOCH, on_epoch) {
            Ok(handle) => handle,
            Err(EngineErr::InsufficientData { got, expected }) => {
                // Tolerated: park until the next enable notification instead
                // of crashing the loop or spinning on the same failure.
                warn!(got = got, expected = expected; "too few samples to train, parking");
                let mut state = control.state.lock();
                if !state.stopping {
                    control.signal.wait(&mut state);
                }
                continue;
            }
            Err(EngineErr::Closed) => {
                debug!("engine closed, coordinator exiting");
                return;
            }
            Err(e) => {
                error!("failed to schedule training: {e}");
                return;
            }
        };

        match block_on(handle) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("training failed: {e}");
                return;
            }
            Err(_) => {
                // The engine's runtime was torn down under us.
                debug!("training task cancelled, coordinator exiting");
                return;
            }
        }
    }
}
