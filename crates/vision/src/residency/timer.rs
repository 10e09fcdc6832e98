//! Debounced single-shot timer driving idle eviction.
//!
//! One background thread per timer waits for the armed deadline. Arming again
//! replaces the pending deadline, so at most one firing is outstanding. Every
//! arming carries a generation number that the callback receives; callers
//! compare it against the generation they last armed to discard firings that
//! raced with a newer `schedule`.

use std::{
    io,
    sync::atomic::{AtomicU64, Ordering},
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::debug;

use crate::telemetry::spawn_thread;

enum TimerCommand {
    Arm { deadline: Instant, generation: u64 },
    Cancel,
}

pub struct IdleEvictionTimer {
    commands: Option<Sender<TimerCommand>>,
    next_generation: AtomicU64,
    handle: Option<JoinHandle<()>>,
}

impl IdleEvictionTimer {
    /// Spawn the timer thread. `on_fire` runs on that thread with the
    /// generation of the arming that expired.
    pub fn spawn<F>(name: impl Into<String>, on_fire: F) -> io::Result<Self>
    where
        F: Fn(u64) + Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = spawn_thread(name, move || timer_loop(rx, on_fire))?;
        Ok(Self {
            commands: Some(tx),
            next_generation: AtomicU64::new(0),
            handle: Some(handle),
        })
    }

    /// Arm the timer for `delay` from now, replacing any pending deadline.
    /// Returns the generation the eventual firing will carry.
    pub fn schedule(&self, delay: Duration) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.send(TimerCommand::Arm {
            deadline: Instant::now() + delay,
            generation,
        });
        generation
    }

    /// Disarm without firing.
    pub fn cancel(&self) {
        self.send(TimerCommand::Cancel);
    }

    fn send(&self, command: TimerCommand) {
        if let Some(tx) = &self.commands {
            if tx.send(command).is_err() {
                debug!("idle timer thread already stopped");
            }
        }
    }
}

impl Drop for IdleEvictionTimer {
    fn drop(&mut self) {
        drop(self.commands.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn timer_loop<F: Fn(u64)>(rx: Receiver<TimerCommand>, on_fire: F) {
    let mut pending: Option<(Instant, u64)> = None;
    loop {
        let command = match pending {
            Some((deadline, generation)) => match rx.recv_deadline(deadline) {
                Ok(command) => command,
                Err(RecvTimeoutError::Timeout) => {
                    pending = None;
                    on_fire(generation);
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match rx.recv() {
                Ok(command) => command,
                Err(_) => break,
            },
        };

        match command {
            TimerCommand::Arm {
                deadline,
                generation,
            } => pending = Some((deadline, generation)),
            TimerCommand::Cancel => pending = None,
        }
    }
}
