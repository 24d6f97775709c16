//! The export scheduler: one thread that keeps the workers' timer wheels
//! turning and the templates fresh.

use crate::context::ProbeContext;
use anyhow::Result;
use crossbeam_channel::{Receiver, TryRecvError};
use delayprobe_utils::fdtimer::FdTimer;
use delayprobe_utils::unix_time::boot_time_nanos;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info, warn};

/// Sleep between ticks while any worker has expirations queued.
pub const BACKLOG_SLEEP: Duration = Duration::from_micros(100);

/// Sleep between ticks otherwise.
pub const IDLE_SLEEP: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerMessage {
    /// Sent by the first interface enable
    Activate,
    Shutdown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SchedulerState {
    WaitingForActivation,
    Ticking,
    Stopped,
}

/// Starts the scheduler thread. It does nothing until it receives
/// [`SchedulerMessage::Activate`].
pub fn spawn_scheduler(
    ctx: Arc<ProbeContext>,
    messages: Receiver<SchedulerMessage>,
) -> Result<JoinHandle<()>> {
    let handle = std::thread::Builder::new()
        .name("delayprobe-scheduler".to_string())
        .spawn(move || run_scheduler(ctx, messages))?;
    Ok(handle)
}

fn run_scheduler(ctx: Arc<ProbeContext>, messages: Receiver<SchedulerMessage>) {
    let timer = match FdTimer::new() {
        Ok(timer) => Some(timer),
        Err(e) => {
            warn!("Falling back to thread sleep: {e}");
            None
        }
    };
    let mut state = SchedulerState::WaitingForActivation;
    loop {
        state = match state {
            SchedulerState::WaitingForActivation => match messages.recv() {
                Ok(SchedulerMessage::Activate) => {
                    info!("Export scheduler activated");
                    SchedulerState::Ticking
                }
                Ok(SchedulerMessage::Shutdown) | Err(_) => SchedulerState::Stopped,
            },
            SchedulerState::Ticking => match messages.try_recv() {
                Ok(SchedulerMessage::Shutdown) | Err(TryRecvError::Disconnected) => {
                    SchedulerState::Stopped
                }
                Ok(SchedulerMessage::Activate) | Err(TryRecvError::Empty) => {
                    let pause = tick(&ctx);
                    sleep(timer.as_ref(), pause);
                    SchedulerState::Ticking
                }
            },
            SchedulerState::Stopped => break,
        };
    }
    info!("Export scheduler stopped");
}

/// Interrupts every worker and resends due templates. Returns how long
/// to sleep before the next tick.
fn tick(ctx: &ProbeContext) -> Duration {
    for worker in ctx.workers.iter() {
        worker.interrupt();
    }
    if let Ok(now) = boot_time_nanos() {
        ctx.refresh_templates(now);
    }
    if ctx.has_backlog() {
        BACKLOG_SLEEP
    } else {
        IDLE_SLEEP
    }
}

fn sleep(timer: Option<&FdTimer>, duration: Duration) {
    match timer {
        Some(timer) => {
            if let Err(e) = timer.sleep(duration) {
                error!("Scheduler timer failed: {e}");
                std::thread::sleep(duration);
            }
        }
        None => std::thread::sleep(duration),
    }
}
