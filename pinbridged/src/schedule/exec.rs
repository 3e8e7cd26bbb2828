//! Schedule executors.
//!
//! One executor task drives one schedule's hardware sequence to
//! completion. Before every HAL call it re-checks the world: a user
//! override, a closed time window, or a stop signal each end the run
//! at the next safe point (the boundary between a HAL call and a
//! sleep).

use super::window;
use crate::{cache::PinEntry, drive};
use pinbridge_api::{
    hal::Hal,
    types::schedule::{RunStatus, ScheduleKind, ScheduleSpec},
    Result,
};
use std::sync::Arc;
use tokio::{sync::watch, time};
use tracing::warn;

/// Everything an executor needs to run one schedule.

pub struct ExecCtx {
    pub hal: Arc<dyn Hal>,
    pub entry: Arc<PinEntry>,
    pub spec: ScheduleSpec,
    pub pwm_freq: u32,
}

/// Runs the schedule to completion. `Some(status)` is the outcome to
/// record on the schedule; `None` means the run was cut short by a
/// stop signal (modify, remove, or shutdown) and no outcome is
/// recorded.

pub async fn run(
    ctx: ExecCtx,
    mut stop: watch::Receiver<bool>,
) -> Option<RunStatus> {
    let outcome = match ctx.spec.kind {
        ScheduleKind::PwmCycle {
            cycles,
            on_ms,
            off_ms,
        } => run_cycle(&ctx, &mut stop, cycles, on_ms, off_ms).await,

        ScheduleKind::PwmFade {
            total_ms,
            steps,
            start_duty,
            end_duty,
        } => {
            run_fade(&ctx, &mut stop, total_ms, steps, start_duty, end_duty)
                .await
        }

        ScheduleKind::DigitalToggle { cycles, interval_ms } => {
            run_toggle(&ctx, &mut stop, cycles, interval_ms).await
        }

        ScheduleKind::HoldState { state, hold_ms } => {
            run_hold(&ctx, &mut stop, state, hold_ms).await
        }
    };

    if let Some(status) = outcome {
        if status == RunStatus::Error {
            warn!(
                "schedule {} on pin {} failed",
                &ctx.spec.id, ctx.entry.desc.number
            )
        }
    }
    outcome
}

// The pre-action check. `Some(outcome)` means the run must end now
// with that outcome.

async fn precheck(
    ctx: &ExecCtx,
    stop: &watch::Receiver<bool>,
) -> Option<Option<RunStatus>> {
    if *stop.borrow() {
        return Some(None);
    }

    if ctx.entry.lock().await.user_override_active {
        return Some(Some(RunStatus::SupersededByOverride));
    }

    if !window::is_open(&ctx.spec) {
        return Some(Some(RunStatus::SkippedOutOfWindow));
    }
    None
}

// Sleeps, waking early when stop is signalled. The follow-up
// precheck decides what to do about it.

async fn pause(ms: u64, stop: &mut watch::Receiver<bool>) {
    #[rustfmt::skip]
    tokio::select! {
        _ = time::sleep(time::Duration::from_millis(ms)) => (),
        _ = stop.changed() => ()
    }
}

async fn set_digital(ctx: &ExecCtx, value: bool) -> Result<()> {
    let mut state = ctx.entry.lock().await;

    drive::digital_locked(ctx.hal.as_ref(), &ctx.entry, &mut state, value)
}

async fn set_pwm(ctx: &ExecCtx, duty: u8) -> Result<()> {
    let mut state = ctx.entry.lock().await;

    drive::pwm_locked(
        ctx.hal.as_ref(),
        &ctx.entry,
        &mut state,
        duty,
        ctx.pwm_freq,
    )
}

// On/off cycling. Terminal state is low by construction; zero cycles
// complete successfully without a single HAL call.

async fn run_cycle(
    ctx: &ExecCtx,
    stop: &mut watch::Receiver<bool>,
    cycles: u32,
    on_ms: u64,
    off_ms: u64,
) -> Option<RunStatus> {
    for _ in 0..cycles {
        if let Some(outcome) = precheck(ctx, stop).await {
            return outcome;
        }

        if set_digital(ctx, true).await.is_err() {
            return Some(RunStatus::Error);
        }

        pause(on_ms, stop).await;

        if let Some(outcome) = precheck(ctx, stop).await {
            return outcome;
        }

        if set_digital(ctx, false).await.is_err() {
            return Some(RunStatus::Error);
        }

        pause(off_ms, stop).await;
    }
    Some(RunStatus::Success)
}

// Linear duty ramp. Each step sleeps first, then writes, so a
// single-step fade issues exactly one write -- the end duty -- after
// the full duration.

async fn run_fade(
    ctx: &ExecCtx,
    stop: &mut watch::Receiver<bool>,
    total_ms: u64,
    steps: u32,
    start_duty: u8,
    end_duty: u8,
) -> Option<RunStatus> {
    if !ctx.entry.desc.pwm_capable {
        return Some(RunStatus::Error);
    }

    let step_ms = total_ms / steps as u64;
    let span = end_duty as i32 - start_duty as i32;

    for i in 1..=steps {
        if let Some(outcome) = precheck(ctx, stop).await {
            return outcome;
        }

        pause(step_ms, stop).await;

        if let Some(outcome) = precheck(ctx, stop).await {
            return outcome;
        }

        let duty =
            (start_duty as i32 + span * i as i32 / steps as i32) as u8;

        if set_pwm(ctx, duty).await.is_err() {
            return Some(RunStatus::Error);
        }
    }
    Some(RunStatus::Success)
}

// Repeated toggling. The pin is restored to the level it had when the
// run began, so a completed run is net-zero.

async fn run_toggle(
    ctx: &ExecCtx,
    stop: &mut watch::Receiver<bool>,
    cycles: u32,
    interval_ms: u64,
) -> Option<RunStatus> {
    let original = ctx.entry.lock().await.hardware;
    let mut current = original;

    for _ in 0..cycles {
        if let Some(outcome) = precheck(ctx, stop).await {
            return outcome;
        }

        current = !current;

        if set_digital(ctx, current).await.is_err() {
            return Some(RunStatus::Error);
        }

        pause(interval_ms, stop).await;
    }

    if current != original {
        if let Some(outcome) = precheck(ctx, stop).await {
            return outcome;
        }

        if set_digital(ctx, original).await.is_err() {
            return Some(RunStatus::Error);
        }
    }
    Some(RunStatus::Success)
}

// Drive, hold, release.

async fn run_hold(
    ctx: &ExecCtx,
    stop: &mut watch::Receiver<bool>,
    state: bool,
    hold_ms: u64,
) -> Option<RunStatus> {
    if let Some(outcome) = precheck(ctx, stop).await {
        return outcome;
    }

    if set_digital(ctx, state).await.is_err() {
        return Some(RunStatus::Error);
    }

    pause(hold_ms, stop).await;

    if let Some(outcome) = precheck(ctx, stop).await {
        return outcome;
    }

    if set_digital(ctx, false).await.is_err() {
        return Some(RunStatus::Error);
    }
    Some(RunStatus::Success)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::PinCache,
        hal::sim::{SimHal, Write},
        pins::PIN_TABLE,
    };

    fn ctx(
        hal: &Arc<SimHal>,
        pin: u8,
        kind: ScheduleKind,
    ) -> (ExecCtx, watch::Sender<bool>, watch::Receiver<bool>) {
        let cache = PinCache::new(PIN_TABLE);
        let entry = cache.entry(pin).unwrap();

        hal.configure(&entry.desc).unwrap();

        let (tx, rx) = watch::channel(false);

        (
            ExecCtx {
                hal: hal.clone(),
                entry,
                spec: ScheduleSpec {
                    id: String::from("s1"),
                    enabled: true,
                    window: None,
                    kind,
                },
                pwm_freq: 1_000,
            },
            tx,
            rx,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_hold_state_sequence() {
        let hal = Arc::new(SimHal::new());
        let (ctx, _tx, rx) = ctx(
            &hal,
            23,
            ScheduleKind::HoldState {
                state: true,
                hold_ms: 5_000,
            },
        );

        assert_eq!(run(ctx, rx).await, Some(RunStatus::Success));
        assert_eq!(
            hal.history(),
            vec![Write::Digital(23, true), Write::Digital(23, false)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_sequence() {
        let hal = Arc::new(SimHal::new());
        let (ctx, _tx, rx) = ctx(
            &hal,
            23,
            ScheduleKind::PwmCycle {
                cycles: 2,
                on_ms: 100,
                off_ms: 100,
            },
        );

        assert_eq!(run(ctx, rx).await, Some(RunStatus::Success));
        assert_eq!(
            hal.history(),
            vec![
                Write::Digital(23, true),
                Write::Digital(23, false),
                Write::Digital(23, true),
                Write::Digital(23, false),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_cycles_touch_nothing() {
        let hal = Arc::new(SimHal::new());
        let (ctx, _tx, rx) = ctx(
            &hal,
            23,
            ScheduleKind::PwmCycle {
                cycles: 0,
                on_ms: 100,
                off_ms: 100,
            },
        );

        assert_eq!(run(ctx, rx).await, Some(RunStatus::Success));
        assert!(hal.history().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_step_fade() {
        let hal = Arc::new(SimHal::new());
        let (ctx, _tx, rx) = ctx(
            &hal,
            18,
            ScheduleKind::PwmFade {
                total_ms: 2_000,
                steps: 1,
                start_duty: 0,
                end_duty: 100,
            },
        );

        let started = time::Instant::now();

        assert_eq!(run(ctx, rx).await, Some(RunStatus::Success));

        // Exactly one write, the end duty, after the full duration.

        assert_eq!(hal.history(), vec![Write::Pwm(18, 100)]);
        assert!(started.elapsed() >= time::Duration::from_millis(2_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fade_ramp_hits_endpoints() {
        let hal = Arc::new(SimHal::new());
        let (ctx, _tx, rx) = ctx(
            &hal,
            18,
            ScheduleKind::PwmFade {
                total_ms: 400,
                steps: 4,
                start_duty: 20,
                end_duty: 80,
            },
        );

        assert_eq!(run(ctx, rx).await, Some(RunStatus::Success));
        assert_eq!(
            hal.history(),
            vec![
                Write::Pwm(18, 35),
                Write::Pwm(18, 50),
                Write::Pwm(18, 65),
                Write::Pwm(18, 80),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fade_needs_pwm_pin() {
        let hal = Arc::new(SimHal::new());
        let (ctx, _tx, rx) = ctx(
            &hal,
            23,
            ScheduleKind::PwmFade {
                total_ms: 1_000,
                steps: 2,
                start_duty: 0,
                end_duty: 100,
            },
        );

        assert_eq!(run(ctx, rx).await, Some(RunStatus::Error));
        assert!(hal.history().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_restores_original() {
        let hal = Arc::new(SimHal::new());
        let (ctx, _tx, rx) = ctx(
            &hal,
            23,
            ScheduleKind::DigitalToggle {
                cycles: 3,
                interval_ms: 50,
            },
        );

        // Start the pin high so restoration is visible.

        {
            let mut state = ctx.entry.lock().await;

            drive::digital_locked(
                ctx.hal.as_ref(),
                &ctx.entry,
                &mut state,
                true,
            )
            .unwrap();
        }
        hal.clear_history();

        assert_eq!(run(ctx, rx).await, Some(RunStatus::Success));

        // Three toggles land low, then the original level returns.

        assert_eq!(
            hal.history(),
            vec![
                Write::Digital(23, false),
                Write::Digital(23, true),
                Write::Digital(23, false),
                Write::Digital(23, true),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_override_ends_run() {
        let hal = Arc::new(SimHal::new());
        let (ctx, _tx, rx) = ctx(
            &hal,
            23,
            ScheduleKind::HoldState {
                state: true,
                hold_ms: 600_000,
            },
        );
        let entry = ctx.entry.clone();

        let task = tokio::spawn(run(ctx, rx));

        // Let the executor drive the pin and enter its hold.

        time::sleep(time::Duration::from_millis(1_000)).await;
        entry.lock().await.user_override_active = true;

        // The executor notices at its next pre-action check.

        assert_eq!(
            task.await.unwrap(),
            Some(RunStatus::SupersededByOverride)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_signal_ends_run_quietly() {
        let hal = Arc::new(SimHal::new());
        let (ctx, tx, rx) = ctx(
            &hal,
            23,
            ScheduleKind::HoldState {
                state: true,
                hold_ms: 600_000,
            },
        );

        let task = tokio::spawn(run(ctx, rx));

        time::sleep(time::Duration::from_millis(1_000)).await;

        let _ = tx.send(true);

        // Stopped runs record no outcome.

        assert_eq!(task.await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_window_skips() {
        use pinbridge_api::types::schedule::TimeWindow;

        let hal = Arc::new(SimHal::new());
        let (mut ctx, _tx, rx) = ctx(
            &hal,
            23,
            ScheduleKind::HoldState {
                state: true,
                hold_ms: 1_000,
            },
        );

        // A one-minute window an hour from now is closed at the time
        // of the run, whatever the wall clock says.

        let now = window::minute_of_day(&chrono::Local::now());
        let start = (now + 60) % 1440;
        let end = (start + 1) % 1440;

        ctx.spec.window = Some(TimeWindow {
            enabled: true,
            start,
            end,
        });

        assert_eq!(run(ctx, rx).await, Some(RunStatus::SkippedOutOfWindow));
        assert!(hal.history().is_empty());
    }
}
