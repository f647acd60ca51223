use std::process::ExitCode;
use std::thread;
use std::time::{Duration, Instant};

use stage_engine::{ContextHandle, Session, SessionWatcher};
use tracing::{error, info, warn};

use super::bootstrap::AppWiring;

#[derive(Debug, Clone)]
pub(crate) struct LoopConfig {
    pub(crate) target_tps: u32,
    /// Session time a loaded stage stays active before it is completed.
    pub(crate) stage_dwell: Duration,
    pub(crate) max_frames: u64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            target_tps: 60,
            stage_dwell: Duration::from_secs(2),
            max_frames: 60 * 120,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PlaythroughSummary {
    pub(crate) frames: u64,
    pub(crate) stages_completed: Vec<String>,
    pub(crate) persistent_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LoopOutcome {
    Finished(PlaythroughSummary),
    NotStarted,
    FrameLimit { frames: u64 },
}

pub(crate) fn run(app: AppWiring) -> ExitCode {
    let AppWiring {
        config,
        mut session,
        selection,
        return_context,
    } = app;

    let frame_budget = Duration::from_secs_f64(1.0 / config.target_tps.max(1) as f64);
    let mut frame_started = Instant::now();
    let mut pace = |_: &Session| {
        let elapsed = frame_started.elapsed();
        if elapsed < frame_budget {
            thread::sleep(frame_budget - elapsed);
        }
        frame_started = Instant::now();
    };

    match drive_playthrough(&mut session, &config, &selection, return_context, &mut pace) {
        LoopOutcome::Finished(summary) => {
            info!(
                frames = summary.frames,
                stages = ?summary.stages_completed,
                persistent = summary.persistent_count,
                "playthrough_finished"
            );
            ExitCode::SUCCESS
        }
        LoopOutcome::NotStarted => {
            error!(selection = ?selection, "playthrough_not_started");
            ExitCode::FAILURE
        }
        LoopOutcome::FrameLimit { frames } => {
            error!(frames, "playthrough_frame_limit_reached");
            ExitCode::FAILURE
        }
    }
}

/// Runs a scripted playthrough: starts the selection, completes each stage
/// once it has been active for `stage_dwell`, and stops after the session
/// is back in its idle context. `pace` runs after every frame.
pub(crate) fn drive_playthrough(
    session: &mut Session,
    config: &LoopConfig,
    selection: &[usize],
    return_context: Option<ContextHandle>,
    pace: &mut dyn FnMut(&Session),
) -> LoopOutcome {
    if !session.start_playthrough(selection, return_context) {
        return LoopOutcome::NotStarted;
    }

    let mut watcher = SessionWatcher::default();
    let mut active_since: Option<(String, Duration)> = None;
    let mut stages_completed = Vec::new();

    for frame in 1..=config.max_frames {
        session.run_frame();

        if watcher.observe(session.session_id()) {
            info!(
                session_id = %session.session_id(),
                remaining = session.remaining_stages(),
                "playthrough_observed"
            );
        }

        match (session.current_stage_name(), session.is_stage_active()) {
            (Some(name), true) => {
                let now = session.now();
                let started = match &active_since {
                    Some((tracked, since)) if tracked == name => *since,
                    _ => {
                        active_since = Some((name.to_string(), now));
                        now
                    }
                };
                if now.saturating_sub(started) >= config.stage_dwell {
                    let name = name.to_string();
                    if session.complete_current_stage() {
                        stages_completed.push(name);
                        active_since = None;
                    } else {
                        warn!(stage = %name, "stage_completion_rejected");
                    }
                }
            }
            (Some(_), false) => {}
            (None, _) => {
                if session.env().pending_load_count() == 0 {
                    return LoopOutcome::Finished(PlaythroughSummary {
                        frames: frame,
                        stages_completed,
                        persistent_count: session.list_persistent().len(),
                    });
                }
            }
        }

        pace(session);
    }

    LoopOutcome::FrameLimit {
        frames: config.max_frames,
    }
}
