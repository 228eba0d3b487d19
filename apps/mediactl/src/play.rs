// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The `play` and `devices` commands.

use crate::cli::PlayArgs;
use crate::config::ConfigLoadResult;
use anyhow::Context;
use mediacore_core::{ErrorCode, PlayerState, StatisticsSnapshot};
use mediacore_engine::{HeadlessGpuProvider, MediaCore, PlayerListener};
use mediacore_nodes::capture::VirtualCaptureBackend;
use mediacore_nodes::render::HeadlessSurface;
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Forwards state callbacks to the command loop and optionally prints statistics.
struct ConsoleListener {
    states: mpsc::Sender<(PlayerState, ErrorCode)>,
    print_stats: bool,
}

impl PlayerListener for ConsoleListener {
    fn on_state(&self, state: PlayerState, code: ErrorCode) {
        info!(state = %state, code = %code, "Session state");
        let _ = self.states.send((state, code));
    }

    fn on_resolution_change(&self, height: u32, width: u32) {
        info!(width, height, "Video resolution");
    }

    #[allow(clippy::disallowed_macros)]
    fn on_statistics(&self, stats: &StatisticsSnapshot) {
        if self.print_stats {
            println!("{}", stats.to_json());
        }
    }
}

const fn is_terminal(state: PlayerState) -> bool {
    matches!(state, PlayerState::Finished | PlayerState::Stopped | PlayerState::Error)
}

fn start_core(loaded: ConfigLoadResult) -> anyhow::Result<MediaCore> {
    let core = MediaCore::new(loaded.config)?;
    core.init(Some(Arc::new(HeadlessGpuProvider)))?;
    if let Some(missing_file) = &loaded.file_missing {
        warn!(config_path = %missing_file, "Config file not found, using defaults");
    }
    Ok(core)
}

// Allow println for CLI output to stdout (intentional)
#[allow(clippy::disallowed_macros)]
pub fn run(loaded: ConfigLoadResult, args: &PlayArgs) -> anyhow::Result<()> {
    let core = start_core(loaded)?;
    let renderer = core.create_renderer()?;
    let surface = HeadlessSurface::new(args.width, args.height);
    let monitor = surface.monitor();
    renderer.attach(Box::new(surface))?;

    let (states_tx, states_rx) = mpsc::channel();
    let listener = Arc::new(ConsoleListener { states: states_tx, print_stats: args.stats });
    let player = core.create_player(Some(renderer.id()), listener)?;
    if args.mute {
        player.set_mute(true)?;
    }
    player.start(&args.uri).with_context(|| format!("cannot play {}", args.uri))?;

    let deadline = args.duration_secs.map(|secs| Instant::now() + Duration::from_secs(secs));
    let mut snapshot_taken = !args.snapshot;
    let mut stopping = false;
    let mut last = PlayerState::Idle;
    loop {
        let next = match deadline {
            Some(deadline) if !stopping => {
                states_rx.recv_timeout(deadline.saturating_duration_since(Instant::now()))
            },
            _ => states_rx.recv().map_err(|_| mpsc::RecvTimeoutError::Disconnected),
        };
        match next {
            Ok((state, _code)) => {
                last = state;
                if state == PlayerState::Playing && !snapshot_taken {
                    snapshot_taken = true;
                    match player.capture_snapshot().and_then(|request| request.wait()) {
                        Ok(frame) => println!(
                            "snapshot: {}x{} at {} us",
                            frame.width, frame.height, frame.timestamp_us
                        ),
                        Err(e) => warn!(error = %e, "Snapshot failed"),
                    }
                }
                if is_terminal(state) {
                    break;
                }
            },
            Err(mpsc::RecvTimeoutError::Timeout) => {
                info!("Duration elapsed, stopping");
                stopping = true;
                player.stop()?;
            },
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    let summary = serde_json::json!({
        "session": player.id().as_u64(),
        "state": last,
        "source": player.source().map(|s| s.to_string()),
        "totals": player.totals(),
        "surface_presents": monitor.stats().presents,
        "error": player.last_error().map(|(code, message)| serde_json::json!({
            "code": code,
            "message": message,
        })),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    let failure = player.last_error().filter(|_| last == PlayerState::Error);
    player.destroy()?;
    core.destroy_renderer(renderer.id())?;
    core.shutdown();

    if let Some((code, message)) = failure {
        anyhow::bail!("playback failed ({code}): {message}");
    }
    Ok(())
}

#[allow(clippy::disallowed_macros)]
pub fn list_devices(loaded: ConfigLoadResult) -> anyhow::Result<()> {
    let core = start_core(loaded)?;
    let enumerator =
        core.camera_enumerator(Arc::new(VirtualCaptureBackend::with_default_devices()))?;
    let devices = enumerator.list_devices()?;
    println!("{}", serde_json::to_string_pretty(&devices)?);
    core.shutdown();
    Ok(())
}
