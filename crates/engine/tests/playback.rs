// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! End-to-end session tests against scripted sources and headless renderers.
//!
//! These run the real playout actor on the core's runtime, so they are plain `#[test]`s
//! that block on listener callbacks.

#![allow(clippy::unwrap_used)]

mod common;

use common::{core_with, RecordingListener, RecordingSink};
use mediacore_core::MediaCoreError;
use mediacore_core::{CoreConfig, ErrorCode, PlayerState};
use mediacore_engine::PlayerOptions;
use mediacore_nodes::render::HeadlessSurface;
use mediacore_nodes::test_utils::{
    ScriptStep, ScriptedTransport, StallingTransport, SCRIPT_AUDIO_PACKET_US, SCRIPT_VIDEO_SIZE,
};
use std::sync::Arc;
use std::time::Duration;

fn av_script(seconds: usize) -> Vec<ScriptStep> {
    vec![
        ScriptStep::audio_packets(0, seconds * 50),
        ScriptStep::video_packets(0, seconds * 25),
        ScriptStep::End,
    ]
}

#[test]
fn stalled_connect_ends_in_timeout_error() {
    let mut config = CoreConfig::default();
    config.player.ingest.connect_timeout_ms = 300;
    let core = core_with(Arc::new(StallingTransport), config);
    let listener = RecordingListener::new();
    let player = core.create_player(None, listener.clone()).unwrap();

    player.start("test://unreachable.example/live").unwrap();
    assert!(listener.wait_for(PlayerState::Error));

    assert_eq!(
        listener.states(),
        vec![(PlayerState::Connecting, ErrorCode::Ok), (PlayerState::Error, ErrorCode::Timeout)]
    );
    assert_eq!(player.last_error().unwrap().0, ErrorCode::Timeout);
    assert_eq!(player.state(), PlayerState::Error);

    player.destroy().unwrap();
    core.shutdown();
}

#[test]
fn av_playback_survives_pause_and_resume() {
    let core = core_with(Arc::new(ScriptedTransport::new(vec![av_script(2)])), CoreConfig::default());
    let renderer = core.create_renderer().unwrap();
    let surface = HeadlessSurface::new(640, 360);
    let monitor = surface.monitor();
    renderer.attach(Box::new(surface)).unwrap();

    let listener = RecordingListener::new();
    let sink = RecordingSink::default();
    let player = core
        .create_player_with(
            listener.clone(),
            PlayerOptions {
                renderer: Some(renderer.id()),
                audio_sink: Some(Box::new(sink.clone())),
                config: None,
            },
        )
        .unwrap();

    player.start("test://vod/clip").unwrap();
    assert!(listener.wait_for(PlayerState::Playing));
    std::thread::sleep(Duration::from_millis(300));

    player.pause().unwrap();
    assert!(listener.wait_for(PlayerState::Paused));
    let frozen = player.totals();
    std::thread::sleep(Duration::from_millis(250));
    assert_eq!(player.totals(), frozen, "nothing is consumed while paused");

    player.resume().unwrap();
    assert!(listener.wait_for(PlayerState::Finished));

    let totals = player.totals();
    assert_eq!(totals.audio_presented, 100);
    assert_eq!(totals.video_presented + totals.dropped_late, 50);

    // Audio reaches the sink exactly once, in timestamp order.
    let played = sink.played();
    let expected: Vec<u64> = (0..100).map(|i| i * SCRIPT_AUDIO_PACKET_US).collect();
    assert_eq!(played, expected);

    let sync_ts = listener.sync_ts();
    assert!(!sync_ts.is_empty());
    assert!(sync_ts.windows(2).all(|w| w[0] <= w[1]));

    let transitions = listener.transitions();
    assert_eq!(
        &transitions[..3],
        &[PlayerState::Connecting, PlayerState::Buffering, PlayerState::Playing]
    );
    assert!(transitions.contains(&PlayerState::Paused));
    assert_eq!(transitions.last(), Some(&PlayerState::Finished));
    assert!(transitions.iter().all(|s| *s != PlayerState::Error));
    assert!(listener.resolutions().contains(&(SCRIPT_VIDEO_SIZE.1, SCRIPT_VIDEO_SIZE.0)));

    player.destroy().unwrap();
    assert_eq!(monitor.stats().presents, totals.video_presented - totals.dropped_renderer);
    assert_eq!(player.allocated_buffers(), 0);
    core.shutdown();
}

#[test]
fn snapshot_while_playing_matches_rendered_resolution() {
    let core = core_with(Arc::new(ScriptedTransport::new(vec![av_script(4)])), CoreConfig::default());
    let renderer = core.create_renderer().unwrap();
    renderer.attach(Box::new(HeadlessSurface::new(320, 240))).unwrap();

    let listener = RecordingListener::new();
    let player = core.create_player(Some(renderer.id()), listener.clone()).unwrap();
    player.start("test://vod/clip").unwrap();
    assert!(listener.wait_for(PlayerState::Playing));

    let frame = player.capture_snapshot().unwrap().wait().unwrap();
    assert_eq!((frame.width, frame.height), SCRIPT_VIDEO_SIZE);
    drop(frame);

    player.stop().unwrap();
    assert!(listener.wait_for(PlayerState::Stopped));
    player.destroy().unwrap();
    assert_eq!(player.allocated_buffers(), 0);
    core.shutdown();
}

#[test]
fn seek_from_paused_returns_to_paused() {
    let core = core_with(Arc::new(ScriptedTransport::new(vec![av_script(3)])), CoreConfig::default());
    let listener = RecordingListener::new();
    let sink = RecordingSink::default();
    let player = core
        .create_player_with(
            listener.clone(),
            PlayerOptions { audio_sink: Some(Box::new(sink.clone())), ..PlayerOptions::default() },
        )
        .unwrap();

    player.start("test://vod/clip").unwrap();
    assert!(listener.wait_for(PlayerState::Playing));
    player.pause().unwrap();
    assert!(listener.wait_for(PlayerState::Paused));
    let before_seek = sink.played().len();

    player.seek(2_000_000).unwrap();
    assert!(listener.wait_for(PlayerState::Seeking));
    assert!(listener.wait_for_nth(PlayerState::Paused, 2));

    player.resume().unwrap();
    assert!(listener.wait_for(PlayerState::Finished));

    let played = sink.played();
    let after_seek = &played[before_seek..];
    assert!(!after_seek.is_empty());
    assert!(after_seek.iter().all(|ts| *ts >= 2_000_000), "{after_seek:?}");
    assert!(after_seek.windows(2).all(|w| w[0] < w[1]));

    player.destroy().unwrap();
    core.shutdown();
}

#[test]
fn muted_audio_still_drives_playout() {
    let script = vec![ScriptStep::audio_packets(0, 10), ScriptStep::End];
    let core = core_with(Arc::new(ScriptedTransport::new(vec![script])), CoreConfig::default());
    let listener = RecordingListener::new();
    let sink = RecordingSink::default();
    let player = core
        .create_player_with(
            listener.clone(),
            PlayerOptions { audio_sink: Some(Box::new(sink.clone())), ..PlayerOptions::default() },
        )
        .unwrap();

    player.set_mute(true).unwrap();
    player.set_mute(true).unwrap();
    player.start("test://vod/tone").unwrap();
    assert!(listener.wait_for(PlayerState::Finished));

    assert!(player.is_muted());
    assert!(sink.played().is_empty());
    assert_eq!(player.totals().audio_presented, 10);
    assert!(listener.states().iter().all(|(_, code)| *code == ErrorCode::Ok));

    player.destroy().unwrap();
    core.shutdown();
}

#[test]
fn illegal_commands_are_reported_without_a_transition() {
    let core = core_with(Arc::new(ScriptedTransport::new(vec![])), CoreConfig::default());
    let listener = RecordingListener::new();
    let player = core.create_player(None, listener.clone()).unwrap();

    player.pause().unwrap();
    player.resume().unwrap();
    player.seek(1_000).unwrap();
    assert!(listener.wait_until(common::WAIT, |states| states.len() == 3));

    assert!(listener
        .states()
        .iter()
        .all(|entry| *entry == (PlayerState::Idle, ErrorCode::InvalidStateTransition)));
    assert_eq!(player.state(), PlayerState::Idle);

    player.destroy().unwrap();
    core.shutdown();
}

#[test]
fn restart_after_finish_plays_the_next_script() {
    let script = || vec![ScriptStep::audio_packets(0, 5), ScriptStep::End];
    let transport = Arc::new(ScriptedTransport::new(vec![script(), script()]));
    let core = core_with(transport.clone(), CoreConfig::default());
    let listener = RecordingListener::new();
    let player = core.create_player(None, listener.clone()).unwrap();

    player.start("test://vod/a").unwrap();
    assert!(listener.wait_for_nth(PlayerState::Finished, 1));
    player.start("test://vod/b").unwrap();
    assert!(listener.wait_for_nth(PlayerState::Finished, 2));

    assert_eq!(transport.opens(), 2);
    assert_eq!(player.totals().audio_presented, 10);
    assert_eq!(player.source().unwrap().to_string(), "test://vod/b");

    player.destroy().unwrap();
    core.shutdown();
}

#[test]
fn seek_while_playing_a_long_clip_resumes_from_target() {
    // Long enough that every channel and queue is full when the seek lands.
    let core = core_with(Arc::new(ScriptedTransport::new(vec![av_script(10)])), CoreConfig::default());
    let listener = RecordingListener::new();
    let sink = RecordingSink::default();
    let player = core
        .create_player_with(
            listener.clone(),
            PlayerOptions { audio_sink: Some(Box::new(sink.clone())), ..PlayerOptions::default() },
        )
        .unwrap();

    player.start("test://vod/long").unwrap();
    assert!(listener.wait_for(PlayerState::Playing));
    std::thread::sleep(Duration::from_millis(200));

    player.seek(8_000_000).unwrap();
    assert!(listener.wait_for(PlayerState::Seeking));
    assert!(listener.wait_for_nth(PlayerState::Playing, 2), "stuck in {:?}", player.state());
    assert!(listener.wait_for(PlayerState::Finished));

    let transitions = listener.transitions();
    let seek_at = transitions.iter().position(|s| *s == PlayerState::Seeking).unwrap();
    assert_eq!(
        &transitions[seek_at..],
        &[PlayerState::Seeking, PlayerState::Buffering, PlayerState::Playing, PlayerState::Finished]
    );

    let played = sink.played();
    let tail: Vec<u64> = (400..500).map(|i| i * SCRIPT_AUDIO_PACKET_US).collect();
    assert!(played.ends_with(&tail), "{:?}", &played[played.len().saturating_sub(5)..]);
    let before_target = &played[..played.len() - tail.len()];
    assert!(before_target.iter().all(|ts| *ts < 8_000_000));

    player.destroy().unwrap();
    assert_eq!(player.allocated_buffers(), 0);
    core.shutdown();
}

#[test]
fn forward_timestamp_jump_recovers_through_stuck() {
    let script = vec![
        ScriptStep::video_packets(0, 10),
        ScriptStep::video_packets(10_000_000, 10),
        ScriptStep::End,
    ];
    let mut config = CoreConfig::default();
    config.player.playout.stuck_timeout_ms = 300;
    let core = core_with(Arc::new(ScriptedTransport::new(vec![script])), config);
    let listener = RecordingListener::new();
    let player = core.create_player(None, listener.clone()).unwrap();

    player.start("test://vod/jump").unwrap();
    assert!(listener.wait_for(PlayerState::Finished));

    assert_eq!(
        listener.transitions(),
        vec![
            PlayerState::Connecting,
            PlayerState::Buffering,
            PlayerState::Playing,
            PlayerState::Stuck,
            PlayerState::Playing,
            PlayerState::Finished,
        ]
    );
    assert!(listener.states().contains(&(PlayerState::Stuck, ErrorCode::Timeout)));
    let totals = player.totals();
    assert_eq!(totals.video_presented + totals.dropped_late, 20);

    player.destroy().unwrap();
    core.shutdown();
}

#[test]
fn source_stall_mid_play_rebuffers_then_resumes() {
    let script = vec![
        ScriptStep::audio_packets(0, 25),
        ScriptStep::Stall(Duration::from_millis(1_000)),
        ScriptStep::audio_packets(500_000, 25),
        ScriptStep::End,
    ];
    let mut config = CoreConfig::default();
    config.player.playout.prebuffer_ms = Some(100);
    let core = core_with(Arc::new(ScriptedTransport::new(vec![script])), config);
    let listener = RecordingListener::new();
    let sink = RecordingSink::default();
    let player = core
        .create_player_with(
            listener.clone(),
            PlayerOptions { audio_sink: Some(Box::new(sink.clone())), ..PlayerOptions::default() },
        )
        .unwrap();

    player.start("test://live/flaky").unwrap();
    assert!(listener.wait_for(PlayerState::Finished));

    assert_eq!(
        listener.transitions(),
        vec![
            PlayerState::Connecting,
            PlayerState::Buffering,
            PlayerState::Playing,
            PlayerState::Buffering,
            PlayerState::Playing,
            PlayerState::Finished,
        ]
    );
    let expected: Vec<u64> = (0..50).map(|i| i * SCRIPT_AUDIO_PACKET_US).collect();
    assert_eq!(sink.played(), expected);

    player.destroy().unwrap();
    core.shutdown();
}

#[test]
fn second_start_is_rejected_until_the_first_is_handled() {
    let script = || vec![ScriptStep::audio_packets(0, 5), ScriptStep::End];
    let transport = Arc::new(ScriptedTransport::new(vec![script(), script()]));
    let core = core_with(transport.clone(), CoreConfig::default());
    let listener = RecordingListener::new();
    let player = core.create_player(None, listener.clone()).unwrap();

    player.start("test://vod/a").unwrap();
    let err = player.start("test://vod/b").unwrap_err();
    assert!(matches!(err, MediaCoreError::InvalidArgument(_)), "{err}");
    assert!(listener.wait_for(PlayerState::Finished));
    assert_eq!(transport.opens(), 1);
    assert_eq!(player.source().unwrap().to_string(), "test://vod/a");

    // The slot is free again once the run is over.
    player.start("test://vod/c").unwrap();
    assert!(listener.wait_for_nth(PlayerState::Finished, 2));
    assert_eq!(transport.opens(), 2);

    player.destroy().unwrap();
    core.shutdown();
}

#[test]
fn frames_for_a_detached_renderer_count_as_dropped() {
    let mut config = CoreConfig::default();
    config.player.playout.stats_interval_ms = 100;
    let core = core_with(Arc::new(ScriptedTransport::new(vec![av_script(2)])), config);
    // Bound but never attached to a surface.
    let renderer = core.create_renderer().unwrap();
    let listener = RecordingListener::new();
    let player = core.create_player(Some(renderer.id()), listener.clone()).unwrap();

    player.start("test://vod/clip").unwrap();
    assert!(listener.wait_for(PlayerState::Finished));

    let totals = player.totals();
    let reported = listener.statistics().iter().map(|s| s.dropped_frames).max().unwrap();
    assert!(renderer.stats().dropped_detached > 0);
    assert!(
        reported > totals.dropped_late + totals.dropped_renderer,
        "reported {reported}, totals {totals:?}"
    );

    player.destroy().unwrap();
    core.shutdown();
}
