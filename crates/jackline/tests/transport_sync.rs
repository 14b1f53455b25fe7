//! Transport state machine and slow-sync against the loopback server

mod common;

use std::sync::{Arc, Mutex};

use jackline::{Bbt, PositionBits, TransportPosition, TransportState};

type Polls = Arc<Mutex<Vec<(TransportState, u32)>>>;

#[test]
fn test_start_stop_without_slow_sync() {
    let server = common::server(48_000, 512);
    let client = common::open(&server, "deck");
    let transport = client.transport();
    assert_eq!(transport.state().unwrap(), TransportState::Stopped);

    client.transport_start();
    server.run_cycle();
    assert_eq!(client.transport_state().unwrap(), TransportState::Rolling);
    server.run_cycles(3);
    assert_eq!(transport.position().unwrap().frame, 4 * 512);

    client.transport_stop();
    server.run_cycles(2);
    let (state, position) = client.transport_query().unwrap();
    assert_eq!(state, TransportState::Stopped);
    assert_eq!(position.frame, 4 * 512);
}

#[test]
fn test_locate_takes_effect_next_cycle() {
    let server = common::server(48_000, 256);
    let client = common::open(&server, "seeker");
    client.transport_locate(96_000).unwrap();
    assert_eq!(client.transport().position().unwrap().frame, 0);

    server.run_cycle();
    assert_eq!(client.transport().position().unwrap().frame, 96_000);
    assert_eq!(client.transport_frame(), 96_000);
}

#[test]
fn test_reposition_rejects_unknown_fields() {
    let server = common::server(48_000, 256);
    let client = common::open(&server, "bad");
    let mut position = TransportPosition::at_frame(0);
    position.valid |= PositionBits::from_bits(1 << 20);
    let err = client.transport_reposition(&position).unwrap_err();
    assert_eq!(err.code(), Some(22));
}

#[test]
fn test_reposition_carries_musical_position() {
    let server = common::server(48_000, 256);
    let client = common::open(&server, "cue");
    let mut position = TransportPosition::at_frame(4_800);
    position.set_bbt(Bbt {
        bar: 3,
        beat: 2,
        tick: 0,
        bar_start_tick: 7_680.0,
        beats_per_bar: 4.0,
        beat_type: 4.0,
        ticks_per_beat: 1_920.0,
        beats_per_minute: 120.0,
    });
    client.transport_reposition(&position).unwrap();
    server.run_cycle();

    let seen = client.transport().position().unwrap();
    assert_eq!(seen.frame, 4_800);
    // Without a timebase master the musical fields do not outlive the cycle
    assert!(seen.bbt().is_none());
}

fn slow_client(server: &jackline::LoopbackServer, name: &str, ready_after: usize) -> (jackline::Client, Polls) {
    let mut client = common::open(server, name);
    let polls: Polls = Arc::new(Mutex::new(Vec::new()));
    let sink = polls.clone();
    client
        .set_sync_callback(move |state, position| {
            let mut polls = sink.lock().unwrap();
            polls.push((state, position.frame));
            polls.len() > ready_after
        })
        .unwrap();
    client.activate().unwrap();
    (client, polls)
}

#[test]
fn test_slow_sync_waits_for_ready_client() {
    let server = common::server(48_000, 256);
    let (client, polls) = slow_client(&server, "slow", 2);

    client.transport_start();
    server.run_cycle();
    assert_eq!(client.transport_state().unwrap(), TransportState::Starting);
    server.run_cycle();
    assert_eq!(client.transport_state().unwrap(), TransportState::Starting);
    server.run_cycle();
    assert_eq!(client.transport_state().unwrap(), TransportState::Rolling);

    {
        let seen = polls.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|(state, frame)| *state == TransportState::Starting && *frame == 0));
    }

    // Ready clients are not polled again while rolling
    server.run_cycles(3);
    assert_eq!(polls.lock().unwrap().len(), 3);
}

#[test]
fn test_slow_sync_times_out() {
    // 1000 frames at 50 kHz is a 20 ms cycle; a 100 ms timeout spans 5 cycles
    let server = common::server(50_000, 1_000);
    let (mut client, polls) = slow_client(&server, "stuck", usize::MAX);
    client.set_sync_timeout(100_000).unwrap();

    client.transport_start();
    for _ in 0..4 {
        server.run_cycle();
        assert_eq!(client.transport_state().unwrap(), TransportState::Starting);
    }
    server.run_cycle();
    assert_eq!(client.transport_state().unwrap(), TransportState::Rolling);

    // The laggard is still polled, now with Rolling
    server.run_cycles(2);
    let polls = polls.lock().unwrap();
    let states: Vec<_> = polls.iter().map(|(state, _)| *state).collect();
    assert_eq!(states.len(), 7);
    assert!(states[..5].iter().all(|s| *s == TransportState::Starting));
    assert!(states[5..].iter().all(|s| *s == TransportState::Rolling));
}

#[test]
fn test_late_client_stops_being_polled_once_ready() {
    let server = common::server(50_000, 1_000);
    // Ready on its seventh poll, two cycles after the 100 ms timeout
    let (mut client, polls) = slow_client(&server, "late", 6);
    client.set_sync_timeout(100_000).unwrap();

    client.transport_start();
    server.run_cycles(7);
    assert_eq!(polls.lock().unwrap().len(), 7);
    assert_eq!(
        polls.lock().unwrap().last().map(|(state, _)| *state),
        Some(TransportState::Rolling)
    );

    server.run_cycles(3);
    assert_eq!(polls.lock().unwrap().len(), 7);
    assert_eq!(client.transport_state().unwrap(), TransportState::Rolling);
}

#[test]
fn test_relocate_while_rolling_resyncs() {
    let server = common::server(48_000, 256);
    let (client, polls) = slow_client(&server, "follower", 0);

    client.transport_start();
    server.run_cycle();
    assert_eq!(client.transport_state().unwrap(), TransportState::Rolling);

    client.transport_locate(48_000).unwrap();
    server.run_cycle();
    let polls = polls.lock().unwrap().clone();
    assert_eq!(polls.last(), Some(&(TransportState::Starting, 48_000)));
    assert_eq!(client.transport_state().unwrap(), TransportState::Rolling);
}

#[test]
fn test_cleared_sync_callback_stops_participation() {
    let server = common::server(48_000, 256);
    let (mut client, polls) = slow_client(&server, "leaver", usize::MAX);
    client.clear_sync_callback().unwrap();

    client.transport_start();
    server.run_cycle();
    assert_eq!(client.transport_state().unwrap(), TransportState::Rolling);
    assert!(polls.lock().unwrap().is_empty());
}
