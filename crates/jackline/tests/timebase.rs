//! Timebase master election and musical position publishing

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use jackline::{Error, TimebaseMaster};

#[test]
fn test_master_publishes_bar_beat_tick() {
    let server = common::server(48_000, 512);
    let mut client = common::open(&server, "clock");
    let mut master = TimebaseMaster::new(120.0, 4.0, 4.0, 1_920.0);
    let acquired = client
        .set_timebase_callback(
            move |state, nframes, position, new_position| {
                master.update(state, nframes, position, new_position)
            },
            false,
        )
        .unwrap();
    assert!(acquired);
    client.activate().unwrap();

    server.run_cycle();
    let position = client.transport().position().unwrap();
    let bbt = position.bbt().unwrap();
    assert_eq!((bbt.bar, bbt.beat, bbt.tick), (1, 1, 0));
    assert_eq!(bbt.beats_per_minute, 120.0);

    // 512 frames at 48 kHz and 120 BPM is 40.96 ticks of 1920
    client.transport_start();
    server.run_cycle();
    let position = client.transport().position().unwrap();
    assert_eq!(position.frame, 512);
    let bbt = position.bbt().unwrap();
    assert_eq!((bbt.bar, bbt.beat, bbt.tick), (1, 1, 40));
}

#[test]
fn test_callback_runs_only_when_rolling_or_relocated() {
    let server = common::server(48_000, 256);
    let mut client = common::open(&server, "lazy");
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    client
        .set_timebase_callback(
            move |_, _, _, _| {
                seen.fetch_add(1, Ordering::SeqCst);
            },
            false,
        )
        .unwrap();
    client.activate().unwrap();

    server.run_cycles(3);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    client.transport_locate(1_000).unwrap();
    server.run_cycle();
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    client.transport_start();
    server.run_cycles(2);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[test]
fn test_master_cannot_move_the_frame() {
    let server = common::server(48_000, 256);
    let mut client = common::open(&server, "rogue");
    client
        .set_timebase_callback(
            |_, _, position, _| {
                position.frame = 999_999;
            },
            false,
        )
        .unwrap();
    client.activate().unwrap();
    server.run_cycle();
    assert_eq!(client.transport().position().unwrap().frame, 0);
}

#[test]
fn test_conditional_acquisition_and_takeover() {
    let server = common::server(48_000, 256);
    let mut first = common::open(&server, "first");
    let mut second = common::open(&server, "second");

    assert!(first.set_timebase_callback(|_, _, _, _| {}, false).unwrap());
    assert!(!second.set_timebase_callback(|_, _, _, _| {}, true).unwrap());
    assert!(second.set_timebase_callback(|_, _, _, _| {}, false).unwrap());

    let err = first.release_timebase().unwrap_err();
    assert!(matches!(err, Error::NotTimebaseMaster));
    second.release_timebase().unwrap();
    assert!(first.set_timebase_callback(|_, _, _, _| {}, true).unwrap());
}

#[test]
fn test_closing_master_releases_role() {
    let server = common::server(48_000, 256);
    let mut master = common::open(&server, "master");
    master.set_timebase_callback(|_, _, _, _| {}, false).unwrap();
    master.close().unwrap();

    let mut next = common::open(&server, "next");
    assert!(next.set_timebase_callback(|_, _, _, _| {}, true).unwrap());
}

#[test]
fn test_reactivated_master_sees_new_position() {
    let server = common::server(48_000, 256);
    let mut client = common::open(&server, "resumer");
    let flags = Arc::new(Mutex::new(Vec::new()));
    let seen = flags.clone();
    client
        .set_timebase_callback(
            move |_, _, _, new_position| {
                seen.lock().unwrap().push(new_position);
            },
            false,
        )
        .unwrap();
    client.activate().unwrap();
    server.run_cycle();
    assert_eq!(*flags.lock().unwrap(), vec![true]);

    client.deactivate().unwrap();
    server.run_cycle();
    client.activate().unwrap();
    server.run_cycle();
    assert_eq!(*flags.lock().unwrap(), vec![true, true]);

    client.transport_start();
    server.run_cycle();
    assert_eq!(*flags.lock().unwrap(), vec![true, true, false]);
}
