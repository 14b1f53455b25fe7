//! MIDI routing between clients through the loopback graph

mod common;

use std::sync::{Arc, Mutex};

use jackline::{Control, Error, ViolationKind};

type Received = Arc<Mutex<Vec<(u32, Vec<u8>)>>>;

#[test]
fn test_events_merge_in_time_order() {
    let server = common::server(48_000, 128);

    let mut keys = common::open(&server, "keys");
    let keys_out = keys.register_midi_out("out").unwrap();
    let port = keys_out.clone();
    keys.set_process_callback(move |scope| {
        let mut writer = scope.midi_out(&port).unwrap();
        writer.clear_buffer();
        writer.write_midi_event(4, &[0x90, 60, 100]).unwrap();
        writer.write_midi_event(40, &[0x80, 60, 0]).unwrap();
        Control::Continue
    })
    .unwrap();
    keys.activate().unwrap();

    let mut pads = common::open(&server, "pads");
    let pads_out = pads.register_midi_out("out").unwrap();
    let port = pads_out.clone();
    pads.set_process_callback(move |scope| {
        let mut writer = scope.midi_out(&port).unwrap();
        writer.clear_buffer();
        writer.write_midi_event(10, &[0x99, 36, 127]).unwrap();
        Control::Continue
    })
    .unwrap();
    pads.activate().unwrap();

    let mut synth = common::open(&server, "synth");
    let synth_in = synth.register_midi_in("in").unwrap();
    let received: Received = Arc::new(Mutex::new(Vec::new()));
    let (port, sink) = (synth_in.clone(), received.clone());
    synth
        .set_process_callback(move |scope| {
            let mut events = sink.lock().unwrap();
            events.clear();
            for event in scope.incoming_midi_events(&port).unwrap() {
                events.push((event.time, event.bytes.to_vec()));
            }
            Control::Continue
        })
        .unwrap();
    synth.activate().unwrap();

    synth.connect_ports(&keys_out, &synth_in).unwrap();
    synth.connect_ports(&pads_out, &synth_in).unwrap();
    server.run_cycle();

    let events = received.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![
            (4, vec![0x90, 60, 100]),
            (10, vec![0x99, 36, 127]),
            (40, vec![0x80, 60, 0]),
        ]
    );
}

#[test]
fn test_writer_enforces_event_rules() {
    let server = common::server(48_000, 64);
    let mut client = common::open(&server, "strict");
    let out = client.register_midi_out("out").unwrap();
    let outcomes: Arc<Mutex<Vec<Error>>> = Arc::new(Mutex::new(Vec::new()));
    let (port, sink) = (out.clone(), outcomes.clone());
    client
        .set_process_callback(move |scope| {
            let mut writer = scope.midi_out(&port).unwrap();
            let mut errors = sink.lock().unwrap();
            if let Err(e) = writer.write_midi_event(0, &[0x90, 60, 1]) {
                errors.push(e);
            }
            writer.clear_buffer();
            writer.write_midi_event(20, &[0x90, 60, 1]).unwrap();
            for (time, bytes) in [
                (10, &[0x80u8, 60, 0][..]),
                (64, &[0x80, 60, 0][..]),
                (30, &[0x90, 0x91][..]),
            ] {
                if let Err(e) = writer.write_midi_event(time, bytes) {
                    errors.push(e);
                }
            }
            assert_eq!(writer.event_count(), 1);
            Control::Continue
        })
        .unwrap();
    client.activate().unwrap();
    server.run_cycle();

    let errors = outcomes.lock().unwrap();
    let kinds: Vec<_> = errors
        .iter()
        .map(|e| match e {
            Error::Violation(kind) => *kind,
            other => panic!("unexpected error: {other}"),
        })
        .collect();
    assert_eq!(
        kinds,
        vec![
            ViolationKind::MidiNotCleared,
            ViolationKind::MidiOutOfOrder { time: 10, last: 20 },
            ViolationKind::MidiTimeOutOfRange { time: 64, nframes: 64 },
            ViolationKind::MidiNotNormalized,
        ]
    );
}

#[test]
fn test_full_buffer_counts_lost_events() {
    let server = common::server(48_000, 16);
    let mut client = common::open(&server, "flood");
    let out = client.register_midi_out("out").unwrap();
    let lost = Arc::new(Mutex::new(0));
    let (port, sink) = (out.clone(), lost.clone());
    client
        .set_process_callback(move |scope| {
            let mut writer = scope.midi_out(&port).unwrap();
            writer.clear_buffer();
            let mut full = false;
            for time in 0..16 {
                if let Err(Error::MidiBufferFull { .. }) = writer.write_midi_event(time, &[0x90, 60, 1]) {
                    full = true;
                }
            }
            assert!(full);
            *sink.lock().unwrap() = writer.lost_midi_events();
            Control::Continue
        })
        .unwrap();
    client.activate().unwrap();
    server.run_cycle();
    assert!(*lost.lock().unwrap() > 0);
}
