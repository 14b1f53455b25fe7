//! Graph connections, signal flow and processing order

mod common;

use std::sync::{Arc, Mutex};

use jackline::{Client, Control, Error, LoopbackServer, Port};

/// Client with one output that writes `level` every cycle
fn source(server: &LoopbackServer, name: &str, level: f32) -> (Client, Port) {
    let mut client = common::open(server, name);
    let out = client.register_audio_out("out").unwrap();
    let port = out.clone();
    client
        .set_process_callback(move |scope| {
            scope.audio_out(&port).unwrap().fill(level);
            Control::Continue
        })
        .unwrap();
    client.activate().unwrap();
    (client, out)
}

/// Client with one input that records the first sample of every cycle
fn sink(server: &LoopbackServer, name: &str) -> (Client, Port, Arc<Mutex<Vec<f32>>>) {
    let mut client = common::open(server, name);
    let input = client.register_audio_in("in").unwrap();
    let heard = Arc::new(Mutex::new(Vec::new()));
    let (port, log) = (input.clone(), heard.clone());
    client
        .set_process_callback(move |scope| {
            let samples = scope.audio_in(&port).unwrap();
            log.lock().unwrap().push(samples[0]);
            Control::Continue
        })
        .unwrap();
    client.activate().unwrap();
    (client, input, heard)
}

#[test]
fn test_signal_flows_within_one_cycle() {
    let server = common::server(48_000, 64);
    // Sink opens first so the graph order, not the open order, puts it last
    let (mut listener, _, heard) = sink(&server, "listener");
    let (_speaker, _) = source(&server, "speaker", 0.25);

    listener.connect("speaker:out", "listener:in").unwrap();
    server.run_cycle();
    assert_eq!(heard.lock().unwrap().last().copied(), Some(0.25));
    assert_eq!(server.processing_order(), vec!["speaker", "listener"]);
}

#[test]
fn test_inputs_sum_all_connected_outputs() {
    let server = common::server(48_000, 64);
    let (_a, a_out) = source(&server, "a", 0.25);
    let (_b, b_out) = source(&server, "b", 0.5);
    let (mut mix, mix_in, heard) = sink(&server, "mix");

    mix.connect_ports(&a_out, &mix_in).unwrap();
    mix.connect_ports(&mix_in, &b_out).unwrap();
    server.run_cycle();
    assert_eq!(heard.lock().unwrap().last().copied(), Some(0.75));

    assert_eq!(mix.number_of_connections(&mix_in).unwrap(), 2);
    assert!(mix.is_connected_to(&mix_in, "a:out").unwrap());

    mix.disconnect_all(&mix_in).unwrap();
    server.run_cycle();
    assert_eq!(heard.lock().unwrap().last().copied(), Some(0.0));
}

#[test]
fn test_connection_errors() {
    let server = common::server(48_000, 64);
    let (mut a, a_out) = source(&server, "a", 1.0);
    let (_b, b_in, _) = sink(&server, "b");

    let err = a.connect("b:in", "a:out").unwrap_err();
    assert!(matches!(err, Error::InvalidConnection { .. }));

    let err = a.connect("a:out", "nobody:in").unwrap_err();
    assert!(matches!(err, Error::PortNotFound(name) if name == "nobody:in"));

    a.connect_ports(&a_out, &b_in).unwrap();
    let err = a.connect("a:out", "b:in").unwrap_err();
    assert!(matches!(err, Error::AlreadyExists { .. }));
    assert_eq!(err.code(), Some(17));

    a.disconnect("a:out", "b:in").unwrap();
    let err = a.disconnect("a:out", "b:in").unwrap_err();
    assert!(matches!(err, Error::NoSuchConnection { .. }));

    let err = a.connect_ports(&a_out, &a_out).unwrap_err();
    assert!(matches!(err, Error::InvalidConnection { .. }));
}

#[test]
fn test_audio_and_midi_do_not_connect() {
    let server = common::server(48_000, 64);
    let (mut a, _) = source(&server, "a", 1.0);
    let mut m = common::open(&server, "m");
    m.register_midi_in("notes").unwrap();
    m.activate().unwrap();

    let err = a.connect("a:out", "m:notes").unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidConnection {
            reason: "port types differ",
            ..
        }
    ));
}

#[test]
fn test_inactive_clients_cannot_connect() {
    let server = common::server(48_000, 64);
    let (mut a, _) = source(&server, "a", 1.0);
    let mut idle = common::open(&server, "idle");
    idle.register_audio_in("in").unwrap();

    let err = a.connect("a:out", "idle:in").unwrap_err();
    assert!(matches!(err, Error::InvalidConnection { .. }));
}

#[test]
fn test_deactivate_drops_connections() {
    let server = common::server(48_000, 64);
    let (mut a, a_out) = source(&server, "a", 1.0);
    let (mut b, b_in, _) = sink(&server, "b");
    a.connect_ports(&a_out, &b_in).unwrap();
    assert_eq!(a.all_connections().unwrap(), vec![("a:out".to_string(), "b:in".to_string())]);

    b.deactivate().unwrap();
    assert!(a.port_connections(&a_out).unwrap().is_empty());
    assert_eq!(server.processing_order(), vec!["a"]);
}

#[test]
fn test_system_playback_receives_output() {
    let server = common::server(48_000, 64);
    server.add_system_ports(2, 2).unwrap();
    let (mut player, out) = source(&server, "player", 0.5);

    player.connect(out.name(), "system:playback_1").unwrap();
    let playback = player.port_by_name("system:playback_1").unwrap();
    assert_eq!(player.port_connections(&playback).unwrap(), vec!["player:out"]);

    let order = server.processing_order();
    let player_at = order.iter().position(|n| n == "player").unwrap();
    let system_at = order.iter().position(|n| n == "system").unwrap();
    assert!(player_at < system_at);
}
