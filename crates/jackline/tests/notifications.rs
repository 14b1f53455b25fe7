//! Server notifications as seen by an observing client

mod common;

use std::sync::{Arc, Mutex};

use jackline::{Client, Control, LoopbackServer, PortAvailability};

type Log<T> = Arc<Mutex<Vec<T>>>;

fn log<T>() -> Log<T> {
    Arc::new(Mutex::new(Vec::new()))
}

/// Active client recording port registrations under `policy`
fn port_watcher(server: &LoopbackServer, name: &str, policy: PortAvailability) -> (Client, Log<(Option<String>, bool)>) {
    let mut client = common::open(server, name);
    let seen = log();
    let sink = seen.clone();
    client
        .set_port_registration_callback(
            move |port, registered| {
                let name = port.map(|p| p.name().to_string());
                sink.lock().unwrap().push((name, registered));
            },
            policy,
        )
        .unwrap();
    client.activate().unwrap();
    (client, seen)
}

#[test]
fn test_client_registration() {
    common::init_logging();
    let server = common::server(48_000, 256);
    let mut watcher = common::open(&server, "watcher");
    let seen = log();
    let sink = seen.clone();
    watcher
        .set_client_registration_callback(move |name, registered| {
            sink.lock().unwrap().push((name.to_string(), registered));
        })
        .unwrap();
    watcher.activate().unwrap();

    let mut newcomer = common::open(&server, "newcomer");
    server.dispatch_notifications();
    newcomer.close().unwrap();
    server.dispatch_notifications();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![("newcomer".to_string(), true), ("newcomer".to_string(), false)]
    );
}

#[test]
fn test_port_registration_resolves_ports() {
    let server = common::server(48_000, 256);
    let (_watcher, seen) = port_watcher(&server, "watcher", PortAvailability::OnlyAvailable);
    let mut other = common::open(&server, "other");

    let port = other.register_audio_out("out").unwrap();
    server.dispatch_notifications();
    other.unregister_port(&port).unwrap();
    server.dispatch_notifications();

    // The port is already gone on the second delivery but was seen before
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            (Some("other:out".to_string()), true),
            (Some("other:out".to_string()), false),
        ]
    );
}

#[test]
fn test_vanished_ports_follow_policy() {
    let server = common::server(48_000, 256);
    let (_strict, strict_seen) = port_watcher(&server, "strict", PortAvailability::OnlyAvailable);
    let (_lenient, lenient_seen) = port_watcher(&server, "lenient", PortAvailability::IncludeVanished);
    let mut other = common::open(&server, "other");

    let port = other.register_audio_out("blink").unwrap();
    other.unregister_port(&port).unwrap();
    server.dispatch_notifications();

    assert!(strict_seen.lock().unwrap().is_empty());
    assert_eq!(*lenient_seen.lock().unwrap(), vec![(None, true), (None, false)]);
}

#[test]
fn test_connect_and_rename() {
    let server = common::server(48_000, 256);
    let mut watcher = common::open(&server, "watcher");
    let connects = log();
    let renames = log();
    let sink = connects.clone();
    watcher
        .set_port_connect_callback(
            move |a, b, connected| {
                let names = (a.map(|p| p.name().to_string()), b.map(|p| p.name().to_string()));
                sink.lock().unwrap().push((names, connected));
            },
            PortAvailability::OnlyAvailable,
        )
        .unwrap();
    let sink = renames.clone();
    watcher
        .set_port_rename_callback(
            move |port, old, new| {
                let current = port.map(|p| p.name().to_string());
                sink.lock().unwrap().push((current, old.to_string(), new.to_string()));
                Control::Continue
            },
            PortAvailability::OnlyAvailable,
        )
        .unwrap();
    watcher.activate().unwrap();

    let mut a = common::open(&server, "a");
    let out = a.register_audio_out("out").unwrap();
    a.activate().unwrap();
    let mut b = common::open(&server, "b");
    b.register_audio_in("in").unwrap();
    b.activate().unwrap();

    a.connect("a:out", "b:in").unwrap();
    a.set_port_short_name(&out, "main").unwrap();
    server.dispatch_notifications();

    assert_eq!(
        *connects.lock().unwrap(),
        vec![((Some("a:main".to_string()), Some("b:in".to_string())), true)]
    );
    assert_eq!(
        *renames.lock().unwrap(),
        vec![(Some("a:main".to_string()), "a:out".to_string(), "a:main".to_string())]
    );
}

#[test]
fn test_graph_order_xrun_and_sample_rate() {
    let server = common::server(48_000, 256);
    let mut watcher = common::open(&server, "watcher");
    let graph = Arc::new(Mutex::new(0));
    let xruns = log();
    let rates = log();

    let sink = graph.clone();
    watcher
        .set_graph_order_callback(move || {
            *sink.lock().unwrap() += 1;
            Control::Continue
        })
        .unwrap();
    let sink = xruns.clone();
    watcher
        .set_xrun_callback(move |delay| {
            sink.lock().unwrap().push(delay);
            Control::Continue
        })
        .unwrap();
    let sink = rates.clone();
    watcher
        .set_sample_rate_callback(move |rate| {
            sink.lock().unwrap().push(rate);
            Control::Continue
        })
        .unwrap();
    watcher.activate().unwrap();
    server.dispatch_notifications();
    let after_activation = *graph.lock().unwrap();

    let mut other = common::open(&server, "other");
    other.activate().unwrap();
    server.report_xrun(125.0);
    server.set_sample_rate(44_100);
    server.dispatch_notifications();

    assert_eq!(*graph.lock().unwrap(), after_activation + 1);
    assert_eq!(*xruns.lock().unwrap(), vec![125.0]);
    assert_eq!(*rates.lock().unwrap(), vec![44_100]);
    assert_eq!(watcher.sample_rate(), 44_100);
}

#[test]
fn test_stop_disables_only_that_notification() {
    let server = common::server(48_000, 256);
    let mut watcher = common::open(&server, "watcher");
    let xruns = Arc::new(Mutex::new(0));
    let sink = xruns.clone();
    watcher
        .set_xrun_callback(move |_| {
            *sink.lock().unwrap() += 1;
            Control::Stop
        })
        .unwrap();
    watcher.activate().unwrap();

    server.report_xrun(10.0);
    server.report_xrun(20.0);
    server.dispatch_notifications();
    assert_eq!(*xruns.lock().unwrap(), 1);
}

#[test]
fn test_inactive_clients_receive_nothing() {
    let server = common::server(48_000, 256);
    let mut idle = common::open(&server, "idle");
    let seen: Log<String> = log();
    let sink = seen.clone();
    idle.set_client_registration_callback(move |name, _| {
        sink.lock().unwrap().push(name.to_string());
    })
    .unwrap();

    let _other = common::open(&server, "other");
    server.report_xrun(5.0);
    assert_eq!(server.pending_notifications(), 0);
    assert_eq!(server.dispatch_notifications(), 0);
    assert!(seen.lock().unwrap().is_empty());
}

#[test]
fn test_buffer_size_change_reaches_active_clients() {
    let server = common::server(48_000, 256);
    let mut client = common::open(&server, "resizer");
    let sizes = log();
    let sink = sizes.clone();
    client
        .set_buffer_size_callback(move |nframes| {
            sink.lock().unwrap().push(nframes);
            Control::Continue
        })
        .unwrap();
    client.activate().unwrap();

    server.set_buffer_size(1_024).unwrap();
    assert!(server.set_buffer_size(1_000).is_err());
    assert_eq!(*sizes.lock().unwrap(), vec![1_024]);
    assert_eq!(client.buffer_size(), 1_024);
    assert_eq!(server.run_cycle().n_frames, 1_024);
}
