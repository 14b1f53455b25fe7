//! Client open/activate/deactivate/close against the loopback server

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use jackline::{
    Client, ClientConfig, ClientOptions, Control, Error, LoopbackServer, Status, ViolationKind,
};

fn counting_process(client: &mut Client) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = count.clone();
    client
        .set_process_callback(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Control::Continue
        })
        .unwrap();
    count
}

#[test]
fn test_process_runs_only_while_active() {
    let server = common::server(48_000, 256);
    let mut client = common::open(&server, "worker");
    let count = counting_process(&mut client);

    server.run_cycles(3);
    assert_eq!(count.load(Ordering::SeqCst), 0);

    client.activate().unwrap();
    assert!(client.is_active());
    server.run_cycles(3);
    assert_eq!(count.load(Ordering::SeqCst), 3);

    client.deactivate().unwrap();
    server.run_cycles(3);
    assert_eq!(count.load(Ordering::SeqCst), 3);

    // Reactivation reuses the same callbacks
    client.activate().unwrap();
    server.run_cycle();
    assert_eq!(count.load(Ordering::SeqCst), 4);
}

#[test]
fn test_close_is_idempotent_and_final() {
    let server = common::server(48_000, 256);
    let mut client = common::open(&server, "closer");
    client.register_audio_out("out").unwrap();
    client.activate().unwrap();

    client.close().unwrap();
    client.close().unwrap();
    assert!(client.is_closed());
    assert!(server.client_names().is_empty());

    let err = client.activate().unwrap_err();
    assert!(matches!(err, Error::Violation(ViolationKind::ClientClosed)));
    assert!(client.register_audio_in("in").is_err());
}

#[test]
fn test_drop_closes_client() {
    let server = common::server(48_000, 256);
    {
        let mut client = common::open(&server, "scoped");
        client.activate().unwrap();
        assert_eq!(server.client_names(), vec!["scoped"]);
    }
    assert!(server.client_names().is_empty());
}

#[test]
fn test_non_realtime_callbacks_locked_while_active() {
    let server = common::server(48_000, 256);
    let mut client = common::open(&server, "locked");
    client.activate().unwrap();

    let err = client.set_xrun_callback(|_| Control::Continue).unwrap_err();
    assert!(matches!(
        err,
        Error::Violation(ViolationKind::RegisteredWhileActive(_))
    ));

    // Process, shutdown and sync callbacks may change while running
    client.set_process_callback(|_| Control::Continue).unwrap();
    client.set_shutdown_callback(|_, _| {}).unwrap();
}

#[test]
fn test_process_callback_replaced_while_active() {
    let server = common::server(48_000, 256);
    let mut client = common::open(&server, "swap");
    let first = counting_process(&mut client);
    client.activate().unwrap();
    server.run_cycles(2);

    let second = counting_process(&mut client);
    server.run_cycles(2);
    assert_eq!(first.load(Ordering::SeqCst), 2);
    assert_eq!(second.load(Ordering::SeqCst), 2);
}

#[test]
fn test_process_stop_disables_only_the_callback() {
    let server = common::server(48_000, 256);
    let mut client = common::open(&server, "once");
    let count = Arc::new(AtomicUsize::new(0));
    let seen = count.clone();
    client
        .set_process_callback(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Control::Stop
        })
        .unwrap();
    client.activate().unwrap();

    server.run_cycles(4);
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(client.is_active());
}

#[test]
fn test_admin_call_from_callback_is_refused() {
    let server = common::server(48_000, 256);
    let other = Arc::new(Mutex::new(common::open(&server, "other")));
    let refused = Arc::new(Mutex::new(None));

    let mut client = common::open(&server, "caller");
    let (target, outcome) = (other.clone(), refused.clone());
    client
        .set_process_callback(move |_| {
            let result = target.lock().unwrap().register_audio_in("late");
            outcome.lock().unwrap().get_or_insert(result.is_err());
            Control::Continue
        })
        .unwrap();
    client.activate().unwrap();
    server.run_cycle();

    assert_eq!(*refused.lock().unwrap(), Some(true));
    assert!(other.lock().unwrap().inports().is_empty());
}

#[test]
fn test_graph_order_callback_may_call_server() {
    let server = common::server(48_000, 256);
    let helper: Arc<Mutex<Option<Client>>> = Arc::new(Mutex::new(None));
    let outcomes = Arc::new(Mutex::new(Vec::new()));

    let mut watcher = common::open(&server, "watcher");
    let (connector, slot, seen) = (server.clone(), helper.clone(), outcomes.clone());
    watcher
        .set_graph_order_callback(move || {
            let mut slot = slot.lock().unwrap();
            if slot.is_none() {
                let mut opened = common::open(&connector, "helper");
                let mut seen = seen.lock().unwrap();
                seen.push(opened.register_audio_in("in").is_ok());
                seen.push(connector.client_names().contains(&"helper".to_string()));
                let refused = opened.activate().unwrap_err();
                seen.push(matches!(refused, Error::Violation(ViolationKind::CallbackContext)));
                *slot = Some(opened);
            }
            Control::Continue
        })
        .unwrap();
    let out = watcher.register_audio_out("out").unwrap();
    let input = watcher.register_audio_in("in").unwrap();
    watcher.activate().unwrap();

    watcher.connect(out.name(), input.name()).unwrap();
    server.dispatch_notifications();

    assert_eq!(*outcomes.lock().unwrap(), vec![true, true, true]);
    let mut opened = helper.lock().unwrap().take().unwrap();
    assert_eq!(opened.inports().len(), 1);
    opened.activate().unwrap();
    opened.close().unwrap();
}

#[test]
fn test_panicking_callback_does_not_stop_the_cycle() {
    let server = common::server(48_000, 256);
    let mut faulty = common::open(&server, "faulty");
    faulty
        .set_process_callback(|_| panic!("process failure"))
        .unwrap();
    faulty.activate().unwrap();

    let mut healthy = common::open(&server, "healthy");
    let count = counting_process(&mut healthy);
    healthy.activate().unwrap();

    let report = server.run_cycles(2).unwrap();
    assert_eq!(report.clients_run, 2);
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[test]
fn test_shutdown_turns_client_into_zombie() {
    let server = common::server(48_000, 256);
    let mut client = common::open(&server, "survivor");
    let reported: Arc<Mutex<Option<(Status, String)>>> = Arc::new(Mutex::new(None));
    let sink = reported.clone();
    client
        .set_shutdown_callback(move |status, reason| {
            *sink.lock().unwrap() = Some((status, reason.to_string()));
        })
        .unwrap();
    client.activate().unwrap();

    server.shutdown("maintenance");
    let (status, reason) = reported.lock().unwrap().clone().unwrap();
    assert!(status.failure() && status.server_error());
    assert_eq!(reason, "maintenance");

    let err = client.register_audio_in("in").unwrap_err();
    assert_eq!(err.code(), Some(-1));

    client.deactivate().unwrap();
    client.close().unwrap();
}

#[test]
fn test_open_reports_renamed_client() {
    let server = common::server(48_000, 256);
    let _first = common::open(&server, "dup");
    let second = Client::open(&server, "dup", &ClientOptions::default()).unwrap();
    assert!(second.status().name_not_unique());
    assert_ne!(second.name(), "dup");

    let err = Client::open(
        &server,
        "dup",
        &ClientOptions {
            use_exact_name: true,
            ..Default::default()
        },
    )
    .unwrap_err();
    match err {
        Error::Open { status, .. } => assert!(status.failure() && status.name_not_unique()),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_open_rejects_separator_in_name() {
    let server = common::server(48_000, 256);
    let err = Client::open(&server, "deck:a", &ClientOptions::default()).unwrap_err();
    match err {
        Error::Open { status, .. } => assert!(status.failure() && status.invalid_option()),
        other => panic!("unexpected error: {other}"),
    }
    assert!(server.client_names().is_empty());

    // Short names may still contain the separator; the owner is unambiguous
    let mut client = common::open(&server, "deck");
    let port = client.register_audio_out("a:b").unwrap();
    assert_eq!(port.name(), "deck:a:b");
    assert_eq!(port.client_name(), "deck");
    assert_eq!(port.short_name(), "a:b");
}

#[test]
fn test_from_config_activates() {
    let server = LoopbackServer::default();
    let config = ClientConfig {
        name: "configured".to_string(),
        auto_activate: true,
        sync_timeout_us: Some(500_000),
        ..Default::default()
    };
    let client = Client::from_config(&server, &config).unwrap();
    assert!(client.is_active());
    assert_eq!(client.name(), "configured");
    assert_eq!(server.processing_order(), vec!["configured"]);
}

#[test]
fn test_server_properties_reach_client() {
    let server = common::server(44_100, 128);
    let client = common::open(&server, "reader");
    assert_eq!(client.sample_rate(), 44_100);
    assert_eq!(client.buffer_size(), 128);
    assert!(!client.is_realtime());

    server.run_cycles(4);
    assert_eq!(client.last_frame_time(), 3 * 128);
    assert!(client.frame_time() >= client.last_frame_time());
}
