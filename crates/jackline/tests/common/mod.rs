//! Shared helpers for loopback integration tests

#![allow(dead_code)]

use jackline::{Client, ClientOptions, LoopbackConfig, LoopbackServer};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Loopback server with the given rate and cycle length
pub fn server(sample_rate: u32, buffer_size: u32) -> LoopbackServer {
    init_logging();
    LoopbackServer::new(LoopbackConfig {
        sample_rate,
        buffer_size,
        ..Default::default()
    })
}

pub fn open(server: &LoopbackServer, name: &str) -> Client {
    let options = ClientOptions {
        use_exact_name: true,
        ..Default::default()
    };
    Client::open(server, name, &options).expect("open client")
}
