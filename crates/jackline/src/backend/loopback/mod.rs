//! In-process loopback server
//!
//! Implements the server half of every protocol the client speaks, inside
//! the calling process. Cycles and notifications are driven explicitly,
//! which makes whole-protocol behaviour reproducible:
//!
//! ```text
//!  LoopbackServer ──open()──► LoopbackSession (Backend) ──► Client
//!        │
//!        ├─ run_cycle()               process thread role: sync polling,
//!        │                            process + timebase callbacks, mixing
//!        └─ dispatch_notifications()  notification thread role
//! ```
//!
//! [`LoopbackServer::start`] runs both roles on background threads paced by
//! the configured period, for code that wants a free-running server.
//!
//! Lock order is dispatch lock, then state lock. Callbacks run under the
//! state lock only on the process side, where administrative calls are
//! refused by the callback guard.

mod engine;
mod notify;
mod session;
mod state;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::callbacks::Handlers;
use crate::client::ClientOptions;
use crate::config::LoopbackConfig;
use crate::error::{Result, Status};
use crate::metadata::Description;
use crate::transport::Transport;
use crate::types::{Frames, PortFlags, PortKind, Uuid};

use super::{Backend, Connector};
use engine::{LoopbackTransport, TransportShared};
use notify::{Event, Notification};
use session::LoopbackSession;
use state::ServerState;

pub use state::CycleReport;

pub(crate) struct Shared {
    state: Mutex<ServerState>,
    dispatch: Mutex<()>,
    transport: Arc<TransportShared>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn dispatch_lock(&self) -> MutexGuard<'_, ()> {
        self.dispatch.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Handle to an in-process server; clones share the same server
#[derive(Clone)]
pub struct LoopbackServer {
    shared: Arc<Shared>,
}

impl Default for LoopbackServer {
    fn default() -> Self {
        Self::new(LoopbackConfig::default())
    }
}

impl std::fmt::Debug for LoopbackServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackServer").finish_non_exhaustive()
    }
}

impl LoopbackServer {
    pub fn new(config: LoopbackConfig) -> Self {
        log::info!(
            "loopback server '{}': {} Hz, {} frames",
            config.name,
            config.sample_rate,
            config.buffer_size
        );
        let transport = Arc::new(TransportShared::new(config.sample_rate, config.buffer_size));
        LoopbackServer {
            shared: Arc::new(Shared {
                state: Mutex::new(ServerState::new(config, transport.clone())),
                dispatch: Mutex::new(()),
                transport,
            }),
        }
    }

    pub fn config(&self) -> LoopbackConfig {
        self.shared.state().config.clone()
    }

    pub fn is_running(&self) -> bool {
        self.shared.state().running
    }

    pub fn sample_rate(&self) -> Frames {
        self.shared.state().sample_rate
    }

    pub fn buffer_size(&self) -> Frames {
        self.shared.state().buffer_size
    }

    /// Run one process cycle
    pub fn run_cycle(&self) -> CycleReport {
        self.shared.state().run_cycle()
    }

    /// Run `count` cycles; returns the report of the last one
    pub fn run_cycles(&self, count: usize) -> Option<CycleReport> {
        (0..count).map(|_| self.run_cycle()).last()
    }

    /// Deliver every queued notification; returns how many were delivered
    pub fn dispatch_notifications(&self) -> usize {
        let _dispatch = self.shared.dispatch_lock();
        let mut delivered = 0;
        loop {
            let (client, event, mut handlers) = {
                let mut state = self.shared.state();
                let Some((client, note)) = state.notifications.pop_front() else {
                    break;
                };
                let Some(handlers) = state
                    .clients
                    .get_mut(&client)
                    .and_then(|record| record.notifications.take())
                else {
                    continue;
                };
                let event = note.resolve(|port| state.resolve_port(port, client));
                (client, event, handlers)
            };
            let vanished = match &event {
                Event::PortRegistration {
                    port: Some(port),
                    registered: false,
                } => Some(port.id()),
                _ => None,
            };

            event.deliver(&mut handlers);
            delivered += 1;

            let mut state = self.shared.state();
            if let Some(record) = state.clients.get_mut(&client) {
                record.notifications = Some(handlers);
                if let Some(port) = vanished {
                    record.known_ports.remove(&port);
                }
            }
        }
        delivered
    }

    /// Run one cycle, then deliver the notifications it produced
    pub fn pump(&self) -> CycleReport {
        let report = self.run_cycle();
        self.dispatch_notifications();
        report
    }

    /// Change the cycle length; buffer-size callbacks run immediately
    pub fn set_buffer_size(&self, nframes: Frames) -> Result<()> {
        self.shared.state().set_buffer_size(nframes)
    }

    /// Change the sample rate; clients are notified
    pub fn set_sample_rate(&self, rate: Frames) {
        self.shared.state().set_sample_rate(rate);
    }

    /// Report an xrun to every active client
    pub fn report_xrun(&self, delayed_usecs: f32) {
        self.shared
            .state()
            .notify(Notification::Xrun { delayed_usecs });
    }

    /// Shut the server down; every client gets its shutdown callback
    ///
    /// Clients become zombies: they can still be deactivated and closed,
    /// other calls fail. The next open restarts the server unless the
    /// client asks not to start one.
    pub fn shutdown(&self, reason: &str) {
        let _dispatch = self.shared.dispatch_lock();
        self.shared.state().shutdown(reason);
    }

    /// Register a "system" client with physical capture and playback ports
    ///
    /// Capture ports are outputs, playback ports inputs, as on hardware.
    pub fn add_system_ports(&self, capture: usize, playback: usize) -> Result<()> {
        let options = ClientOptions {
            use_exact_name: true,
            ..Default::default()
        };
        let (id, _, _) = self
            .shared
            .state()
            .open_client("system", &options)
            .map_err(|status| crate::Error::Open {
                name: "system".to_string(),
                status,
            })?;
        let mut state = self.shared.state();
        let physical = PortFlags::IS_PHYSICAL | PortFlags::IS_TERMINAL;
        for n in 1..=capture {
            state.register_port(id, &format!("capture_{}", n), PortKind::Audio, PortFlags::IS_OUTPUT | physical)?;
        }
        for n in 1..=playback {
            state.register_port(id, &format!("playback_{}", n), PortKind::Audio, PortFlags::IS_INPUT | physical)?;
        }
        state
            .activate(id, Handlers::detached())
            .map_err(|(error, _)| error)
    }

    /// Names of the open clients
    pub fn client_names(&self) -> Vec<String> {
        self.shared
            .state()
            .clients
            .values()
            .filter(|record| !record.zombie)
            .map(|record| record.name.clone())
            .collect()
    }

    /// Active clients in the order their process callbacks run
    pub fn processing_order(&self) -> Vec<String> {
        let state = self.shared.state();
        state
            .order
            .iter()
            .filter_map(|id| state.clients.get(id))
            .map(|record| record.name.clone())
            .collect()
    }

    /// Queued, undelivered notifications
    pub fn pending_notifications(&self) -> usize {
        self.shared.state().notifications.len()
    }

    /// Snapshot of the metadata store
    pub fn properties(&self) -> BTreeMap<Uuid, Description> {
        self.shared.state().properties.all()
    }

    /// Transport handle of the server itself
    pub fn transport(&self) -> Transport {
        Transport::new(Arc::new(LoopbackTransport::new(self.shared.transport.clone())))
    }

    /// Drive cycles and notifications from background threads
    pub fn start(&self) -> Result<LoopbackDriver> {
        let running = Arc::new(AtomicBool::new(true));
        let period = Duration::from_micros(self.config().period_usecs().max(1));

        let server = self.clone();
        let alive = running.clone();
        let process = thread::Builder::new()
            .name("loopback-process".into())
            .spawn(move || {
                while alive.load(Ordering::Acquire) {
                    let started = std::time::Instant::now();
                    server.run_cycle();
                    if let Some(rest) = period.checked_sub(started.elapsed()) {
                        thread::sleep(rest);
                    }
                }
            })
            .map_err(spawn_error)?;

        let server = self.clone();
        let alive = running.clone();
        let notify = thread::Builder::new()
            .name("loopback-notify".into())
            .spawn(move || {
                while alive.load(Ordering::Acquire) {
                    if server.dispatch_notifications() == 0 {
                        thread::sleep(Duration::from_millis(1));
                    }
                }
            })
            .map_err(spawn_error)?;

        log::info!("loopback driver started, period {:?}", period);
        Ok(LoopbackDriver {
            running,
            threads: vec![process, notify],
        })
    }

    fn session(&self, name: &str, options: &ClientOptions) -> std::result::Result<(LoopbackSession, Status), Status> {
        let (id, actual, status) = self.shared.state().open_client(name, options)?;
        log::info!("client '{}' opened ({})", actual, status);
        Ok((LoopbackSession::new(self.shared.clone(), id, actual), status))
    }
}

impl Connector for LoopbackServer {
    fn open(&self, name: &str, options: &ClientOptions) -> std::result::Result<(Box<dyn Backend>, Status), Status> {
        let (session, status) = self.session(name, options)?;
        Ok((Box::new(session), status))
    }
}

fn spawn_error(error: std::io::Error) -> crate::Error {
    log::error!("failed to spawn loopback driver thread: {}", error);
    crate::Error::Operation {
        op: "start driver",
        code: error.raw_os_error().unwrap_or(-1),
    }
}

/// Background threads driving a [`LoopbackServer`]; stopped on drop
pub struct LoopbackDriver {
    running: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl LoopbackDriver {
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for LoopbackDriver {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                log::error!("loopback driver thread panicked");
            }
        }
    }
}
