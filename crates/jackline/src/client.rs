//! Client lifecycle, ports, connections and server queries
//!
//! ```text
//!            open()
//!              │
//!              ▼
//!   ┌──────► Inactive ──activate()──► Active
//!   │          │   ▲                    │
//!   │          │   └───deactivate()─────┘
//!   │        close()                    │ close() deactivates first
//!   │          ▼                        │
//!   │        Closed ◄───────────────────┘
//!   └── ports and callbacks can be set up here before activation
//! ```
//!
//! A [`Client`] owns its backend connection, its [`PortRegistry`] and its
//! [`CallbackTable`]. While active, the callback handlers live with the
//! backend; deactivation hands them back. Dropping a client closes it.
//!
//! Calls that talk to the server fail with [`ViolationKind::CallbackContext`]
//! when made from a realtime callback (process, sync, timebase, buffer size,
//! shutdown). Notification callbacks may query the server and change the
//! graph, but activate, deactivate and close are refused there too.

use std::collections::BTreeMap;

use crate::backend::{ActivationError, Backend, Connector};
use crate::callbacks::{CallbackTable, Control, PortAvailability};
use crate::config::ClientConfig;
use crate::context::{ensure_admin_allowed, ensure_lifecycle_allowed};
use crate::error::{Error, Result, Status, ViolationKind};
use crate::metadata::{Description, Property, PropertyChange};
use crate::port::{Port, PortFilter, PortRegistry};
use crate::process::ProcessScope;
use crate::transport::{Transport, TransportPosition, TransportState};
use crate::types::{port_name_size, Direction, Frames, PortFlags, PortKind, Time, Uuid};

/// Environment variable that forbids starting a server on open
pub const ENV_NO_START_SERVER: &str = "JACK_NO_START_SERVER";

/// Environment variable naming the default server
pub const ENV_DEFAULT_SERVER: &str = "JACK_DEFAULT_SERVER";

/// Options for opening a client
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientOptions {
    /// Fail instead of renaming when the name is taken
    pub use_exact_name: bool,
    /// Fail instead of starting a server
    pub no_start_server: bool,
    pub server_name: Option<String>,
    pub session_id: Option<String>,
}

impl ClientOptions {
    /// Apply the server environment variables
    pub fn with_env(self) -> Self {
        self.apply_env(|key| std::env::var(key).ok())
    }

    fn apply_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if lookup(ENV_NO_START_SERVER).is_some() {
            self.no_start_server = true;
        }
        if self.server_name.is_none() {
            self.server_name = lookup(ENV_DEFAULT_SERVER).filter(|name| !name.is_empty());
        }
        self
    }
}

impl From<&ClientConfig> for ClientOptions {
    fn from(config: &ClientConfig) -> Self {
        ClientOptions {
            use_exact_name: config.use_exact_name,
            no_start_server: config.no_start_server,
            server_name: config.server_name.clone(),
            session_id: config.session_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Inactive,
    Active,
    Closed,
}

/// An open connection to an audio server
pub struct Client {
    backend: Box<dyn Backend>,
    lifecycle: Lifecycle,
    status: Status,
    registry: PortRegistry,
    callbacks: CallbackTable,
    transport: Transport,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("name", &self.backend.name())
            .field("lifecycle", &self.lifecycle)
            .field("ports", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Open a client through `connector`
    ///
    /// The actual name may differ from `name` unless
    /// [`ClientOptions::use_exact_name`] is set; [`Client::status`] then
    /// reports `NAME_NOT_UNIQUE`.
    pub fn open(connector: &dyn Connector, name: &str, options: &ClientOptions) -> Result<Client> {
        ensure_admin_allowed()?;
        let options = options.clone().with_env();
        let (backend, status) = connector.open(name, &options).map_err(|status| {
            log::warn!("open '{}' failed: {}", name, status);
            Error::Open {
                name: name.to_string(),
                status,
            }
        })?;
        let transport = Transport::new(backend.transport());
        log::info!("opened client '{}'", backend.name());
        Ok(Client {
            backend,
            lifecycle: Lifecycle::Inactive,
            status,
            registry: PortRegistry::new(),
            callbacks: CallbackTable::new(),
            transport,
        })
    }

    /// Open a client as described by a [`ClientConfig`]
    pub fn from_config(connector: &dyn Connector, config: &ClientConfig) -> Result<Client> {
        let mut client = Client::open(connector, &config.name, &ClientOptions::from(config))?;
        if let Some(usecs) = config.sync_timeout_us {
            client.set_sync_timeout(usecs)?;
        }
        if config.auto_activate {
            client.activate()?;
        }
        Ok(client)
    }

    /// Guard for calls that talk to the server
    fn admin(&self) -> Result<()> {
        ensure_admin_allowed()?;
        if self.lifecycle == Lifecycle::Closed {
            return Err(ViolationKind::ClientClosed.into());
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Properties
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn name(&self) -> &str {
        self.backend.name()
    }

    pub fn uuid(&self) -> Result<Uuid> {
        self.admin()?;
        self.backend.uuid()
    }

    /// Status reported when the client was opened
    pub fn status(&self) -> Status {
        self.status
    }

    pub fn sample_rate(&self) -> Frames {
        self.backend.sample_rate()
    }

    pub fn buffer_size(&self) -> Frames {
        self.backend.buffer_size()
    }

    /// Ask the server for a new cycle length (a power of two)
    pub fn set_buffer_size(&mut self, nframes: Frames) -> Result<()> {
        self.admin()?;
        self.backend.set_buffer_size(nframes)
    }

    pub fn is_realtime(&self) -> bool {
        self.backend.is_realtime()
    }

    /// DSP load in percent
    pub fn cpu_load(&self) -> f32 {
        self.backend.cpu_load()
    }

    /// Estimated current frame time
    pub fn frame_time(&self) -> Frames {
        self.backend.frame_time()
    }

    pub fn frames_since_cycle_start(&self) -> Frames {
        self.backend.frames_since_cycle_start()
    }

    pub fn last_frame_time(&self) -> Frames {
        self.backend.last_frame_time()
    }

    pub fn is_active(&self) -> bool {
        self.lifecycle == Lifecycle::Active
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle == Lifecycle::Closed
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════════

    /// Start processing; a no-op if already active
    pub fn activate(&mut self) -> Result<()> {
        ensure_lifecycle_allowed()?;
        self.admin()?;
        if self.lifecycle == Lifecycle::Active {
            return Ok(());
        }
        let Some(handlers) = self.callbacks.check_out() else {
            return Err(Error::Operation {
                op: "activate",
                code: -1,
            });
        };
        if let Err(ActivationError { error, handlers }) = self.backend.activate(handlers) {
            self.callbacks.check_in(handlers);
            log::warn!("activating '{}' failed: {}", self.name(), error);
            return Err(error);
        }
        self.lifecycle = Lifecycle::Active;
        Ok(())
    }

    /// Stop processing; a no-op if inactive
    pub fn deactivate(&mut self) -> Result<()> {
        ensure_lifecycle_allowed()?;
        self.admin()?;
        if self.lifecycle != Lifecycle::Active {
            return Ok(());
        }
        let handlers = self.backend.deactivate()?;
        self.callbacks.check_in(handlers);
        self.lifecycle = Lifecycle::Inactive;
        Ok(())
    }

    /// Deactivate if needed, drop all ports and disconnect; idempotent
    pub fn close(&mut self) -> Result<()> {
        ensure_lifecycle_allowed()?;
        if self.lifecycle == Lifecycle::Closed {
            return Ok(());
        }
        if self.lifecycle == Lifecycle::Active {
            match self.backend.deactivate() {
                Ok(handlers) => self.callbacks.check_in(handlers),
                Err(e) => log::warn!("deactivate on close of '{}' failed: {}", self.name(), e),
            }
        }
        self.registry.drain();
        self.lifecycle = Lifecycle::Closed;
        self.backend.close()?;
        log::info!("closed client '{}'", self.name());
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Callback registration
    // ═══════════════════════════════════════════════════════════════════════════

    /// Called once per cycle on the process thread; may be replaced while active
    pub fn set_process_callback<F>(&mut self, callback: F) -> Result<()>
    where
        F: FnMut(&ProcessScope) -> Control + Send + 'static,
    {
        self.admin()?;
        self.callbacks.set_process(Box::new(callback))
    }

    /// Called if the server shuts down or drops the client; allowed while active
    pub fn set_shutdown_callback<F>(&mut self, callback: F) -> Result<()>
    where
        F: FnMut(Status, &str) + Send + 'static,
    {
        self.admin()?;
        self.callbacks.set_shutdown(Box::new(callback));
        Ok(())
    }

    pub fn set_buffer_size_callback<F>(&mut self, callback: F) -> Result<()>
    where
        F: FnMut(Frames) -> Control + Send + 'static,
    {
        self.admin()?;
        self.callbacks.set_buffer_size(Box::new(callback))
    }

    pub fn set_sample_rate_callback<F>(&mut self, callback: F) -> Result<()>
    where
        F: FnMut(Frames) -> Control + Send + 'static,
    {
        self.admin()?;
        self.callbacks.set_sample_rate(Box::new(callback))
    }

    pub fn set_client_registration_callback<F>(&mut self, callback: F) -> Result<()>
    where
        F: FnMut(&str, bool) + Send + 'static,
    {
        self.admin()?;
        self.callbacks.set_client_registration(Box::new(callback))
    }

    pub fn set_port_registration_callback<F>(&mut self, callback: F, policy: PortAvailability) -> Result<()>
    where
        F: FnMut(Option<Port>, bool) + Send + 'static,
    {
        self.admin()?;
        self.callbacks.set_port_registration(Box::new(callback), policy)
    }

    pub fn set_port_connect_callback<F>(&mut self, callback: F, policy: PortAvailability) -> Result<()>
    where
        F: FnMut(Option<Port>, Option<Port>, bool) + Send + 'static,
    {
        self.admin()?;
        self.callbacks.set_port_connect(Box::new(callback), policy)
    }

    /// Receives the port, its old name and its new name
    pub fn set_port_rename_callback<F>(&mut self, callback: F, policy: PortAvailability) -> Result<()>
    where
        F: FnMut(Option<Port>, &str, &str) -> Control + Send + 'static,
    {
        self.admin()?;
        self.callbacks.set_port_rename(Box::new(callback), policy)
    }

    pub fn set_graph_order_callback<F>(&mut self, callback: F) -> Result<()>
    where
        F: FnMut() -> Control + Send + 'static,
    {
        self.admin()?;
        self.callbacks.set_graph_order(Box::new(callback))
    }

    /// Receives the delay in microseconds
    pub fn set_xrun_callback<F>(&mut self, callback: F) -> Result<()>
    where
        F: FnMut(f32) -> Control + Send + 'static,
    {
        self.admin()?;
        self.callbacks.set_xrun(Box::new(callback))
    }

    pub fn set_freewheel_callback<F>(&mut self, callback: F) -> Result<()>
    where
        F: FnMut(bool) + Send + 'static,
    {
        self.admin()?;
        self.callbacks.set_freewheel(Box::new(callback))
    }

    pub fn set_property_change_callback<F>(&mut self, callback: F) -> Result<()>
    where
        F: FnMut(Uuid, &str, PropertyChange) + Send + 'static,
    {
        self.admin()?;
        self.callbacks.set_property_change(Box::new(callback))
    }

    /// Take part in slow-sync
    ///
    /// The callback is polled on the process thread until it returns true
    /// for the requested position, or until the sync timeout elapses.
    pub fn set_sync_callback<F>(&mut self, callback: F) -> Result<()>
    where
        F: FnMut(TransportState, &TransportPosition) -> bool + Send + 'static,
    {
        self.admin()?;
        self.callbacks.set_sync(Some(Box::new(callback)))?;
        self.backend.set_slow_sync(true)
    }

    /// Stop taking part in slow-sync
    pub fn clear_sync_callback(&mut self) -> Result<()> {
        self.admin()?;
        self.backend.set_slow_sync(false)?;
        self.callbacks.set_sync(None)
    }

    pub fn set_sync_timeout(&mut self, usecs: Time) -> Result<()> {
        self.admin()?;
        self.backend.set_sync_timeout(usecs)
    }

    /// Become timebase master
    ///
    /// With `conditional`, returns `Ok(false)` without installing anything
    /// if another client already holds the role.
    pub fn set_timebase_callback<F>(&mut self, callback: F, conditional: bool) -> Result<bool>
    where
        F: FnMut(TransportState, Frames, &mut TransportPosition, bool) + Send + 'static,
    {
        self.admin()?;
        if !self.backend.acquire_timebase(conditional)? {
            return Ok(false);
        }
        self.callbacks.set_timebase(Some(Box::new(callback)))?;
        Ok(true)
    }

    /// Give up the timebase role; fails if this client does not hold it
    pub fn release_timebase(&mut self) -> Result<()> {
        self.admin()?;
        self.backend.release_timebase()?;
        self.callbacks.set_timebase(None)
    }

    pub fn set_freewheel(&mut self, on: bool) -> Result<()> {
        self.admin()?;
        self.backend.set_freewheel(on)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Ports
    // ═══════════════════════════════════════════════════════════════════════════

    /// Register a port owned by this client
    ///
    /// `flags` may add physical, terminal or monitor bits; the direction
    /// bits come from `direction`.
    pub fn register_port(
        &mut self,
        short_name: &str,
        kind: PortKind,
        direction: Direction,
        flags: PortFlags,
    ) -> Result<Port> {
        self.admin()?;
        let full_name = format!("{}:{}", self.name(), short_name);
        if self.registry.contains_short_name(short_name) {
            return Err(Error::DuplicatePortName(full_name));
        }
        if full_name.len() > port_name_size() {
            return Err(Error::NameTooLong {
                name: full_name,
                max: port_name_size(),
            });
        }
        let extra = PortFlags::from_bits(
            flags.bits() & !(PortFlags::IS_INPUT.bits() | PortFlags::IS_OUTPUT.bits()),
        );
        let port = self
            .backend
            .register_port(short_name, kind, direction.flag() | extra)?;
        log::debug!("registered {} {} port '{}'", kind, direction, port.name());
        self.registry.insert(port.clone());
        Ok(port)
    }

    pub fn register_audio_in(&mut self, short_name: &str) -> Result<Port> {
        self.register_port(short_name, PortKind::Audio, Direction::Input, PortFlags::empty())
    }

    pub fn register_audio_out(&mut self, short_name: &str) -> Result<Port> {
        self.register_port(short_name, PortKind::Audio, Direction::Output, PortFlags::empty())
    }

    pub fn register_midi_in(&mut self, short_name: &str) -> Result<Port> {
        self.register_port(short_name, PortKind::Midi, Direction::Input, PortFlags::empty())
    }

    pub fn register_midi_out(&mut self, short_name: &str) -> Result<Port> {
        self.register_port(short_name, PortKind::Midi, Direction::Output, PortFlags::empty())
    }

    /// Unregister an owned port; its connections are dropped
    pub fn unregister_port(&mut self, port: &Port) -> Result<()> {
        self.admin()?;
        if !self.registry.contains(port) {
            return Err(ViolationKind::NotOwned.into());
        }
        self.backend.unregister_port(port)?;
        self.registry.remove(port);
        log::debug!("unregistered port '{}'", port.name());
        Ok(())
    }

    /// Unregister every owned port; stops at the first failure
    pub fn unregister_all(&mut self) -> Result<()> {
        let ports: Vec<Port> = self.registry.iter().cloned().collect();
        for port in &ports {
            self.unregister_port(port)?;
        }
        Ok(())
    }

    pub fn owns(&self, port: &Port) -> bool {
        self.registry.contains(port)
    }

    pub fn registry(&self) -> &PortRegistry {
        &self.registry
    }

    pub fn inports(&self) -> &[Port] {
        self.registry.list(PortKind::Audio, Direction::Input)
    }

    pub fn outports(&self) -> &[Port] {
        self.registry.list(PortKind::Audio, Direction::Output)
    }

    pub fn midi_inports(&self) -> &[Port] {
        self.registry.list(PortKind::Midi, Direction::Input)
    }

    pub fn midi_outports(&self) -> &[Port] {
        self.registry.list(PortKind::Midi, Direction::Output)
    }

    /// Rename an owned port; returns the updated port
    pub fn set_port_short_name(&mut self, port: &Port, short_name: &str) -> Result<Port> {
        self.admin()?;
        if !self.registry.contains(port) {
            return Err(ViolationKind::NotOwned.into());
        }
        let full_name = self.backend.rename_port(port, short_name)?;
        self.registry.rename(port.id(), &full_name);
        self.registry
            .find(port.id())
            .cloned()
            .ok_or_else(|| Error::PortNotFound(full_name))
    }

    pub fn port_aliases(&self, port: &Port) -> Result<Vec<String>> {
        self.admin()?;
        self.backend.port_aliases(port)
    }

    /// Add an alias; a port holds at most two
    pub fn set_port_alias(&mut self, port: &Port, alias: &str) -> Result<()> {
        self.admin()?;
        self.backend.set_port_alias(port, alias)
    }

    pub fn unset_port_alias(&mut self, port: &Port, alias: &str) -> Result<()> {
        self.admin()?;
        self.backend.unset_port_alias(port, alias)
    }

    /// Turn input monitoring on or off; requests are counted
    pub fn request_monitor(&mut self, port: &Port, on: bool) -> Result<()> {
        self.admin()?;
        self.backend.request_monitor(port, on)
    }

    pub fn port_monitoring(&self, port: &Port) -> Result<bool> {
        self.admin()?;
        self.backend.monitoring(port)
    }

    /// Look up a port by full name or alias
    pub fn port_by_name(&self, name: &str) -> Option<Port> {
        self.admin().ok()?;
        self.backend.port_by_name(name)
    }

    pub fn ports(&self, filter: &PortFilter) -> Result<Vec<Port>> {
        self.admin()?;
        self.backend.ports(filter)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Connections
    // ═══════════════════════════════════════════════════════════════════════════

    /// Connect an output port to an input port, by full name
    pub fn connect(&mut self, source: &str, destination: &str) -> Result<()> {
        self.admin()?;
        self.backend.connect(source, destination)
    }

    pub fn disconnect(&mut self, source: &str, destination: &str) -> Result<()> {
        self.admin()?;
        self.backend.disconnect(source, destination)
    }

    /// Order two ports as (output, input)
    fn orient<'a>(a: &'a Port, b: &'a Port) -> Result<(&'a Port, &'a Port)> {
        match (a.direction(), b.direction()) {
            (Direction::Output, Direction::Input) => Ok((a, b)),
            (Direction::Input, Direction::Output) => Ok((b, a)),
            _ => Err(Error::InvalidConnection {
                output: a.name().to_string(),
                input: b.name().to_string(),
                reason: "ports have the same direction",
            }),
        }
    }

    /// Connect two ports in whichever order their directions require
    pub fn connect_ports(&mut self, a: &Port, b: &Port) -> Result<()> {
        let (source, destination) = Self::orient(a, b)?;
        self.connect(source.name(), destination.name())
    }

    pub fn disconnect_ports(&mut self, a: &Port, b: &Port) -> Result<()> {
        let (source, destination) = Self::orient(a, b)?;
        self.disconnect(source.name(), destination.name())
    }

    pub fn disconnect_all(&mut self, port: &Port) -> Result<()> {
        self.admin()?;
        self.backend.disconnect_all(port)
    }

    /// Full names of the ports connected to `port`
    pub fn port_connections(&self, port: &Port) -> Result<Vec<String>> {
        self.admin()?;
        self.backend.connections(port)
    }

    pub fn number_of_connections(&self, port: &Port) -> Result<usize> {
        self.port_connections(port).map(|names| names.len())
    }

    pub fn is_connected_to(&self, port: &Port, other: &str) -> Result<bool> {
        Ok(self.port_connections(port)?.iter().any(|name| name == other))
    }

    /// Every connection in the graph as (output, input) names
    pub fn all_connections(&self) -> Result<Vec<(String, String)>> {
        let outputs = self.ports(&PortFilter::new().outputs())?;
        let mut all = Vec::new();
        for output in &outputs {
            for input in self.backend.connections(output)? {
                all.push((output.name().to_string(), input));
            }
        }
        Ok(all)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Transport
    // ═══════════════════════════════════════════════════════════════════════════

    /// Lock-free transport handle, usable from callbacks
    pub fn transport(&self) -> Transport {
        self.transport.clone()
    }

    pub fn transport_start(&self) {
        self.transport.start();
    }

    pub fn transport_stop(&self) {
        self.transport.stop();
    }

    /// Relocate; takes effect within two cycles
    pub fn transport_locate(&self, frame: Frames) -> Result<()> {
        self.transport.locate(frame)
    }

    pub fn transport_reposition(&self, position: &TransportPosition) -> Result<()> {
        self.transport.reposition(position)
    }

    pub fn transport_query(&self) -> Result<(TransportState, TransportPosition)> {
        self.transport.query()
    }

    pub fn transport_state(&self) -> Result<TransportState> {
        self.transport.state()
    }

    /// Estimated current transport frame
    pub fn transport_frame(&self) -> Frames {
        self.transport.current_frame()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Other clients
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn uuid_for_client_name(&self, name: &str) -> Result<Uuid> {
        self.admin()?;
        self.backend.uuid_for_client_name(name)
    }

    pub fn client_name_by_uuid(&self, uuid: Uuid) -> Result<String> {
        self.admin()?;
        self.backend.client_name_by_uuid(uuid)
    }

    pub fn client_pid(&self, name: &str) -> Option<u32> {
        self.admin().ok()?;
        self.backend.client_pid(name)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Metadata
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn set_property(&mut self, subject: Uuid, key: &str, property: Property) -> Result<()> {
        self.admin()?;
        self.backend.set_property(subject, key, property)
    }

    pub fn property(&self, subject: Uuid, key: &str) -> Result<Option<Property>> {
        self.admin()?;
        self.backend.property(subject, key)
    }

    pub fn properties(&self, subject: Uuid) -> Result<Description> {
        self.admin()?;
        self.backend.properties(subject)
    }

    pub fn all_properties(&self) -> Result<BTreeMap<Uuid, Description>> {
        self.admin()?;
        self.backend.all_properties()
    }

    /// Fails if the property does not exist
    pub fn remove_property(&mut self, subject: Uuid, key: &str) -> Result<()> {
        self.admin()?;
        self.backend.remove_property(subject, key)
    }

    /// Returns the number of properties removed
    pub fn remove_properties(&mut self, subject: Uuid) -> Result<usize> {
        self.admin()?;
        self.backend.remove_properties(subject)
    }

    pub fn remove_all_properties(&mut self) -> Result<()> {
        self.admin()?;
        self.backend.remove_all_properties()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("closing '{}' on drop failed: {}", self.backend.name(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_overrides() {
        let env = |key: &str| match key {
            ENV_NO_START_SERVER => Some(String::new()),
            ENV_DEFAULT_SERVER => Some("studio".to_string()),
            _ => None,
        };
        let options = ClientOptions::default().apply_env(env);
        assert!(options.no_start_server);
        assert_eq!(options.server_name.as_deref(), Some("studio"));

        let explicit = ClientOptions {
            server_name: Some("live".to_string()),
            ..Default::default()
        }
        .apply_env(env);
        assert_eq!(explicit.server_name.as_deref(), Some("live"));
    }

    #[test]
    fn test_options_from_config() {
        let config = ClientConfig {
            name: "rec".to_string(),
            use_exact_name: true,
            session_id: Some("abc".to_string()),
            ..Default::default()
        };
        let options = ClientOptions::from(&config);
        assert!(options.use_exact_name);
        assert_eq!(options.session_id.as_deref(), Some("abc"));
    }
}
