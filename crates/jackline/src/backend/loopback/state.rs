//! Server-side tables of the loopback server
//!
//! Everything here runs under the server lock. The tables mirror what a
//! remote server keeps:
//!
//! ```text
//!  clients      id ─► name, uuid, activity, handlers, slow-sync flags
//!  ports        id ─► full name, owner, kind, flags, aliases, buffer
//!  connections  (output id, input id)
//!  order        active clients, topologically sorted along connections
//! ```

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use super::engine::{TransportEngine, TransportShared};
use super::notify::Notification;
use crate::callbacks::{Handlers, NotificationHandlers, RealtimeHandlers};
use crate::client::ClientOptions;
use crate::config::{LoopbackConfig, MAX_BUFFER_SIZE};
use crate::error::{Error, Result, Status, ViolationKind, EINVAL};
use crate::metadata::{PropertyChange, PropertyStore};
use crate::port::{Ownership, Port, PortFilter};
use crate::process::{BufferSource, PortBuffer, PortData, ProcessScope};
use crate::transport::TransportState;
use crate::types::{
    client_name_size, port_name_size, Direction, Frames, PortFlags, PortId, PortKind, Uuid,
    MAX_PORT_ALIASES,
};

pub(crate) type ClientId = u32;

/// Notifications kept per server before the oldest are dropped
const NOTIFICATION_BACKLOG: usize = 4096;

pub(crate) struct ClientRecord {
    pub(crate) name: String,
    pub(crate) uuid: Uuid,
    pub(crate) active: bool,
    /// Server went away underneath this client
    pub(crate) zombie: bool,
    pub(crate) realtime: Option<RealtimeHandlers>,
    pub(crate) notifications: Option<NotificationHandlers>,
    pub(crate) slow_sync: bool,
    /// Sync callback has not reported ready for the current position
    pub(crate) sync_poll: bool,
    /// Owned input ports, in registration order
    pub(crate) inputs: Vec<PortId>,
    /// Ports this client has seen, for resolving notifications late
    pub(crate) known_ports: BTreeMap<PortId, Port>,
}

pub(crate) struct PortRecord {
    pub(crate) name: String,
    pub(crate) owner: ClientId,
    pub(crate) kind: PortKind,
    pub(crate) flags: PortFlags,
    pub(crate) uuid: Uuid,
    pub(crate) aliases: Vec<String>,
    pub(crate) monitor_requests: u32,
    pub(crate) buffer: PortBuffer,
}

impl PortRecord {
    fn view(&self, id: PortId, viewer: ClientId) -> Port {
        let ownership = if self.owner == viewer {
            Ownership::Owned
        } else {
            Ownership::External
        };
        Port::new(id, self.name.clone(), self.kind, self.flags, self.uuid, ownership)
    }
}

/// Buffers of one client's ports, as seen by its process callback
struct ClientBuffers<'a> {
    ports: &'a BTreeMap<PortId, PortRecord>,
    client: ClientId,
}

impl BufferSource for ClientBuffers<'_> {
    fn port_buffer(&self, id: PortId) -> Option<&PortBuffer> {
        self.ports
            .get(&id)
            .filter(|record| record.owner == self.client)
            .map(|record| &record.buffer)
    }
}

/// Outcome of one server cycle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleReport {
    /// Frames processed; 0 if the server is shut down
    pub n_frames: Frames,
    /// Frame time at the start of the cycle
    pub frame_time: Frames,
    /// Transport state during the cycle
    pub transport: TransportState,
    /// Active clients whose process callback ran
    pub clients_run: usize,
    pub xrun: bool,
}

pub(crate) struct ServerState {
    pub(crate) config: LoopbackConfig,
    pub(crate) running: bool,
    pub(crate) sample_rate: Frames,
    pub(crate) buffer_size: Frames,
    pub(crate) freewheel: bool,
    pub(crate) frame_time: Frames,
    pub(crate) cpu_load: f32,
    next_client: ClientId,
    next_port: u32,
    next_uuid: u64,
    pub(crate) clients: BTreeMap<ClientId, ClientRecord>,
    pub(crate) ports: BTreeMap<PortId, PortRecord>,
    pub(crate) connections: BTreeSet<(PortId, PortId)>,
    pub(crate) properties: PropertyStore,
    pub(crate) notifications: VecDeque<(ClientId, Notification)>,
    pub(crate) engine: TransportEngine,
    pub(crate) order: Vec<ClientId>,
}

impl ServerState {
    pub(crate) fn new(config: LoopbackConfig, transport: Arc<TransportShared>) -> Self {
        let engine = TransportEngine::new(transport, config.sample_rate, config.sync_timeout_us);
        ServerState {
            running: true,
            sample_rate: config.sample_rate,
            buffer_size: config.buffer_size,
            freewheel: false,
            frame_time: 0,
            cpu_load: 0.0,
            next_client: 1,
            next_port: 1,
            next_uuid: 1,
            clients: BTreeMap::new(),
            ports: BTreeMap::new(),
            connections: BTreeSet::new(),
            properties: PropertyStore::new(),
            notifications: VecDeque::new(),
            engine,
            order: Vec::new(),
            config,
        }
    }

    fn allocate_uuid(&mut self) -> Uuid {
        let uuid = Uuid(self.next_uuid);
        self.next_uuid += 1;
        uuid
    }

    /// Queue a notification for every active client
    pub(crate) fn notify(&mut self, note: Notification) {
        for (id, client) in &self.clients {
            if client.active {
                if self.notifications.len() >= NOTIFICATION_BACKLOG {
                    log::warn!("notification backlog full; dropping oldest");
                    self.notifications.pop_front();
                }
                self.notifications.push_back((*id, note.clone()));
            }
        }
    }

    /// A client that exists and whose server is still up
    fn live_client(&self, client: ClientId, op: &'static str) -> Result<&ClientRecord> {
        match self.clients.get(&client) {
            None => Err(ViolationKind::ClientClosed.into()),
            Some(record) if record.zombie => Err(Error::Operation { op, code: -1 }),
            Some(record) => Ok(record),
        }
    }

    pub(crate) fn client_by_name(&self, name: &str) -> Option<(ClientId, &ClientRecord)> {
        self.clients
            .iter()
            .find(|(_, record)| !record.zombie && record.name == name)
            .map(|(id, record)| (*id, record))
    }

    pub(crate) fn port_id_by_name(&self, name: &str) -> Option<PortId> {
        self.ports
            .iter()
            .find(|(_, record)| record.name == name || record.aliases.iter().any(|a| a == name))
            .map(|(id, _)| *id)
    }

    /// Current view of a port for `viewer`, remembering it for later
    pub(crate) fn port_view(&mut self, id: PortId, viewer: ClientId) -> Option<Port> {
        let port = self.ports.get(&id)?.view(id, viewer);
        if let Some(client) = self.clients.get_mut(&viewer) {
            client.known_ports.insert(id, port.clone());
        }
        Some(port)
    }

    /// Resolve a port for a notification; vanished ports come from the cache
    pub(crate) fn resolve_port(&mut self, id: PortId, viewer: ClientId) -> Option<Port> {
        self.port_view(id, viewer).or_else(|| {
            self.clients
                .get(&viewer)
                .and_then(|client| client.known_ports.get(&id).cloned())
        })
    }

    // ───────────────────────────────────────────────────────────────────────
    // Clients
    // ───────────────────────────────────────────────────────────────────────

    fn unique_name(&self, name: &str) -> Option<String> {
        let max = client_name_size();
        let mut base = name.to_string();
        while base.len() + 3 > max {
            base.pop();
        }
        (1..=99)
            .map(|n| format!("{}-{:02}", base, n))
            .find(|candidate| self.client_by_name(candidate).is_none())
    }

    /// Admit a new client; returns its id, actual name and open status
    pub(crate) fn open_client(
        &mut self,
        name: &str,
        options: &ClientOptions,
    ) -> std::result::Result<(ClientId, String, Status), Status> {
        let mut status = Status::empty();

        if let Some(wanted) = options.server_name.as_deref() {
            if wanted != self.config.name {
                log::debug!("no server named '{}'", wanted);
                return Err(Status::FAILURE | Status::SERVER_FAILED);
            }
        }
        if !self.running {
            if options.no_start_server {
                return Err(Status::FAILURE | Status::SERVER_FAILED);
            }
            self.restart();
            status |= Status::SERVER_STARTED;
        }
        // ':' separates client and port in full port names
        if name.is_empty() || name.len() > client_name_size() || name.contains(':') {
            return Err(Status::FAILURE | Status::INVALID_OPTION);
        }

        let actual = if self.client_by_name(name).is_none() {
            name.to_string()
        } else if options.use_exact_name {
            return Err(Status::FAILURE | Status::NAME_NOT_UNIQUE);
        } else {
            status |= Status::NAME_NOT_UNIQUE;
            self.unique_name(name)
                .ok_or(Status::FAILURE | Status::NAME_NOT_UNIQUE)?
        };
        if let Some(session) = options.session_id.as_deref() {
            log::debug!("client '{}' opened for session {}", actual, session);
        }

        let id = self.next_client;
        self.next_client += 1;
        let uuid = self.allocate_uuid();
        self.clients.insert(
            id,
            ClientRecord {
                name: actual.clone(),
                uuid,
                active: false,
                zombie: false,
                realtime: None,
                notifications: None,
                slow_sync: false,
                sync_poll: false,
                inputs: Vec::new(),
                known_ports: BTreeMap::new(),
            },
        );
        self.notify(Notification::ClientRegistration {
            name: actual.clone(),
            registered: true,
        });
        Ok((id, actual, status))
    }

    fn restart(&mut self) {
        log::info!("loopback server '{}' started", self.config.name);
        self.running = true;
        self.freewheel = false;
    }

    pub(crate) fn activate(&mut self, client: ClientId, handlers: Handlers) -> std::result::Result<(), (Error, Handlers)> {
        let record = match self.live_client(client, "activate") {
            Ok(record) => record,
            Err(error) => return Err((error, handlers)),
        };
        if record.active {
            return Err((Error::Operation { op: "activate", code: -1 }, handlers));
        }
        let Some(record) = self.clients.get_mut(&client) else {
            return Err((ViolationKind::ClientClosed.into(), handlers));
        };
        record.active = true;
        record.sync_poll = record.slow_sync;
        record.realtime = Some(handlers.realtime);
        record.notifications = Some(handlers.notifications);
        log::info!("client '{}' activated", record.name);
        self.engine.client_activated(client);
        self.graph_changed();
        Ok(())
    }

    pub(crate) fn deactivate(&mut self, client: ClientId) -> Result<Handlers> {
        let record = self
            .clients
            .get_mut(&client)
            .ok_or(ViolationKind::ClientClosed)?;
        if record.realtime.is_none() || record.notifications.is_none() {
            return Err(ViolationKind::NotActive.into());
        }
        let (Some(realtime), Some(notifications)) = (record.realtime.take(), record.notifications.take()) else {
            return Err(ViolationKind::NotActive.into());
        };
        let was_active = std::mem::replace(&mut record.active, false);
        record.sync_poll = false;
        log::info!("client '{}' deactivated", record.name);

        self.notifications.retain(|(target, _)| *target != client);
        if was_active {
            let owned: Vec<PortId> = self.owned_ports(client);
            for port in owned {
                self.drop_connections(port);
            }
            self.graph_changed();
        }
        Ok(Handlers {
            realtime,
            notifications,
        })
    }

    pub(crate) fn close(&mut self, client: ClientId) {
        if self.clients.get(&client).map_or(false, |record| record.active) {
            let _ = self.deactivate(client);
        }
        for port in self.owned_ports(client) {
            self.remove_port(port);
        }
        self.engine.release_timebase(client);
        self.notifications.retain(|(target, _)| *target != client);
        if let Some(record) = self.clients.remove(&client) {
            log::info!("client '{}' closed", record.name);
            if !record.zombie {
                self.notify(Notification::ClientRegistration {
                    name: record.name,
                    registered: false,
                });
            }
        }
    }

    fn owned_ports(&self, client: ClientId) -> Vec<PortId> {
        self.ports
            .iter()
            .filter(|(_, record)| record.owner == client)
            .map(|(id, _)| *id)
            .collect()
    }

    // ───────────────────────────────────────────────────────────────────────
    // Ports
    // ───────────────────────────────────────────────────────────────────────

    pub(crate) fn register_port(
        &mut self,
        client: ClientId,
        short_name: &str,
        kind: PortKind,
        flags: PortFlags,
    ) -> Result<Port> {
        let owner = self.live_client(client, "port register")?;
        let direction = flags.direction().ok_or(Error::Operation {
            op: "port register",
            code: EINVAL,
        })?;
        if short_name.is_empty() {
            return Err(Error::Operation {
                op: "port register",
                code: EINVAL,
            });
        }
        let full_name = format!("{}:{}", owner.name, short_name);
        if full_name.len() > port_name_size() {
            return Err(Error::NameTooLong {
                name: full_name,
                max: port_name_size(),
            });
        }
        if self.port_id_by_name(&full_name).is_some() {
            return Err(Error::DuplicatePortName(full_name));
        }

        let id = PortId(self.next_port);
        self.next_port += 1;
        let uuid = self.allocate_uuid();
        self.ports.insert(
            id,
            PortRecord {
                name: full_name,
                owner: client,
                kind,
                flags,
                uuid,
                aliases: Vec::new(),
                monitor_requests: 0,
                buffer: PortBuffer::new(id, kind, direction, self.buffer_size),
            },
        );
        if let (Direction::Input, Some(record)) = (direction, self.clients.get_mut(&client)) {
            record.inputs.push(id);
        }
        self.notify(Notification::PortRegistration {
            port: id,
            registered: true,
        });
        self.port_view(id, client).ok_or_else(|| Error::PortNotFound(short_name.to_string()))
    }

    /// Check that `client` owns the port behind `port`
    fn owned_port(&self, client: ClientId, port: &Port, op: &'static str) -> Result<PortId> {
        self.live_client(client, op)?;
        let record = self
            .ports
            .get(&port.id())
            .ok_or_else(|| Error::PortNotFound(port.name().to_string()))?;
        if record.owner != client {
            return Err(ViolationKind::NotOwned.into());
        }
        Ok(port.id())
    }

    pub(crate) fn unregister_port(&mut self, client: ClientId, port: &Port) -> Result<()> {
        let id = self.owned_port(client, port, "port unregister")?;
        self.remove_port(id);
        Ok(())
    }

    fn remove_port(&mut self, id: PortId) {
        self.drop_connections(id);
        let Some(record) = self.ports.remove(&id) else {
            return;
        };
        if let Some(owner) = self.clients.get_mut(&record.owner) {
            owner.inputs.retain(|input| *input != id);
        }
        log::debug!("port '{}' unregistered", record.name);
        self.notify(Notification::PortRegistration {
            port: id,
            registered: false,
        });
    }

    pub(crate) fn rename_port(&mut self, client: ClientId, port: &Port, short_name: &str) -> Result<String> {
        let id = self.owned_port(client, port, "port rename")?;
        if short_name.is_empty() {
            return Err(Error::Operation {
                op: "port rename",
                code: EINVAL,
            });
        }
        let owner_name = self
            .clients
            .get(&client)
            .map(|record| record.name.clone())
            .unwrap_or_default();
        let full_name = format!("{}:{}", owner_name, short_name);
        if full_name.len() > port_name_size() {
            return Err(Error::NameTooLong {
                name: full_name,
                max: port_name_size(),
            });
        }
        if self.port_id_by_name(&full_name).is_some_and(|other| other != id) {
            return Err(Error::DuplicatePortName(full_name));
        }
        let Some(record) = self.ports.get_mut(&id) else {
            return Err(Error::PortNotFound(port.name().to_string()));
        };
        let old = std::mem::replace(&mut record.name, full_name.clone());
        self.notify(Notification::PortRename {
            port: id,
            old,
            new: full_name.clone(),
        });
        Ok(full_name)
    }

    fn port_record(&self, port: &Port) -> Result<&PortRecord> {
        self.ports
            .get(&port.id())
            .ok_or_else(|| Error::PortNotFound(port.name().to_string()))
    }

    pub(crate) fn port_aliases(&self, port: &Port) -> Result<Vec<String>> {
        Ok(self.port_record(port)?.aliases.clone())
    }

    pub(crate) fn set_port_alias(&mut self, port: &Port, alias: &str) -> Result<()> {
        let record = self
            .ports
            .get_mut(&port.id())
            .ok_or_else(|| Error::PortNotFound(port.name().to_string()))?;
        if record.aliases.iter().any(|a| a == alias) {
            return Ok(());
        }
        if record.aliases.len() >= MAX_PORT_ALIASES {
            return Err(Error::Operation {
                op: "port set alias",
                code: -1,
            });
        }
        record.aliases.push(alias.to_string());
        Ok(())
    }

    pub(crate) fn unset_port_alias(&mut self, port: &Port, alias: &str) -> Result<()> {
        let record = self
            .ports
            .get_mut(&port.id())
            .ok_or_else(|| Error::PortNotFound(port.name().to_string()))?;
        let before = record.aliases.len();
        record.aliases.retain(|a| a != alias);
        if record.aliases.len() == before {
            return Err(Error::Operation {
                op: "port unset alias",
                code: -1,
            });
        }
        Ok(())
    }

    pub(crate) fn request_monitor(&mut self, port: &Port, on: bool) -> Result<()> {
        let record = self
            .ports
            .get_mut(&port.id())
            .ok_or_else(|| Error::PortNotFound(port.name().to_string()))?;
        if on {
            record.monitor_requests += 1;
        } else {
            record.monitor_requests = record.monitor_requests.saturating_sub(1);
        }
        Ok(())
    }

    pub(crate) fn monitoring(&self, port: &Port) -> Result<bool> {
        Ok(self.port_record(port)?.monitor_requests > 0)
    }

    pub(crate) fn ports(&mut self, filter: &PortFilter, viewer: ClientId) -> Result<Vec<Port>> {
        let matcher = filter.compile()?;
        let ids: Vec<PortId> = self
            .ports
            .iter()
            .filter(|(_, record)| matcher.matches(&record.name, record.kind, record.flags))
            .map(|(id, _)| *id)
            .collect();
        Ok(ids
            .into_iter()
            .filter_map(|id| self.port_view(id, viewer))
            .collect())
    }

    // ───────────────────────────────────────────────────────────────────────
    // Graph
    // ───────────────────────────────────────────────────────────────────────

    pub(crate) fn connect(&mut self, client: ClientId, source: &str, destination: &str) -> Result<()> {
        self.live_client(client, "connect")?;
        let (src, dst) = self.check_pair(source, destination)?;
        if !self.connections.insert((src, dst)) {
            return Err(Error::AlreadyExists {
                output: source.to_string(),
                input: destination.to_string(),
            });
        }
        log::debug!("connected {} -> {}", source, destination);
        self.notify(Notification::PortConnect {
            a: src,
            b: dst,
            connected: true,
        });
        self.graph_changed();
        Ok(())
    }

    fn check_pair(&self, source: &str, destination: &str) -> Result<(PortId, PortId)> {
        let src = self
            .port_id_by_name(source)
            .ok_or_else(|| Error::PortNotFound(source.to_string()))?;
        let dst = self
            .port_id_by_name(destination)
            .ok_or_else(|| Error::PortNotFound(destination.to_string()))?;
        let invalid = |reason| Error::InvalidConnection {
            output: source.to_string(),
            input: destination.to_string(),
            reason,
        };
        let (Some(s), Some(d)) = (self.ports.get(&src), self.ports.get(&dst)) else {
            return Err(Error::PortNotFound(source.to_string()));
        };
        if !s.flags.contains(PortFlags::IS_OUTPUT) || !d.flags.contains(PortFlags::IS_INPUT) {
            return Err(invalid("source must be an output and destination an input"));
        }
        if s.kind != d.kind {
            return Err(invalid("port types differ"));
        }
        let active = |owner: ClientId| self.clients.get(&owner).map_or(false, |c| c.active);
        if !active(s.owner) || !active(d.owner) {
            return Err(invalid("owning client is not active"));
        }
        Ok((src, dst))
    }

    pub(crate) fn disconnect(&mut self, client: ClientId, source: &str, destination: &str) -> Result<()> {
        self.live_client(client, "disconnect")?;
        let src = self
            .port_id_by_name(source)
            .ok_or_else(|| Error::PortNotFound(source.to_string()))?;
        let dst = self
            .port_id_by_name(destination)
            .ok_or_else(|| Error::PortNotFound(destination.to_string()))?;
        if !self.connections.remove(&(src, dst)) {
            return Err(Error::NoSuchConnection {
                output: source.to_string(),
                input: destination.to_string(),
            });
        }
        log::debug!("disconnected {} -> {}", source, destination);
        self.notify(Notification::PortConnect {
            a: src,
            b: dst,
            connected: false,
        });
        self.graph_changed();
        Ok(())
    }

    pub(crate) fn disconnect_all(&mut self, client: ClientId, port: &Port) -> Result<()> {
        self.live_client(client, "disconnect")?;
        self.port_record(port)?;
        if self.drop_connections(port.id()) {
            self.graph_changed();
        }
        Ok(())
    }

    /// Remove every connection of `port`; returns true if any existed
    fn drop_connections(&mut self, port: PortId) -> bool {
        let affected: Vec<(PortId, PortId)> = self
            .connections
            .iter()
            .filter(|(src, dst)| *src == port || *dst == port)
            .copied()
            .collect();
        for (src, dst) in &affected {
            self.connections.remove(&(*src, *dst));
            self.notify(Notification::PortConnect {
                a: *src,
                b: *dst,
                connected: false,
            });
        }
        !affected.is_empty()
    }

    pub(crate) fn connections(&self, port: &Port) -> Result<Vec<String>> {
        self.port_record(port)?;
        let id = port.id();
        Ok(self
            .connections
            .iter()
            .filter_map(|(src, dst)| match (*src == id, *dst == id) {
                (true, _) => self.ports.get(dst),
                (_, true) => self.ports.get(src),
                _ => None,
            })
            .map(|record| record.name.clone())
            .collect())
    }

    fn graph_changed(&mut self) {
        self.order = self.processing_order();
        self.notify(Notification::GraphOrder);
    }

    /// Active clients sorted so that every client runs after the clients
    /// feeding it; ties go to the lower id, feedback loops run last
    fn processing_order(&self) -> Vec<ClientId> {
        let mut indegree: BTreeMap<ClientId, usize> = self
            .clients
            .iter()
            .filter(|(_, record)| record.active)
            .map(|(id, _)| (*id, 0))
            .collect();
        let edges: BTreeSet<(ClientId, ClientId)> = self
            .connections
            .iter()
            .filter_map(|(src, dst)| {
                let from = self.ports.get(src)?.owner;
                let to = self.ports.get(dst)?.owner;
                let linked = from != to && indegree.contains_key(&from) && indegree.contains_key(&to);
                linked.then_some((from, to))
            })
            .collect();
        for (_, to) in &edges {
            if let Some(count) = indegree.get_mut(to) {
                *count += 1;
            }
        }

        let mut ready: BTreeSet<ClientId> = indegree
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(indegree.len());
        while let Some(client) = ready.pop_first() {
            order.push(client);
            for (_, to) in edges.range((client, ClientId::MIN)..=(client, ClientId::MAX)) {
                if let Some(count) = indegree.get_mut(to) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(*to);
                    }
                }
            }
        }
        for client in indegree.keys() {
            if !order.contains(client) {
                order.push(*client);
            }
        }
        order
    }

    // ───────────────────────────────────────────────────────────────────────
    // Engine parameters
    // ───────────────────────────────────────────────────────────────────────

    pub(crate) fn set_buffer_size(&mut self, nframes: Frames) -> Result<()> {
        if nframes == 0 || !nframes.is_power_of_two() || nframes > MAX_BUFFER_SIZE {
            return Err(Error::Operation {
                op: "set buffer size",
                code: EINVAL,
            });
        }
        if nframes == self.buffer_size {
            return Ok(());
        }
        log::info!("buffer size {} -> {}", self.buffer_size, nframes);
        self.buffer_size = nframes;
        for record in self.ports.values_mut() {
            record.buffer.resize(nframes);
        }
        self.engine.shared.set_rates(self.sample_rate, nframes);
        for client in self.clients.values_mut().filter(|c| c.active) {
            if let Some(realtime) = client.realtime.as_mut() {
                realtime.buffer_size(nframes);
            }
        }
        Ok(())
    }

    pub(crate) fn set_sample_rate(&mut self, rate: Frames) {
        if rate == 0 || rate == self.sample_rate {
            return;
        }
        log::info!("sample rate {} -> {}", self.sample_rate, rate);
        self.sample_rate = rate;
        self.engine.set_frame_rate(rate);
        self.engine.shared.set_rates(rate, self.buffer_size);
        self.notify(Notification::SampleRate { rate });
    }

    pub(crate) fn set_freewheel(&mut self, client: ClientId, on: bool) -> Result<()> {
        self.live_client(client, "set freewheel")?;
        if self.freewheel != on {
            self.freewheel = on;
            log::info!("freewheel {}", if on { "on" } else { "off" });
            self.notify(Notification::Freewheel { starting: on });
        }
        Ok(())
    }

    pub(crate) fn set_slow_sync(&mut self, client: ClientId, enabled: bool) -> Result<()> {
        self.live_client(client, "set sync callback")?;
        if let Some(record) = self.clients.get_mut(&client) {
            record.slow_sync = enabled;
            record.sync_poll = enabled && record.active;
        }
        Ok(())
    }

    /// Tear everything down as a dying server would
    pub(crate) fn shutdown(&mut self, reason: &str) {
        if !self.running {
            return;
        }
        log::warn!("loopback server '{}' shutting down: {}", self.config.name, reason);
        self.running = false;
        self.notifications.clear();
        self.connections.clear();
        self.properties.clear();
        self.ports.clear();
        self.order.clear();
        let clients: Vec<ClientId> = self.clients.keys().copied().collect();
        for id in clients {
            self.engine.release_timebase(id);
            let Some(record) = self.clients.get_mut(&id) else {
                continue;
            };
            record.zombie = true;
            record.active = false;
            record.inputs.clear();
            if let Some(handlers) = record.notifications.as_mut() {
                handlers.shutdown(Status::FAILURE | Status::SERVER_ERROR, reason);
            }
        }
    }

    // ───────────────────────────────────────────────────────────────────────
    // Metadata
    // ───────────────────────────────────────────────────────────────────────

    pub(crate) fn property_changed(&mut self, subject: Uuid, key: &str, change: PropertyChange) {
        self.notify(Notification::PropertyChange {
            subject,
            key: key.to_string(),
            change,
        });
    }

    // ───────────────────────────────────────────────────────────────────────
    // Cycle
    // ───────────────────────────────────────────────────────────────────────

    /// Run one process cycle over all active clients
    pub(crate) fn run_cycle(&mut self) -> CycleReport {
        let nframes = self.buffer_size;
        let frame_time = self.frame_time;
        if !self.running {
            return CycleReport {
                n_frames: 0,
                frame_time,
                transport: self.engine.state(),
                clients_run: 0,
                xrun: false,
            };
        }
        let started = Instant::now();
        let cycle_usecs = nframes as u64 * 1_000_000 / self.sample_rate.max(1) as u64;
        self.engine.shared.mark_cycle_start(frame_time);

        for client in self.clients.values_mut().filter(|c| c.active) {
            if let Some(realtime) = client.realtime.as_mut() {
                realtime.apply_pending();
            }
        }

        let order = std::mem::take(&mut self.order);
        self.engine.begin_cycle(&mut self.clients, &order, cycle_usecs);
        let transport = self.engine.state();

        let mut clients_run = 0;
        for &id in &order {
            if !self.clients.get(&id).map_or(false, |c| c.active) {
                continue;
            }
            self.mix_inputs(id);
            for record in self.ports.values_mut().filter(|r| r.owner == id) {
                record.buffer.begin_cycle();
            }

            let buffers = ClientBuffers {
                ports: &self.ports,
                client: id,
            };
            let scope = ProcessScope::new(nframes, frame_time, &buffers);
            if let Some(realtime) = self.clients.get_mut(&id).and_then(|c| c.realtime.as_mut()) {
                realtime.process(&scope);
                if self.engine.master() == Some(id) {
                    self.engine.run_timebase(realtime, nframes);
                }
                clients_run += 1;
            }
        }
        self.order = order;

        self.engine.end_cycle(nframes, cycle_usecs);
        self.frame_time = frame_time.wrapping_add(nframes);

        let elapsed_usecs = started.elapsed().as_micros() as u64;
        let load = elapsed_usecs as f32 * 100.0 / cycle_usecs.max(1) as f32;
        self.cpu_load = self.cpu_load * 0.9 + load * 0.1;
        let xrun = self.config.detect_xruns && !self.freewheel && elapsed_usecs > cycle_usecs;
        if xrun {
            self.notify(Notification::Xrun {
                delayed_usecs: (elapsed_usecs - cycle_usecs) as f32,
            });
        }

        CycleReport {
            n_frames: nframes,
            frame_time,
            transport,
            clients_run,
            xrun,
        }
    }

    /// Fill the input buffers of `client` from connected outputs
    fn mix_inputs(&mut self, client: ClientId) {
        let Some(record) = self.clients.get(&client) else {
            return;
        };
        for &input in &record.inputs {
            let Some(target) = self.ports.get_mut(&input) else {
                continue;
            };
            // Taken out so the sources can be read while it is filled
            let mut data = std::mem::replace(target.buffer.data_mut(), PortData::AudioIn(Vec::new()));
            let ports = &self.ports;
            let sources = self
                .connections
                .iter()
                .filter(|(_, dst)| *dst == input)
                .filter_map(|(src, _)| ports.get(src))
                .map(|source| source.buffer.data());
            match &mut data {
                PortData::AudioIn(samples) => {
                    samples.iter_mut().for_each(|s| *s = 0.0);
                    for source in sources {
                        if let PortData::AudioOut(out) = source {
                            for (sample, value) in samples.iter_mut().zip(out.borrow().iter()) {
                                *sample += *value;
                            }
                        }
                    }
                }
                PortData::MidiIn(events) => {
                    events.clear();
                    for source in sources {
                        if let PortData::MidiOut(out) = source {
                            events.append(&out.borrow());
                        }
                    }
                    events.sort_by_time();
                }
                _ => {}
            }
            if let Some(target) = self.ports.get_mut(&input) {
                *target.buffer.data_mut() = data;
            }
        }
    }
}
