//! One client connection to the loopback server

use std::collections::BTreeMap;
use std::sync::{Arc, MutexGuard};

use super::engine::LoopbackTransport;
use super::state::{ClientId, ServerState};
use super::Shared;
use crate::backend::{ActivationError, Backend};
use crate::callbacks::Handlers;
use crate::error::{Error, Result, ViolationKind};
use crate::metadata::{Description, Property, PropertyChange};
use crate::port::{Port, PortFilter};
use crate::transport::TransportControl;
use crate::types::{Frames, PortFlags, PortKind, Time, Uuid};

pub(crate) struct LoopbackSession {
    shared: Arc<Shared>,
    id: ClientId,
    name: String,
    transport: Arc<LoopbackTransport>,
}

impl LoopbackSession {
    pub(crate) fn new(shared: Arc<Shared>, id: ClientId, name: String) -> Self {
        let transport = Arc::new(LoopbackTransport::new(shared.transport.clone()));
        LoopbackSession {
            shared,
            id,
            name,
            transport,
        }
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.shared.state()
    }

    fn running(&self) -> Result<MutexGuard<'_, ServerState>> {
        let state = self.state();
        let refused: Option<Error> = match state.clients.get(&self.id) {
            None => Some(ViolationKind::ClientClosed.into()),
            Some(record) if record.zombie => Some(Error::Operation {
                op: "server call",
                code: -1,
            }),
            Some(_) => None,
        };
        match refused {
            Some(error) => Err(error),
            None => Ok(state),
        }
    }
}

impl Backend for LoopbackSession {
    fn name(&self) -> &str {
        &self.name
    }

    fn uuid(&self) -> Result<Uuid> {
        self.state()
            .clients
            .get(&self.id)
            .map(|record| record.uuid)
            .ok_or_else(|| ViolationKind::ClientClosed.into())
    }

    fn sample_rate(&self) -> Frames {
        self.state().sample_rate
    }

    fn buffer_size(&self) -> Frames {
        self.state().buffer_size
    }

    fn set_buffer_size(&mut self, nframes: Frames) -> Result<()> {
        self.running()?.set_buffer_size(nframes)
    }

    fn is_realtime(&self) -> bool {
        self.state().config.realtime
    }

    fn cpu_load(&self) -> f32 {
        self.state().cpu_load
    }

    fn frame_time(&self) -> Frames {
        self.shared.transport.frame_time()
    }

    fn frames_since_cycle_start(&self) -> Frames {
        self.shared.transport.frames_since_cycle_start()
    }

    fn last_frame_time(&self) -> Frames {
        self.shared.transport.last_frame_time()
    }

    fn activate(&mut self, handlers: Handlers) -> std::result::Result<(), ActivationError> {
        self.state()
            .activate(self.id, handlers)
            .map_err(|(error, handlers)| ActivationError { error, handlers })
    }

    fn deactivate(&mut self) -> Result<Handlers> {
        let _dispatch = self.shared.dispatch_lock();
        self.state().deactivate(self.id)
    }

    fn close(&mut self) -> Result<()> {
        let _dispatch = self.shared.dispatch_lock();
        self.state().close(self.id);
        Ok(())
    }

    fn register_port(&mut self, short_name: &str, kind: PortKind, flags: PortFlags) -> Result<Port> {
        self.state().register_port(self.id, short_name, kind, flags)
    }

    fn unregister_port(&mut self, port: &Port) -> Result<()> {
        self.state().unregister_port(self.id, port)
    }

    fn rename_port(&mut self, port: &Port, short_name: &str) -> Result<String> {
        self.state().rename_port(self.id, port, short_name)
    }

    fn port_aliases(&self, port: &Port) -> Result<Vec<String>> {
        self.running()?.port_aliases(port)
    }

    fn set_port_alias(&mut self, port: &Port, alias: &str) -> Result<()> {
        self.running()?.set_port_alias(port, alias)
    }

    fn unset_port_alias(&mut self, port: &Port, alias: &str) -> Result<()> {
        self.running()?.unset_port_alias(port, alias)
    }

    fn request_monitor(&mut self, port: &Port, on: bool) -> Result<()> {
        self.running()?.request_monitor(port, on)
    }

    fn monitoring(&self, port: &Port) -> Result<bool> {
        self.running()?.monitoring(port)
    }

    fn port_by_name(&self, name: &str) -> Option<Port> {
        let mut state = self.state();
        let id = state.port_id_by_name(name)?;
        state.port_view(id, self.id)
    }

    fn ports(&self, filter: &PortFilter) -> Result<Vec<Port>> {
        self.running()?.ports(filter, self.id)
    }

    fn connect(&mut self, source: &str, destination: &str) -> Result<()> {
        self.state().connect(self.id, source, destination)
    }

    fn disconnect(&mut self, source: &str, destination: &str) -> Result<()> {
        self.state().disconnect(self.id, source, destination)
    }

    fn disconnect_all(&mut self, port: &Port) -> Result<()> {
        self.state().disconnect_all(self.id, port)
    }

    fn connections(&self, port: &Port) -> Result<Vec<String>> {
        self.running()?.connections(port)
    }

    fn set_freewheel(&mut self, on: bool) -> Result<()> {
        self.state().set_freewheel(self.id, on)
    }

    fn set_sync_timeout(&mut self, usecs: Time) -> Result<()> {
        self.running()?.engine.set_sync_timeout(usecs);
        Ok(())
    }

    fn set_slow_sync(&mut self, enabled: bool) -> Result<()> {
        self.state().set_slow_sync(self.id, enabled)
    }

    fn acquire_timebase(&mut self, conditional: bool) -> Result<bool> {
        let acquired = self.running()?.engine.acquire_timebase(self.id, conditional);
        if acquired {
            log::info!("client '{}' is timebase master", self.name);
        }
        Ok(acquired)
    }

    fn release_timebase(&mut self) -> Result<()> {
        if self.running()?.engine.release_timebase(self.id) {
            log::info!("client '{}' released timebase", self.name);
            Ok(())
        } else {
            Err(Error::NotTimebaseMaster)
        }
    }

    fn transport(&self) -> Arc<dyn TransportControl> {
        self.transport.clone()
    }

    fn uuid_for_client_name(&self, name: &str) -> Result<Uuid> {
        self.running()?
            .client_by_name(name)
            .map(|(_, record)| record.uuid)
            .ok_or_else(|| Error::ClientNotFound(name.to_string()))
    }

    fn client_name_by_uuid(&self, uuid: Uuid) -> Result<String> {
        self.running()?
            .clients
            .values()
            .find(|record| !record.zombie && record.uuid == uuid)
            .map(|record| record.name.clone())
            .ok_or_else(|| Error::ClientNotFound(uuid.to_string()))
    }

    fn client_pid(&self, name: &str) -> Option<u32> {
        // Every loopback client lives in this process
        self.state()
            .client_by_name(name)
            .map(|_| std::process::id())
    }

    fn set_property(&mut self, subject: Uuid, key: &str, property: Property) -> Result<()> {
        let mut state = self.running()?;
        let change = state.properties.set(subject, key, property);
        state.property_changed(subject, key, change);
        Ok(())
    }

    fn property(&self, subject: Uuid, key: &str) -> Result<Option<Property>> {
        Ok(self.running()?.properties.get(subject, key).cloned())
    }

    fn properties(&self, subject: Uuid) -> Result<Description> {
        Ok(self.running()?.properties.description(subject))
    }

    fn all_properties(&self) -> Result<BTreeMap<Uuid, Description>> {
        Ok(self.running()?.properties.all())
    }

    fn remove_property(&mut self, subject: Uuid, key: &str) -> Result<()> {
        let mut state = self.running()?;
        if !state.properties.remove(subject, key) {
            return Err(Error::Operation {
                op: "remove property",
                code: -1,
            });
        }
        state.property_changed(subject, key, PropertyChange::Deleted);
        Ok(())
    }

    fn remove_properties(&mut self, subject: Uuid) -> Result<usize> {
        let mut state = self.running()?;
        let removed = state.properties.remove_subject(subject);
        if removed > 0 {
            state.property_changed(subject, "", PropertyChange::Deleted);
        }
        Ok(removed)
    }

    fn remove_all_properties(&mut self) -> Result<()> {
        let mut state = self.running()?;
        state.properties.clear();
        state.property_changed(Uuid::EMPTY, "", PropertyChange::Deleted);
        Ok(())
    }
}
