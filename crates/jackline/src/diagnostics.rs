//! Process-wide error and info message sinks
//!
//! By default diagnostics go through the `log` facade. An application can
//! redirect them with [`set_error_function`] / [`set_info_function`]; the
//! returned [`MessageHook`] restores the previous sink when dropped, so
//! hooks nest.

use std::sync::{Arc, RwLock};

type Sink = Arc<dyn Fn(&str) + Send + Sync>;

static ERROR_SINK: RwLock<Option<Sink>> = RwLock::new(None);
static INFO_SINK: RwLock<Option<Sink>> = RwLock::new(None);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Error,
    Info,
}

impl Channel {
    fn sink(self) -> &'static RwLock<Option<Sink>> {
        match self {
            Channel::Error => &ERROR_SINK,
            Channel::Info => &INFO_SINK,
        }
    }

    fn replace(self, sink: Option<Sink>) -> Option<Sink> {
        let mut slot = self
            .sink()
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::replace(&mut *slot, sink)
    }

    fn current(self) -> Option<Sink> {
        self.sink()
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Installed message sink; the previous sink comes back on drop
#[must_use = "the sink is removed again when the hook is dropped"]
pub struct MessageHook {
    channel: Channel,
    previous: Option<Sink>,
}

impl Drop for MessageHook {
    fn drop(&mut self) {
        self.channel.replace(self.previous.take());
    }
}

impl std::fmt::Debug for MessageHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageHook")
            .field("channel", &self.channel)
            .finish()
    }
}

/// Route error messages to `sink` until the returned hook is dropped
pub fn set_error_function<F>(sink: F) -> MessageHook
where
    F: Fn(&str) + Send + Sync + 'static,
{
    install(Channel::Error, Arc::new(sink))
}

/// Route informational messages to `sink` until the returned hook is dropped
pub fn set_info_function<F>(sink: F) -> MessageHook
where
    F: Fn(&str) + Send + Sync + 'static,
{
    install(Channel::Info, Arc::new(sink))
}

fn install(channel: Channel, sink: Sink) -> MessageHook {
    let previous = channel.replace(Some(sink));
    MessageHook { channel, previous }
}

pub(crate) fn error(message: &str) {
    match Channel::Error.current() {
        Some(sink) => sink(message),
        None => log::error!("{}", message),
    }
}

pub(crate) fn info(message: &str) {
    match Channel::Info.current() {
        Some(sink) => sink(message),
        None => log::info!("{}", message),
    }
}
