use std::collections::HashMap;

use parking_lot::{Mutex, RwLock};
use portable_atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::{Error, Result, SequenceDefinition};

/// Capacity of each registration's event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Cluster-wide notifications about a sequence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SequenceEvent {
    /// The sequence was destroyed; its allocation state is gone.
    Destroyed { sequence: String },
}

/// Handle returned by [`SequenceRegistry::register_channel`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegistrationId(u64);

#[derive(Debug)]
struct Registration {
    sequence: String,
    sender: broadcast::Sender<SequenceEvent>,
}

/// Named sequence definitions known to the cluster, plus the event channels
/// of the parties using them.
#[derive(Debug, Default)]
pub struct SequenceRegistry {
    definitions: RwLock<HashMap<String, SequenceDefinition>>,
    registrations: Mutex<HashMap<RegistrationId, Registration>>,
    next_registration: AtomicU64,
}

impl SequenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `definition` under its name and returns it.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] if a sequence of that name already exists.
    pub fn create_sequence(&self, definition: SequenceDefinition) -> Result<SequenceDefinition> {
        let mut definitions = self.definitions.write();
        if definitions.contains_key(definition.name()) {
            return Err(Error::configuration(format!(
                "sequence '{}' already exists",
                definition.name()
            )));
        }
        definitions.insert(definition.name().to_owned(), definition.clone());
        info!(
            sequence = definition.name(),
            max_logical_node_count = definition.max_logical_node_count(),
            backup_count = definition.backup_count(),
            "Created sequence"
        );
        Ok(definition)
    }

    /// # Errors
    ///
    /// [`Error::UnknownSequence`] if no such sequence exists.
    pub fn sequence(&self, name: &str) -> Result<SequenceDefinition> {
        self.definitions
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| unknown(name))
    }

    /// Names of all live sequences, sorted.
    pub fn sequences(&self) -> Vec<String> {
        let mut names: Vec<_> = self.definitions.read().keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Forgets `name` and notifies its registrations with
    /// [`SequenceEvent::Destroyed`]. The registrations are dropped afterwards,
    /// so receivers see the channel close after the event.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownSequence`] if no such sequence exists.
    pub fn remove_sequence(&self, name: &str) -> Result<SequenceDefinition> {
        let definition = self
            .definitions
            .write()
            .remove(name)
            .ok_or_else(|| unknown(name))?;

        let mut notified = 0;
        self.registrations.lock().retain(|_, registration| {
            if registration.sequence != name {
                return true;
            }
            // No receiver left is fine.
            let _ = registration.sender.send(SequenceEvent::Destroyed {
                sequence: name.to_owned(),
            });
            notified += 1;
            false
        });

        info!(sequence = name, notified, "Destroyed sequence");
        Ok(definition)
    }

    /// Opens an event channel for `name`.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownSequence`] if no such sequence exists.
    pub fn register_channel(
        &self,
        name: &str,
    ) -> Result<(RegistrationId, broadcast::Receiver<SequenceEvent>)> {
        // Hold the read lock so a concurrent removal cannot miss this channel.
        let definitions = self.definitions.read();
        if !definitions.contains_key(name) {
            return Err(unknown(name));
        }

        let id = RegistrationId(self.next_registration.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        self.registrations.lock().insert(
            id,
            Registration {
                sequence: name.to_owned(),
                sender,
            },
        );
        drop(definitions);

        debug!(sequence = name, registration = id.0, "Registered event channel");
        Ok((id, receiver))
    }

    /// Closes a channel opened by [`SequenceRegistry::register_channel`].
    /// Returns `false` if it was already gone.
    pub fn deregister_channel(&self, id: RegistrationId) -> bool {
        self.registrations.lock().remove(&id).is_some()
    }

    /// Number of open channels for `name`.
    pub fn channel_count(&self, name: &str) -> usize {
        self.registrations
            .lock()
            .values()
            .filter(|r| r.sequence == name)
            .count()
    }
}

fn unknown(name: &str) -> Error {
    Error::UnknownSequence {
        sequence: name.to_owned(),
    }
}
