//! Managed-object registry.
//!
//! Build adaptors are stored in an arena of slots; a map from address key to
//! slot index resolves incoming calls. The registry owns each adaptor until it
//! is removed.

use crate::build_adaptor::BuildAdaptor;
use crate::types::DataAddr;
use std::collections::HashMap;

/// Ways callers name a managed object when deregistering it.
#[derive(Debug, Clone, Copy)]
pub enum ManagedRef<'a> {
    Object(&'a BuildAdaptor),
    Addr(&'a DataAddr),
    Key(&'a str),
}

impl ManagedRef<'_> {
    /// Normalize to the registry key. An adaptor that was never published
    /// has no key.
    pub fn key(&self) -> Option<String> {
        match self {
            ManagedRef::Object(adaptor) => adaptor.addr().map(DataAddr::key),
            ManagedRef::Addr(addr) => Some(addr.key()),
            ManagedRef::Key(key) => Some(key.to_string()),
        }
    }
}

impl<'a> From<&'a BuildAdaptor> for ManagedRef<'a> {
    fn from(adaptor: &'a BuildAdaptor) -> Self {
        ManagedRef::Object(adaptor)
    }
}

impl<'a> From<&'a DataAddr> for ManagedRef<'a> {
    fn from(addr: &'a DataAddr) -> Self {
        ManagedRef::Addr(addr)
    }
}

impl<'a> From<&'a str> for ManagedRef<'a> {
    fn from(key: &'a str) -> Self {
        ManagedRef::Key(key)
    }
}

impl<'a> From<&'a String> for ManagedRef<'a> {
    fn from(key: &'a String) -> Self {
        ManagedRef::Key(key.as_str())
    }
}

/// Build adaptors published by this agent, keyed by address.
#[derive(Debug, Default)]
pub struct ManagedObjects {
    slots: Vec<Option<BuildAdaptor>>,
    free: Vec<usize>,
    index: HashMap<String, usize>,
}

impl ManagedObjects {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `adaptor` under `addr`, returning the key.
    ///
    /// An adaptor already stored under the same key is replaced and dropped.
    pub fn insert(&mut self, addr: &DataAddr, adaptor: BuildAdaptor) -> String {
        let key = addr.key();
        if let Some(&slot) = self.index.get(&key) {
            self.slots[slot] = Some(adaptor);
            return key;
        }

        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(adaptor);
                slot
            }
            None => {
                self.slots.push(Some(adaptor));
                self.slots.len() - 1
            }
        };
        self.index.insert(key.clone(), slot);
        key
    }

    pub fn get(&self, key: &str) -> Option<&BuildAdaptor> {
        let slot = *self.index.get(key)?;
        self.slots[slot].as_ref()
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut BuildAdaptor> {
        let slot = *self.index.get(key)?;
        self.slots[slot].as_mut()
    }

    pub fn remove(&mut self, key: &str) -> Option<BuildAdaptor> {
        let slot = self.index.remove(key)?;
        self.free.push(slot);
        self.slots[slot].take()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    /// Key of the adaptor building `new_image_id`.
    pub fn find_by_image_id(&self, new_image_id: &str) -> Option<String> {
        self.index
            .iter()
            .find(|(_, &slot)| {
                self.slots[slot]
                    .as_ref()
                    .is_some_and(|a| a.new_image_id() == new_image_id)
            })
            .map(|(key, _)| key.clone())
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.index.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &BuildAdaptor)> {
        self.index
            .iter()
            .filter_map(|(key, &slot)| self.slots[slot].as_ref().map(|a| (key, a)))
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}
