use std::collections::HashMap;

use rkyv::{Archive, Deserialize, Serialize};

use super::message::NetMessage;
use super::messages::MsgStringTableEntries;
use super::protocol::NetError;

/// Id reserved on every peer for the table bootstrap message, so the table
/// itself can be decoded before the peer has received it.
pub const BOOTSTRAP_STRING_ID: u8 = 0;

const MAX_STRINGS: usize = u8::MAX as usize + 1;

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct StringTableEntry {
    pub id: u8,
    pub name: String,
}

/// Interns message type names to the one byte ids used in data frames.
#[derive(Debug, Clone)]
pub struct StringTable {
    strings: Vec<String>,
    ids: HashMap<String, u8>,
    locked: bool,
}

impl Default for StringTable {
    fn default() -> Self {
        Self::new()
    }
}

impl StringTable {
    pub fn new() -> Self {
        let bootstrap = MsgStringTableEntries::NAME.to_string();
        Self {
            ids: HashMap::from([(bootstrap.clone(), BOOTSTRAP_STRING_ID)]),
            strings: vec![bootstrap],
            locked: false,
        }
    }

    /// Registers `name` under the next free id. Adding a name twice returns
    /// the id it already has.
    pub fn add_string(&mut self, name: &str) -> Result<u8, NetError> {
        if let Some(&id) = self.ids.get(name) {
            return Ok(id);
        }
        if self.locked {
            return Err(NetError::StringTableLocked(name.to_string()));
        }
        if self.strings.len() >= MAX_STRINGS {
            return Err(NetError::StringTableFull(name.to_string()));
        }

        let id = self.strings.len() as u8;
        self.strings.push(name.to_string());
        self.ids.insert(name.to_string(), id);
        log::trace!("string table: {} -> {}", id, name);
        Ok(id)
    }

    /// Freezes the table. Called when it is first sent to a peer.
    pub fn lock(&mut self) {
        self.locked = true;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn try_get_string(&self, id: u8) -> Option<&str> {
        self.strings.get(id as usize).map(String::as_str)
    }

    pub fn try_find_string_id(&self, name: &str) -> Option<u8> {
        self.ids.get(name).copied()
    }

    pub fn entries(&self) -> Vec<StringTableEntry> {
        self.strings
            .iter()
            .enumerate()
            .map(|(id, name)| StringTableEntry {
                id: id as u8,
                name: name.clone(),
            })
            .collect()
    }

    /// Swaps in a table received from the server. The incoming entries are
    /// validated first; on error the current table is left untouched.
    pub fn replace(&mut self, mut entries: Vec<StringTableEntry>) -> Result<(), NetError> {
        entries.sort_by_key(|entry| entry.id);

        let mut strings = Vec::with_capacity(entries.len());
        let mut ids = HashMap::with_capacity(entries.len());
        for (index, entry) in entries.into_iter().enumerate() {
            if entry.id as usize != index {
                return Err(NetError::Malformed("string table ids are not contiguous"));
            }
            if ids.insert(entry.name.clone(), entry.id).is_some() {
                return Err(NetError::Malformed("duplicate name in string table"));
            }
            strings.push(entry.name);
        }

        if strings.first().map(String::as_str) != Some(MsgStringTableEntries::NAME) {
            return Err(NetError::Malformed("string table bootstrap id mismatch"));
        }

        self.strings = strings;
        self.ids = ids;
        self.locked = true;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}
