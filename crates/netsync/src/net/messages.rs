use rkyv::{Archive, Deserialize, Serialize};

use super::message::NetMessage;
use super::protocol::MessageGroup;
use super::string_table::StringTableEntry;
use crate::state::GameState;

/// Complete string table, sent by the server once per new channel.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct MsgStringTableEntries {
    pub entries: Vec<StringTableEntry>,
}

impl NetMessage for MsgStringTableEntries {
    const NAME: &'static str = "MsgStringTableEntries";
    const GROUP: MessageGroup = MessageGroup::String;

    crate::rkyv_codec!();
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct MsgState {
    pub state: GameState,
}

impl NetMessage for MsgState {
    const NAME: &'static str = "MsgState";
    const GROUP: MessageGroup = MessageGroup::Entity;

    crate::rkyv_codec!();
}

/// Last tick the client applied, used by the server as the delta baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct MsgStateAck {
    pub tick: u32,
}

impl NetMessage for MsgStateAck {
    const NAME: &'static str = "MsgStateAck";
    const GROUP: MessageGroup = MessageGroup::Entity;

    crate::rkyv_codec!();
}
