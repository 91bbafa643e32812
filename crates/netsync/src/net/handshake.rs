use std::collections::HashMap;
use std::fmt;

use super::connection::ConnectionId;
use super::protocol::MAX_USERNAME_LEN;

/// The raw handshake frame a connection is suspended on. The next data frame
/// from that connection resolves it instead of going through dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingFrame {
    /// Server: the client's requested username.
    Username,
    /// Client: the session name the server assigned.
    AssignedName,
    /// Server: the client's acknowledgement of its assigned name.
    Ack,
}

impl fmt::Display for PendingFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Username => "username",
            Self::AssignedName => "assigned name",
            Self::Ack => "acknowledgement",
        };
        f.write_str(name)
    }
}

/// At most one pending handshake frame per connection.
#[derive(Debug, Default)]
pub struct PendingFrames {
    pending: HashMap<ConnectionId, PendingFrame>,
}

impl PendingFrames {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect(&mut self, connection: ConnectionId, frame: PendingFrame) {
        if let Some(previous) = self.pending.insert(connection, frame) {
            log::warn!(
                "{}: replacing pending {} with {}",
                connection,
                previous,
                frame
            );
        }
    }

    /// Resolves the wait, if any, handing the frame to the caller.
    pub fn take(&mut self, connection: ConnectionId) -> Option<PendingFrame> {
        self.pending.remove(&connection)
    }

    pub fn get(&self, connection: ConnectionId) -> Option<PendingFrame> {
        self.pending.get(&connection).copied()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

pub fn is_valid_username(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("empty");
    }
    if name.chars().count() > MAX_USERNAME_LEN {
        return Err("too long");
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err("illegal characters");
    }
    Ok(())
}

/// Returns `requested`, or `requested_N` with the smallest `N >= 2` not
/// already taken.
pub fn resolve_session_name(requested: &str, is_taken: impl Fn(&str) -> bool) -> String {
    if !is_taken(requested) {
        return requested.to_string();
    }
    (2u32..)
        .map(|suffix| format!("{requested}_{suffix}"))
        .find(|candidate| !is_taken(candidate))
        .unwrap_or_else(|| requested.to_string())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn username_validation() {
        assert!(is_valid_username("player_1").is_ok());
        assert!(is_valid_username(&"a".repeat(MAX_USERNAME_LEN)).is_ok());

        assert_eq!(is_valid_username(""), Err("empty"));
        assert_eq!(
            is_valid_username(&"a".repeat(MAX_USERNAME_LEN + 1)),
            Err("too long")
        );
        assert_eq!(is_valid_username("bad name"), Err("illegal characters"));
        assert_eq!(is_valid_username("ünïcode"), Err("illegal characters"));
    }

    #[test]
    fn collision_takes_first_free_suffix() {
        let taken: HashSet<&str> = ["alice", "alice_2", "alice_4"].into();

        assert_eq!(resolve_session_name("bob", |n| taken.contains(n)), "bob");
        assert_eq!(
            resolve_session_name("alice", |n| taken.contains(n)),
            "alice_3"
        );
    }

    #[test]
    fn pending_frames_resolve_once() {
        let mut pending = PendingFrames::new();
        pending.expect(ConnectionId(1), PendingFrame::Username);
        pending.expect(ConnectionId(2), PendingFrame::Ack);

        assert_eq!(pending.take(ConnectionId(1)), Some(PendingFrame::Username));
        assert_eq!(pending.take(ConnectionId(1)), None);
        assert_eq!(pending.get(ConnectionId(2)), Some(PendingFrame::Ack));
        assert_eq!(pending.len(), 1);
    }
}
