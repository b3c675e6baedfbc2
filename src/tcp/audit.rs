//! Per-connection record of request and response payloads.

use std::fmt;

use parking_lot::Mutex;

/// Identifier assigned to each accepted connection, starting at 1.
pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => f.write_str("INBOUND"),
            Direction::Outbound => f.write_str("OUTBOUND"),
        }
    }
}

/// One recorded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub connection_id: ConnectionId,
    pub direction: Direction,
    pub data: Vec<u8>,
}

impl AuditEntry {
    pub fn new(connection_id: ConnectionId, direction: Direction, data: &[u8]) -> Self {
        Self {
            connection_id,
            direction,
            data: data.to_vec(),
        }
    }
}

impl fmt::Display for AuditEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.connection_id,
            self.direction,
            String::from_utf8_lossy(&self.data)
        )
    }
}

/// Append-only log of payloads exchanged by a listener's connections.
#[derive(Debug, Default)]
pub struct AuditTrail {
    entries: Mutex<Vec<AuditEntry>>,
}

impl AuditTrail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_entry(&self, connection_id: ConnectionId, direction: Direction, data: &[u8]) {
        self.entries
            .lock()
            .push(AuditEntry::new(connection_id, direction, data));
    }

    /// Entries for one connection in insertion order.
    pub fn get_connection_trail(&self, connection_id: ConnectionId) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.connection_id == connection_id)
            .cloned()
            .collect()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// One line per entry, for diagnostics.
    pub fn dump(&self) -> String {
        self.entries
            .lock()
            .iter()
            .map(|entry| format!("{}\n", entry))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trail_per_connection() {
        let trail = AuditTrail::new();
        trail.add_entry(1, Direction::Inbound, b"I am done");
        trail.add_entry(2, Direction::Inbound, b"hello");
        trail.add_entry(1, Direction::Outbound, b"good bye");
        trail.add_entry(2, Direction::Outbound, b"echo hello");

        assert_eq!(trail.len(), 4);
        assert_eq!(
            trail.get_connection_trail(1),
            vec![
                AuditEntry::new(1, Direction::Inbound, b"I am done"),
                AuditEntry::new(1, Direction::Outbound, b"good bye"),
            ]
        );
        assert!(trail.get_connection_trail(3).is_empty());

        assert_eq!(
            trail.dump(),
            "1 INBOUND I am done\n2 INBOUND hello\n1 OUTBOUND good bye\n2 OUTBOUND echo hello\n"
        );

        trail.clear();
        assert!(trail.is_empty());
    }
}
