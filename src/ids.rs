use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Strongly typed connection identifier backed by ULID.
///
/// Assigned when a connection is accepted and carried on every log line the
/// acceptor and the worker emit for it, so one connection's lifecycle can be
/// followed across threads.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, PartialOrd, Ord)]
pub struct ConnectionId(pub ulid::Ulid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConnectionId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = ulid::Ulid::from_string(s)?;
        Ok(ConnectionId(id))
    }
}
