use std::fmt;

/// Identifies one playthrough attempt. Strictly increasing, never reused.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u64);

impl SessionId {
    pub(crate) fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lets an observer notice a new playthrough without looking at the queue.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionWatcher {
    last_seen: Option<SessionId>,
}

impl SessionWatcher {
    /// Returns true the first time a given session id is observed.
    pub fn observe(&mut self, current: SessionId) -> bool {
        if self.last_seen == Some(current) {
            return false;
        }
        self.last_seen = Some(current);
        true
    }

    pub fn last_seen(&self) -> Option<SessionId> {
        self.last_seen
    }
}
