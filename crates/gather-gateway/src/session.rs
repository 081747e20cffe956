use std::sync::atomic::{AtomicU8, Ordering};

use uuid::Uuid;

use gather_types::models::Channel;

/// Lifecycle of one live connection.
///
/// Connecting -> Open -> Closing -> Closed, with Open -> Closed directly
/// on abrupt transport failure. No transition returns to Open; a
/// reconnecting client always gets a fresh session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// One client connection bound to exactly one channel for its lifetime.
/// The id distinguishes concurrent sessions of the same user (multiple
/// tabs or devices on the same or different channels).
#[derive(Debug)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    pub username: String,
    pub channel: Channel,
    state: AtomicU8,
}

impl Session {
    pub fn new(user_id: Uuid, username: String, channel: Channel) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            username,
            channel,
            state: AtomicU8::new(SessionState::Connecting as u8),
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Mark the session live once it is registered for fan-out.
    pub fn mark_open(&self) {
        self.state.store(SessionState::Open as u8, Ordering::Release);
    }

    /// Begin teardown. Returns true for exactly one caller, even under
    /// concurrent close attempts; the winner runs deregistration.
    pub fn begin_close(&self) -> bool {
        loop {
            let current = self.state.load(Ordering::Acquire);
            if current >= SessionState::Closing as u8 {
                return false;
            }
            if self
                .state
                .compare_exchange(
                    current,
                    SessionState::Closing as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Terminal transition, once deregistration has run.
    pub fn mark_closed(&self) {
        self.state.store(SessionState::Closed as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn session() -> Session {
        Session::new(Uuid::new_v4(), "alice".into(), Channel::UnreadFeed)
    }

    #[test]
    fn lifecycle_transitions() {
        let s = session();
        assert_eq!(s.state(), SessionState::Connecting);

        s.mark_open();
        assert_eq!(s.state(), SessionState::Open);

        assert!(s.begin_close());
        assert_eq!(s.state(), SessionState::Closing);

        s.mark_closed();
        assert_eq!(s.state(), SessionState::Closed);
    }

    #[test]
    fn close_is_won_exactly_once() {
        let s = session();
        s.mark_open();

        assert!(s.begin_close());
        assert!(!s.begin_close());

        s.mark_closed();
        assert!(!s.begin_close());
    }

    #[test]
    fn concurrent_close_has_one_winner() {
        let s = Arc::new(session());
        s.mark_open();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = s.clone();
                std::thread::spawn(move || s.begin_close())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
