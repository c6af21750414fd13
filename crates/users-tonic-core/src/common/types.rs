//! # Domain Types
//!
//! The [`User`] record held by the store, and the [`TimeSource`] used to
//! stamp it at creation time.
//!
//! The store only ever hands out owned clones of [`User`], so nothing a caller
//! does with a returned value can reach back into store state. Conversion into
//! the wire message ([`proto::User`](crate::proto::User)) lives here so the
//! server stays free of field-by-field mapping.

use crate::proto;
use std::time::{SystemTime, UNIX_EPOCH};

/// A stored user record.
///
/// `id` and `created_at` are assigned by the store and never change after
/// creation.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: String,
    /// Seconds since the Unix epoch.
    pub created_at: i64,
}

impl From<User> for proto::User {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            email: user.email,
            name: user.name,
            created_at: user.created_at,
        }
    }
}

/// A source of wall-clock time used to stamp `created_at`.
pub trait TimeSource: Send + Sync + 'static {
    /// Returns the current time in whole seconds since the Unix epoch.
    fn unix_seconds(&self) -> i64;
}

/// [`TimeSource`] backed by [`SystemTime::now`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn unix_seconds(&self) -> i64 {
        // A clock set before 1970 yields 0 rather than failing the insert.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_is_past_2020() {
        // 2020-01-01T00:00:00Z
        assert!(SystemClock.unix_seconds() > 1_577_836_800);
    }

    #[test]
    fn converts_into_wire_message() {
        let user = User {
            id: "user_1".to_string(),
            email: "alice@x.com".to_string(),
            name: "Alice".to_string(),
            created_at: 42,
        };
        let msg = proto::User::from(user);
        assert_eq!(msg.id, "user_1");
        assert_eq!(msg.email, "alice@x.com");
        assert_eq!(msg.name, "Alice");
        assert_eq!(msg.created_at, 42);
    }
}
