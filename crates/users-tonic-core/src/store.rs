//! Concurrency-safe in-memory user store.
//!
//! [`UserStore`] owns the `id -> User` map behind a single readers-writer
//! lock. `create` takes the write half; `get`, `list` and `stream` share the
//! read half, so reads run alongside each other but never alongside an
//! insert.
//!
//! ## Identifiers
//!
//! Ids are `user_<n>` where `n` is the map size plus one, computed while the
//! write lock is held. They are unique only because nothing is ever removed.
//!
//! ## Streaming
//!
//! [`UserStore::stream`] pushes records one at a time into a [`UserSink`],
//! sleeping [`StreamOptions::pace`] between items. The first failed `send`
//! ends the stream with that error. [`StreamMode`] decides whether the read
//! lock is held across the paced loop or only long enough to clone a
//! snapshot.

use crate::{Error, Result, SystemClock, TimeSource, User};
use core::future::Future;
use core::time::Duration;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Delay inserted between streamed records unless overridden.
pub const DEFAULT_STREAM_PACE: Duration = Duration::from_millis(100);

/// Destination for records emitted by [`UserStore::stream`].
///
/// A failed `send` aborts the stream; implementations should return
/// [`Error::SinkClosed`] once the consumer is gone.
pub trait UserSink: Send {
    fn send(&mut self, user: User) -> impl Future<Output = Result<()>> + Send;
}

/// Collects every record. Never fails.
impl UserSink for Vec<User> {
    fn send(&mut self, user: User) -> impl Future<Output = Result<()>> + Send {
        self.push(user);
        core::future::ready(Ok(()))
    }
}

/// How long [`UserStore::stream`] holds the read lock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StreamMode {
    /// Hold the read lock for the whole paced loop. Concurrent `create`
    /// calls wait until the stream finishes or fails.
    #[default]
    HoldLock,
    /// Clone all records under the lock, release it, then emit the copy.
    Snapshot,
}

/// Pacing and locking policy for a single [`UserStore::stream`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamOptions {
    /// Sleep between consecutive records. `Duration::ZERO` disables pacing.
    pub pace: Duration,
    pub mode: StreamMode,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            pace: DEFAULT_STREAM_PACE,
            mode: StreamMode::default(),
        }
    }
}

/// In-memory repository of [`User`] records.
///
/// Share it between request handlers with an `Arc`; each instance is fully
/// independent.
#[derive(Debug, Default)]
pub struct UserStore<T = SystemClock> {
    users: RwLock<HashMap<String, User>>,
    clock: T,
}

impl UserStore {
    /// Creates an empty store stamping records with the system clock.
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl<T: TimeSource> UserStore<T> {
    /// Creates an empty store that reads `created_at` from `clock`.
    pub fn with_clock(clock: T) -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Inserts a new user and returns a copy of the stored record.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] if `email` or `name` is empty. Values are
    /// not trimmed, and nothing is written on failure.
    pub async fn create(&self, email: impl Into<String>, name: impl Into<String>) -> Result<User> {
        let (email, name) = (email.into(), name.into());
        if email.is_empty() || name.is_empty() {
            return Err(Error::invalid_argument("email and name are required"));
        }

        let mut users = self.users.write().await;
        let id = format!("user_{}", users.len() + 1);
        let user = User {
            id: id.clone(),
            email,
            name,
            created_at: self.clock.unix_seconds(),
        };
        users.insert(id, user.clone());
        Ok(user)
    }

    /// Returns a copy of the user stored under `id`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `id` is empty.
    /// - [`Error::NotFound`] if no such user exists.
    pub async fn get(&self, id: &str) -> Result<User> {
        if id.is_empty() {
            return Err(Error::invalid_argument("id is required"));
        }

        self.users
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound { id: id.to_owned() })
    }

    /// Returns a copy of every stored user, in no particular order.
    pub async fn list(&self) -> Vec<User> {
        self.users.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.users.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.users.read().await.is_empty()
    }

    /// Emits every stored user into `sink`, one record per `send`.
    ///
    /// Order matches [`list`](Self::list): unspecified. Returns how many
    /// records were emitted. Records already sent stay sent if a later
    /// `send` fails.
    ///
    /// # Errors
    ///
    /// Whatever the sink returned from its first failed `send`.
    pub async fn stream<S: UserSink>(&self, sink: &mut S, options: StreamOptions) -> Result<usize> {
        match options.mode {
            StreamMode::HoldLock => {
                let users = self.users.read().await;
                emit(users.values().cloned(), sink, options.pace).await
            }
            StreamMode::Snapshot => {
                let snapshot = self.list().await;
                emit(snapshot.into_iter(), sink, options.pace).await
            }
        }
    }
}

async fn emit<I, S>(users: I, sink: &mut S, pace: Duration) -> Result<usize>
where
    I: Iterator<Item = User>,
    S: UserSink,
{
    let mut sent = 0;
    for user in users {
        if sent > 0 && !pace.is_zero() {
            tokio::time::sleep(pace).await;
        }
        sink.send(user).await?;
        sent += 1;
    }
    Ok(sent)
}
