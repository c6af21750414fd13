//! gRPC service implementation for the user directory.
//!
//! This module defines [`UserHandler`], the concrete implementation of the
//! [`UserService`] gRPC service defined in the protobuf specification. Every
//! RPC is a thin translation onto the shared [`UserStore`]: request fields in,
//! [`User`](users_tonic_core::User) snapshots out, and store errors mapped to
//! `tonic::Status` through `From<Error>`.
//!
//! ## Responsibilities
//!
//! - Refuse new RPCs once shutdown has begun.
//! - Run `StreamUsers` on a background task that feeds a bounded channel, so
//!   the paced emission loop is decoupled from tonic's polling.
//! - Track in-flight streams so shutdown can wait for them to drain, and
//!   abort the ones still running once the drain window closes.

use crate::server::{
    config::ServerConfig,
    streaming::sink::ChannelSink,
    telemetry::{
        decrement_streams_inflight, increment_request_errors, increment_requests,
        increment_streams_inflight, increment_users_created, increment_users_streamed,
        record_stream_duration,
    },
};
use core::pin::Pin;
use core::time::Duration;
use futures::TryStreamExt;
use portable_atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_stream::{Stream, wrappers::ReceiverStream};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use users_tonic_core::{
    Error, UserStore,
    proto::{
        CreateUserRequest, CreateUserResponse, GetUserRequest, GetUserResponse, ListUsersRequest,
        ListUsersResponse, StreamUsersRequest, StreamUsersResponse,
        user_service_server::UserService,
    },
};

const GET_USER: &str = "GetUser";
const CREATE_USER: &str = "CreateUser";
const LIST_USERS: &str = "ListUsers";
const STREAM_USERS: &str = "StreamUsers";

/// How often shutdown re-checks the in-flight stream count.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// gRPC front end for a [`UserStore`].
///
/// Cloning is cheap; clones share the store and the shutdown state.
#[derive(Clone)]
pub struct UserHandler {
    config: ServerConfig,
    store: Arc<UserStore>,
    state: Arc<ServiceState>,
}

#[derive(Default)]
struct ServiceState {
    /// Cancelled when shutdown begins; new RPCs are refused.
    shutdown_token: CancellationToken,
    /// Cancelled when the drain window closes; running streams end with
    /// `UNAVAILABLE`.
    abort_token: CancellationToken,
    streams_inflight: AtomicUsize,
}

/// Counts one in-flight stream for as long as it is alive.
struct InflightGuard(Arc<ServiceState>);

impl InflightGuard {
    fn new(state: Arc<ServiceState>) -> Self {
        state.streams_inflight.fetch_add(1, Ordering::AcqRel);
        increment_streams_inflight();
        Self(state)
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.0.streams_inflight.fetch_sub(1, Ordering::AcqRel);
        decrement_streams_inflight();
    }
}

impl UserHandler {
    /// Creates a handler over a fresh, empty store.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_store(config, Arc::new(UserStore::new()))
    }

    pub fn with_store(config: ServerConfig, store: Arc<UserStore>) -> Self {
        Self {
            config,
            store,
            state: Arc::default(),
        }
    }

    pub fn streams_inflight(&self) -> usize {
        self.state.streams_inflight.load(Ordering::Acquire)
    }

    fn ensure_serving(&self) -> Result<(), Error> {
        if self.state.shutdown_token.is_cancelled() {
            return Err(Error::ServiceShutdown);
        }
        Ok(())
    }

    /// Stops accepting RPCs and waits up to the configured shutdown timeout
    /// for in-flight streams to finish. Streams still running after that are
    /// aborted.
    ///
    /// Returns the number of streams still running when the wait ended.
    pub async fn shutdown(&self) -> usize {
        // === Phase 0: Stop accepting new requests ===
        #[cfg(feature = "tracing")]
        tracing::info!("Refusing new requests");
        self.state.shutdown_token.cancel();

        // === Phase 1: Wait for in-flight streams to drain ===
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Draining in-flight streams ({} active)",
            self.streams_inflight()
        );
        let drained = timeout(self.config.shutdown_timeout, async {
            while self.streams_inflight() > 0 {
                sleep(DRAIN_POLL_INTERVAL).await;
            }
        })
        .await;

        let remaining = self.streams_inflight();
        match drained {
            Ok(()) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("All in-flight streams drained");
            }
            Err(_) => {
                #[cfg(feature = "tracing")]
                tracing::warn!("Graceful drain timed out ({remaining} streams still active)");
            }
        }

        // === Phase 2: Abort whatever is left ===
        self.state.abort_token.cancel();
        remaining
    }
}

/// Converts a store result into a gRPC result, counting failures per method.
fn observe<T>(method: &'static str, result: users_tonic_core::Result<T>) -> Result<T, Status> {
    result.map_err(|e| {
        increment_request_errors(method);
        #[cfg(feature = "tracing")]
        tracing::debug!("{method} failed: {e}");
        e.into()
    })
}

#[tonic::async_trait]
impl UserService for UserHandler {
    type StreamUsersStream =
        Pin<Box<dyn Stream<Item = Result<StreamUsersResponse, Status>> + Send>>;

    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(id = %req.get_ref().id)))]
    async fn get_user(
        &self,
        req: Request<GetUserRequest>,
    ) -> Result<Response<GetUserResponse>, Status> {
        increment_requests(GET_USER);
        observe(GET_USER, self.ensure_serving())?;

        let user = observe(GET_USER, self.store.get(&req.get_ref().id).await)?;
        Ok(Response::new(GetUserResponse {
            user: Some(user.into()),
        }))
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
    async fn create_user(
        &self,
        req: Request<CreateUserRequest>,
    ) -> Result<Response<CreateUserResponse>, Status> {
        increment_requests(CREATE_USER);
        observe(CREATE_USER, self.ensure_serving())?;

        let CreateUserRequest { email, name } = req.into_inner();
        let user = observe(CREATE_USER, self.store.create(email, name).await)?;
        increment_users_created();

        #[cfg(feature = "tracing")]
        tracing::info!("Created user {}", user.id);

        Ok(Response::new(CreateUserResponse {
            user: Some(user.into()),
        }))
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
    async fn list_users(
        &self,
        _req: Request<ListUsersRequest>,
    ) -> Result<Response<ListUsersResponse>, Status> {
        increment_requests(LIST_USERS);
        observe(LIST_USERS, self.ensure_serving())?;

        let users = self.store.list().await;
        Ok(Response::new(ListUsersResponse {
            users: users.into_iter().map(Into::into).collect(),
        }))
    }

    /// Streams every stored user, one message each.
    ///
    /// The store's emission loop runs on a spawned task writing into a
    /// channel of `stream_buffer_size`; the receiving end is the response
    /// body. The stream ends when the loop finishes, or when the client goes
    /// away and the next send into the channel fails.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
    async fn stream_users(
        &self,
        _req: Request<StreamUsersRequest>,
    ) -> Result<Response<Self::StreamUsersStream>, Status> {
        let start = std::time::Instant::now();
        increment_requests(STREAM_USERS);
        observe(STREAM_USERS, self.ensure_serving())?;

        let inflight = InflightGuard::new(Arc::clone(&self.state));
        let (resp_tx, resp_rx) = mpsc::channel(self.config.stream_buffer_size);
        let abort_tx = resp_tx.clone();
        let abort = self.state.abort_token.clone();
        let store = Arc::clone(&self.store);
        let options = self.config.stream_options;

        let fut = async move {
            let _inflight = inflight;
            let mut sink = ChannelSink::new(resp_tx);
            let result = tokio::select! {
                result = store.stream(&mut sink, options) => result,
                () = abort.cancelled() => Err(Error::ServiceShutdown),
            };
            match result {
                Ok(_sent) => {
                    record_stream_duration(start.elapsed().as_millis() as f64);
                    #[cfg(feature = "tracing")]
                    tracing::debug!("Streamed {_sent} users");
                }
                Err(e) => {
                    increment_request_errors(STREAM_USERS);
                    #[cfg(feature = "tracing")]
                    tracing::warn!("Stream aborted: {e}");
                    if e == Error::ServiceShutdown {
                        let _ = abort_tx.send(Err(e.into())).await;
                    }
                }
            }
        };
        #[cfg(feature = "tracing")]
        let fut = {
            use tracing::Instrument;
            fut.instrument(tracing::info_span!("streaming"))
        };

        tokio::spawn(fut);

        let stream = ReceiverStream::new(resp_rx).inspect_ok(|_| increment_users_streamed(1));
        Ok(Response::new(Box::pin(stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::config::LogFormat;
    use std::collections::HashSet;
    use tokio_stream::StreamExt;
    use tonic::Code;
    use users_tonic_core::{StreamMode, StreamOptions};

    fn config(pace: Duration) -> ServerConfig {
        ServerConfig {
            stream_options: StreamOptions {
                pace,
                mode: StreamMode::HoldLock,
            },
            stream_buffer_size: 1,
            shutdown_timeout: Duration::from_secs(1),
            server_addr: "127.0.0.1:0".to_string(),
            uds: false,
            log_format: LogFormat::Pretty,
        }
    }

    fn handler() -> UserHandler {
        UserHandler::new(config(Duration::ZERO))
    }

    async fn create(handler: &UserHandler, email: &str, name: &str) -> Result<String, Status> {
        let resp = handler
            .create_user(Request::new(CreateUserRequest {
                email: email.to_string(),
                name: name.to_string(),
            }))
            .await?;
        Ok(resp.into_inner().user.unwrap().id)
    }

    #[tokio::test]
    async fn get_user_empty_id() {
        let status = handler()
            .get_user(Request::new(GetUserRequest { id: String::new() }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn get_user_not_found() {
        let status = handler()
            .get_user(Request::new(GetUserRequest {
                id: "nonexistent".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn create_then_get_user() {
        let handler = handler();
        let id = create(&handler, "alice@example.com", "Alice").await.unwrap();
        assert_eq!(id, "user_1");

        let user = handler
            .get_user(Request::new(GetUserRequest { id }))
            .await
            .unwrap()
            .into_inner()
            .user
            .unwrap();
        assert_eq!(user.email, "alice@example.com");
        assert_eq!(user.name, "Alice");
        assert!(user.created_at > 0);
    }

    #[tokio::test]
    async fn create_user_missing_fields() {
        let handler = handler();
        for (email, name) in [("", "Test"), ("test@example.com", "")] {
            let status = create(&handler, email, name).await.unwrap_err();
            assert_eq!(status.code(), Code::InvalidArgument);
        }
        assert_eq!(handler.store.len().await, 0);
    }

    #[tokio::test]
    async fn list_users_empty_and_populated() {
        let handler = handler();
        let empty = handler
            .list_users(Request::new(ListUsersRequest {}))
            .await
            .unwrap();
        assert!(empty.into_inner().users.is_empty());

        for name in ["A", "B", "C"] {
            create(&handler, &format!("{name}@example.com"), name)
                .await
                .unwrap();
        }
        let users = handler
            .list_users(Request::new(ListUsersRequest {}))
            .await
            .unwrap()
            .into_inner()
            .users;
        assert_eq!(users.len(), 3);
    }

    #[tokio::test]
    async fn stream_users_empty() {
        let handler = handler();
        let items: Vec<_> = handler
            .stream_users(Request::new(StreamUsersRequest {}))
            .await
            .unwrap()
            .into_inner()
            .collect()
            .await;
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn stream_users_emits_each_user_once() {
        let handler = handler();
        create(&handler, "a@example.com", "A").await.unwrap();
        create(&handler, "b@example.com", "B").await.unwrap();

        let ids: Vec<String> = handler
            .stream_users(Request::new(StreamUsersRequest {}))
            .await
            .unwrap()
            .into_inner()
            .map(|item| item.unwrap().user.unwrap().id)
            .collect()
            .await;

        assert_eq!(ids.len(), 2);
        let unique: HashSet<_> = ids.into_iter().collect();
        assert_eq!(
            unique,
            HashSet::from(["user_1".to_string(), "user_2".to_string()])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stream_ends_when_client_disconnects() {
        let handler = UserHandler::new(config(Duration::from_millis(100)));
        for i in 0..5 {
            create(&handler, &format!("u{i}@example.com"), "U")
                .await
                .unwrap();
        }

        let mut stream = handler
            .stream_users(Request::new(StreamUsersRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert!(stream.next().await.unwrap().is_ok());
        assert_eq!(handler.streams_inflight(), 1);
        drop(stream);

        timeout(Duration::from_secs(1), async {
            while handler.streams_inflight() > 0 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("stream task should stop after the client left");
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_streams_then_refuses_requests() {
        let handler = UserHandler::new(config(Duration::from_millis(100)));
        for i in 0..3 {
            create(&handler, &format!("u{i}@example.com"), "U")
                .await
                .unwrap();
        }

        let stream = handler
            .stream_users(Request::new(StreamUsersRequest {}))
            .await
            .unwrap()
            .into_inner();
        let consumer = tokio::spawn(stream.collect::<Vec<_>>());

        assert_eq!(handler.shutdown().await, 0);
        assert_eq!(consumer.await.unwrap().len(), 3);

        let status = create(&handler, "late@example.com", "Late")
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::Unavailable);

        let status = handler
            .stream_users(Request::new(StreamUsersRequest {}))
            .await
            .err()
            .unwrap();
        assert_eq!(status.code(), Code::Unavailable);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_aborts_streams_past_the_drain_timeout() {
        const USERS: usize = 30;
        let handler = UserHandler::new(config(Duration::from_millis(100)));
        for i in 0..USERS {
            create(&handler, &format!("u{i}@example.com"), "U")
                .await
                .unwrap();
        }

        let stream = handler
            .stream_users(Request::new(StreamUsersRequest {}))
            .await
            .unwrap()
            .into_inner();
        let consumer = tokio::spawn(stream.collect::<Vec<_>>());

        // 30 users at 100ms apart cannot finish inside the 1s window.
        assert_eq!(handler.shutdown().await, 1);

        let items = timeout(Duration::from_secs(1), consumer)
            .await
            .expect("aborted stream should end promptly")
            .unwrap();
        assert!(items.len() < USERS);
        let (last, delivered) = items.split_last().unwrap();
        assert_eq!(last.as_ref().unwrap_err().code(), Code::Unavailable);
        assert!(delivered.iter().all(Result::is_ok));

        timeout(Duration::from_secs(1), async {
            while handler.streams_inflight() > 0 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("aborted stream task should exit");
    }
}
