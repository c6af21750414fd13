use tokio::sync::mpsc;
use tonic::Status;
use users_tonic_core::{Error, Result, User, UserSink, proto::StreamUsersResponse};

/// Response half of a `StreamUsers` call.
///
/// Wraps the sender side of the channel whose receiver is returned to tonic as
/// the response body. Once the client disconnects tonic drops the receiver,
/// and the next [`send`](UserSink::send) fails with [`Error::SinkClosed`],
/// which is what stops the store's emission loop.
pub struct ChannelSink {
    tx: mpsc::Sender<core::result::Result<StreamUsersResponse, Status>>,
}

impl ChannelSink {
    pub const fn new(tx: mpsc::Sender<core::result::Result<StreamUsersResponse, Status>>) -> Self {
        Self { tx }
    }
}

impl UserSink for ChannelSink {
    async fn send(&mut self, user: User) -> Result<()> {
        let msg = StreamUsersResponse {
            user: Some(user.into()),
        };
        self.tx.send(Ok(msg)).await.map_err(|e| Error::SinkClosed {
            context: format!("Failed to forward user: {e}"),
        })
    }
}
