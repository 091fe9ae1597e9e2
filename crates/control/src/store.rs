//! Store plugin
//!
//! Controller specialisation for the store child. The store is the one
//! worker the rest of the daemon stashes into: messages are queued here,
//! serialised to msgpack and streamed over a dedicated pipe the child
//! inherited, in arrival order, by a single pusher task.

use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use skewer_model::{StashError, Stasher, TcpUdpParsedMessage};

use crate::codec::{ControlCodec, write_frame};
use crate::controller::PluginController;

/// The store child and its message pipe
pub struct StorePlugin {
    controller: Arc<PluginController>,
    queue: parking_lot::Mutex<Option<mpsc::UnboundedSender<TcpUdpParsedMessage>>>,
    pusher: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl StorePlugin {
    /// `pipe_write` is the supervisor end of the pipe whose read end the
    /// store child inherited
    pub fn new(controller: Arc<PluginController>, pipe_write: OwnedFd) -> Arc<StorePlugin> {
        let (tx, mut rx) = mpsc::unbounded_channel::<TcpUdpParsedMessage>();

        let pusher = tokio::spawn(async move {
            let mut pipe = tokio::fs::File::from_std(std::fs::File::from(pipe_write));
            let mut codec = ControlCodec::new();
            while let Some(msg) = rx.recv().await {
                let payload = match rmp_serde::to_vec(&msg) {
                    Ok(bytes) => Bytes::from(bytes),
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to encode a message for the store");
                        continue;
                    }
                };
                if let Err(e) = write_frame(&mut pipe, &mut codec, payload).await {
                    tracing::warn!(error = %e, "failed to write a message to the store pipe");
                    break;
                }
            }
            // queue closed and drained; dropping the pipe signals the child
            // that no more messages are coming
        });

        Arc::new(StorePlugin {
            controller,
            queue: parking_lot::Mutex::new(Some(tx)),
            pusher: tokio::sync::Mutex::new(Some(pusher)),
        })
    }

    pub fn controller(&self) -> &Arc<PluginController> {
        &self.controller
    }

    /// Stop accepting messages, drain the queue, close the pipe, then shut
    /// the child down
    pub async fn shutdown(&self, kill_timeout: Duration) {
        self.queue.lock().take();
        if let Some(pusher) = self.pusher.lock().await.take() {
            let _ = pusher.await;
        }
        self.controller.shutdown(kill_timeout).await;
    }
}

impl Stasher for StorePlugin {
    fn stash(&self, msg: TcpUdpParsedMessage) -> Result<(), StashError> {
        // called on every message from every service: a lock-free send on
        // an unbounded queue, never blocking the caller
        match self.queue.lock().as_ref() {
            Some(tx) => tx
                .send(msg)
                .map_err(|_| StashError::NonFatal("store queue closed".into())),
            None => Err(StashError::NonFatal("store is shutting down".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use tokio::io::AsyncReadExt;

    use crate::codec::read_frame;

    fn pipe_pair() -> (OwnedFd, OwnedFd) {
        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        (read_end, write_end)
    }

    #[tokio::test]
    async fn stashed_messages_arrive_framed_on_the_pipe() {
        let (read_end, write_end) = pipe_pair();
        let controller = Arc::new(PluginController::new("skewer-store", None, None, None, None));
        let plugin = StorePlugin::new(controller, write_end);

        let mut msg = TcpUdpParsedMessage::default();
        msg.parsed.fields.message = "persist me".into();
        msg.txnr = 12;
        plugin.stash(msg.clone()).unwrap();

        let mut reader = tokio::fs::File::from_std(std::fs::File::from(read_end));
        let mut codec = ControlCodec::new();
        let mut buf = BytesMut::new();
        let frame = tokio::time::timeout(
            Duration::from_secs(2),
            read_frame(&mut reader, &mut codec, &mut buf),
        )
        .await
        .expect("frame should arrive")
        .unwrap()
        .expect("frame");

        let back: TcpUdpParsedMessage = rmp_serde::from_slice(&frame).unwrap();
        assert_eq!(back, msg);
    }

    #[tokio::test]
    async fn shutdown_drains_then_closes_the_pipe() {
        let (read_end, write_end) = pipe_pair();
        let controller = Arc::new(PluginController::new("skewer-store", None, None, None, None));
        let plugin = StorePlugin::new(controller, write_end);

        for i in 0..10u64 {
            let mut msg = TcpUdpParsedMessage::default();
            msg.txnr = i;
            plugin.stash(msg).unwrap();
        }
        // the child was never created, so this only drains the queue
        plugin.shutdown(Duration::from_millis(100)).await;
        assert!(plugin.stash(TcpUdpParsedMessage::default()).is_err());

        // all ten messages are on the pipe, then EOF
        let mut reader = tokio::fs::File::from_std(std::fs::File::from(read_end));
        let mut codec = ControlCodec::new();
        let mut buf = BytesMut::new();
        for i in 0..10u64 {
            let frame = read_frame(&mut reader, &mut codec, &mut buf)
                .await
                .unwrap()
                .expect("frame");
            let back: TcpUdpParsedMessage = rmp_serde::from_slice(&frame).unwrap();
            assert_eq!(back.txnr, i);
        }
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty(), "pipe should be closed after shutdown");
    }
}
