//! Per-client outbound queue
//!
//! Each connected client owns a bounded FIFO queue of encoded messages. The
//! hub holds the producing [`ClientHandle`], the client's write loop holds the
//! consuming [`ClientMailbox`]. One producer, one consumer.

use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::server::{CloseReason, EncodedMessage};

/// Unique client identifier
pub type ClientId = Uuid;

/// Outcome of a non-blocking enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    /// The message is in the queue
    Queued,
    /// The queue is at capacity
    Full,
    /// The client's write loop is gone
    Closed,
}

/// Producer half of a client's outbound queue, owned by the hub
#[derive(Debug)]
pub struct ClientHandle {
    id: ClientId,
    queue: mpsc::Sender<EncodedMessage>,
    close_tx: oneshot::Sender<CloseReason>,
}

impl ClientHandle {
    /// Get the client ID
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Try to enqueue a message without waiting
    pub fn try_enqueue(&self, message: &EncodedMessage) -> Enqueue {
        match self.queue.try_send(EncodedMessage::clone(message)) {
            Ok(()) => Enqueue::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => Enqueue::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => Enqueue::Closed,
        }
    }

    /// Whether the consuming side has gone away
    pub fn is_closed(&self) -> bool {
        self.queue.is_closed() || self.close_tx.is_closed()
    }

    /// Tell the client to close and release the queue
    pub fn close(self, reason: CloseReason) {
        let _ = self.close_tx.send(reason);
    }
}

/// What the write loop sees next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailboxEvent {
    /// A message to write
    Message(EncodedMessage),
    /// The hub released this client; the reason is set when the hub asked
    /// for the close explicitly
    Closed(Option<CloseReason>),
}

/// Where the mailbox is in its release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Release {
    /// Still registered
    Open,
    /// Released with a reason that keeps queued messages; hand them out first
    Draining(CloseReason),
    /// Nothing more will be handed out
    Done,
}

/// Consumer half of a client's outbound queue, owned by the write loop
#[derive(Debug)]
pub struct ClientMailbox {
    id: ClientId,
    queue: mpsc::Receiver<EncodedMessage>,
    close_rx: oneshot::Receiver<CloseReason>,
    release: Release,
}

impl ClientMailbox {
    /// Get the client ID
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Wait for the next message or for the hub to release this client.
    ///
    /// An eviction wins over queued messages. A shutdown release hands out
    /// everything already queued before reporting `Closed`. Once `Closed` is
    /// returned, every later call returns `Closed(None)` immediately.
    pub async fn next(&mut self) -> MailboxEvent {
        loop {
            match self.release {
                Release::Done => return MailboxEvent::Closed(None),
                Release::Draining(reason) => {
                    return match self.queue.try_recv() {
                        Ok(message) => MailboxEvent::Message(message),
                        Err(_) => {
                            self.release = Release::Done;
                            MailboxEvent::Closed(Some(reason))
                        }
                    };
                }
                Release::Open => {}
            }

            tokio::select! {
                biased;
                reason = &mut self.close_rx => match reason {
                    Ok(reason) if reason.drains_queue() => {
                        self.release = Release::Draining(reason);
                    }
                    reason => {
                        self.release = Release::Done;
                        return MailboxEvent::Closed(reason.ok());
                    }
                },
                message = self.queue.recv() => match message {
                    Some(message) => return MailboxEvent::Message(message),
                    None => {
                        self.release = Release::Done;
                        return MailboxEvent::Closed(None);
                    }
                }
            }
        }
    }

    /// Wait for a release that discards the queue, ignoring queued messages.
    ///
    /// Used to abort a write that is stuck on a slow peer. A release that
    /// keeps the queue is recorded for [`next`](Self::next) and this future
    /// stays pending.
    pub async fn evicted(&mut self) -> CloseReason {
        if self.release == Release::Open {
            match (&mut self.close_rx).await {
                Ok(reason) if !reason.drains_queue() => {
                    self.release = Release::Done;
                    return reason;
                }
                Ok(reason) => self.release = Release::Draining(reason),
                Err(_) => self.release = Release::Done,
            }
        }
        std::future::pending().await
    }

    /// Take a queued message without waiting
    pub fn try_next(&mut self) -> Option<EncodedMessage> {
        self.queue.try_recv().ok()
    }
}

/// Create the two halves of a client queue with the given capacity
pub fn client_channel(capacity: usize) -> (ClientHandle, ClientMailbox) {
    let id = Uuid::new_v4();
    let (queue_tx, queue_rx) = mpsc::channel(capacity.max(1));
    let (close_tx, close_rx) = oneshot::channel();

    (
        ClientHandle {
            id,
            queue: queue_tx,
            close_tx,
        },
        ClientMailbox {
            id,
            queue: queue_rx,
            close_rx,
            release: Release::Open,
        },
    )
}
