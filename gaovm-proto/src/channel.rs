//! Bidirectional JSON-RPC channel over one byte stream.
//!
//! A channel owns two background tasks: a writer draining a queue of
//! pre-encoded frames (so concurrent senders interleave at whole-message
//! granularity, never byte-interleaved) and a reader that decodes frames and
//! classifies them. Responses complete the pending call registered under
//! their ID; requests go to a one-shot [`wait_for_request`] registration if
//! one exists for the method, else to the installed [`InboundHandler`].
//!
//! A broken channel is terminal: framing errors, EOF, and write failures all
//! close it, failing every pending call and waiter. Callers must build a new
//! channel over a new stream.
//!
//! [`wait_for_request`]: RpcChannel::wait_for_request

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::ProtoError;
use crate::frame::{encode_frame, FrameDecoder};
use crate::message::{RpcErrorObject, RpcMessage};

/// Depth of the outbound write queue.
const WRITE_QUEUE_DEPTH: usize = 64;

/// ID allocation range for locally originated requests.
///
/// The two ranges must never collide on one channel: clients count up from
/// 1, the daemon counts down from −1 for its driver-directed requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdRange {
    ClientAscending,
    DaemonDescending,
}

/// An inbound request intercepted by [`RpcChannel::wait_for_request`].
///
/// The interceptor owns the reply: answer with [`RpcChannel::respond_ok`] or
/// [`RpcChannel::respond_err`], echoing `id`.
#[derive(Debug)]
pub struct InboundRequest {
    pub id: Value,
    pub method: String,
    pub params: Option<Value>,
}

/// Handler for inbound requests and notifications.
///
/// Installed once per channel after the handshake; invoked from a spawned
/// task per message so a slow handler never stalls the reader.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, RpcErrorObject>;

    /// Notifications have no reply; the default drops them.
    async fn handle_notification(&self, method: &str, params: Option<Value>) {
        let _ = (method, params);
    }
}

/// Handle to one JSON-RPC conversation. Cheap to clone.
#[derive(Clone)]
pub struct RpcChannel {
    shared: Arc<Shared>,
}

struct Shared {
    writer_tx: mpsc::Sender<Vec<u8>>,
    pending: Mutex<HashMap<i64, oneshot::Sender<Result<Value, RpcErrorObject>>>>,
    waiters: Mutex<HashMap<String, oneshot::Sender<InboundRequest>>>,
    handler: Mutex<Option<Arc<dyn InboundHandler>>>,
    next_id: AtomicI64,
    descending: bool,
    closed_tx: watch::Sender<bool>,
}

#[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().expect("channel state lock poisoned")
}

impl RpcChannel {
    /// Wrap a connected stream and spawn the reader and writer tasks.
    pub fn new<S>(stream: S, range: IdRange) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::build(stream, range, None, None).0
    }

    /// Like [`new`](Self::new), but with the inbound handler installed
    /// before the reader task can dispatch anything — a handler installed
    /// after construction could miss the peer's first request.
    pub fn with_handler<S>(stream: S, range: IdRange, handler: Arc<dyn InboundHandler>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::build(stream, range, Some(handler), None).0
    }

    /// Like [`new`](Self::new), but with a `hello` interceptor registered
    /// before the reader task starts, so the peer's opening `hello` can
    /// never slip past it. This is the constructor both ends of a fresh
    /// driver↔daemon socket use.
    pub fn with_hello_interceptor<S>(
        stream: S,
        range: IdRange,
    ) -> (Self, oneshot::Receiver<InboundRequest>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (channel, rx) = Self::build(stream, range, None, Some("hello"));
        #[expect(clippy::expect_used, reason = "build always registers the requested interceptor")]
        let rx = rx.expect("hello interceptor registered");
        (channel, rx)
    }

    fn build<S>(
        stream: S,
        range: IdRange,
        handler: Option<Arc<dyn InboundHandler>>,
        intercept: Option<&str>,
    ) -> (Self, Option<oneshot::Receiver<InboundRequest>>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (writer_tx, writer_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let (closed_tx, _) = watch::channel(false);
        let descending = matches!(range, IdRange::DaemonDescending);
        let mut waiters = HashMap::new();
        let interceptor_rx = intercept.map(|method| {
            let (tx, rx) = oneshot::channel();
            waiters.insert(method.to_owned(), tx);
            rx
        });
        let shared = Arc::new(Shared {
            writer_tx,
            pending: Mutex::new(HashMap::new()),
            waiters: Mutex::new(waiters),
            handler: Mutex::new(handler),
            next_id: AtomicI64::new(if descending { -1 } else { 1 }),
            descending,
            closed_tx,
        });

        tokio::spawn(writer_task(Arc::clone(&shared), write_half, writer_rx));
        tokio::spawn(reader_task(Arc::clone(&shared), read_half));

        (Self { shared }, interceptor_rx)
    }

    /// Install the inbound handler. Replaces any previous handler.
    pub fn set_handler(&self, handler: Arc<dyn InboundHandler>) {
        *lock(&self.shared.handler) = Some(handler);
    }

    /// Send a request and await the matching response.
    ///
    /// # Errors
    /// [`ProtoError::ChannelClosed`] if the channel is or becomes closed,
    /// [`ProtoError::Remote`] if the peer answers with an error object.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, ProtoError> {
        if self.is_closed() {
            return Err(ProtoError::ChannelClosed);
        }
        let id = self.shared.allocate_id();
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.pending).insert(id, tx);
        // Removes the table entry if this future is dropped before the
        // response arrives (timeout or caller cancellation).
        let _guard = PendingGuard {
            shared: Arc::clone(&self.shared),
            id,
        };

        let msg = RpcMessage::request(json!(id), method, params);
        self.shared.send_message(msg).await?;

        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(ProtoError::ChannelClosed),
        }
    }

    /// [`call`](Self::call) bounded by a timeout.
    ///
    /// # Errors
    /// [`ProtoError::Timeout`] when the deadline elapses first; the pending
    /// entry is removed so a late response is discarded.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, ProtoError> {
        match tokio::time::timeout(timeout, self.call(method, params)).await {
            Ok(result) => result,
            Err(_) => Err(ProtoError::Timeout(timeout)),
        }
    }

    /// Send a notification (no response expected).
    ///
    /// # Errors
    /// [`ProtoError::ChannelClosed`] if the channel is closed.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ProtoError> {
        self.shared
            .send_message(RpcMessage::notification(method, params))
            .await
    }

    /// Register a one-shot interceptor for the next inbound request with the
    /// given method. Used to catch the peer's `hello` during the handshake
    /// race, before the regular handler is installed.
    ///
    /// # Errors
    /// Fails if the channel is closed or an interceptor for this method is
    /// already registered.
    pub fn wait_for_request(
        &self,
        method: &str,
    ) -> Result<oneshot::Receiver<InboundRequest>, ProtoError> {
        if self.is_closed() {
            return Err(ProtoError::ChannelClosed);
        }
        let (tx, rx) = oneshot::channel();
        let mut waiters = lock(&self.shared.waiters);
        if waiters.contains_key(method) {
            return Err(ProtoError::Handshake(format!(
                "an interceptor for '{method}' is already registered"
            )));
        }
        waiters.insert(method.to_owned(), tx);
        Ok(rx)
    }

    /// Answer an intercepted request with a result.
    ///
    /// # Errors
    /// [`ProtoError::ChannelClosed`] if the channel is closed.
    pub async fn respond_ok(&self, id: Value, result: Value) -> Result<(), ProtoError> {
        self.shared.send_message(RpcMessage::success(id, result)).await
    }

    /// Answer an intercepted request with an error.
    ///
    /// # Errors
    /// [`ProtoError::ChannelClosed`] if the channel is closed.
    pub async fn respond_err(&self, id: Value, error: RpcErrorObject) -> Result<(), ProtoError> {
        self.shared.send_message(RpcMessage::error(id, error)).await
    }

    /// Close the channel, failing all pending calls and waiters.
    pub fn close(&self) {
        self.shared.close();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.shared.closed_tx.borrow()
    }

    /// Resolve when the channel closes (immediately if already closed).
    pub async fn closed(&self) {
        let mut rx = self.shared.closed_tx.subscribe();
        if *rx.borrow() {
            return;
        }
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

struct PendingGuard {
    shared: Arc<Shared>,
    id: i64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        lock(&self.shared.pending).remove(&self.id);
    }
}

impl Shared {
    fn allocate_id(&self) -> i64 {
        if self.descending {
            self.next_id.fetch_sub(1, Ordering::Relaxed)
        } else {
            self.next_id.fetch_add(1, Ordering::Relaxed)
        }
    }

    async fn send_message(&self, msg: RpcMessage) -> Result<(), ProtoError> {
        if *self.closed_tx.borrow() {
            return Err(ProtoError::ChannelClosed);
        }
        let frame = encode_frame(&msg.into_value())?;
        self.writer_tx
            .send(frame)
            .await
            .map_err(|_| ProtoError::ChannelClosed)
    }

    fn close(&self) {
        let was_closed = self.closed_tx.send_replace(true);
        if was_closed {
            return;
        }
        // Dropping the senders fails every waiting receiver.
        lock(&self.pending).clear();
        lock(&self.waiters).clear();
        *lock(&self.handler) = None;
    }

    fn complete(&self, id: &Value, outcome: Result<Value, RpcErrorObject>) {
        let Some(id) = id.as_i64() else {
            tracing::debug!(?id, "response with non-integer id, dropping");
            return;
        };
        if let Some(tx) = lock(&self.pending).remove(&id) {
            let _ = tx.send(outcome);
        } else {
            tracing::debug!(id, "response for unknown or cancelled request");
        }
    }
}

async fn writer_task<W>(shared: Arc<Shared>, mut write_half: W, mut rx: mpsc::Receiver<Vec<u8>>)
where
    W: AsyncWrite + Unpin + Send,
{
    let mut closed_rx = shared.closed_tx.subscribe();
    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(frame) => {
                    if write_half.write_all(&frame).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = closed_rx.changed() => break,
        }
    }
    let _ = write_half.shutdown().await;
    shared.close();
}

async fn reader_task<R>(shared: Arc<Shared>, mut read_half: R)
where
    R: AsyncRead + Unpin + Send,
{
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; 16 * 1024];
    'stream: loop {
        let n = match read_half.read(&mut buf).await {
            Ok(0) | Err(_) => break 'stream,
            Ok(n) => n,
        };
        decoder.push(&buf[..n]);
        loop {
            match decoder.next_frame() {
                Ok(Some(value)) => dispatch_inbound(&shared, value),
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(error = %e, "framing error, closing channel");
                    break 'stream;
                }
            }
        }
    }
    shared.close();
}

fn dispatch_inbound(shared: &Arc<Shared>, value: Value) {
    let msg = match RpcMessage::from_value(value) {
        Ok(msg) => msg,
        Err(err) => {
            // Malformed message: answer with id null, best-effort.
            let reply = RpcMessage::error(Value::Null, err);
            if let Ok(frame) = encode_frame(&reply.into_value()) {
                let _ = shared.writer_tx.try_send(frame);
            }
            return;
        }
    };

    match msg {
        RpcMessage::Success { id, result } => shared.complete(&id, Ok(result)),
        RpcMessage::Error { id, error } => shared.complete(&id, Err(error)),
        RpcMessage::Request { id, method, params } => {
            if let Some(waiter) = lock(&shared.waiters).remove(&method) {
                let _ = waiter.send(InboundRequest { id, method, params });
                return;
            }
            let handler = lock(&shared.handler).clone();
            match handler {
                Some(handler) => {
                    let shared = Arc::clone(shared);
                    tokio::spawn(async move {
                        let reply = match handler.handle_request(&method, params).await {
                            Ok(result) => RpcMessage::success(id, result),
                            Err(error) => RpcMessage::error(id, error),
                        };
                        let _ = shared.send_message(reply).await;
                    });
                }
                None => {
                    // The only window without a handler is pre-handshake.
                    let reply = RpcMessage::error(id, RpcErrorObject::handshake_required());
                    if let Ok(frame) = encode_frame(&reply.into_value()) {
                        let _ = shared.writer_tx.try_send(frame);
                    }
                }
            }
        }
        RpcMessage::Notification { method, params } => {
            let handler = lock(&shared.handler).clone();
            if let Some(handler) = handler {
                tokio::spawn(async move {
                    handler.handle_notification(&method, params).await;
                });
            }
        }
    }
}
