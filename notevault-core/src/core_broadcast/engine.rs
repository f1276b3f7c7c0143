/*
    engine.rs - Broadcast fan-out / fan-in

    One request walks Validating -> Buffering -> Dispatching -> Aggregating
    and ends Completed, or Rejected if a limit trips before dispatch.

    1. Validating: too many recipients is rejected before any I/O.
    2. Buffering: the message is read in chunks; after every chunk the size
       and size x recipient count are checked against the limits.
    3. Dispatching: each registered recipient gets its own task with two
       fresh duplex pipes. The handle runs in a nested task so a panic is
       caught; writing the message and reading the reply run beside it.
       Unregistered recipients get a `resolve` error without any I/O.
    4. Aggregating: after every recipient task has finished (JoinSet
       barrier) the result map is turned into one reply envelope.

    Every recipient has a deadline. On expiry its entry becomes a `timeout`
    error, so the envelope always holds exactly one entry per distinct
    recipient. Dropping the broadcast future aborts every recipient task.
*/

use super::errors::{BroadcastError, LimitViolation};
use super::node::{NodeHandle, NodeId};
use super::registry::NodeRegistry;
use super::wire::{FailureStage, MessageKind, ReplyEnvelope, ReplyPayload};
use crate::config::BroadcastConfig;
use crate::metrics::Timer;
use metrics::{counter, histogram};
use std::any::Any;
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Size and count limits checked before any dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastLimits {
    pub max_recipients: usize,
    pub max_message_size: usize,
    pub max_total_broadcast_size: usize,
}

impl Default for BroadcastLimits {
    fn default() -> Self {
        BroadcastLimits {
            max_recipients: 1000,
            max_message_size: 50 * 1024 * 1024,
            max_total_broadcast_size: 500 * 1024 * 1024,
        }
    }
}

impl BroadcastLimits {
    pub fn check_recipients(&self, count: usize) -> Result<(), LimitViolation> {
        if count > self.max_recipients {
            return Err(LimitViolation::TooManyRecipients {
                count,
                max: self.max_recipients,
            });
        }
        Ok(())
    }

    /// Check `size` bytes buffered so far for `recipients` recipients
    pub fn check_buffered(&self, size: usize, recipients: usize) -> Result<(), LimitViolation> {
        if size > self.max_message_size {
            return Err(LimitViolation::MessageTooLarge {
                size,
                max: self.max_message_size,
            });
        }
        let total = size.saturating_mul(recipients);
        if total > self.max_total_broadcast_size {
            return Err(LimitViolation::TotalTooLarge {
                total,
                max: self.max_total_broadcast_size,
            });
        }
        Ok(())
    }
}

/// Lifecycle of one broadcast request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastState {
    Validating,
    Buffering,
    Dispatching,
    Aggregating,
    Completed,
    Rejected,
}

/// Result of a completed broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastOutcome {
    pub envelope: ReplyEnvelope,
    /// Bytes of the buffered message
    pub message_size: usize,
}

impl BroadcastOutcome {
    pub fn results(&self) -> &BTreeMap<NodeId, ReplyPayload> {
        &self.envelope.payload
    }

    pub fn error_count(&self) -> usize {
        self.results().values().filter(|p| p.is_error()).count()
    }
}

/// Per-recipient delivery settings
#[derive(Debug, Clone, Copy)]
struct Delivery {
    timeout: Duration,
    chunk_size: usize,
    channel_capacity: usize,
    max_reply_size: usize,
}

/// Fans one message out to many registered nodes
#[derive(Clone)]
pub struct Broadcaster {
    registry: NodeRegistry,
    sender_id: String,
    limits: BroadcastLimits,
    recipient_timeout: Duration,
    read_chunk_size: usize,
    channel_capacity: usize,
}

impl Broadcaster {
    pub fn new(registry: NodeRegistry, config: &BroadcastConfig) -> Self {
        Broadcaster {
            registry,
            sender_id: config.sender_id.clone(),
            limits: BroadcastLimits {
                max_recipients: config.max_recipients,
                max_message_size: config.max_message_size,
                max_total_broadcast_size: config.max_total_broadcast_size,
            },
            recipient_timeout: config.recipient_timeout,
            read_chunk_size: config.read_chunk_size.max(1),
            channel_capacity: config.channel_capacity.max(1),
        }
    }

    pub fn with_limits(mut self, limits: BroadcastLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_recipient_timeout(mut self, timeout: Duration) -> Self {
        self.recipient_timeout = timeout;
        self
    }

    pub fn limits(&self) -> &BroadcastLimits {
        &self.limits
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// Deliver `message` to every recipient and collect one entry per recipient
    ///
    /// Only limit violations and failures reading `message` fail the call.
    /// Duplicate ids are dispatched once.
    pub async fn broadcast<R>(
        &self,
        message: R,
        recipients: &[NodeId],
    ) -> Result<BroadcastOutcome, BroadcastError>
    where
        R: AsyncRead + Unpin,
    {
        let timer = Timer::new("broadcast.duration_ms");
        counter!("broadcast.requests").increment(1);

        self.enter(BroadcastState::Validating);
        if let Err(violation) = self.limits.check_recipients(recipients.len()) {
            return Err(self.reject(violation));
        }

        self.enter(BroadcastState::Buffering);
        let message = self.buffer(message, recipients.len()).await?;
        let message_size = message.len();

        self.enter(BroadcastState::Dispatching);
        histogram!("broadcast.recipients").record(recipients.len() as f64);
        let payload = self.dispatch(Arc::from(message), recipients).await;

        self.enter(BroadcastState::Aggregating);
        let envelope = ReplyEnvelope {
            sender: self.sender_id.clone(),
            kind: MessageKind::BroadcastResult,
            payload,
        };
        let outcome = BroadcastOutcome {
            envelope,
            message_size,
        };

        self.enter(BroadcastState::Completed);
        info!(
            recipients = outcome.results().len(),
            errors = outcome.error_count(),
            bytes = message_size,
            "Broadcast complete"
        );
        timer.stop();
        Ok(outcome)
    }

    /// Like [`Broadcaster::broadcast`], then write the encoded envelope to `reply`
    pub async fn broadcast_to<R, W>(
        &self,
        message: R,
        recipients: &[NodeId],
        mut reply: W,
    ) -> Result<BroadcastOutcome, BroadcastError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let outcome = self.broadcast(message, recipients).await?;
        let bytes = outcome.envelope.encode()?;
        reply.write_all(&bytes).await?;
        reply.flush().await?;
        Ok(outcome)
    }

    fn enter(&self, state: BroadcastState) {
        debug!(state = ?state, "Broadcast state");
    }

    fn reject(&self, violation: LimitViolation) -> BroadcastError {
        self.enter(BroadcastState::Rejected);
        counter!("broadcast.rejected").increment(1);
        warn!(reason = %violation, "Broadcast rejected");
        BroadcastError::LimitExceeded(violation)
    }

    async fn buffer<R>(&self, mut message: R, recipients: usize) -> Result<Vec<u8>, BroadcastError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buffered = Vec::new();
        let mut chunk = vec![0u8; self.read_chunk_size];
        loop {
            let n = message.read(&mut chunk).await?;
            if n == 0 {
                return Ok(buffered);
            }
            if let Err(violation) = self.limits.check_buffered(buffered.len() + n, recipients) {
                return Err(self.reject(violation));
            }
            buffered.extend_from_slice(&chunk[..n]);
        }
    }

    async fn dispatch(
        &self,
        message: Arc<[u8]>,
        recipients: &[NodeId],
    ) -> BTreeMap<NodeId, ReplyPayload> {
        let delivery = Delivery {
            timeout: self.recipient_timeout,
            chunk_size: self.read_chunk_size,
            channel_capacity: self.channel_capacity,
            max_reply_size: self.limits.max_message_size,
        };

        let mut results = BTreeMap::new();
        let mut pending = HashSet::new();
        let mut tasks = JoinSet::new();

        for id in recipients {
            if results.contains_key(id) || pending.contains(id) {
                continue;
            }
            let handle = match self.registry.get(id).await {
                Some(handle) => handle,
                None => {
                    debug!(node = %id, "Recipient not registered");
                    results.insert(
                        id.clone(),
                        ReplyPayload::error(FailureStage::Resolve, format!("node {} not found", id)),
                    );
                    continue;
                }
            };

            pending.insert(id.clone());
            let id = id.clone();
            let message = Arc::clone(&message);
            tasks.spawn(async move {
                let payload =
                    match tokio::time::timeout(delivery.timeout, deliver(handle, message, delivery))
                        .await
                    {
                        Ok(payload) => payload,
                        Err(_) => {
                            counter!("broadcast.recipient.timeouts").increment(1);
                            ReplyPayload::error(
                                FailureStage::Timeout,
                                format!("no reply within {:?}", delivery.timeout),
                            )
                        }
                    };
                (id, payload)
            });
        }

        // Barrier: nothing is aggregated until every recipient task is done
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, payload)) => {
                    pending.remove(&id);
                    results.insert(id, payload);
                }
                Err(e) => warn!(error = %e, "Recipient task failed"),
            }
        }
        for id in pending {
            results.insert(
                id,
                ReplyPayload::error(FailureStage::Invoke, "recipient task failed"),
            );
        }

        for (id, payload) in &results {
            if let ReplyPayload::Error(err) = payload {
                counter!("broadcast.recipient.errors").increment(1);
                debug!(node = %id, stage = %err.stage, error = %err.message, "Recipient failed");
            }
        }
        results
    }
}

/// Run one recipient: invoke the handle, write the message, read the reply
async fn deliver(
    handle: Arc<dyn NodeHandle>,
    message: Arc<[u8]>,
    delivery: Delivery,
) -> ReplyPayload {
    let (mut to_node, node_inbound) = tokio::io::duplex(delivery.channel_capacity);
    let (node_outbound, from_node) = tokio::io::duplex(delivery.channel_capacity);

    let invocation = AbortOnDrop(tokio::spawn(async move {
        handle.handle(node_inbound, node_outbound).await
    }));

    let write = async move {
        to_node.write_all(&message).await?;
        to_node.shutdown().await?;
        Ok::<(), io::Error>(())
    };
    let read = read_reply(from_node, delivery.chunk_size, delivery.max_reply_size);

    let (invoked, written, reply) = tokio::join!(invocation, write, read);

    // A node that fails tends to break the pipes too, so its own error wins
    // over the write error it causes. A read error is ours and wins over
    // the node error it causes.
    match (invoked, written, reply) {
        (Err(e), _, _) => ReplyPayload::error(FailureStage::Invoke, join_error_message(e)),
        (_, _, Err(e)) => ReplyPayload::error(FailureStage::Read, e.to_string()),
        (Ok(Err(e)), _, _) => ReplyPayload::error(FailureStage::Invoke, e.to_string()),
        (_, Err(e), _) => ReplyPayload::error(FailureStage::Write, e.to_string()),
        (Ok(Ok(())), Ok(()), Ok(reply)) => ReplyPayload::Reply(reply),
    }
}

async fn read_reply<R>(mut from_node: R, chunk_size: usize, max: usize) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut reply = Vec::new();
    let mut chunk = vec![0u8; chunk_size];
    loop {
        let n = from_node.read(&mut chunk).await?;
        if n == 0 {
            return Ok(reply);
        }
        if reply.len() + n > max {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("reply exceeds {} bytes", max),
            ));
        }
        reply.extend_from_slice(&chunk[..n]);
    }
}

fn join_error_message(err: JoinError) -> String {
    if err.is_panic() {
        format!("node panicked: {}", panic_message(err.into_panic()))
    } else {
        err.to_string()
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Aborts the task when dropped, so a timed-out or cancelled delivery does
/// not leave the handle running
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Future for AbortOnDrop<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_broadcast::errors::NodeError;
    use crate::core_broadcast::node::EchoNode;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::io::DuplexStream;
    use tokio::sync::Notify;

    /// Replies with the message length and counts invocations
    #[derive(Default)]
    struct CountingNode {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl NodeHandle for CountingNode {
        async fn handle(
            &self,
            mut inbound: DuplexStream,
            mut outbound: DuplexStream,
        ) -> Result<(), NodeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut message = Vec::new();
            inbound.read_to_end(&mut message).await?;
            outbound
                .write_all(message.len().to_string().as_bytes())
                .await?;
            Ok(())
        }
    }

    struct PanickingNode;

    #[async_trait]
    impl NodeHandle for PanickingNode {
        async fn handle(&self, _: DuplexStream, _: DuplexStream) -> Result<(), NodeError> {
            panic!("handler exploded");
        }
    }

    struct FailingNode;

    #[async_trait]
    impl NodeHandle for FailingNode {
        async fn handle(
            &self,
            mut inbound: DuplexStream,
            _: DuplexStream,
        ) -> Result<(), NodeError> {
            let mut message = Vec::new();
            inbound.read_to_end(&mut message).await?;
            Err(NodeError::Failed("refused".to_string()))
        }
    }

    /// Never replies; flags when its future is dropped
    struct StuckNode {
        started: Arc<Notify>,
        dropped: Arc<AtomicBool>,
    }

    struct SetOnDrop(Arc<AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl NodeHandle for StuckNode {
        async fn handle(&self, _: DuplexStream, _: DuplexStream) -> Result<(), NodeError> {
            let _guard = SetOnDrop(Arc::clone(&self.dropped));
            self.started.notify_one();
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn broadcaster(registry: NodeRegistry) -> Broadcaster {
        Broadcaster::new(registry, &BroadcastConfig::default())
    }

    fn ids(names: &[&str]) -> Vec<NodeId> {
        names.iter().map(|n| NodeId::from(*n)).collect()
    }

    #[tokio::test]
    async fn test_echo_to_all_recipients() {
        let registry = NodeRegistry::new();
        registry.insert(NodeId::from("a"), Arc::new(EchoNode)).await;
        registry.insert(NodeId::from("b"), Arc::new(EchoNode)).await;

        let outcome = broadcaster(registry)
            .broadcast(&b"hello nodes"[..], &ids(&["a", "b"]))
            .await
            .unwrap();

        assert_eq!(outcome.message_size, 11);
        assert_eq!(outcome.results().len(), 2);
        for payload in outcome.results().values() {
            assert_eq!(payload, &ReplyPayload::Reply(b"hello nodes".to_vec()));
        }
        assert_eq!(outcome.envelope.sender, "notevault");
        assert_eq!(outcome.envelope.kind, MessageKind::BroadcastResult);
    }

    #[tokio::test]
    async fn test_too_many_recipients_dispatches_nothing() {
        let registry = NodeRegistry::new();
        let node = Arc::new(CountingNode::default());
        registry.insert(NodeId::from("n"), node.clone()).await;

        let recipients = vec![NodeId::from("n"); 1001];
        let err = broadcaster(registry)
            .broadcast(&b"x"[..], &recipients)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            BroadcastError::LimitExceeded(LimitViolation::TooManyRecipients { count: 1001, max: 1000 })
        ));
        assert_eq!(node.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_total_size_rejected_before_full_buffering() {
        let registry = NodeRegistry::new();
        let node = Arc::new(CountingNode::default());
        registry.insert(NodeId::from("n"), node.clone()).await;

        let limits = BroadcastLimits {
            max_recipients: 10,
            max_message_size: 1024 * 1024,
            max_total_broadcast_size: 100_000,
        };
        let engine = broadcaster(registry).with_limits(limits);

        // An endless message only terminates if the limit check runs per chunk
        let endless = tokio::io::repeat(0x2a);
        let recipients = vec![NodeId::from("n"); 3];
        let err = tokio::time::timeout(
            Duration::from_secs(5),
            engine.broadcast(endless, &recipients),
        )
        .await
        .expect("buffering should stop at the limit")
        .unwrap_err();

        assert!(matches!(
            err,
            BroadcastError::LimitExceeded(LimitViolation::TotalTooLarge { max: 100_000, .. })
        ));
        assert_eq!(node.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_message_size_limit() {
        let engine = broadcaster(NodeRegistry::new()).with_limits(BroadcastLimits {
            max_recipients: 10,
            max_message_size: 100,
            max_total_broadcast_size: 10_000,
        });

        let message = vec![0u8; 101];
        let err = engine
            .broadcast(message.as_slice(), &ids(&["a"]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BroadcastError::LimitExceeded(LimitViolation::MessageTooLarge { max: 100, .. })
        ));

        let message = vec![0u8; 100];
        assert!(engine.broadcast(message.as_slice(), &ids(&["a"])).await.is_ok());
    }

    #[tokio::test]
    async fn test_failures_are_isolated_per_recipient() {
        let registry = NodeRegistry::new();
        registry.insert(NodeId::from("ok"), Arc::new(EchoNode)).await;
        registry.insert(NodeId::from("boom"), Arc::new(PanickingNode)).await;

        let outcome = broadcaster(registry)
            .broadcast(&b"ping"[..], &ids(&["missing", "ok", "boom"]))
            .await
            .unwrap();

        let results = outcome.results();
        assert_eq!(results.len(), 3);
        assert_eq!(results[&NodeId::from("ok")], ReplyPayload::Reply(b"ping".to_vec()));

        match &results[&NodeId::from("missing")] {
            ReplyPayload::Error(err) => assert_eq!(err.stage, FailureStage::Resolve),
            other => panic!("expected resolve error, got {:?}", other),
        }
        match &results[&NodeId::from("boom")] {
            ReplyPayload::Error(err) => {
                assert_eq!(err.stage, FailureStage::Invoke);
                assert!(err.message.contains("handler exploded"));
            }
            other => panic!("expected invoke error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_node_error_is_invoke_failure() {
        let registry = NodeRegistry::new();
        registry.insert(NodeId::from("no"), Arc::new(FailingNode)).await;

        let outcome = broadcaster(registry)
            .broadcast(&b"please"[..], &ids(&["no"]))
            .await
            .unwrap();

        assert_eq!(
            outcome.results()[&NodeId::from("no")],
            ReplyPayload::error(FailureStage::Invoke, "Node failed: refused")
        );
    }

    #[tokio::test]
    async fn test_slow_recipient_times_out() {
        let registry = NodeRegistry::new();
        let dropped = Arc::new(AtomicBool::new(false));
        registry
            .insert(
                NodeId::from("slow"),
                Arc::new(StuckNode {
                    started: Arc::new(Notify::new()),
                    dropped: dropped.clone(),
                }),
            )
            .await;
        registry.insert(NodeId::from("fast"), Arc::new(EchoNode)).await;

        let outcome = broadcaster(registry)
            .with_recipient_timeout(Duration::from_millis(100))
            .broadcast(&b"hi"[..], &ids(&["slow", "fast"]))
            .await
            .unwrap();

        match &outcome.results()[&NodeId::from("slow")] {
            ReplyPayload::Error(err) => assert_eq!(err.stage, FailureStage::Timeout),
            other => panic!("expected timeout, got {:?}", other),
        }
        assert_eq!(
            outcome.results()[&NodeId::from("fast")],
            ReplyPayload::Reply(b"hi".to_vec())
        );

        // The stuck handle is aborted, not leaked
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_dropping_broadcast_aborts_recipients() {
        let registry = NodeRegistry::new();
        let started = Arc::new(Notify::new());
        let dropped = Arc::new(AtomicBool::new(false));
        registry
            .insert(
                NodeId::from("stuck"),
                Arc::new(StuckNode {
                    started: started.clone(),
                    dropped: dropped.clone(),
                }),
            )
            .await;

        let engine = broadcaster(registry);
        let running = tokio::spawn(async move {
            engine
                .broadcast(&b"hi"[..], &[NodeId::from("stuck")])
                .await
        });

        started.notified().await;
        running.abort();
        assert!(running.await.unwrap_err().is_cancelled());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_duplicate_recipients_dispatched_once() {
        let registry = NodeRegistry::new();
        let node = Arc::new(CountingNode::default());
        registry.insert(NodeId::from("n"), node.clone()).await;

        let outcome = broadcaster(registry)
            .broadcast(&b"abc"[..], &ids(&["n", "n", "n"]))
            .await
            .unwrap();

        assert_eq!(outcome.results().len(), 1);
        assert_eq!(node.calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.results()[&NodeId::from("n")], ReplyPayload::Reply(b"3".to_vec()));
    }

    #[tokio::test]
    async fn test_broadcast_to_writes_envelope() {
        let registry = NodeRegistry::new();
        registry.insert(NodeId::from("a"), Arc::new(EchoNode)).await;

        let mut reply = Vec::new();
        let outcome = broadcaster(registry)
            .broadcast_to(&b"m"[..], &ids(&["a", "b"]), &mut reply)
            .await
            .unwrap();

        let decoded = ReplyEnvelope::decode(&reply).unwrap();
        assert_eq!(decoded, outcome.envelope);
        assert_eq!(decoded.payload.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_recipient_list() {
        let outcome = broadcaster(NodeRegistry::new())
            .broadcast(&b"nobody"[..], &[])
            .await
            .unwrap();
        assert!(outcome.results().is_empty());
    }
}
