//! Per-workflow progress emission.
//!
//! One emitter exists per workflow execution; the orchestrator pushes typed
//! events, a transport adapter consumes the receiving end. The channel is
//! bounded and sends never block: once the consumer is gone (or hopelessly
//! behind) events are dropped, because a disconnected caller must not stall
//! or cancel in-flight backend steps.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Instant;

use roost_common::{AgentSnapshot, ErrorKind, ProgressEvent};
use tokio::sync::mpsc;

/// Open span handle returned by [`ProgressEmitter::span_start`].
pub struct Span {
    name: String,
    depth: u32,
    started: Instant,
}

/// Producer side of one workflow's event sequence.
pub struct ProgressEmitter {
    tx: mpsc::Sender<ProgressEvent>,
    depth: AtomicU32,
    terminal_sent: AtomicBool,
}

impl ProgressEmitter {
    /// Create an emitter and the receiver its transport adapter will drain.
    #[must_use]
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (
            Self {
                tx,
                depth: AtomicU32::new(0),
                terminal_sent: AtomicBool::new(false),
            },
            rx,
        )
    }

    /// Emit a free-text progress line.
    pub fn log(&self, message: impl Into<String>) {
        self.send(ProgressEvent::Log {
            message: message.into(),
        });
    }

    /// Open a named sub-operation span.
    #[must_use]
    pub fn span_start(&self, name: &str) -> Span {
        let depth = self.depth.fetch_add(1, Ordering::SeqCst);
        self.send(ProgressEvent::SpanStart {
            name: name.to_owned(),
            depth,
        });
        Span {
            name: name.to_owned(),
            depth,
            started: Instant::now(),
        }
    }

    /// Close a span, emitting its elapsed duration.
    pub fn span_end(&self, span: Span) {
        self.depth.fetch_sub(1, Ordering::SeqCst);
        let elapsed_ms = u64::try_from(span.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.send(ProgressEvent::SpanEnd {
            name: span.name,
            depth: span.depth,
            elapsed_ms,
        });
    }

    /// Emit the successful terminal event. At most one terminal event is
    /// ever delivered; later calls are ignored.
    pub fn complete(&self, agent: AgentSnapshot) {
        if !self.terminal_sent.swap(true, Ordering::SeqCst) {
            self.send_unchecked(ProgressEvent::Complete { agent });
        }
    }

    /// Emit the failed terminal event. At most one terminal event is ever
    /// delivered; later calls are ignored.
    pub fn error(&self, kind: ErrorKind, message: impl Into<String>) {
        if !self.terminal_sent.swap(true, Ordering::SeqCst) {
            self.send_unchecked(ProgressEvent::Error {
                kind,
                message: message.into(),
            });
        }
    }

    fn send(&self, event: ProgressEvent) {
        if self.terminal_sent.load(Ordering::SeqCst) {
            return;
        }
        self.send_unchecked(event);
    }

    fn send_unchecked(&self, event: ProgressEvent) {
        // Full buffer or hung-up consumer both mean "drop", never block.
        let _ = self.tx.try_send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::Receiver<ProgressEvent>) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    #[tokio::test]
    async fn events_arrive_in_order_with_depths() {
        let (emitter, mut rx) = ProgressEmitter::channel(16);
        let outer = emitter.span_start("provision instance");
        let inner = emitter.span_start("wait for boot");
        emitter.log("still booting");
        emitter.span_end(inner);
        emitter.span_end(outer);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 5);
        assert!(matches!(
            &events[0],
            ProgressEvent::SpanStart { name, depth: 0 } if name == "provision instance"
        ));
        assert!(matches!(&events[1], ProgressEvent::SpanStart { depth: 1, .. }));
        assert!(matches!(&events[3], ProgressEvent::SpanEnd { depth: 1, .. }));
        assert!(matches!(&events[4], ProgressEvent::SpanEnd { depth: 0, .. }));
    }

    #[tokio::test]
    async fn only_first_terminal_event_is_delivered() {
        let (emitter, mut rx) = ProgressEmitter::channel(16);
        emitter.error(ErrorKind::BackendError, "boom");
        emitter.error(ErrorKind::Timeout, "late");
        emitter.log("after terminal");

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            ProgressEvent::Error { kind: ErrorKind::BackendError, .. }
        ));
    }

    #[tokio::test]
    async fn full_buffer_drops_instead_of_blocking() {
        let (emitter, mut rx) = ProgressEmitter::channel(2);
        for i in 0..10 {
            emitter.log(format!("line {i}"));
        }
        assert_eq!(drain(&mut rx).len(), 2);
    }

    #[tokio::test]
    async fn gone_consumer_is_harmless() {
        let (emitter, rx) = ProgressEmitter::channel(2);
        drop(rx);
        emitter.log("nobody listening");
        emitter.error(ErrorKind::BackendError, "still fine");
    }
}
