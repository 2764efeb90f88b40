//! Typed progress events for the orchestration entry points.
//!
//! The producer side ([`EventSink`]) can emit any number of non-terminal
//! events and exactly one terminal event: [`EventSink::complete`] and
//! [`EventSink::fail`] consume the sink, and a sink dropped without either
//! emits a terminal error on its way out. Sends to a consumer that has gone
//! away are ignored; the work carries on to completion.

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::session::Phase;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StudioEvent {
    Status {
        message: String,
    },
    Chunk {
        content: String,
    },
    Changes {
        files: Vec<String>,
    },
    Error {
        message: String,
    },
    Complete {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        phase: Option<Phase>,
    },
}

impl StudioEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::Chunk { .. } => "chunk",
            Self::Changes { .. } => "changes",
            Self::Error { .. } => "error",
            Self::Complete { .. } => "complete",
        }
    }
}

/// Create a connected sink/stream pair.
pub fn channel() -> (EventSink, EventStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        EventSink {
            tx: Some(tx),
        },
        EventStream { rx, done: false },
    )
}

/// Producer half. Not cloneable, so only its owner can end the stream.
#[derive(Debug)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<StudioEvent>>,
}

impl EventSink {
    /// A sink whose events go nowhere, for the synchronous entry points.
    pub fn discard() -> Self {
        Self { tx: None }
    }

    fn send(&self, event: StudioEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }

    pub fn status(&self, message: impl Into<String>) {
        self.send(StudioEvent::Status {
            message: message.into(),
        });
    }

    pub fn chunk(&self, content: impl Into<String>) {
        self.send(StudioEvent::Chunk {
            content: content.into(),
        });
    }

    /// No event is sent for an empty list.
    pub fn changes(&self, files: &[String]) {
        if !files.is_empty() {
            self.send(StudioEvent::Changes {
                files: files.to_vec(),
            });
        }
    }

    pub fn complete(mut self, content: impl Into<String>, phase: Option<Phase>) {
        let event = StudioEvent::Complete {
            content: content.into(),
            phase,
        };
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(event);
        }
    }

    pub fn fail(mut self, message: impl Into<String>) {
        let event = StudioEvent::Error {
            message: message.into(),
        };
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(event);
        }
    }
}

impl Drop for EventSink {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(StudioEvent::Error {
                message: "Operation ended without a result".to_string(),
            });
        }
    }
}

/// Consumer half. Yields events until the terminal one.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<StudioEvent>,
    done: bool,
}

impl EventStream {
    /// Next event, or `None` once the terminal event has been delivered.
    pub async fn recv(&mut self) -> Option<StudioEvent> {
        if self.done {
            return None;
        }
        let event = self.rx.recv().await?;
        if event.is_terminal() {
            self.done = true;
            self.rx.close();
        }
        Some(event)
    }

    /// Drain every event, terminal one last.
    pub async fn collect(mut self) -> Vec<StudioEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.recv().await {
            events.push(event);
        }
        events
    }

    /// Drain and return only the terminal event.
    pub async fn outcome(self) -> Option<StudioEvent> {
        self.collect().await.pop().filter(StudioEvent::is_terminal)
    }

    /// As a `Stream`, for transports. The sink never sends after its
    /// terminal event, so the stream ends right after it.
    pub fn into_stream(self) -> UnboundedReceiverStream<StudioEvent> {
        UnboundedReceiverStream::new(self.rx)
    }
}
