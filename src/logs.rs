use tokio::sync::{mpsc, watch};

/// Fans one container's line-oriented output into a single consumer.
///
/// Producer and consumer run as independent tasks. Delivery never blocks:
/// the channel is unbounded and lines offered after `close` are dropped, so
/// a consumer that stopped reading cannot wedge the producer or the
/// reconciliation loop.
#[derive(Clone)]
pub struct LogMux {
    tx: mpsc::UnboundedSender<String>,
    close_tx: std::sync::Arc<watch::Sender<bool>>,
    close_rx: watch::Receiver<bool>,
}

impl LogMux {
    /// Creates a multiplexer and the receiving end of its line sequence.
    /// The sequence terminates when every producer-side clone is dropped.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = watch::channel(false);

        (
            Self {
                tx,
                close_tx: std::sync::Arc::new(close_tx),
                close_rx,
            },
            rx,
        )
    }

    /// Signals the producer to stop reading the underlying stream. Safe to
    /// call concurrently with in-flight delivery, and more than once.
    pub fn close(&self) {
        let _ = self.close_tx.send(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.close_rx.borrow()
    }

    /// Resolves once `close` has been called.
    pub async fn closed(&self) {
        let mut rx = self.close_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Offers one line to the consumer. Returns false if the line was
    /// dropped because the multiplexer is closed or the consumer is gone.
    pub fn deliver(&self, line: String) -> bool {
        if self.is_closed() {
            return false;
        }
        self.tx.send(line).is_ok()
    }
}

/// Splits raw output chunks into complete lines, holding any partial line
/// until the next chunk arrives. Container streams chunk on network
/// boundaries, not line boundaries.
#[derive(Debug, Default)]
pub struct LineBuffer {
    partial: Vec<u8>,
}

impl LineBuffer {
    /// Appends a chunk and returns every line completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();

        for byte in chunk {
            if *byte == b'\n' {
                lines.push(take_line(&mut self.partial));
            } else {
                self.partial.push(*byte);
            }
        }

        lines
    }

    /// Returns the trailing partial line, if any. Called once the stream
    /// has ended.
    pub fn flush(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            return None;
        }
        Some(take_line(&mut self.partial))
    }
}

fn take_line(partial: &mut Vec<u8>) -> String {
    let mut bytes = std::mem::take(partial);
    if bytes.last() == Some(&b'\r') {
        bytes.pop();
    }
    String::from_utf8_lossy(&bytes).into_owned()
}
