use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::StreamExt;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, FramedRead};
use tracing::debug;

/// Longest record emitted before a line without a newline is split
pub const MAX_LINE_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// One newline-delimited record captured from a child process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    pub stream: StreamKind,
    pub text: String,
}

/// Non-blocking, bounded destination for captured output lines.
///
/// Readers never wait on the consumer: when the queue is full the line is
/// dropped and counted, so the child's pipes keep draining.
#[derive(Clone, Debug)]
pub struct LineSink {
    tx: mpsc::Sender<OutputLine>,
    dropped: Arc<AtomicU64>,
}

impl LineSink {
    pub fn channel(capacity: usize) -> (LineSink, mpsc::Receiver<OutputLine>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            LineSink {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Hand a line to the consumer; returns false if it was not accepted
    pub fn deliver(&self, line: OutputLine) -> bool {
        match self.tx.try_send(line) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    debug!(dropped, "Line consumer is behind, dropping output");
                }
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Splits a byte stream on `\n` into lossily decoded UTF-8 lines
#[derive(Debug, Clone)]
pub struct LineCodec {
    max_length: usize,
    next_index: usize,
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new(MAX_LINE_BYTES)
    }
}

impl LineCodec {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length: max_length.max(4),
            next_index: 0,
        }
    }
}

fn to_text(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    text.strip_suffix('\r').unwrap_or(&text).to_string()
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(offset) = src[self.next_index..].iter().position(|b| *b == b'\n') {
            let end = self.next_index + offset;
            let line = src.split_to(end + 1);
            self.next_index = 0;
            return Ok(Some(to_text(&line[..end])));
        }

        if src.len() > self.max_length {
            // Never cut through a multi-byte character
            let mut split = self.max_length;
            while split > 0 && (src[split] & 0xC0) == 0x80 {
                split -= 1;
            }
            if split == 0 {
                split = self.max_length;
            }
            let chunk = src.split_to(split);
            self.next_index = 0;
            return Ok(Some(to_text(&chunk)));
        }

        self.next_index = src.len();
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        self.next_index = 0;
        if src.is_empty() {
            return Ok(None);
        }
        let rest = src.split_to(src.len());
        Ok(Some(to_text(&rest)))
    }
}

/// Drain `reader` into `sink` until EOF; returns the number of lines read
pub async fn pump<R>(reader: R, stream: StreamKind, sink: LineSink) -> u64
where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::with_capacity(reader, LineCodec::default(), 8 * 1024);
    let mut count = 0;
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(text) => {
                count += 1;
                sink.deliver(OutputLine { stream, text });
            }
            Err(e) => {
                debug!(?stream, "Output capture stopped: {e}");
                break;
            }
        }
    }
    count
}
