//! Duplex line channel to one worker process

use std::io;
use std::time::Duration;

use flume::Sender;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::protocol::HostMessage;
use crate::error::WorkerError;

/// Longest worker line the host will buffer
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Something the worker said, tagged with the process epoch it came from
#[derive(Debug, Clone, PartialEq)]
pub struct LinkEvent {
    pub epoch: u64,
    pub kind: LinkEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEventKind {
    Line(String),
    /// A line that could not be read as protocol text; it was dropped
    Malformed(String),
    /// The worker's output reached EOF or failed
    Closed,
}

#[derive(Debug, PartialEq, Eq)]
enum LineRead {
    Line,
    Oversize(usize),
    Eof,
}

/// Read one `\n`-terminated line into `buf`, keeping at most `limit` bytes.
/// The rest of an oversize line is consumed and discarded.
async fn read_line_bounded<R>(reader: &mut R, buf: &mut Vec<u8>, limit: usize) -> io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let mut total = 0usize;

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(match total {
                0 => LineRead::Eof,
                n if n > limit => LineRead::Oversize(n),
                _ => LineRead::Line,
            });
        }

        let (chunk, used, done) = match available.iter().position(|&b| b == b'\n') {
            Some(i) => (&available[..i], i + 1, true),
            None => (available, available.len(), false),
        };
        let room = limit.saturating_sub(buf.len());
        buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
        total += chunk.len();
        reader.consume(used);

        if done {
            if total > limit {
                return Ok(LineRead::Oversize(total));
            }
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
            return Ok(LineRead::Line);
        }
    }
}

pub struct ResultChannel {
    epoch: u64,
    writer: BufWriter<Box<dyn AsyncWrite + Send + Unpin>>,
    send_timeout: Duration,
    reader: Option<JoinHandle<()>>,
}

impl ResultChannel {
    /// Wrap a worker's pipes. Output lines are forwarded to `events` by a
    /// background reader until EOF.
    pub fn open(
        epoch: u64,
        input: Box<dyn AsyncWrite + Send + Unpin>,
        output: Box<dyn AsyncRead + Send + Unpin>,
        events: Sender<LinkEvent>,
        send_timeout: Duration,
    ) -> Self {
        let reader = tokio::spawn(async move {
            let mut output = BufReader::new(output);
            let mut buf = Vec::new();
            loop {
                let kind = match read_line_bounded(&mut output, &mut buf, MAX_LINE_BYTES).await {
                    Ok(LineRead::Line) => match std::str::from_utf8(&buf) {
                        Ok(line) => LinkEventKind::Line(line.to_owned()),
                        Err(e) => LinkEventKind::Malformed(format!("invalid UTF-8: {e}")),
                    },
                    Ok(LineRead::Oversize(len)) => LinkEventKind::Malformed(format!(
                        "line of {len} bytes exceeds the {MAX_LINE_BYTES} byte limit"
                    )),
                    Ok(LineRead::Eof) => LinkEventKind::Closed,
                    Err(e) => {
                        debug!(epoch, "worker output failed: {}", e);
                        LinkEventKind::Closed
                    }
                };
                let closed = kind == LinkEventKind::Closed;
                if events.send(LinkEvent { epoch, kind }).is_err() || closed {
                    break;
                }
            }
        });

        Self {
            epoch,
            writer: BufWriter::new(input),
            send_timeout,
            reader: Some(reader),
        }
    }

    /// Write one message, bounded by the send timeout
    pub async fn send(&mut self, message: &HostMessage) -> Result<(), WorkerError> {
        let line = message.to_string();
        trace!(epoch = self.epoch, bytes = line.len(), "-> worker");

        let limit = self.send_timeout;
        let writer = &mut self.writer;
        let write = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        };

        match tokio::time::timeout(limit, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(WorkerError::Channel(e)),
            Err(_) => Err(WorkerError::Timeout(limit)),
        }
    }

    /// Close the worker's input so it sees EOF. The reader keeps draining
    /// output until the worker closes its end; those lines still carry this
    /// channel's epoch.
    pub async fn close(mut self) {
        let _ = tokio::time::timeout(self.send_timeout, self.writer.shutdown()).await;
        self.reader.take();
    }
}

impl Drop for ResultChannel {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}
