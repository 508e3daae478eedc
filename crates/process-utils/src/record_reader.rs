use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Yields non-empty, trimmed text records from a child stream.
///
/// A record ends at `\n` or `\r`. Runs of delimiters collapse, so `\r\n` and
/// repeated carriage returns never produce empty records. Invalid UTF-8 is
/// replaced rather than rejected.
pub struct OutputRecordReader<R> {
    reader: R,
    pending: Vec<u8>,
    eof: bool,
}

impl<R> OutputRecordReader<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            pending: Vec::new(),
            eof: false,
        }
    }

    /// Next record, or `None` once the stream is exhausted.
    pub async fn next_record(&mut self) -> io::Result<Option<String>> {
        loop {
            if self.eof {
                return Ok(take_record(&mut self.pending));
            }

            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                self.eof = true;
                continue;
            }

            match available.iter().position(|b| matches!(b, b'\n' | b'\r')) {
                Some(idx) => {
                    self.pending.extend_from_slice(&available[..idx]);
                    self.reader.consume(idx + 1);
                    if let Some(record) = take_record(&mut self.pending) {
                        return Ok(Some(record));
                    }
                }
                None => {
                    let n = available.len();
                    self.pending.extend_from_slice(available);
                    self.reader.consume(n);
                }
            }
        }
    }
}

fn take_record(pending: &mut Vec<u8>) -> Option<String> {
    if pending.is_empty() {
        return None;
    }
    let record = String::from_utf8_lossy(pending).trim().to_string();
    pending.clear();
    (!record.is_empty()).then_some(record)
}
