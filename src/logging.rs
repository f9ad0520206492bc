use tokio::sync::broadcast;
use tracing_subscriber::fmt::MakeWriter;

/// Log lines kept for late SSE subscribers before the oldest are dropped.
pub(crate) const LOG_CHANNEL_CAPACITY: usize = 256;

/// Tees formatted log lines to stdout and to every `/api/logs` subscriber.
#[derive(Clone)]
pub(crate) struct SseMakeWriter {
    pub sender: broadcast::Sender<String>,
    pub suppress_stdout: bool,
}

impl SseMakeWriter {
    pub fn new(suppress_stdout: bool) -> Self {
        let (sender, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);
        Self {
            sender,
            suppress_stdout,
        }
    }
}

impl<'a> MakeWriter<'a> for SseMakeWriter {
    type Writer = SseWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SseWriter {
            sender: self.sender.clone(),
            suppress_stdout: self.suppress_stdout,
        }
    }
}

pub(crate) struct SseWriter {
    sender: broadcast::Sender<String>,
    suppress_stdout: bool,
}

impl std::io::Write for SseWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let line = String::from_utf8_lossy(buf).trim_end().to_string();
        if !line.is_empty() {
            let _ = self.sender.send(line); // no subscribers is fine
        }
        if !self.suppress_stdout {
            std::io::stdout().write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if !self.suppress_stdout {
            std::io::stdout().flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn writes_reach_subscribers_without_trailing_newline() {
        let make = SseMakeWriter::new(true);
        let mut rx = make.sender.subscribe();

        let mut writer = make.make_writer();
        writer.write_all(b"INFO relay started\n").unwrap();
        writer.write_all(b"\n").unwrap();

        assert_eq!(rx.try_recv().unwrap(), "INFO relay started");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn writing_without_subscribers_succeeds() {
        let make = SseMakeWriter::new(true);
        let mut writer = make.make_writer();
        assert_eq!(writer.write(b"dropped").unwrap(), 7);
    }
}
