// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Asynchronous logging behind the standard `log` facade. Producers format
//! into a bounded queue and never block; a single `Drain` (owned by the admin
//! thread) moves completed messages to the output. Messages are dropped when
//! the queue is full.

pub use log::{debug, error, info, trace, warn, Level, LevelFilter};

use crossbeam_queue::ArrayQueue;
use std::io::Write;
use std::sync::Arc;

const DEFAULT_QUEUE_DEPTH: usize = 4096;
const DEFAULT_MESSAGE_SIZE: usize = 1024;

/// A sink for formatted log messages.
pub trait Output: Send {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<()>;
    fn flush(&mut self) -> std::io::Result<()>;
}

pub struct Stdout {}

impl Stdout {
    pub fn new() -> Self {
        Self {}
    }
}

impl Default for Stdout {
    fn default() -> Self {
        Self::new()
    }
}

impl Output for Stdout {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<()> {
        std::io::stdout().write_all(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stdout().flush()
    }
}

pub struct File {
    file: std::fs::File,
}

impl File {
    pub fn open(path: &str) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self { file })
    }
}

impl Output for File {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.file.write_all(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

/// Receiving side of the log queue. Whoever owns the drain must call
/// `flush()` periodically or messages will be dropped once the queue fills.
pub trait Drain: Send {
    fn flush(&mut self) -> std::io::Result<()>;
}

struct LogDrain {
    queue: Arc<ArrayQueue<Vec<u8>>>,
    output: Box<dyn Output>,
}

impl Drain for LogDrain {
    fn flush(&mut self) -> std::io::Result<()> {
        while let Some(message) = self.queue.pop() {
            self.output.write(&message)?;
        }
        self.output.flush()
    }
}

struct QueueLogger {
    queue: Arc<ArrayQueue<Vec<u8>>>,
    level: LevelFilter,
    message_size: usize,
}

impl log::Log for QueueLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut message = Vec::with_capacity(self.message_size);
        let _ = writeln!(
            &mut message,
            "{} {} {}",
            record.level(),
            record.target(),
            record.args()
        );
        // queue full: drop the message rather than block the producer
        let _ = self.queue.push(message);
    }

    fn flush(&self) {}
}

pub struct LogBuilder {
    output: Option<Box<dyn Output>>,
    level: LevelFilter,
    queue_depth: usize,
    message_size: usize,
}

impl LogBuilder {
    pub fn new() -> Self {
        Self {
            output: None,
            level: LevelFilter::Info,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            message_size: DEFAULT_MESSAGE_SIZE,
        }
    }

    pub fn output(mut self, output: Box<dyn Output>) -> Self {
        self.output = Some(output);
        self
    }

    pub fn level(mut self, level: Level) -> Self {
        self.level = level.to_level_filter();
        self
    }

    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    pub fn message_size(mut self, bytes: usize) -> Self {
        self.message_size = bytes;
        self
    }

    pub fn build(self) -> Result<Log, std::io::Error> {
        let output = self.output.ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "no output configured")
        })?;
        let queue = Arc::new(ArrayQueue::new(self.queue_depth));
        Ok(Log {
            queue,
            output,
            level: self.level,
            message_size: self.message_size,
        })
    }
}

impl Default for LogBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Log {
    queue: Arc<ArrayQueue<Vec<u8>>>,
    output: Box<dyn Output>,
    level: LevelFilter,
    message_size: usize,
}

impl Log {
    /// Install this log as the global `log` backend and return the drain.
    /// May only be called once per process; later calls return a drain whose
    /// messages will never arrive (the facade keeps the first logger).
    pub fn start(self) -> Box<dyn Drain> {
        let logger = QueueLogger {
            queue: self.queue.clone(),
            level: self.level,
            message_size: self.message_size,
        };
        if log::set_boxed_logger(Box::new(logger)).is_ok() {
            log::set_max_level(self.level);
        }
        Box::new(LogDrain {
            queue: self.queue,
            output: self.output,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Capture {
        buf: Arc<Mutex<Vec<u8>>>,
    }

    impl Output for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<()> {
            self.buf.lock().unwrap().extend_from_slice(buf);
            Ok(())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn drain_moves_messages_to_output() {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let log = LogBuilder::new()
            .output(Box::new(Capture {
                buf: captured.clone(),
            }))
            .build()
            .expect("failed to build log");

        // push a message directly through the queue, since the global
        // facade can only be claimed by one test process-wide
        log.queue.push(b"INFO test hello\n".to_vec()).unwrap();

        let mut drain = log.start();
        drain.flush().expect("flush failed");

        let content = captured.lock().unwrap();
        assert_eq!(&content[..], b"INFO test hello\n");
    }

    #[test]
    fn queue_overflow_drops() {
        let log = LogBuilder::new()
            .output(Box::new(Stdout::new()))
            .queue_depth(2)
            .build()
            .expect("failed to build log");

        assert!(log.queue.push(b"1".to_vec()).is_ok());
        assert!(log.queue.push(b"2".to_vec()).is_ok());
        assert!(log.queue.push(b"3".to_vec()).is_err());
    }
}
