//! Fake transport and channel used by the unit tests.

use crate::transport::{ChannelRequest, TerminalChannel, TerminalTransport, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything a [`FakeChannel`] saw, shared with the test body.
#[derive(Default)]
pub struct ChannelLog {
    pub written: Mutex<Vec<u8>>,
    pub resized: Mutex<Vec<(u16, u16)>>,
    pub closes: AtomicUsize,
}

impl ChannelLog {
    pub fn written_text(&self) -> String {
        String::from_utf8_lossy(&self.written.lock()).into_owned()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

pub struct FakeChannel {
    log: Arc<ChannelLog>,
    output: VecDeque<Vec<u8>>,
    active: bool,
    fail_writes: bool,
    close_failures: usize,
}

impl FakeChannel {
    pub fn new(log: Arc<ChannelLog>) -> Self {
        Self {
            log,
            output: VecDeque::new(),
            active: true,
            fail_writes: false,
            close_failures: 0,
        }
    }

    pub fn with_output(mut self, chunks: Vec<Vec<u8>>) -> Self {
        self.output = chunks.into();
        self
    }

    pub fn failing_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }

    /// Make the next `count` calls to `close` fail and leave the channel up.
    pub fn failing_closes(mut self, count: usize) -> Self {
        self.close_failures = count;
        self
    }
}

#[async_trait]
impl TerminalChannel for FakeChannel {
    fn terminal_type(&self) -> &str {
        crate::transport::TERMINAL_TYPE
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if !self.active {
            return Err(TransportError::Closed);
        }
        if self.fail_writes {
            return Err(TransportError::Other("write rejected".into()));
        }
        self.log.written.lock().extend_from_slice(data);
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if !self.active {
            return Err(TransportError::Closed);
        }
        match self.output.pop_front() {
            Some(chunk) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    self.output.push_front(chunk[n..].to_vec());
                }
                Ok(n)
            }
            None => Ok(0),
        }
    }

    async fn resize(&mut self, cols: u16, rows: u16) -> Result<(), TransportError> {
        self.log.resized.lock().push((cols, rows));
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.close_failures > 0 {
            self.close_failures -= 1;
            return Err(TransportError::Other("close rejected".into()));
        }
        if self.active {
            self.active = false;
            self.log.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// How [`FakeTransport::open_channel`] behaves.
#[derive(Clone)]
pub enum Behavior {
    /// Open immediately, the channel yields these output chunks.
    Open(Vec<Vec<u8>>),
    /// Open immediately, but every write on the channel fails.
    OpenFailingWrites,
    /// Fail with `Refused(reason)`.
    Refuse(String),
    /// Open a channel, then wait for cancellation and hand the channel back anyway.
    OpenAfterCancel,
    /// Open a channel, then on cancellation close it and report `Cancelled`.
    HonourCancel,
    /// Never finish and never look at the token.
    IgnoreCancel,
}

pub struct FakeTransport {
    behavior: Behavior,
    requests: Mutex<Vec<ChannelRequest>>,
    channels: Mutex<Vec<Arc<ChannelLog>>>,
}

impl FakeTransport {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            requests: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
        }
    }

    pub fn opening() -> Self {
        Self::new(Behavior::Open(Vec::new()))
    }

    pub fn requests(&self) -> Vec<ChannelRequest> {
        self.requests.lock().clone()
    }

    /// Logs of every channel this transport created, in creation order.
    pub fn channels(&self) -> Vec<Arc<ChannelLog>> {
        self.channels.lock().clone()
    }

    fn new_channel(&self) -> FakeChannel {
        let log = Arc::new(ChannelLog::default());
        self.channels.lock().push(Arc::clone(&log));
        FakeChannel::new(log)
    }
}

#[async_trait]
impl TerminalTransport for FakeTransport {
    fn name(&self) -> &str {
        "fake"
    }

    async fn open_channel(
        &self,
        request: ChannelRequest,
        cancel: CancellationToken,
    ) -> Result<Box<dyn TerminalChannel>, TransportError> {
        self.requests.lock().push(request);
        match &self.behavior {
            Behavior::Open(output) => Ok(Box::new(self.new_channel().with_output(output.clone()))),
            Behavior::OpenFailingWrites => Ok(Box::new(self.new_channel().failing_writes())),
            Behavior::Refuse(reason) => Err(TransportError::Refused(reason.clone())),
            Behavior::OpenAfterCancel => {
                let channel = self.new_channel();
                cancel.cancelled().await;
                Ok(Box::new(channel))
            }
            Behavior::HonourCancel => {
                let mut channel = self.new_channel();
                cancel.cancelled().await;
                channel.close().await?;
                Err(TransportError::Cancelled)
            }
            Behavior::IgnoreCancel => std::future::pending().await,
        }
    }
}
