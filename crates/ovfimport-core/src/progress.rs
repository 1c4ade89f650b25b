//! Transfer progress reporting.
//!
//! Transfers push [`Progress`] samples into a bounded channel with
//! `try_send`; a reporter thread drains it and calls the
//! [`ProgressListener`] at most once per throttle interval. A full or closed
//! channel drops the sample, so reporting never slows a transfer down.

use std::io::{self, Read};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, tick, Receiver, Sender};

use crate::cancel::CancelToken;
use crate::error::CancelledIo;

/// Capacity of the sample channel between a transfer and its reporter.
pub const PROGRESS_CHANNEL_CAPACITY: usize = 64;

/// A progress sample for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    /// Package member or library file name.
    pub file: String,
    /// Bytes moved so far.
    pub transferred: u64,
    /// Expected total, or 0 if unknown.
    pub total: u64,
    /// The file has been fully transferred.
    pub done: bool,
}

impl Progress {
    /// Percentage complete, clamped to `0.0..=100.0`.
    pub fn percent(&self) -> f32 {
        if self.total == 0 {
            return if self.done { 100.0 } else { 0.0 };
        }
        ((self.transferred as f64 / self.total as f64) * 100.0).min(100.0) as f32
    }
}

/// Receives progress samples.
///
/// Implementations are called from a reporter thread and must return
/// promptly: a slow listener delays later samples, which are then dropped.
pub trait ProgressListener: Send + Sync {
    fn on_progress(&self, progress: &Progress);
}

impl<F> ProgressListener for F
where
    F: Fn(&Progress) + Send + Sync,
{
    fn on_progress(&self, progress: &Progress) {
        self(progress)
    }
}

/// A listener that ignores every sample.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressListener for NoProgress {
    fn on_progress(&self, _progress: &Progress) {}
}

/// Non-blocking sending half of a progress channel.
#[derive(Debug, Clone)]
pub struct ProgressSender {
    sender: Option<Sender<Progress>>,
}

impl ProgressSender {
    /// A sender that discards every sample.
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    /// Offer a sample; it is dropped if the channel is full or closed.
    pub fn send(&self, progress: Progress) {
        if let Some(sender) = &self.sender {
            let _ = sender.try_send(progress);
        }
    }
}

/// Create a bounded progress channel.
pub fn channel() -> (ProgressSender, Receiver<Progress>) {
    let (tx, rx) = bounded(PROGRESS_CHANNEL_CAPACITY);
    (ProgressSender { sender: Some(tx) }, rx)
}

/// Wraps a transfer stream, emitting samples and honoring cancellation.
pub struct ProgressReader<R> {
    inner: R,
    file: String,
    total: u64,
    transferred: u64,
    sender: ProgressSender,
    cancel: CancelToken,
}

impl<R: Read> ProgressReader<R> {
    pub fn new(
        inner: R,
        file: impl Into<String>,
        total: u64,
        sender: ProgressSender,
        cancel: CancelToken,
    ) -> Self {
        Self {
            inner,
            file: file.into(),
            total,
            transferred: 0,
            sender,
            cancel,
        }
    }

    /// Bytes read so far.
    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    /// Emit the final sample for this file.
    pub fn finish(&self) {
        self.sender.send(Progress {
            file: self.file.clone(),
            transferred: self.transferred,
            total: self.total.max(self.transferred),
            done: true,
        });
    }
}

impl<R: Read> Read for ProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(CancelledIo::into_io());
        }

        let n = self.inner.read(buf)?;
        if n > 0 {
            self.transferred += n as u64;
            self.sender.send(Progress {
                file: self.file.clone(),
                transferred: self.transferred,
                total: self.total,
                done: false,
            });
        }
        Ok(n)
    }
}

/// Rate limiter in front of a listener.
pub struct Throttle<'a> {
    listener: &'a dyn ProgressListener,
    interval: Duration,
    last_emit: Option<Instant>,
    pending: Option<Progress>,
}

impl<'a> Throttle<'a> {
    pub fn new(listener: &'a dyn ProgressListener, interval: Duration) -> Self {
        Self {
            listener,
            interval,
            last_emit: None,
            pending: None,
        }
    }

    /// Pass a sample on now, or hold it until the interval has elapsed.
    ///
    /// Final samples and the first sample of a new file are never held.
    pub fn offer(&mut self, sample: Progress) {
        if let Some(pending) = &self.pending {
            if pending.file != sample.file {
                self.flush();
            }
        }

        let due = self
            .last_emit
            .map_or(true, |at| at.elapsed() >= self.interval);
        if sample.done || due {
            self.pending = None;
            self.emit(&sample);
        } else {
            self.pending = Some(sample);
        }
    }

    /// Emit the held sample, if any.
    pub fn flush(&mut self) {
        if let Some(sample) = self.pending.take() {
            self.emit(&sample);
        }
    }

    fn emit(&mut self, sample: &Progress) {
        self.last_emit = Some(Instant::now());
        self.listener.on_progress(sample);
    }
}

/// Drain `receiver` into `listener` until every sender is gone.
pub fn report(receiver: Receiver<Progress>, listener: &dyn ProgressListener, interval: Duration) {
    let mut throttle = Throttle::new(listener, interval);
    let ticker = tick(interval.max(Duration::from_millis(1)));

    loop {
        select! {
            recv(receiver) -> msg => match msg {
                Ok(sample) => throttle.offer(sample),
                Err(_) => break,
            },
            recv(ticker) -> _ => throttle.flush(),
        }
    }
    throttle.flush();
}
