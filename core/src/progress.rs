//! One-way progress notifications. Sinks must never block the caller.

use log::info;
use tokio::sync::mpsc::UnboundedSender;

pub trait ProgressSink: Send + Sync {
    fn report_progress(&self, percent: u8);
    fn report_status(&self, text: &str);
    fn log_line(&self, text: &str);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Progress(u8),
    Status(String),
    Log(String),
}

/// Forwards everything to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ProgressSink for LogSink {
    fn report_progress(&self, percent: u8) {
        log::debug!("progress: {}%", percent);
    }

    fn report_status(&self, text: &str) {
        info!("{}", text);
    }

    fn log_line(&self, text: &str) {
        info!("{}", text);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn report_progress(&self, _percent: u8) {}
    fn report_status(&self, _text: &str) {}
    fn log_line(&self, _text: &str) {}
}

/// Pushes events onto an unbounded channel. Events are dropped once the
/// receiving side has gone away.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: UnboundedSender<ProgressEvent>,
}

impl ChannelSink {
    pub fn new(tx: UnboundedSender<ProgressEvent>) -> Self {
        Self { tx }
    }
}

impl ProgressSink for ChannelSink {
    fn report_progress(&self, percent: u8) {
        let _ = self.tx.send(ProgressEvent::Progress(percent.min(100)));
    }

    fn report_status(&self, text: &str) {
        let _ = self.tx.send(ProgressEvent::Status(text.to_string()));
    }

    fn log_line(&self, text: &str) {
        let _ = self.tx.send(ProgressEvent::Log(text.to_string()));
    }
}

/// Turns a done/total pair into a percentage, emitting only on change.
#[derive(Debug, Default)]
pub struct PercentTracker {
    last: Option<u8>,
}

impl PercentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, sink: &dyn ProgressSink, done: u64, total: u64) {
        let percent = if total == 0 {
            100
        } else {
            ((done.min(total) as u128 * 100) / total as u128) as u8
        };
        if self.last != Some(percent) {
            self.last = Some(percent);
            sink.report_progress(percent);
        }
    }
}
