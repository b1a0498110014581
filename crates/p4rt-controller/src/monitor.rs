//! Congestion monitoring over the inbound notification stream.
//!
//! Each subscription runs one reader task per session. The task decodes
//! packet-in payloads cloned by the dataplane and forwards congestion signals
//! through a bounded queue the orchestrator drains on every tick. Transient
//! stream errors and malformed payloads are logged and skipped; the task
//! stops when the stream ends, reports a terminal error, or is cancelled.

use crate::error::{ControllerError, DecodeError, Result};
use crate::session::{EventStream, SwitchSession};
use crate::transport::{StreamEvent, TransportError};
use crate::{debug_log, info_log, warn_log};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SOURCE: &str = "NotificationMonitor";

/// Destination MAC, source MAC and EtherType.
pub const ETHERNET_HEADER_LEN: usize = 14;

/// Byte carrying the congestion code, right after the Ethernet header.
pub const ECN_OFFSET: usize = ETHERNET_HEADER_LEN;

/// Shortest payload that carries a congestion code.
pub const MIN_PAYLOAD_LEN: usize = ECN_OFFSET + 1;

/// Two-bit ECN codepoint.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EcnCode {
    NotEct = 0,
    Ect1 = 1,
    Ect0 = 2,
    CongestionExperienced = 3,
}

impl EcnCode {
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    pub fn is_congestion(&self) -> bool {
        *self == EcnCode::CongestionExperienced
    }
}

impl TryFrom<u8> for EcnCode {
    type Error = DecodeError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(EcnCode::NotEct),
            1 => Ok(EcnCode::Ect1),
            2 => Ok(EcnCode::Ect0),
            3 => Ok(EcnCode::CongestionExperienced),
            other => Err(DecodeError::UnknownCode(other)),
        }
    }
}

impl fmt::Display for EcnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EcnCode::NotEct => write!(f, "Not-ECT"),
            EcnCode::Ect1 => write!(f, "ECT(1)"),
            EcnCode::Ect0 => write!(f, "ECT(0)"),
            EcnCode::CongestionExperienced => write!(f, "CE"),
        }
    }
}

/// Extracts the congestion code from a cloned packet.
pub fn decode(payload: &[u8]) -> std::result::Result<EcnCode, DecodeError> {
    let byte = payload
        .get(ECN_OFFSET)
        .copied()
        .ok_or(DecodeError::Truncated {
            len: payload.len(),
            required: MIN_PAYLOAD_LEN,
        })?;
    EcnCode::try_from(byte)
}

/// A congestion-experienced packet reported by one switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CongestionSignal {
    pub switch: String,
    pub device_id: u64,
    pub ecn: EcnCode,
    pub detected_at: DateTime<Utc>,
}

impl fmt::Display for CongestionSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Congestion happens on {} (device {}) at {}",
            self.switch,
            self.device_id,
            self.detected_at.format("%H:%M:%S%.3f")
        )
    }
}

/// Why a reader task stopped.
#[derive(Debug)]
pub enum MonitorExit {
    Cancelled,
    /// The switch side hung up without an error.
    Ended,
    Terminal(ControllerError),
}

impl fmt::Display for MonitorExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorExit::Cancelled => write!(f, "cancelled"),
            MonitorExit::Ended => write!(f, "stream ended"),
            MonitorExit::Terminal(e) => write!(f, "{}", e),
        }
    }
}

/// Counters kept by a reader task.
#[derive(Debug, Default)]
pub struct MonitorStats {
    pub packets: AtomicU64,
    pub signals: AtomicU64,
    pub decode_errors: AtomicU64,
    pub stream_errors: AtomicU64,
}

impl MonitorStats {
    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    pub fn signals(&self) -> u64 {
        self.signals.load(Ordering::Relaxed)
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    pub fn stream_errors(&self) -> u64 {
        self.stream_errors.load(Ordering::Relaxed)
    }
}

/// Spawns reader tasks.
#[derive(Debug, Clone)]
pub struct NotificationMonitor {
    queue_depth: usize,
    cancel: CancellationToken,
}

impl NotificationMonitor {
    /// Subscriptions stop when `cancel` fires.
    pub fn new(queue_depth: usize, cancel: CancellationToken) -> Self {
        Self {
            queue_depth: queue_depth.max(1),
            cancel,
        }
    }

    /// Takes the session's stream and starts decoding it.
    pub async fn subscribe(&self, session: &SwitchSession) -> Result<Subscription> {
        let stream = session.receive_stream().await?;
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let cancel = self.cancel.child_token();
        let stats = Arc::new(MonitorStats::default());

        let reader = Reader {
            switch: session.name().to_string(),
            device_id: session.device_id(),
            tx,
            cancel: cancel.clone(),
            stats: Arc::clone(&stats),
        };
        let handle = tokio::spawn(reader.run(stream));
        info_log!(SOURCE, switch = %session.name(), "Monitoring congestion");

        Ok(Subscription {
            switch: session.name().to_string(),
            rx,
            handle,
            cancel,
            stats,
        })
    }
}

struct Reader {
    switch: String,
    device_id: u64,
    tx: mpsc::Sender<CongestionSignal>,
    cancel: CancellationToken,
    stats: Arc<MonitorStats>,
}

impl Reader {
    async fn run(self, mut stream: EventStream) -> MonitorExit {
        loop {
            let item = tokio::select! {
                _ = self.cancel.cancelled() => return MonitorExit::Cancelled,
                item = stream.next() => item,
            };

            let event = match item {
                None => {
                    info_log!(SOURCE, switch = %self.switch, "Notification stream ended");
                    return MonitorExit::Ended;
                }
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    let err = self.stream_error(&e);
                    if !err.is_transient() {
                        return self.stopped(err);
                    }
                    self.stats.stream_errors.fetch_add(1, Ordering::Relaxed);
                    warn_log!(SOURCE, error = %err, "Stream read failed, continuing");
                    continue;
                }
            };

            match event {
                StreamEvent::PacketIn { payload } => {
                    self.stats.packets.fetch_add(1, Ordering::Relaxed);
                    match decode(&payload) {
                        Ok(ecn) if ecn.is_congestion() => {
                            if !self.emit(ecn).await {
                                return MonitorExit::Cancelled;
                            }
                        }
                        Ok(ecn) => {
                            debug_log!(SOURCE, switch = %self.switch, ecn = %ecn, "ECN value");
                        }
                        Err(e) => {
                            self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                            let err = ControllerError::from(e);
                            warn_log!(SOURCE, switch = %self.switch, error = %err, "Skipping packet-in");
                        }
                    }
                }
                StreamEvent::Arbitration {
                    is_primary,
                    election_id,
                } => {
                    debug_log!(SOURCE, switch = %self.switch, is_primary, election_id = %election_id, "Arbitration update");
                }
                StreamEvent::Digest { digest_id, list_id } => {
                    debug_log!(SOURCE, switch = %self.switch, digest_id, list_id, "Digest ignored");
                }
                StreamEvent::TerminalError(e) => return self.terminal(e.to_string()),
            }
        }
    }

    async fn emit(&self, ecn: EcnCode) -> bool {
        let signal = CongestionSignal {
            switch: self.switch.clone(),
            device_id: self.device_id,
            ecn,
            detected_at: Utc::now(),
        };
        self.stats.signals.fetch_add(1, Ordering::Relaxed);
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(signal) => sent.is_ok(),
        }
    }

    fn stream_error(&self, e: &TransportError) -> ControllerError {
        let switch = self.switch.clone();
        let reason = e.to_string();
        if e.code.is_retryable() {
            ControllerError::Stream { switch, reason }
        } else {
            ControllerError::StreamTerminal { switch, reason }
        }
    }

    fn terminal(&self, reason: String) -> MonitorExit {
        self.stopped(ControllerError::StreamTerminal {
            switch: self.switch.clone(),
            reason,
        })
    }

    fn stopped(&self, err: ControllerError) -> MonitorExit {
        warn_log!(SOURCE, error = %err, "Monitoring stopped");
        MonitorExit::Terminal(err)
    }
}

/// Congestion signals of one session.
#[derive(Debug)]
pub struct Subscription {
    switch: String,
    rx: mpsc::Receiver<CongestionSignal>,
    handle: JoinHandle<MonitorExit>,
    cancel: CancellationToken,
    stats: Arc<MonitorStats>,
}

impl Subscription {
    pub fn switch(&self) -> &str {
        &self.switch
    }

    pub fn stats(&self) -> &MonitorStats {
        &self.stats
    }

    /// Waits for the next signal; `None` after the reader has stopped and
    /// the queue is empty.
    pub async fn next(&mut self) -> Option<CongestionSignal> {
        self.rx.recv().await
    }

    /// Everything queued right now, without waiting.
    pub fn try_drain(&mut self) -> Vec<CongestionSignal> {
        let mut signals = Vec::new();
        while let Ok(signal) = self.rx.try_recv() {
            signals.push(signal);
        }
        signals
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the reader to stop without cancelling it.
    pub async fn join(self) -> MonitorExit {
        match self.handle.await {
            Ok(exit) => exit,
            Err(e) => MonitorExit::Terminal(ControllerError::StreamTerminal {
                switch: self.switch,
                reason: format!("reader task failed: {}", e),
            }),
        }
    }

    /// Cancels the reader and waits for it.
    pub async fn stop(self) -> MonitorExit {
        self.cancel();
        self.join().await
    }
}
