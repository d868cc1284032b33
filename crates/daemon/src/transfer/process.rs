//! A single run of the download utility and its output log.
//!
//! The pump task owns the child process. It appends every output line to the
//! transfer's log and then signals subscribers on a broadcast channel; it
//! never waits on a subscriber. Subscribers keep their own cursor into the
//! log, so a lagging receiver only loses wakeups, never lines.

use std::os::unix::process::ExitStatusExt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use protocol::{TransferState, TransferSummary};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Unique identifier for a transfer.
pub type TransferId = String;

/// Channel capacity for output notifications.
const BROADCAST_CAPACITY: usize = 256;

/// Notification sent after the log changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransferEvent {
    /// A line was appended at this index.
    Line(usize),
    /// The transfer reached a terminal state.
    Finished(TransferState),
}

/// Terminal outcome of a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub id: TransferId,
    pub state: TransferState,
    pub exit_code: Option<i32>,
    pub log: Vec<String>,
}

#[derive(Debug)]
struct TransferLog {
    lines: Vec<String>,
    state: TransferState,
    exit_code: Option<i32>,
}

/// One invocation of the download utility.
#[derive(Debug)]
pub struct Transfer {
    id: TransferId,
    input: String,
    started_at: SystemTime,
    log: Mutex<TransferLog>,
    events: broadcast::Sender<TransferEvent>,
}

impl Transfer {
    /// Create a running transfer with an empty log.
    pub fn new(input: impl Into<String>) -> Arc<Self> {
        let (events, _) = broadcast::channel(BROADCAST_CAPACITY);
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            input: input.into(),
            started_at: SystemTime::now(),
            log: Mutex::new(TransferLog {
                lines: Vec::new(),
                state: TransferState::Running,
                exit_code: None,
            }),
            events,
        })
    }

    fn lock(&self) -> MutexGuard<'_, TransferLog> {
        self.log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Get the transfer ID.
    pub fn id(&self) -> &TransferId {
        &self.id
    }

    /// Input as given by the caller.
    pub fn input(&self) -> &str {
        &self.input
    }

    /// Wall clock start time.
    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    /// Current state.
    pub fn state(&self) -> TransferState {
        self.lock().state
    }

    /// Exit code, once the process exited normally.
    pub fn exit_code(&self) -> Option<i32> {
        self.lock().exit_code
    }

    /// Number of lines captured so far.
    pub fn line_count(&self) -> usize {
        self.lock().lines.len()
    }

    /// Lines at and after `from`, the next cursor, and the state observed
    /// together with them.
    pub fn lines_from(&self, from: usize) -> (Vec<String>, usize, TransferState) {
        let log = self.lock();
        let start = from.min(log.lines.len());
        (log.lines[start..].to_vec(), log.lines.len(), log.state)
    }

    /// Append a line and wake subscribers.
    pub(crate) fn push_line(&self, line: String) {
        let index = {
            let mut log = self.lock();
            log.lines.push(line);
            log.lines.len() - 1
        };
        let _ = self.events.send(TransferEvent::Line(index));
    }

    /// Record the terminal state and wake subscribers.
    pub(crate) fn finish(&self, state: TransferState, exit_code: Option<i32>) {
        {
            let mut log = self.lock();
            log.state = state;
            log.exit_code = exit_code;
        }
        let _ = self.events.send(TransferEvent::Finished(state));
    }

    /// Subscribe to output starting at the first line.
    pub fn subscribe(self: &Arc<Self>) -> TransferSubscription {
        self.subscribe_from(0)
    }

    /// Subscribe to output starting at line `from`.
    pub fn subscribe_from(self: &Arc<Self>, from: usize) -> TransferSubscription {
        // Lines pushed before this point are already in the log; later ones
        // also wake the receiver.
        let receiver = self.events.subscribe();
        TransferSubscription {
            transfer: Arc::clone(self),
            receiver,
            cursor: from,
        }
    }

    /// Wait until the transfer reaches a terminal state.
    pub async fn wait(&self) -> TransferOutcome {
        let mut receiver = self.events.subscribe();
        loop {
            if self.state().is_terminal() {
                return self.outcome();
            }
            match receiver.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return self.outcome(),
            }
        }
    }

    /// Snapshot of state, exit code and full log.
    pub fn outcome(&self) -> TransferOutcome {
        let log = self.lock();
        TransferOutcome {
            id: self.id.clone(),
            state: log.state,
            exit_code: log.exit_code,
            log: log.lines.clone(),
        }
    }

    /// Short description for status reporting.
    pub fn summary(&self) -> TransferSummary {
        let log = self.lock();
        TransferSummary {
            id: self.id.clone(),
            input: self.input.clone(),
            state: log.state,
            exit_code: log.exit_code,
            lines: log.lines.len(),
        }
    }
}

/// A reader of transfer output with its own cursor.
pub struct TransferSubscription {
    transfer: Arc<Transfer>,
    receiver: broadcast::Receiver<TransferEvent>,
    cursor: usize,
}

impl TransferSubscription {
    /// Next output line, or `None` once the transfer finished and every line
    /// has been returned.
    pub async fn next_line(&mut self) -> Option<String> {
        loop {
            {
                let log = self.transfer.lock();
                if self.cursor < log.lines.len() {
                    let line = log.lines[self.cursor].clone();
                    self.cursor += 1;
                    return Some(line);
                }
                if log.state.is_terminal() {
                    return None;
                }
            }

            match self.receiver.recv().await {
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(id = %self.transfer.id, skipped, "Subscriber lagged, reading from log");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    if self.cursor >= self.transfer.line_count() {
                        return None;
                    }
                }
            }
        }
    }

    /// Current cursor.
    pub fn cursor(&self) -> usize {
        self.cursor
    }
}

/// Start the task that drains the child's output and records its exit.
pub(crate) fn spawn_pump(transfer: Arc<Transfer>, mut child: Child) -> JoinHandle<()> {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    tokio::spawn(async move {
        let readers: Vec<_> = [
            stdout.map(|s| tokio::spawn(read_lines(s, Arc::clone(&transfer)))),
            stderr.map(|s| tokio::spawn(read_lines(s, Arc::clone(&transfer)))),
        ]
        .into_iter()
        .flatten()
        .collect();

        let status = child.wait().await;
        for reader in readers {
            if let Err(e) = reader.await {
                warn!(id = %transfer.id, error = %e, "Output reader task failed");
            }
        }

        let (state, exit_code) = match status {
            Ok(status) => {
                if let Some(signal) = status.signal() {
                    transfer.push_line(format!("process terminated by signal {}", signal));
                }
                let state = if status.success() {
                    TransferState::Succeeded
                } else {
                    TransferState::Failed
                };
                (state, status.code())
            }
            Err(e) => {
                transfer.push_line(format!("failed to wait for process: {}", e));
                (TransferState::Failed, None)
            }
        };

        info!(
            id = %transfer.id,
            state = %state,
            exit_code = ?exit_code,
            lines = transfer.line_count(),
            "Transfer finished"
        );
        transfer.finish(state, exit_code);
    })
}

/// Forward each newline-terminated line of `reader` into the log.
async fn read_lines<R: AsyncRead + Unpin>(reader: R, transfer: Arc<Transfer>) {
    let mut segments = BufReader::new(reader).split(b'\n');
    loop {
        match segments.next_segment().await {
            Ok(Some(bytes)) => {
                if let Some(line) = clean_line(&bytes) {
                    transfer.push_line(line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(id = %transfer.id, error = %e, "Failed to read transfer output");
                break;
            }
        }
    }
}

/// Keep only the last `\r`-separated segment of a redrawn line; drop blanks.
fn clean_line(bytes: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim_end_matches('\r');
    let last = text.rsplit('\r').next().unwrap_or_default();
    if last.trim().is_empty() {
        None
    } else {
        Some(last.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use std::time::Duration;
    use tokio::process::Command;

    fn spawn_shell(script: &str) -> Child {
        Command::new("/bin/sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap()
    }

    #[test]
    fn test_clean_line() {
        assert_eq!(clean_line(b"hello"), Some("hello".to_string()));
        assert_eq!(clean_line(b"hello\r"), Some("hello".to_string()));
        assert_eq!(clean_line(b"10%\r20%\r30%"), Some("30%".to_string()));
        assert_eq!(clean_line(b"   "), None);
        assert_eq!(clean_line(b""), None);
    }

    #[test]
    fn test_new_transfer_is_running() {
        let transfer = Transfer::new("magnet:?xt=1");
        assert_eq!(transfer.state(), TransferState::Running);
        assert_eq!(transfer.exit_code(), None);
        assert_eq!(transfer.input(), "magnet:?xt=1");
        assert!(Uuid::parse_str(transfer.id()).is_ok());
    }

    #[test]
    fn test_lines_from_cursor() {
        let transfer = Transfer::new("x");
        transfer.push_line("a".to_string());
        transfer.push_line("b".to_string());
        transfer.push_line("c".to_string());

        let (lines, next, state) = transfer.lines_from(1);
        assert_eq!(lines, vec!["b", "c"]);
        assert_eq!(next, 3);
        assert_eq!(state, TransferState::Running);

        let (lines, next, _) = transfer.lines_from(10);
        assert!(lines.is_empty());
        assert_eq!(next, 3);
    }

    #[tokio::test]
    async fn test_subscription_sees_backlog_and_end() {
        let transfer = Transfer::new("x");
        transfer.push_line("early".to_string());

        let mut subscription = transfer.subscribe();
        transfer.push_line("late".to_string());
        transfer.finish(TransferState::Succeeded, Some(0));

        assert_eq!(subscription.next_line().await.as_deref(), Some("early"));
        assert_eq!(subscription.next_line().await.as_deref(), Some("late"));
        assert_eq!(subscription.next_line().await, None);
        assert_eq!(subscription.cursor(), 2);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_misses_nothing() {
        let transfer = Transfer::new("x");
        let mut subscription = transfer.subscribe();

        for i in 0..(BROADCAST_CAPACITY * 2) {
            transfer.push_line(format!("line {}", i));
        }
        transfer.finish(TransferState::Succeeded, Some(0));

        let mut received = 0;
        while let Some(line) = subscription.next_line().await {
            assert_eq!(line, format!("line {}", received));
            received += 1;
        }
        assert_eq!(received, BROADCAST_CAPACITY * 2);
    }

    #[tokio::test]
    async fn test_pump_success() {
        let transfer = Transfer::new("x");
        let child = spawn_shell("echo one; echo two >&2; echo three");
        spawn_pump(Arc::clone(&transfer), child);

        let outcome = tokio::time::timeout(Duration::from_secs(10), transfer.wait())
            .await
            .unwrap();
        assert_eq!(outcome.state, TransferState::Succeeded);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.log.len(), 3);
        assert!(outcome.log.contains(&"two".to_string()));
    }

    #[tokio::test]
    async fn test_pump_failure_keeps_log() {
        let transfer = Transfer::new("x");
        let child = spawn_shell("echo partial; exit 3");
        spawn_pump(Arc::clone(&transfer), child);

        let outcome = tokio::time::timeout(Duration::from_secs(10), transfer.wait())
            .await
            .unwrap();
        assert_eq!(outcome.state, TransferState::Failed);
        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(outcome.log, vec!["partial"]);
    }

    #[tokio::test]
    async fn test_pump_killed_by_signal() {
        let transfer = Transfer::new("x");
        let child = spawn_shell("kill -9 $$");
        spawn_pump(Arc::clone(&transfer), child);

        let outcome = tokio::time::timeout(Duration::from_secs(10), transfer.wait())
            .await
            .unwrap();
        assert_eq!(outcome.state, TransferState::Failed);
        assert_eq!(outcome.exit_code, None);
        assert!(outcome.log.iter().any(|l| l.contains("signal 9")));
    }

    #[tokio::test]
    async fn test_lines_arrive_before_exit() {
        let transfer = Transfer::new("x");
        let child = spawn_shell("echo ready; sleep 2; echo done");
        spawn_pump(Arc::clone(&transfer), child);

        let mut subscription = transfer.subscribe();
        let first = tokio::time::timeout(Duration::from_secs(1), subscription.next_line())
            .await
            .unwrap();
        assert_eq!(first.as_deref(), Some("ready"));
        assert_eq!(transfer.state(), TransferState::Running);

        let outcome = tokio::time::timeout(Duration::from_secs(10), transfer.wait())
            .await
            .unwrap();
        assert_eq!(outcome.log, vec!["ready", "done"]);
    }

    #[test]
    fn test_summary() {
        let transfer = Transfer::new("https://example.com/a.iso");
        transfer.push_line("x".to_string());
        transfer.finish(TransferState::Failed, Some(1));

        let summary = transfer.summary();
        assert_eq!(summary.id, *transfer.id());
        assert_eq!(summary.state, TransferState::Failed);
        assert_eq!(summary.exit_code, Some(1));
        assert_eq!(summary.lines, 1);
    }
}
