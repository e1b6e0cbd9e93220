//! Change-event feed.
//!
//! The replication tool's event helper writes one line per kernel-level
//! state change into a named pipe. Any line on the feed means "something
//! moved underneath us", so the daemon reacts by forcing a full
//! reconciliation cycle instead of waiting for the next timer tick.
//! The line content is only logged; the cycle re-reads the authoritative
//! state from the control volume anyway.

use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// How long to wait before re-opening the feed after EOF or an error.
const REOPEN_DELAY: Duration = Duration::from_secs(2);

/// Start the background reader for the event feed. Each received line
/// is delivered through the returned channel. The task ends when the
/// receiver is dropped.
pub fn spawn_event_reader(path: PathBuf) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(async move {
        loop {
            let file = match tokio::fs::File::open(&path).await {
                Ok(file) => file,
                Err(e) => {
                    warn!("cannot open event feed {}: {}", path.display(), e);
                    tokio::time::sleep(REOPEN_DELAY).await;
                    continue;
                }
            };
            let mut lines = BufReader::new(file).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim().to_string();
                        if line.is_empty() {
                            continue;
                        }
                        debug!("event: {}", line);
                        if tx.send(line).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("event feed read error: {}", e);
                        break;
                    }
                }
            }
            // A writer closing its end of the pipe is routine; back off
            // and reopen
            if tx.is_closed() {
                return;
            }
            tokio::time::sleep(REOPEN_DELAY).await;
        }
    });
    rx
}
