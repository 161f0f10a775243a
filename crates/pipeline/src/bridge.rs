//! JSON-lines feed standing in for the device's native callbacks.
//!
//! Each line is one [`RawEvent`] (`{"kind":"sms",...}` or `{"kind":"mail",...}`).
//! SMS lines are broadcast through the [`LocalSmsPlatform`], mail lines are
//! appended to the [`LocalMailbox`] and picked up by the next scan. Nothing is
//! handed to the pipeline directly, so events only flow while the
//! corresponding source is started.

use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, warn};

use crate::record::RawEvent;
use crate::source::{LocalMailbox, LocalSmsPlatform};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub lines: u64,
    pub sms: u64,
    pub mail: u64,
    pub skipped: u64,
}

pub struct Bridge {
    sms: Option<Arc<LocalSmsPlatform>>,
    mailbox: Option<Arc<LocalMailbox>>,
}

impl Bridge {
    pub fn new(sms: Option<Arc<LocalSmsPlatform>>, mailbox: Option<Arc<LocalMailbox>>) -> Self {
        Self { sms, mailbox }
    }

    /// Feed lines until EOF.
    pub async fn run<R>(&self, reader: R) -> std::io::Result<BridgeStats>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut stats = BridgeStats::default();
        let mut lines = reader.lines();

        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            stats.lines += 1;

            let event: RawEvent = match serde_json::from_str(line) {
                Ok(event) => event,
                Err(e) => {
                    warn!(line = stats.lines, error = %e, "skipping unparseable line");
                    stats.skipped += 1;
                    continue;
                }
            };

            match (event, &self.sms, &self.mailbox) {
                (RawEvent::Sms(payload), Some(platform), _) => {
                    let listeners = platform.deliver(payload);
                    debug!(listeners, "sms broadcast");
                    stats.sms += 1;
                }
                (RawEvent::Mail(message), _, Some(mailbox)) => {
                    let history_id = mailbox.push(message);
                    debug!(history_id, "mail appended");
                    stats.mail += 1;
                }
                (event, _, _) => {
                    warn!(source = %event.source(), "source disabled, skipping event");
                    stats.skipped += 1;
                }
            }
        }

        Ok(stats)
    }
}
