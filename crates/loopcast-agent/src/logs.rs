use std::{collections::VecDeque, sync::Arc};

use loopcast_session::SlotId;
use tokio::sync::Mutex;

// Each line carries its sequence number; pollers resume from the last one they saw.
#[derive(Debug)]
pub struct LogBuffer {
    last_seq: u64,
    capacity: usize,
    lines: VecDeque<(u64, String)>,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            last_seq: 0,
            capacity,
            lines: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, line: String) {
        self.last_seq = self.last_seq.saturating_add(1);
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back((self.last_seq, line));
    }

    /// Lines after `cursor`, oldest first, plus the cursor to poll with next.
    /// Cursor 0 asks for the newest `limit` lines.
    pub fn tail_after(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        let picked: Vec<&(u64, String)> = if cursor == 0 {
            let skip = self.lines.len().saturating_sub(limit);
            self.lines.iter().skip(skip).collect()
        } else {
            self.lines
                .iter()
                .filter(|(seq, _)| *seq > cursor)
                .take(limit)
                .collect()
        };
        let next = picked.last().map_or(cursor, |(seq, _)| *seq);
        (picked.into_iter().map(|(_, line)| line.clone()).collect(), next)
    }
}

#[derive(Clone)]
pub(crate) struct LogSink {
    slot_id: SlotId,
    buffer: Arc<Mutex<LogBuffer>>,
}

impl LogSink {
    pub(crate) fn new(slot_id: SlotId, max_lines: usize) -> Self {
        Self {
            slot_id,
            buffer: Arc::new(Mutex::new(LogBuffer::new(max_lines))),
        }
    }

    pub(crate) fn buffer(&self) -> Arc<Mutex<LogBuffer>> {
        self.buffer.clone()
    }

    pub(crate) async fn emit(&self, line: impl Into<String>) {
        let line = line.into();
        tracing::debug!(slot_id = %self.slot_id, "{line}");
        self.buffer.lock().await.push(line);
    }
}
