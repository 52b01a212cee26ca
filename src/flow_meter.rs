//! Traffic statistics by message code.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use tracing::info;

/// Count and volume of the traffic for one code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowItem {
    pub count: u64,
    pub size: u64,
}

#[derive(Debug, Default)]
struct Direction {
    items: BTreeMap<u32, FlowItem>,
    total: u64,
}

impl Direction {
    fn record(&mut self, code: u32, size: usize) {
        let item = self.items.entry(code).or_default();
        item.count += 1;
        item.size += size as u64;
        self.total += size as u64;
    }

    fn log(&self, name: &str, dir: &str) {
        if self.total == 0 {
            return;
        }

        info!(meter = name, dir, total = self.total, "flow meter");
        for (code, item) in &self.items {
            let share = item.size as f64 / self.total as f64 * 100.0;
            info!(
                meter = name,
                dir,
                code,
                count = item.count,
                size = item.size,
                "flow meter: {share:.1}%"
            );
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    send: Direction,
    recv: Direction,
}

/// Per-code send and receive counters, reported and reset periodically.
#[derive(Debug)]
pub struct FlowMeter {
    name: String,
    inner: Mutex<Inner>,
}

impl FlowMeter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn send(&self, code: u32, size: usize) {
        self.inner.lock().send.record(code, size);
    }

    pub fn recv(&self, code: u32, size: usize) {
        self.inner.lock().recv.record(code, size);
    }

    /// Returns `(send, recv)` counters for the code.
    pub fn item(&self, code: u32) -> (FlowItem, FlowItem) {
        let inner = self.inner.lock();
        (
            inner.send.items.get(&code).copied().unwrap_or_default(),
            inner.recv.items.get(&code).copied().unwrap_or_default(),
        )
    }

    /// Returns the `(send, recv)` byte totals.
    pub fn totals(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (inner.send.total, inner.recv.total)
    }

    /// Logs the counters at info level.
    pub fn print(&self) {
        let inner = self.inner.lock();
        inner.send.log(&self.name, "send");
        inner.recv.log(&self.name, "recv");
    }

    pub fn reset(&self) {
        *self.inner.lock() = Inner::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_by_code() {
        let meter = FlowMeter::new("p2p");
        meter.send(1, 100);
        meter.send(1, 50);
        meter.send(10004, 1000);
        meter.recv(1, 10);

        let (send, recv) = meter.item(1);
        assert_eq!(send, FlowItem { count: 2, size: 150 });
        assert_eq!(recv, FlowItem { count: 1, size: 10 });
        assert_eq!(meter.totals(), (1150, 10));

        meter.print();
        meter.reset();
        assert_eq!(meter.totals(), (0, 0));
        assert_eq!(meter.item(1).0, FlowItem::default());
    }
}
