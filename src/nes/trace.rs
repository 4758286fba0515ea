use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::ops::RangeInclusive;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TraceEntry {
    pub address: u16,
    pub opcode: u8,
    pub bank_epoch: u32,
}

#[derive(Debug, Clone)]
pub struct TraceLog {
    capacity: usize,
    recent: VecDeque<TraceEntry>,
    by_address: BTreeMap<u16, TraceEntry>,
    bank_epoch: u32,
}

impl TraceLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            recent: VecDeque::with_capacity(capacity.min(4096)),
            by_address: BTreeMap::new(),
            bank_epoch: 0,
        }
    }

    pub fn record(&mut self, address: u16, opcode: u8) -> TraceEntry {
        let entry = TraceEntry {
            address,
            opcode,
            bank_epoch: self.bank_epoch,
        };
        if self.capacity == 0 {
            return entry;
        }
        if self.recent.len() >= self.capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(entry);
        self.by_address.insert(address, entry);
        entry
    }

    pub fn lookup(&self, address: u16) -> Option<&TraceEntry> {
        self.by_address.get(&address)
    }

    pub fn invalidate(&mut self, range: RangeInclusive<u16>) -> usize {
        let stale: Vec<u16> = self.by_address.range(range).map(|(&addr, _)| addr).collect();
        for addr in &stale {
            self.by_address.remove(addr);
        }
        self.bank_epoch = self.bank_epoch.wrapping_add(1);
        stale.len()
    }

    pub fn bank_epoch(&self) -> u32 {
        self.bank_epoch
    }

    pub fn recent(&self, limit: usize) -> Vec<TraceEntry> {
        self.recent.iter().rev().take(limit).copied().collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = &TraceEntry> {
        self.by_address.values()
    }

    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }

    pub fn clear(&mut self) {
        self.recent.clear();
        self.by_address.clear();
    }

    pub fn to_json_lines(&self) -> Result<String> {
        let mut out = String::new();
        for entry in self.entries() {
            let line = serde_json::to_string(entry)
                .with_context(|| format!("failed to encode trace entry at ${:04X}", entry.address))?;
            out.push_str(&line);
            out.push('\n');
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recent_list_is_bounded() {
        let mut log = TraceLog::new(3);
        for (i, addr) in [0x8000u16, 0x8002, 0x8004, 0x8006].into_iter().enumerate() {
            log.record(addr, i as u8);
        }
        let recent = log.recent(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].address, 0x8006);
        assert_eq!(recent[2].address, 0x8002);
        assert_eq!(log.lookup(0x8000).map(|e| e.opcode), Some(0));
    }

    #[test]
    fn invalidate_drops_only_switched_window() {
        let mut log = TraceLog::new(16);
        log.record(0x8000, 0xA9);
        log.record(0x9FFF, 0x60);
        log.record(0xC000, 0x4C);

        assert_eq!(log.invalidate(0x8000..=0x9FFF), 2);
        assert!(log.lookup(0x8000).is_none());
        assert_eq!(log.lookup(0xC000).map(|e| e.bank_epoch), Some(0));

        let entry = log.record(0x8000, 0xEA);
        assert_eq!(entry.bank_epoch, 1);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn json_lines_are_address_ordered() {
        let mut log = TraceLog::new(8);
        log.record(0xC000, 0x4C);
        log.record(0x8000, 0x78);
        let text = log.to_json_lines().unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["address"], 0x8000);
        assert_eq!(first["opcode"], 0x78);
        assert_eq!(first["bank_epoch"], 0);
    }

    #[test]
    fn zero_capacity_records_nothing() {
        let mut log = TraceLog::new(0);
        log.record(0x8000, 0x00);
        assert!(log.is_empty());
        assert!(log.recent(4).is_empty());
    }
}
