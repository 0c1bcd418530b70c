/// Upload and download progress shared between the channel and whoever polls
/// it for display.
///
/// Records are keyed by filename. Peers that do not yet know the real name
/// report under the `"Unknown"` placeholder; such updates land on the most
/// recently created record of the same map.
///
/// Each map remembers the previous `(transferred_size, instant)` per filename
/// so that an update can carry an ETA. Completed records never do.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use peerlink_types::models::{percent_of, ProgressRecord, TransferStatus, UNKNOWN_FILENAME};

/// Which of the two maps a record lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Download,
    Upload,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Download => f.write_str("download"),
            Direction::Upload => f.write_str("upload"),
        }
    }
}

/// Previous sample for one filename.
#[derive(Debug, Clone, Copy)]
struct RateSample {
    transferred: u64,
    at: Instant,
}

struct Entry {
    record: ProgressRecord,
    created_seq: u64,
}

#[derive(Default)]
struct MapInner {
    records: HashMap<String, Entry>,
    rates: HashMap<String, RateSample>,
    next_seq: u64,
}

impl MapInner {
    /// Key an incoming record merges into.
    fn resolve_key(&self, filename: &str) -> String {
        if filename == UNKNOWN_FILENAME {
            if let Some((key, _)) = self.records.iter().max_by_key(|(_, e)| e.created_seq) {
                return key.clone();
            }
        }
        filename.to_string()
    }

    fn apply(&mut self, incoming: ProgressRecord, now: Instant) -> ProgressRecord {
        let key = self.resolve_key(&incoming.filename);

        let mut record = match self.records.remove(&key) {
            Some(entry) => {
                let mut existing = entry.record;
                existing.total_size = incoming.total_size;
                existing.transferred_size = incoming.transferred_size;
                existing.status = incoming.status;
                if !incoming.file_type.is_empty() {
                    existing.file_type = incoming.file_type;
                }
                self.records.insert(
                    key.clone(),
                    Entry {
                        record: existing.clone(),
                        created_seq: entry.created_seq,
                    },
                );
                existing
            }
            None => {
                let mut fresh = incoming;
                fresh.filename = key.clone();
                let seq = self.next_seq;
                self.next_seq += 1;
                self.records.insert(
                    key.clone(),
                    Entry {
                        record: fresh.clone(),
                        created_seq: seq,
                    },
                );
                fresh
            }
        };

        record.progress_percent = percent_of(record.transferred_size, record.total_size);
        record.last_update_timestamp = Utc::now();
        record.time_remaining = self.estimate(&key, &record, now);

        if let Some(entry) = self.records.get_mut(&key) {
            entry.record = record.clone();
        }
        record
    }

    fn estimate(&mut self, key: &str, record: &ProgressRecord, now: Instant) -> Option<Duration> {
        if record.status == TransferStatus::Completed {
            self.rates.remove(key);
            return None;
        }

        let sample = RateSample {
            transferred: record.transferred_size,
            at: now,
        };
        let previous = self.rates.insert(key.to_string(), sample)?;

        let elapsed = now.duration_since(previous.at).as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }
        let delta = record.transferred_size as f64 - previous.transferred as f64;
        let throughput = delta / elapsed;
        if throughput <= 0.0 {
            return None;
        }

        // Peer-supplied sizes can push this past what a Duration holds.
        let remaining = record.total_size.saturating_sub(record.transferred_size) as f64;
        Duration::try_from_secs_f64(remaining / throughput).ok()
    }
}

/// One direction's record map.
#[derive(Default)]
pub struct ProgressMap {
    inner: Mutex<MapInner>,
}

impl ProgressMap {
    pub fn upsert(&self, batch: Vec<ProgressRecord>) -> Vec<ProgressRecord> {
        self.upsert_at(batch, Instant::now())
    }

    /// `upsert` with an explicit sample time.
    pub fn upsert_at(&self, batch: Vec<ProgressRecord>, now: Instant) -> Vec<ProgressRecord> {
        let mut inner = self.inner.lock();
        batch
            .into_iter()
            .map(|incoming| {
                let record = inner.apply(incoming, now);
                trace!(
                    "{}: {}/{} ({:.1}%) {:?}",
                    record.filename,
                    record.transferred_size,
                    record.total_size,
                    record.progress_percent,
                    record.status
                );
                record
            })
            .collect()
    }

    /// Set the status of an existing record, keeping its sizes. Returns the
    /// updated record, or `None` if the filename is not tracked.
    pub fn mark(&self, filename: &str, status: TransferStatus) -> Option<ProgressRecord> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let key = inner.resolve_key(filename);
        let current = inner.records.get(&key)?.record.clone();
        let updated = ProgressRecord {
            status,
            ..current
        };
        debug!("{} -> {:?}", key, status);
        Some(inner.apply(updated, now))
    }

    /// `mark`, but only while the record is still in `expected`.
    pub fn mark_if(
        &self,
        filename: &str,
        expected: TransferStatus,
        status: TransferStatus,
    ) -> Option<ProgressRecord> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let current = inner.records.get(filename)?.record.clone();
        if current.status != expected {
            return None;
        }
        debug!("{} {:?} -> {:?}", filename, expected, status);
        Some(inner.apply(ProgressRecord { status, ..current }, now))
    }

    /// Forget the rate sample for `filename`. The record itself stays.
    pub fn cleanup(&self, filename: &str) {
        self.inner.lock().rates.remove(filename);
    }

    pub fn get(&self, filename: &str) -> Option<ProgressRecord> {
        self.inner.lock().records.get(filename).map(|e| e.record.clone())
    }

    /// All records, oldest first.
    pub fn get_all(&self) -> Vec<ProgressRecord> {
        let inner = self.inner.lock();
        let mut entries: Vec<&Entry> = inner.records.values().collect();
        entries.sort_by_key(|e| e.created_seq);
        entries.into_iter().map(|e| e.record.clone()).collect()
    }

    pub fn clear_all(&self) {
        let mut inner = self.inner.lock();
        inner.records.clear();
        inner.rates.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Downloads and uploads, each behind its own lock.
#[derive(Default)]
pub struct ProgressRegistry {
    downloads: ProgressMap,
    uploads: ProgressMap,
}

impl ProgressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map(&self, direction: Direction) -> &ProgressMap {
        match direction {
            Direction::Download => &self.downloads,
            Direction::Upload => &self.uploads,
        }
    }

    pub fn downloads(&self) -> &ProgressMap {
        &self.downloads
    }

    pub fn uploads(&self) -> &ProgressMap {
        &self.uploads
    }

    pub fn upsert(&self, direction: Direction, batch: Vec<ProgressRecord>) -> Vec<ProgressRecord> {
        self.map(direction).upsert(batch)
    }

    pub fn mark(
        &self,
        direction: Direction,
        filename: &str,
        status: TransferStatus,
    ) -> Option<ProgressRecord> {
        self.map(direction).mark(filename, status)
    }

    pub fn cleanup(&self, direction: Direction, filename: &str) {
        self.map(direction).cleanup(filename)
    }

    pub fn get_all(&self, direction: Direction) -> Vec<ProgressRecord> {
        self.map(direction).get_all()
    }

    pub fn clear_all(&self) {
        self.downloads.clear_all();
        self.uploads.clear_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(name: &str, transferred: u64, total: u64, status: TransferStatus) -> ProgressRecord {
        ProgressRecord::new(name, "", total, transferred, status)
    }

    #[test]
    fn two_updates_merge_into_one_record() {
        let map = ProgressMap::default();
        map.upsert(vec![rec("a.txt", 0, 1000, TransferStatus::Transferring)]);
        map.upsert(vec![rec("a.txt", 500, 1000, TransferStatus::Transferring)]);

        let all = map.get_all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].transferred_size, 500);
        assert_eq!(all[0].progress_percent, 50.0);
    }

    #[test]
    fn upsert_is_idempotent() {
        let map = ProgressMap::default();
        let r = rec("a.txt", 200, 1000, TransferStatus::Transferring);
        map.upsert(vec![r.clone()]);
        map.upsert(vec![r]);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("a.txt").unwrap().transferred_size, 200);
    }

    #[test]
    fn percent_is_recomputed_not_trusted() {
        let map = ProgressMap::default();
        let mut r = rec("a.txt", 250, 1000, TransferStatus::Transferring);
        r.progress_percent = 99.0;
        let out = map.upsert(vec![r]);
        assert_eq!(out[0].progress_percent, 25.0);

        let out = map.upsert(vec![rec("z.bin", 10, 0, TransferStatus::Pending)]);
        assert_eq!(out[0].progress_percent, 0.0);
    }

    #[test]
    fn eta_from_consecutive_samples() {
        let map = ProgressMap::default();
        let t0 = Instant::now();
        let first = map.upsert_at(vec![rec("a.txt", 0, 1000, TransferStatus::Transferring)], t0);
        assert_eq!(first[0].time_remaining, None);

        let t1 = t0 + Duration::from_secs(2);
        let second = map.upsert_at(vec![rec("a.txt", 200, 1000, TransferStatus::Transferring)], t1);
        // 100 B/s with 800 B left.
        assert_eq!(second[0].time_remaining, Some(Duration::from_secs(8)));
    }

    #[test]
    fn stalled_transfer_has_no_eta() {
        let map = ProgressMap::default();
        let t0 = Instant::now();
        map.upsert_at(vec![rec("a.txt", 300, 1000, TransferStatus::Transferring)], t0);
        let out = map.upsert_at(
            vec![rec("a.txt", 300, 1000, TransferStatus::Transferring)],
            t0 + Duration::from_secs(5),
        );
        assert_eq!(out[0].time_remaining, None);
    }

    #[test]
    fn eta_beyond_duration_range_is_dropped() {
        let map = ProgressMap::default();
        let t0 = Instant::now();
        map.upsert_at(vec![rec("big.bin", 0, u64::MAX, TransferStatus::Transferring)], t0);
        let out = map.upsert_at(
            vec![rec("big.bin", 1, u64::MAX, TransferStatus::Transferring)],
            t0 + Duration::from_secs(2),
        );
        assert_eq!(out[0].time_remaining, None);
        assert_eq!(out[0].transferred_size, 1);
    }

    #[test]
    fn completed_never_carries_eta() {
        let map = ProgressMap::default();
        let t0 = Instant::now();
        map.upsert_at(vec![rec("a.txt", 0, 1000, TransferStatus::Transferring)], t0);
        let out = map.upsert_at(
            vec![rec("a.txt", 1000, 1000, TransferStatus::Completed)],
            t0 + Duration::from_secs(1),
        );
        assert_eq!(out[0].time_remaining, None);
        assert_eq!(map.get("a.txt").unwrap().time_remaining, None);

        let marked = map.mark("a.txt", TransferStatus::Completed).unwrap();
        assert_eq!(marked.time_remaining, None);
    }

    #[test]
    fn cleanup_forgets_previous_sample() {
        let map = ProgressMap::default();
        let t0 = Instant::now();
        map.upsert_at(vec![rec("a.txt", 0, 1000, TransferStatus::Transferring)], t0);
        map.cleanup("a.txt");

        let out = map.upsert_at(
            vec![rec("a.txt", 500, 1000, TransferStatus::Transferring)],
            t0 + Duration::from_secs(1),
        );
        assert_eq!(out[0].time_remaining, None);
        assert_eq!(map.len(), 1);

        let out = map.upsert_at(
            vec![rec("a.txt", 750, 1000, TransferStatus::Transferring)],
            t0 + Duration::from_secs(2),
        );
        // 250 B/s measured from the post-cleanup sample only.
        assert_eq!(out[0].time_remaining, Some(Duration::from_secs(1)));
    }

    #[test]
    fn unknown_merges_into_latest_record() {
        let map = ProgressMap::default();
        map.upsert(vec![rec("first.bin", 0, 100, TransferStatus::Transferring)]);
        map.upsert(vec![rec("second.bin", 0, 200, TransferStatus::Transferring)]);
        map.upsert(vec![rec(UNKNOWN_FILENAME, 50, 200, TransferStatus::Transferring)]);

        assert_eq!(map.len(), 2);
        assert_eq!(map.get("second.bin").unwrap().transferred_size, 50);
        assert_eq!(map.get("first.bin").unwrap().transferred_size, 0);
    }

    #[test]
    fn unknown_into_empty_map_is_inserted() {
        let map = ProgressMap::default();
        map.upsert(vec![rec(UNKNOWN_FILENAME, 5, 10, TransferStatus::Pending)]);
        assert_eq!(map.get_all()[0].filename, UNKNOWN_FILENAME);
    }

    #[test]
    fn mark_keeps_sizes() {
        let registry = ProgressRegistry::new();
        registry.upsert(
            Direction::Upload,
            vec![rec("u.bin", 40, 100, TransferStatus::Transferring)],
        );
        let marked = registry
            .mark(Direction::Upload, "u.bin", TransferStatus::Failed)
            .unwrap();
        assert_eq!(marked.status, TransferStatus::Failed);
        assert_eq!(marked.transferred_size, 40);
        assert!(registry.mark(Direction::Download, "u.bin", TransferStatus::Failed).is_none());
    }

    #[test]
    fn mark_if_only_moves_from_expected_status() {
        let map = ProgressMap::default();
        map.upsert(vec![rec("p.bin", 0, 0, TransferStatus::Pending)]);
        assert!(map.mark_if("p.bin", TransferStatus::Pending, TransferStatus::Failed).is_some());
        assert!(map.mark_if("p.bin", TransferStatus::Pending, TransferStatus::Failed).is_none());
        assert!(map.mark_if("nope", TransferStatus::Pending, TransferStatus::Failed).is_none());

        map.upsert(vec![rec("q.bin", 5, 10, TransferStatus::Transferring)]);
        assert!(map.mark_if("q.bin", TransferStatus::Pending, TransferStatus::Failed).is_none());
        assert_eq!(map.get("q.bin").unwrap().status, TransferStatus::Transferring);
    }

    #[test]
    fn maps_are_independent_and_clearable() {
        let registry = ProgressRegistry::new();
        registry.upsert(Direction::Download, vec![rec("d", 1, 2, TransferStatus::Pending)]);
        registry.upsert(Direction::Upload, vec![rec("u", 1, 2, TransferStatus::Pending)]);
        assert_eq!(registry.get_all(Direction::Download).len(), 1);
        assert_eq!(registry.get_all(Direction::Upload)[0].filename, "u");

        registry.clear_all();
        assert!(registry.downloads().is_empty());
        assert!(registry.uploads().is_empty());
    }
}
