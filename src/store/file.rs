use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::ReviewStore;
use crate::models::{PersistentState, Review, SeenRecord, Target};

/// File-backed store: one state document plus an append-only JSONL log per target.
///
/// ```text
/// {base}/
/// ├── state.json            # seen ids + last poll, atomically replaced
/// └── reviews/
///     └── {appId}-{country}.jsonl
/// ```
///
/// Assumes it is the only writer of `base`.
pub struct FileStore {
    base_path: PathBuf,
    state_path: PathBuf,
    inner: Mutex<StoreInner>,
}

struct StoreInner {
    state: PersistentState,
    /// Membership index mirroring `state.entries[..].seen_ids`
    index: HashMap<String, HashSet<String>>,
}

impl FileStore {
    pub fn new(base_path: impl AsRef<Path>) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        let reviews_dir = base_path.join("reviews");
        fs::create_dir_all(&reviews_dir)
            .with_context(|| format!("Failed to create data directory: {}", reviews_dir.display()))?;

        let state_path = base_path.join("state.json");
        let state = load_state(&state_path)?;
        let index = state
            .entries
            .iter()
            .map(|(key, record)| (key.clone(), record.seen_ids.iter().cloned().collect()))
            .collect();

        info!(
            path = %base_path.display(),
            targets = state.entries.len(),
            "Initialized file store"
        );

        Ok(Self {
            base_path,
            state_path,
            inner: Mutex::new(StoreInner { state, index }),
        })
    }

    pub fn reviews_path(&self, target: &Target) -> PathBuf {
        self.base_path
            .join("reviews")
            .join(format!("{}.jsonl", target.key()))
    }

    /// Append reviews to the target's log as one durable batch.
    ///
    /// The batch is synced before returning; a failed write is cut back so the
    /// log never keeps a partial batch.
    fn append_log(&self, target: &Target, reviews: &[Review]) -> Result<()> {
        let mut batch = Vec::new();
        for review in reviews {
            serde_json::to_writer(&mut batch, review)?;
            batch.push(b'\n');
        }

        let path = self.reviews_path(target);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open review log: {}", path.display()))?;

        append_durably(&mut file, &batch)
            .with_context(|| format!("Failed to append review log: {}", path.display()))
    }

    /// Write the state document to a temp file and rename it over the old one
    fn save_state(&self, state: &PersistentState) -> Result<()> {
        let tmp_path = self.state_path.with_extension("json.tmp");
        let content = serde_json::to_vec_pretty(state)?;

        let mut file = File::create(&tmp_path)
            .with_context(|| format!("Failed to create temp state: {}", tmp_path.display()))?;
        file.write_all(&content)
            .with_context(|| format!("Failed to write temp state: {}", tmp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync temp state: {}", tmp_path.display()))?;
        drop(file);

        fs::rename(&tmp_path, &self.state_path).with_context(|| {
            format!(
                "Failed to replace state {} -> {}",
                tmp_path.display(),
                self.state_path.display()
            )
        })?;

        Ok(())
    }
}

/// Log file that can be synced and cut back to an earlier length
trait AppendLog: Write {
    fn len(&self) -> io::Result<u64>;
    fn truncate(&mut self, len: u64) -> io::Result<()>;
    fn sync(&mut self) -> io::Result<()>;
}

impl AppendLog for File {
    fn len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

fn append_durably<L: AppendLog>(log: &mut L, batch: &[u8]) -> io::Result<()> {
    let original_len = log.len()?;

    let result = log
        .write_all(batch)
        .and_then(|_| log.flush())
        .and_then(|_| log.sync());

    if let Err(err) = result {
        if let Err(truncate_err) = log.truncate(original_len) {
            warn!(error = %truncate_err, "Failed to roll back partial review log write");
        }
        return Err(err);
    }

    Ok(())
}

fn load_state(path: &Path) -> Result<PersistentState> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(PersistentState::default()),
        Err(err) => {
            return Err(err).with_context(|| format!("Failed to read state: {}", path.display()))
        }
    };

    serde_json::from_str(&content).with_context(|| format!("Failed to parse state: {}", path.display()))
}

impl ReviewStore for FileStore {
    fn seen_set(&self, target: &Target) -> HashSet<String> {
        self.inner
            .lock()
            .index
            .get(&target.key())
            .cloned()
            .unwrap_or_default()
    }

    fn append_reviews(&self, target: &Target, reviews: &[Review], new_ids: &[String]) -> Result<()> {
        // one poll per target at a time, so the log itself needs no lock
        if !reviews.is_empty() {
            self.append_log(target, reviews)?;
        }

        let key = target.key();
        let mut inner = self.inner.lock();
        let StoreInner { state, index } = &mut *inner;

        let seen = index.entry(key.clone()).or_default();
        let record = state.entries.entry(key).or_insert_with(|| SeenRecord {
            seen_ids: Vec::new(),
            last_poll: Utc::now(),
        });

        for id in new_ids {
            if seen.insert(id.clone()) {
                record.seen_ids.push(id.clone());
            }
        }
        record.last_poll = Utc::now();

        self.save_state(state)?;

        debug!(key = %target, appended = reviews.len(), "Persisted poll results");
        Ok(())
    }

    fn read_recent_at(&self, target: &Target, horizon: Duration, now: DateTime<Utc>) -> Result<Vec<Review>> {
        let path = self.reviews_path(target);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to open review log: {}", path.display()))
            }
        };

        let cutoff = now - horizon;
        let mut reader = BufReader::new(file);
        let mut line = Vec::new();
        let mut reviews = Vec::new();
        let mut skipped = 0usize;

        loop {
            line.clear();
            let read = reader
                .read_until(b'\n', &mut line)
                .with_context(|| format!("Failed to read review log: {}", path.display()))?;
            if read == 0 {
                break;
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            match serde_json::from_slice::<Review>(&line) {
                Ok(review) if review.submitted_at >= cutoff => reviews.push(review),
                Ok(_) => {}
                Err(_) => skipped += 1,
            }
        }

        if skipped > 0 {
            debug!(key = %target, skipped, "Skipped corrupt review log lines");
        }

        reviews.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        Ok(reviews)
    }

    fn last_poll(&self, target: &Target) -> Option<DateTime<Utc>> {
        self.inner
            .lock()
            .state
            .entries
            .get(&target.key())
            .map(|record| record.last_poll)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn review(id: &str, submitted_at: DateTime<Utc>) -> Review {
        Review {
            id: id.to_string(),
            app_id: "1".to_string(),
            country: "us".to_string(),
            author: "alice".to_string(),
            rating: 4,
            title: format!("title {}", id),
            content: "content".to_string(),
            submitted_at,
        }
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_append_and_seen_set() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        let target = Target::new("1", "us");
        let now = Utc::now();

        store
            .append_reviews(&target, &[review("a", now), review("b", now)], &ids(&["a", "b"]))
            .unwrap();

        let seen = store.seen_set(&target);
        assert!(seen.contains("a") && seen.contains("b"));
        assert!(store.seen_set(&Target::new("1", "gb")).is_empty());
        assert!(store.last_poll(&target).is_some());
    }

    #[test]
    fn test_merge_skips_known_ids_and_keeps_order() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        let target = Target::new("1", "us");

        store.append_reviews(&target, &[], &ids(&["a", "b"])).unwrap();
        store.append_reviews(&target, &[], &ids(&["b", "c", "c"])).unwrap();

        let reopened = FileStore::new(dir.path()).unwrap();
        let inner = reopened.inner.lock();
        assert_eq!(inner.state.entries["1-us"].seen_ids, ids(&["a", "b", "c"]));
    }

    #[test]
    fn test_noop_append_advances_last_poll_only() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        let target = Target::new("1", "us");

        store.append_reviews(&target, &[review("a", Utc::now())], &ids(&["a"])).unwrap();
        let first = store.last_poll(&target).unwrap();
        let log_before = fs::read(store.reviews_path(&target)).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        store.append_reviews(&target, &[], &[]).unwrap();

        assert!(store.last_poll(&target).unwrap() > first);
        assert_eq!(fs::read(store.reviews_path(&target)).unwrap(), log_before);
        assert_eq!(store.seen_set(&target).len(), 1);
    }

    #[test]
    fn test_state_survives_reopen_without_temp_file() {
        let dir = tempdir().unwrap();
        let target = Target::new("1", "us");
        {
            let store = FileStore::new(dir.path()).unwrap();
            store.append_reviews(&target, &[], &ids(&["x"])).unwrap();
        }

        let store = FileStore::new(dir.path()).unwrap();
        assert!(store.seen_set(&target).contains("x"));
        assert!(dir.path().join("state.json").exists());
        assert!(!dir.path().join("state.json.tmp").exists());

        let raw: serde_json::Value =
            serde_json::from_slice(&fs::read(dir.path().join("state.json")).unwrap()).unwrap();
        assert_eq!(raw["entries"]["1-us"]["seenIds"][0], "x");
        assert!(raw["entries"]["1-us"]["lastPoll"].is_string());
    }

    #[test]
    fn test_corrupt_state_is_an_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("state.json"), "{not json").unwrap();
        assert!(FileStore::new(dir.path()).is_err());
    }

    #[test]
    fn test_seen_set_is_a_snapshot() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        let target = Target::new("1", "us");

        store.append_reviews(&target, &[], &ids(&["a"])).unwrap();
        let snapshot = store.seen_set(&target);
        store.append_reviews(&target, &[], &ids(&["b"])).unwrap();

        assert_eq!(snapshot.len(), 1);
        assert_eq!(store.seen_set(&target).len(), 2);
    }

    #[test]
    fn test_read_recent_boundary_and_order() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        let target = Target::new("1", "us");
        let now: DateTime<Utc> = "2026-05-10T12:00:00Z".parse().unwrap();
        let horizon = Duration::hours(48);

        let reviews = vec![
            review("edge", now - horizon),
            review("outside", now - horizon - Duration::seconds(1)),
            review("newest", now - Duration::hours(1)),
            review("middle", now - Duration::hours(10)),
        ];
        store.append_reviews(&target, &reviews, &[]).unwrap();

        let recent = store.read_recent_at(&target, horizon, now).unwrap();
        let got: Vec<&str> = recent.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(got, vec!["newest", "middle", "edge"]);
    }

    #[test]
    fn test_read_recent_skips_corrupt_lines() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        let target = Target::new("1", "us");
        let now = Utc::now();

        let good = serde_json::to_string(&review("ok", now)).unwrap();
        let mut content = b"{\"id\": \"broken\", \n".to_vec();
        content.extend_from_slice(&[0xff, 0xfe, b'\n']);
        content.extend_from_slice(good.as_bytes());
        content.push(b'\n');
        fs::write(store.reviews_path(&target), content).unwrap();

        let recent = store.read_recent_at(&target, Duration::hours(48), now).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, "ok");
    }

    /// In-memory log that accepts a limited number of bytes, then fails
    struct FlakyLog {
        data: Vec<u8>,
        capacity: usize,
        fail_sync: bool,
    }

    impl Write for FlakyLog {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let room = self.capacity.saturating_sub(self.data.len());
            if room == 0 {
                return Err(io::Error::new(ErrorKind::Other, "disk full"));
            }
            let n = room.min(buf.len());
            self.data.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl AppendLog for FlakyLog {
        fn len(&self) -> io::Result<u64> {
            Ok(self.data.len() as u64)
        }

        fn truncate(&mut self, len: u64) -> io::Result<()> {
            self.data.truncate(len as usize);
            Ok(())
        }

        fn sync(&mut self) -> io::Result<()> {
            if self.fail_sync {
                return Err(io::Error::new(ErrorKind::Other, "sync failed"));
            }
            Ok(())
        }
    }

    #[test]
    fn test_failed_append_leaves_no_partial_batch() {
        let mut log = FlakyLog {
            data: b"{\"id\":\"old\"}\n".to_vec(),
            capacity: 40,
            fail_sync: false,
        };
        let before = log.data.clone();

        let batch = b"{\"id\":\"a\"}\n{\"id\":\"b\"}\n{\"id\":\"c\"}\n";
        assert!(append_durably(&mut log, batch).is_err());
        assert_eq!(log.data, before);

        let mut log = FlakyLog {
            data: Vec::new(),
            capacity: usize::MAX,
            fail_sync: true,
        };
        assert!(append_durably(&mut log, batch).is_err());
        assert!(log.data.is_empty());
    }

    #[test]
    fn test_append_to_real_log_is_complete() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        let mut file = OpenOptions::new().create(true).append(true).open(&path).unwrap();

        append_durably(&mut file, b"one\n").unwrap();
        append_durably(&mut file, b"two\n").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"one\ntwo\n");
    }

    #[test]
    fn test_failed_log_write_keeps_state_untouched() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        let target = Target::new("1", "us");

        // a directory in place of the log makes the append fail
        fs::create_dir_all(store.reviews_path(&target)).unwrap();
        let result = store.append_reviews(&target, &[review("a", Utc::now())], &ids(&["a"]));

        assert!(result.is_err());
        assert!(store.seen_set(&target).is_empty());
        assert!(store.last_poll(&target).is_none());
    }

    #[test]
    fn test_read_recent_missing_log_is_empty() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        let recent = store.read_recent(&Target::new("9", "jp"), Duration::hours(48)).unwrap();
        assert!(recent.is_empty());
    }
}
