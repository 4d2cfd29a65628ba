//! Decides when a dropped file is safe to read and whether its content has
//! already been handled.
//!
//! Upstream tools write files in place, so a file is only ready once its size
//! and mtime have held still for the stability window. Content hashes of
//! processed files are remembered so re-listing an unchanged file is a no-op.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};

pub const DEFAULT_STABLE_WINDOW: Duration = Duration::from_millis(3000);
pub const DEFAULT_FORCE_WINDOW: Duration = Duration::from_secs(10);

/// blake3 digest of file content, hex encoded.
pub fn content_hash(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Observation {
    size: u64,
    mtime: SystemTime,
    since: Instant,
}

#[derive(Debug)]
pub struct StabilityGate {
    stable_window: Duration,
    force_window: Duration,
    observed: Mutex<HashMap<PathBuf, Observation>>,
    processed: Mutex<HashMap<PathBuf, String>>,
}

impl Default for StabilityGate {
    fn default() -> Self {
        Self::new(DEFAULT_STABLE_WINDOW, DEFAULT_FORCE_WINDOW)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl StabilityGate {
    pub fn new(stable_window: Duration, force_window: Duration) -> Self {
        Self {
            stable_window,
            force_window,
            observed: Mutex::new(HashMap::new()),
            processed: Mutex::new(HashMap::new()),
        }
    }

    /// Stat `path` and report whether it has been unchanged for the window.
    /// A vanished file is forgotten and reported not ready.
    pub fn is_ready(&self, path: &Path) -> bool {
        match std::fs::metadata(path) {
            Ok(meta) if meta.is_file() => {
                let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                self.observe(path, meta.len(), mtime, Instant::now())
            }
            _ => {
                self.forget(path);
                false
            }
        }
    }

    /// Record a sighting. Never true on the first sighting, or on any sighting
    /// where size or mtime differ from the previous one.
    pub fn observe(&self, path: &Path, size: u64, mtime: SystemTime, now: Instant) -> bool {
        let mut observed = lock(&self.observed);
        match observed.get(path) {
            Some(prev) if prev.size == size && prev.mtime == mtime => {
                now.saturating_duration_since(prev.since) >= self.stable_window
            }
            _ => {
                observed.insert(
                    path.to_path_buf(),
                    Observation {
                        size,
                        mtime,
                        since: now,
                    },
                );
                false
            }
        }
    }

    /// False when this exact content was already processed at `path`, unless
    /// the file was touched within the force window, in which case it is
    /// handled again.
    pub fn should_process(&self, path: &Path, hash: &str, mtime: SystemTime) -> bool {
        self.should_process_at(path, hash, mtime, SystemTime::now())
    }

    pub fn should_process_at(
        &self,
        path: &Path,
        hash: &str,
        mtime: SystemTime,
        now: SystemTime,
    ) -> bool {
        let processed = lock(&self.processed);
        match processed.get(path) {
            Some(prev) if prev == hash => {
                let age = now.duration_since(mtime).unwrap_or(Duration::ZERO);
                age < self.force_window
            }
            _ => true,
        }
    }

    pub fn mark_processed(&self, path: &Path, hash: &str) {
        lock(&self.processed).insert(path.to_path_buf(), hash.to_string());
    }

    pub fn forget(&self, path: &Path) {
        lock(&self.observed).remove(path);
        lock(&self.processed).remove(path);
    }

    /// Drop state for every path under `root` that is not in `live`.
    pub fn prune(&self, root: &Path, live: &HashSet<PathBuf>) {
        let keep = |p: &PathBuf| !p.starts_with(root) || live.contains(p);
        lock(&self.observed).retain(|p, _| keep(p));
        lock(&self.processed).retain(|p, _| keep(p));
    }

    pub fn tracked(&self) -> usize {
        lock(&self.observed).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn never_ready_on_first_sighting() {
        let gate = StabilityGate::new(Duration::ZERO, DEFAULT_FORCE_WINDOW);
        let p = Path::new("/drops/a.csv");
        let t = Instant::now();
        assert!(!gate.observe(p, 10, SystemTime::UNIX_EPOCH, t));
        assert!(gate.observe(p, 10, SystemTime::UNIX_EPOCH, t));
    }

    #[test]
    fn ready_only_after_window() {
        let gate = StabilityGate::default();
        let p = Path::new("/drops/a.csv");
        let t0 = Instant::now();
        let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        assert!(!gate.observe(p, 10, mtime, t0));
        assert!(!gate.observe(p, 10, mtime, t0 + Duration::from_millis(2999)));
        assert!(gate.observe(p, 10, mtime, t0 + Duration::from_millis(3000)));
    }

    #[test]
    fn change_resets_the_window() {
        let gate = StabilityGate::default();
        let p = Path::new("/drops/a.csv");
        let t0 = Instant::now();
        let mtime = SystemTime::UNIX_EPOCH;
        gate.observe(p, 10, mtime, t0);
        assert!(!gate.observe(p, 20, mtime, t0 + Duration::from_secs(5)));
        assert!(!gate.observe(p, 20, mtime, t0 + Duration::from_secs(7)));
        assert!(gate.observe(p, 20, mtime, t0 + Duration::from_secs(8)));
    }

    #[test]
    fn dedup_respects_force_window() {
        let gate = StabilityGate::default();
        let p = Path::new("/drops/cutstatusm1.csv");
        let now = SystemTime::now();
        let old = now - Duration::from_secs(60);
        let fresh = now - Duration::from_secs(2);

        assert!(gate.should_process_at(p, "h1", old, now));
        gate.mark_processed(p, "h1");
        assert!(!gate.should_process_at(p, "h1", old, now));
        assert!(gate.should_process_at(p, "h1", fresh, now));
        assert!(gate.should_process_at(p, "h2", old, now));
    }

    #[test]
    fn is_ready_reads_real_files_and_prunes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("loadstatuswt1.csv");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "part1,1").unwrap();
        drop(f);

        let gate = StabilityGate::new(Duration::ZERO, DEFAULT_FORCE_WINDOW);
        assert!(!gate.is_ready(&path));
        assert!(gate.is_ready(&path));
        assert_eq!(gate.tracked(), 1);

        gate.prune(dir.path(), &HashSet::new());
        assert_eq!(gate.tracked(), 0);

        std::fs::remove_file(&path).unwrap();
        assert!(!gate.is_ready(&path));
    }

    #[test]
    fn hash_is_stable() {
        assert_eq!(content_hash(b"part1,1\n"), content_hash(b"part1,1\n"));
        assert_ne!(content_hash(b"part1,1\n"), content_hash(b"part2,1\n"));
    }
}
