//! Tick-based CPU and per-task load tracking.
//!
//! Load is reported as a 10-bit fixed-point fraction of a CPU
//! (`1024 == 100%`), derived from the delta in `user + system` jiffies over
//! the delta in wall-clock time, itself converted to jiffies via
//! [`CLK_TCK`]. A tracker never extrapolates across a zero-length window:
//! such samples are dropped rather than producing a bogus infinite load.

use numadv_procio::{Pid, ProcFs, Tid};
use std::time::{Duration, Instant};

/// Kernel clock ticks per second, matching the common `CLK_TCK` value on
/// Linux (`sysconf(_SC_CLK_TCK)`). Fixed rather than queried at runtime: the
/// advisor only ever runs on kernels where this holds.
pub const CLK_TCK: u64 = 100;

/// Errors produced while sampling `/proc`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The underlying procfs read failed; not found is the expected case
    /// for a task/cpu that has since disappeared and should be unbound
    /// silently by the caller.
    #[error(transparent)]
    Procio(#[from] numadv_procio::Error),
}

fn ticks_elapsed(dt: Duration) -> u64 {
    (dt.as_nanos() * u128::from(CLK_TCK) / 1_000_000_000) as u64
}

/// 10-bit fixed point: `1024 == 100%` of a single CPU.
fn compute_load(delta_ticks: u64, dt_ticks: u64) -> Option<i64> {
    if dt_ticks == 0 {
        None
    } else {
        Some((i64::try_from(delta_ticks).unwrap_or(i64::MAX) << 10) / dt_ticks as i64)
    }
}

#[derive(Debug, Clone, Copy)]
struct Baseline {
    last_update: Instant,
    last_user: u64,
    last_system: u64,
}

impl Baseline {
    /// Folds in a new `(user, system)` sample at `now`, returning the
    /// updated load. A zero-length window is dropped entirely: `prev_load`
    /// is returned and the baseline is left untouched, so a later sample
    /// still measures from the last real update rather than from `now`.
    fn advance(&mut self, now: Instant, user: u64, system: u64, prev_load: i64) -> i64 {
        let dt_ticks = ticks_elapsed(now.duration_since(self.last_update));
        if dt_ticks == 0 {
            return prev_load;
        }
        let delta = user
            .saturating_sub(self.last_user)
            .saturating_add(system.saturating_sub(self.last_system));
        let load = compute_load(delta, dt_ticks).unwrap_or(prev_load);
        *self = Baseline {
            last_update: now,
            last_user: user,
            last_system: system,
        };
        load
    }
}

/// Load state for a single logical CPU.
#[derive(Debug, Clone, Copy)]
pub struct CpuLoad {
    cpu: usize,
    baseline: Baseline,
    load: i64,
}

impl CpuLoad {
    /// The CPU id this entry tracks.
    pub fn cpu(&self) -> usize {
        self.cpu
    }

    /// The most recently computed load (10-bit fixed point).
    pub fn load(&self) -> i64 {
        self.load
    }
}

/// Load state for a single task (thread).
#[derive(Debug, Clone, Copy)]
pub struct TaskLoad {
    pid: Pid,
    tid: Tid,
    baseline: Baseline,
    load: i64,
}

impl TaskLoad {
    /// The owning process id.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// The thread id this entry tracks.
    pub fn tid(&self) -> Tid {
        self.tid
    }

    /// The most recently computed load (10-bit fixed point).
    pub fn load(&self) -> i64 {
        self.load
    }
}

/// Owns per-CPU and per-task load state across ticks.
#[derive(Debug, Default)]
pub struct LoadTracker {
    cpus: Vec<CpuLoad>,
    tasks: Vec<TaskLoad>,
}

impl LoadTracker {
    /// An empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    fn cpu_index(&self, cpu: usize) -> Option<usize> {
        self.cpus.iter().position(|c| c.cpu == cpu)
    }

    fn task_index(&self, tid: Tid) -> Option<usize> {
        self.tasks.iter().position(|t| t.tid == tid)
    }

    /// Load last computed for `cpu`, if it has been sampled.
    pub fn cpu_load(&self, cpu: usize) -> Option<i64> {
        self.cpu_index(cpu).map(|i| self.cpus[i].load)
    }

    /// Load last computed for `tid`, if it is tracked.
    pub fn task_load(&self, tid: Tid) -> Option<i64> {
        self.task_index(tid).map(|i| self.tasks[i].load)
    }

    /// All currently tracked tasks.
    pub fn tasks(&self) -> &[TaskLoad] {
        &self.tasks
    }

    /// Samples `/proc/stat` at `now`, updating every CPU's baseline and
    /// load. CPUs seen for the first time record a baseline with load left
    /// at zero (init mode).
    pub fn update_cpus(&mut self, procfs: &ProcFs, now: Instant) -> Result<(), Error> {
        for (cpu, user, system) in procfs.stat_cpu_lines()? {
            match self.cpu_index(cpu) {
                Some(i) => {
                    let prev = self.cpus[i].load;
                    self.cpus[i].load = self.cpus[i].baseline.advance(now, user, system, prev);
                }
                None => self.cpus.push(CpuLoad {
                    cpu,
                    baseline: Baseline {
                        last_update: now,
                        last_user: user,
                        last_system: system,
                    },
                    load: 0,
                }),
            }
        }
        Ok(())
    }

    /// Starts tracking `tid` (owned by `pid`), recording its baseline
    /// immediately. A no-op if `tid` is already tracked.
    pub fn add_task(&mut self, procfs: &ProcFs, pid: Pid, tid: Tid, now: Instant) -> Result<(), Error> {
        if self.task_index(tid).is_some() {
            return Ok(());
        }
        let (user, system) = procfs.task_stat_ticks(pid, tid)?;
        self.tasks.push(TaskLoad {
            pid,
            tid,
            baseline: Baseline {
                last_update: now,
                last_user: user,
                last_system: system,
            },
            load: 0,
        });
        Ok(())
    }

    /// Stops tracking `tid`. A no-op if it was not tracked.
    pub fn remove_task(&mut self, tid: Tid) {
        self.tasks.retain(|t| t.tid != tid);
    }

    /// Samples `/proc/<pid>/task/<tid>/stat` for every tracked task at
    /// `now`, updating its load. Returns the updated load for `tid`, or
    /// `None` if it is not tracked.
    pub fn update_task(&mut self, procfs: &ProcFs, tid: Tid, now: Instant) -> Result<Option<i64>, Error> {
        let Some(i) = self.task_index(tid) else {
            return Ok(None);
        };
        let pid = self.tasks[i].pid;
        let (user, system) = procfs.task_stat_ticks(pid, tid)?;
        let prev = self.tasks[i].load;
        self.tasks[i].load = self.tasks[i].baseline.advance(now, user, system, prev);
        Ok(Some(self.tasks[i].load))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::thread;

    #[test]
    fn formula_matches_fixed_point_definition() {
        // 50 ticks of delta over 100 ticks of wall time == 50% == 512.
        assert_eq!(compute_load(50, 100), Some(512));
        // A full tick's worth of delta over one tick == 100% == 1024.
        assert_eq!(compute_load(1, 1), Some(1024));
    }

    #[test]
    fn zero_dt_drops_the_sample() {
        assert_eq!(compute_load(50, 0), None);
    }

    #[test]
    fn zero_dt_leaves_the_baseline_untouched() {
        let now = Instant::now();
        let mut baseline = Baseline {
            last_update: now,
            last_user: 10,
            last_system: 20,
        };
        let load = baseline.advance(now, 999, 999, 42);
        assert_eq!(load, 42);
        assert_eq!(baseline.last_update, now);
        assert_eq!(baseline.last_user, 10);
        assert_eq!(baseline.last_system, 20);
    }

    #[test]
    fn init_mode_records_baseline_without_load() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("1/task/123")).unwrap();
        fs::write(
            root.join("1/task/123/stat"),
            "123 (w) S 1 1 1 0 -1 0 0 0 0 0 10 20 0 0 20 0 1 0 0 0",
        )
        .unwrap();
        let procfs = ProcFs::new(root);
        let mut tracker = LoadTracker::new();
        tracker.add_task(&procfs, 1, 123, Instant::now()).unwrap();
        assert_eq!(tracker.task_load(123), Some(0));
    }

    #[test]
    fn task_load_updates_after_elapsed_ticks() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("1/task/123")).unwrap();
        let write_stat = |user: u64, system: u64| {
            fs::write(
                root.join("1/task/123/stat"),
                format!("123 (w) S 1 1 1 0 -1 0 0 0 0 0 {user} {system} 0 0 20 0 1 0 0 0"),
            )
            .unwrap();
        };
        write_stat(0, 0);
        let procfs = ProcFs::new(root);
        let mut tracker = LoadTracker::new();
        let t0 = Instant::now();
        tracker.add_task(&procfs, 1, 123, t0).unwrap();

        thread::sleep(Duration::from_millis(15));
        write_stat(1, 0);
        let load = tracker
            .update_task(&procfs, 123, Instant::now())
            .unwrap()
            .unwrap();
        // At least one tick of delta accrued; never negative, never the
        // stale zero baseline value.
        assert!(load > 0);
    }

    #[test]
    fn remove_task_unlinks_it() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("1/task/123")).unwrap();
        fs::write(
            root.join("1/task/123/stat"),
            "123 (w) S 1 1 1 0 -1 0 0 0 0 0 0 0 0 0 20 0 1 0 0 0",
        )
        .unwrap();
        let procfs = ProcFs::new(root);
        let mut tracker = LoadTracker::new();
        tracker.add_task(&procfs, 1, 123, Instant::now()).unwrap();
        assert!(tracker.task_load(123).is_some());
        tracker.remove_task(123);
        assert!(tracker.task_load(123).is_none());
    }

    #[test]
    fn cpu_lines_drive_per_cpu_load() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        fs::write(root.join("stat"), "cpu0 0 0 0 0 0 0 0 0 0 0\n").unwrap();
        let procfs = ProcFs::new(root);
        let mut tracker = LoadTracker::new();
        tracker.update_cpus(&procfs, Instant::now()).unwrap();
        assert_eq!(tracker.cpu_load(0), Some(0));
    }
}
