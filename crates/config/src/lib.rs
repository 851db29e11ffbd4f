//! CLI flags and CPU-partition JSON schema shared by the `advisord` binary.

/// The `advisord` command-line flags.
pub mod cli;
/// Errors validating CLI input and CPU-partition files.
pub mod error;
/// The `--json` CPU-partition file schema.
pub mod partition_file;

pub use cli::{Cli, PolicyMode};
pub use error::Error;

use numadv_partition::CpuPartition;
use numadv_topology::TopoTree;

/// Validates the range and mode-specific constraints on the CLI flags that
/// aren't already enforced by `clap`'s own parsing. `--task` is only
/// required for `threadsgrouping`; `threadsaffinity` with no `--task` scans
/// every pid under `/proc`.
pub fn validate(cli: &Cli) -> Result<(), Error> {
    if !(1..=3600).contains(&cli.period) {
        return Err(Error::InvalidPeriod(cli.period));
    }
    if cli.tracetime == 0 || cli.tracetime >= cli.period {
        return Err(Error::InvalidTraceTime {
            got: cli.tracetime,
            max: cli.period - 1,
        });
    }
    if cli.policy == PolicyMode::ThreadsGrouping && cli.task.is_none() {
        return Err(Error::MissingTask(cli.policy));
    }
    Ok(())
}

/// Resolves the CPU partition to bind against: the `--json` file if given,
/// otherwise one NET-tagged group per NUMA node.
pub fn resolve_partition(cli: &Cli, tree: &TopoTree) -> Result<CpuPartition, Error> {
    match &cli.json {
        Some(path) => partition_file::load(path),
        None => Ok(CpuPartition::default_from_topology(tree)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_cli() -> Cli {
        Cli {
            policy: PolicyMode::ThreadsAffinity,
            period: 10,
            tracetime: 5,
            task: Some("worker".to_string()),
            autonuma: false,
            netaware: false,
            cclaware: false,
            coarsegrain: false,
            affinity_aware: false,
            json: None,
            loglevel: "info".to_string(),
            printlog: false,
        }
    }

    #[test]
    fn accepts_a_well_formed_cli() {
        assert!(validate(&base_cli()).is_ok());
    }

    #[test]
    fn rejects_a_period_outside_the_bound() {
        let mut cli = base_cli();
        cli.period = 0;
        assert!(validate(&cli).is_err());
        cli.period = 3601;
        assert!(validate(&cli).is_err());
    }

    #[test]
    fn rejects_tracetime_not_below_period() {
        let mut cli = base_cli();
        cli.tracetime = cli.period;
        assert!(validate(&cli).is_err());
    }

    #[test]
    fn rejects_a_missing_task_for_threadsgrouping() {
        let mut cli = base_cli();
        cli.policy = PolicyMode::ThreadsGrouping;
        cli.task = None;
        assert!(validate(&cli).is_err());
    }

    #[test]
    fn threadsaffinity_with_no_task_scans_every_pid() {
        let mut cli = base_cli();
        cli.policy = PolicyMode::ThreadsAffinity;
        cli.task = None;
        assert!(validate(&cli).is_ok());
    }
}
