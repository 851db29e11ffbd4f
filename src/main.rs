//! Entry point: wires configuration, logging, topology, and the policy
//! engine together, then runs the supervisor until a quit signal arrives.

use clap::Parser;
use numadv_config::{Cli, PolicyMode};
use numadv_controller::{spawn_control_socket, ControlBlock, GroupingSupervisor, Supervisor};
use numadv_net::NetResolver;
use numadv_policy::{Flags, PolicyEngine, SchedAffinity};
use numadv_procio::{CpuSysfs, ProcFs};
use numadv_topology::{TopoTree, TopoType};
use numadv_trace::{host_abi, SyscallAbi};
use signal_hook::consts::{SIGINT, SIGTERM, SIGUSR1, SIGUSR2};
use signal_hook::iterator::Signals;
use std::collections::HashMap;
use std::error::Error as StdError;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const CONTROL_SOCKET_PATH: &str = "/var/run/wisdom.sock";
const NET_SCRATCH_DIR: &str = "/run/wisdom-netns";

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = numadv_config::validate(&cli) {
        eprintln!("invalid configuration: {e}");
        return ExitCode::FAILURE;
    }
    if let Err(e) = numadv_telemetry::init(&cli.loglevel, cli.printlog) {
        eprintln!("failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "fatal startup error");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn StdError>> {
    let procfs = ProcFs::new("/proc");
    let sysfs = CpuSysfs::new("/sys");
    let tree = TopoTree::build(&sysfs)?;
    let cpu_to_numa = build_cpu_to_numa(&tree);

    let quit = CancellationToken::new();
    spawn_signal_handler(quit.clone());

    let control = Arc::new(ControlBlock::new(true));
    let _socket = spawn_control_socket(CONTROL_SOCKET_PATH, Arc::clone(&control), quit.clone())?;

    let abi: Arc<dyn SyscallAbi> = Arc::from(host_abi()?);
    let period = Duration::from_secs(cli.period);
    let trace_time = Duration::from_secs(cli.tracetime);

    match cli.policy {
        PolicyMode::ThreadsAffinity => {
            let flags = Flags {
                net_aware: cli.netaware,
                numa_aware: cli.autonuma,
                ccl_aware: cli.cclaware,
                coarse_grain: cli.coarsegrain,
                affinity_aware: cli.affinity_aware,
                per_core: false,
            };
            let engine = PolicyEngine::new(
                flags,
                tree,
                procfs.clone(),
                SchedAffinity,
                NetResolver::new(),
                cpu_to_numa,
                PathBuf::from(NET_SCRATCH_DIR),
                cli.task.clone(),
            );
            let mut supervisor = Supervisor::new(engine, control, procfs, abi, trace_time, "wisdom");
            supervisor.run(period, &quit);
        }
        PolicyMode::ThreadsGrouping => {
            let partition = numadv_config::resolve_partition(&cli, &tree)?;
            let task = cli.task.clone().ok_or("threadsgrouping requires --task")?;
            let mut supervisor = GroupingSupervisor::new(
                partition,
                procfs,
                abi,
                SchedAffinity,
                trace_time,
                control,
                task,
            );
            supervisor.run(period, &quit);
        }
    }

    Ok(())
}

fn build_cpu_to_numa(tree: &TopoTree) -> HashMap<usize, u32> {
    let mut cpu_to_numa = HashMap::new();
    for &numa_id in tree.nodes_of_type(TopoType::Numa) {
        let node = tree.node(numa_id);
        let Some(numa) = node.numa_id() else {
            continue;
        };
        for cpu in node.mask().iter() {
            cpu_to_numa.insert(cpu, numa);
        }
    }
    cpu_to_numa
}

/// Installs SIGINT/SIGTERM/SIGUSR1/SIGUSR2 handling: any of the four cancels
/// the quit token, which drains the control socket and the supervisor loop.
fn spawn_signal_handler(quit: CancellationToken) {
    let mut signals = match Signals::new([SIGINT, SIGTERM, SIGUSR1, SIGUSR2]) {
        Ok(signals) => signals,
        Err(e) => {
            tracing::warn!(error = %e, "failed to install signal handler, quit signals will be ignored");
            return;
        }
    };
    let spawned = std::thread::Builder::new()
        .name("wisdom-signals".into())
        .spawn(move || {
            if signals.forever().next().is_some() {
                quit.cancel();
            }
        });
    if let Err(e) = spawned {
        tracing::warn!(error = %e, "failed to spawn the signal-handling thread");
    }
}
