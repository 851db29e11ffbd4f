//! Daemon CLI flags, matching the daemon's external flag surface.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Which top-level run mode the daemon should drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PolicyMode {
    /// Trace futex syscalls to infer thread-affinity groups and bind them
    /// with the topology-driven policy engine.
    #[value(name = "threadsaffinity")]
    ThreadsAffinity,
    /// Trace net/IO syscalls and distribute threads across a configured
    /// CPU partition.
    #[value(name = "threadsgrouping")]
    ThreadsGrouping,
}

/// `advisord`'s command-line flags.
#[derive(Debug, Parser)]
#[command(name = "advisord", about = "User-space CPU-affinity advisor for NUMA servers")]
pub struct Cli {
    /// Which run mode to drive.
    #[arg(long)]
    pub policy: PolicyMode,

    /// Scan and balance period, in seconds (1..=3600).
    #[arg(long, default_value_t = 10)]
    pub period: u64,

    /// Length of each trace collection window, in seconds (1..period).
    #[arg(long, default_value_t = 5)]
    pub tracetime: u64,

    /// The `comm` of the process(es) to track.
    #[arg(long)]
    pub task: Option<String>,

    /// Prefer `task_fault_siblings` NUMA aggregates when choosing a group's node.
    #[arg(long)]
    pub autonuma: bool,

    /// Prefer the net resolver's NUMA preference when choosing a group's node.
    #[arg(long)]
    pub netaware: bool,

    /// Bind within a cluster rather than a whole NUMA node, and run migration every tick.
    #[arg(long)]
    pub cclaware: bool,

    /// Bind to a node's whole mask rather than its single lightest CPU.
    #[arg(long)]
    pub coarsegrain: bool,

    /// Drive dispatch from ptrace/futex group detection (implied by `--policy=threadsaffinity`).
    #[arg(long = "affinityAware")]
    pub affinity_aware: bool,

    /// Path to a CPU-partition JSON file (`{"io": [...], "net": [...]}`).
    #[arg(long, value_name = "PATH")]
    pub json: Option<PathBuf>,

    /// `tracing` log level filter.
    #[arg(long, default_value = "info")]
    pub loglevel: String,

    /// Also echo logs to stdout.
    #[arg(long)]
    pub printlog: bool,
}
