//! COWFS command-line front-end.
//!
//! `mount`/`umount` drive the kernel-facing event loop; every other
//! command operates on the backend directly and works whether or not
//! the filesystem is mounted. All commands exit 0 on success, non-zero
//! on any error, and support machine-readable output via `--json`.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use log::debug;

use cowfs::gc::{GcOptions, DEFAULT_SAFETY_WINDOW};
use cowfs::{snapshot, stats, version, Backend, CowMountOptions, DigestAlgo};

// ============================================================================
// Argument Surface
// ============================================================================

#[derive(Parser)]
#[command(name = "cowfs", version, about = "Copy-on-write versioning filesystem")]
struct Cli {
    /// Emit machine-readable JSON instead of human output
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Initialize a new backend directory
    Init {
        /// Backend directory
        backend: PathBuf,
        /// Digest algorithm, fixed for the backend's lifetime
        #[arg(long, default_value = "sha256")]
        digest_algo: String,
    },

    /// Mount a backend and serve it until unmounted
    Mount {
        /// Backend directory
        backend: PathBuf,
        /// Mount point
        mountpoint: PathBuf,
        /// Permit other users to access the mount
        #[arg(long)]
        allow_other: bool,
        /// Unmount automatically when this process exits
        #[arg(long)]
        auto_unmount: bool,
    },

    /// Unmount a mounted filesystem
    Umount {
        /// Mount point
        mountpoint: PathBuf,
    },

    /// Show a file's version chain
    History {
        /// Backend directory
        backend: PathBuf,
        /// File path inside the filesystem (e.g. /notes.txt)
        path: String,
    },

    /// Restore a file to an earlier version
    Restore {
        /// Backend directory
        backend: PathBuf,
        /// File path inside the filesystem
        path: String,
        /// Version number as printed by history
        #[arg(long, short = 'v')]
        version: Option<u64>,
        /// Restore the newest version older than this time
        /// (RFC 3339 or unix seconds)
        #[arg(long, conflicts_with = "version")]
        before: Option<String>,
    },

    /// Snapshot operations
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCmd,
    },

    /// Reclaim unreferenced objects
    Gc {
        /// Backend directory
        backend: PathBuf,
        /// Keep only each file's most recent N versions
        #[arg(long)]
        keep_last: Option<u32>,
        /// Soft-delete versions older than this time
        /// (RFC 3339 or unix seconds)
        #[arg(long)]
        before: Option<String>,
        /// Report without deleting
        #[arg(long)]
        dry_run: bool,
        /// Minimum object age in seconds before deletion
        #[arg(long, default_value_t = DEFAULT_SAFETY_WINDOW.as_secs())]
        safety_window: u64,
    },

    /// Show backend statistics
    Stats {
        /// Backend directory
        backend: PathBuf,
    },

    /// Show recent versions across all files
    Log {
        /// Backend directory
        backend: PathBuf,
        /// Maximum entries
        #[arg(long, short = 'n', default_value_t = 20)]
        limit: u32,
    },

    /// Show changed paths between a snapshot and the current tree,
    /// or between two snapshots
    Diff {
        /// Backend directory
        backend: PathBuf,
        /// Snapshot name (the older side)
        snapshot: String,
        /// Second snapshot name (the newer side; default: current tree)
        snapshot2: Option<String>,
    },
}

#[derive(Subcommand)]
enum SnapshotCmd {
    /// Capture the current tree
    Create {
        /// Backend directory
        backend: PathBuf,
        /// Unique snapshot name
        name: String,
        /// Optional description
        #[arg(long)]
        description: Option<String>,
    },
    /// List all snapshots
    List {
        /// Backend directory
        backend: PathBuf,
    },
    /// Describe one snapshot
    Show {
        /// Backend directory
        backend: PathBuf,
        /// Snapshot name
        name: String,
    },
    /// Restore the tree to a snapshot's state
    Restore {
        /// Backend directory
        backend: PathBuf,
        /// Snapshot name
        name: String,
        /// Leave files created after the snapshot in place
        #[arg(long)]
        keep_new: bool,
    },
    /// Delete a snapshot
    Delete {
        /// Backend directory
        backend: PathBuf,
        /// Snapshot name
        name: String,
    },
}

// ============================================================================
// Entry Point
// ============================================================================

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        // Human-readable, no stack traces.
        eprintln!("cowfs: {err:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let json = cli.json;
    match cli.command {
        Cmd::Init {
            backend,
            digest_algo,
        } => {
            let algo = DigestAlgo::from_str(&digest_algo)
                .map_err(|_| anyhow!("unknown digest algorithm '{digest_algo}'"))?;
            Backend::init(&backend, algo)
                .with_context(|| format!("initializing {}", backend.display()))?;
            if json {
                println!(
                    "{}",
                    serde_json::json!({ "initialized": backend, "digest_algo": algo.as_str() })
                );
            } else {
                println!("initialized {} ({algo})", backend.display());
            }
        }

        Cmd::Mount {
            backend,
            mountpoint,
            allow_other,
            auto_unmount,
        } => {
            let backend = Backend::open(&backend)?;
            let opts = CowMountOptions {
                allow_other,
                auto_unmount,
            };
            cowfs::mount(backend, &mountpoint, opts)
                .with_context(|| format!("mounting at {}", mountpoint.display()))?;
        }

        Cmd::Umount { mountpoint } => umount(&mountpoint)?,

        Cmd::History { backend, path } => {
            let backend = Backend::open(&backend)?;
            let path = fs_path(&path);
            let chain = version::history(&backend, &path)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&chain)?);
            } else {
                for info in &chain {
                    println!(
                        "v{:<4} {} {:>10} B  {}  {}",
                        info.n,
                        if info.current { "*" } else { " " },
                        info.version.size,
                        format_time(info.version.created_at),
                        info.version.digest.short(),
                    );
                }
            }
        }

        Cmd::Restore {
            backend,
            path,
            version: version_n,
            before,
        } => {
            let mut backend = Backend::open(&backend)?;
            let path = fs_path(&path);
            let restored = match (version_n, before) {
                (Some(n), None) => version::restore(&mut backend, &path, n)?,
                (None, Some(t)) => version::restore_before(&mut backend, &path, parse_time(&t)?)?,
                _ => bail!("exactly one of --version or --before is required"),
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&restored)?);
            } else {
                println!(
                    "restored {path} ({} bytes, version {})",
                    restored.size, restored.id
                );
            }
        }

        Cmd::Snapshot { command } => run_snapshot(command, json)?,

        Cmd::Gc {
            backend,
            keep_last,
            before,
            dry_run,
            safety_window,
        } => {
            let mut backend = Backend::open(&backend)?;
            let opts = GcOptions {
                keep_last,
                before: before.as_deref().map(parse_time).transpose()?,
                dry_run,
                safety_window: Duration::from_secs(safety_window),
            };
            let report = cowfs::gc::run(&mut backend, &opts)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "{}{} versions pruned, {} objects, {} bytes reclaimed",
                    if report.dry_run { "[dry run] " } else { "" },
                    report.versions_pruned,
                    if report.dry_run {
                        report.digests.len() as u64
                    } else {
                        report.objects_deleted
                    },
                    report.bytes_reclaimed,
                );
            }
        }

        Cmd::Stats { backend } => {
            let backend = Backend::open(&backend)?;
            let stats = stats::collect(&backend)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("format version:  {}", stats.format_version);
                println!("digest algo:     {}", stats.digest_algo);
                println!("files:           {}", stats.total_files);
                println!("versions:        {}", stats.total_versions);
                println!("objects:         {}", stats.total_objects);
                println!("orphans:         {}", stats.orphan_objects);
                println!("logical size:    {} B", stats.logical_bytes);
                println!("actual size:     {} B", stats.actual_bytes);
                println!(
                    "dedup savings:   {} B (ratio {:.2})",
                    stats.dedup_saved_bytes, stats.dedup_ratio
                );
            }
        }

        Cmd::Log { backend, limit } => {
            let backend = Backend::open(&backend)?;
            let entries = backend.index.recent_versions(limit)?;
            if json {
                let rows: Vec<serde_json::Value> = entries
                    .iter()
                    .map(|(path, v)| serde_json::json!({ "path": path, "version": v }))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                for (path, v) in &entries {
                    println!(
                        "{}  {:>10} B  {}  {}",
                        format_time(v.created_at),
                        v.size,
                        v.digest.short(),
                        path,
                    );
                }
            }
        }

        Cmd::Diff {
            backend,
            snapshot: old,
            snapshot2,
        } => {
            let backend = Backend::open(&backend)?;
            let changes = match snapshot2 {
                Some(new) => snapshot::diff::between(&backend, &old, &new)?,
                None => snapshot::diff::against_current(&backend, &old)?,
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&changes)?);
            } else {
                for change in &changes {
                    let tag = match change.kind {
                        snapshot::diff::ChangeKind::Added => "A",
                        snapshot::diff::ChangeKind::Removed => "D",
                        snapshot::diff::ChangeKind::Modified => "M",
                    };
                    println!("{tag} {}", change.path);
                }
            }
        }
    }
    Ok(())
}

fn run_snapshot(cmd: SnapshotCmd, json: bool) -> Result<()> {
    match cmd {
        SnapshotCmd::Create {
            backend,
            name,
            description,
        } => {
            let mut backend = Backend::open(&backend)?;
            let snap = snapshot::create(&mut backend, &name, description.as_deref())?;
            if json {
                println!("{}", serde_json::to_string_pretty(&snap)?);
            } else {
                println!("snapshot '{}' created", snap.name);
            }
        }
        SnapshotCmd::List { backend } => {
            let backend = Backend::open(&backend)?;
            let snaps = snapshot::list(&backend)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&snaps)?);
            } else {
                for snap in &snaps {
                    println!(
                        "{}  {}  {}",
                        format_time(snap.created_at),
                        snap.name,
                        snap.description.as_deref().unwrap_or(""),
                    );
                }
            }
        }
        SnapshotCmd::Show { backend, name } => {
            let backend = Backend::open(&backend)?;
            let detail = snapshot::show(&backend, &name)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&detail)?);
            } else {
                println!(
                    "snapshot '{}' ({}, {} files, {} B)",
                    detail.snapshot.name,
                    format_time(detail.snapshot.created_at),
                    detail.files.len(),
                    detail.total_bytes,
                );
                for file in &detail.files {
                    println!("  {:>10} B  {}  {}", file.size, file.digest.short(), file.path);
                }
            }
        }
        SnapshotCmd::Restore {
            backend,
            name,
            keep_new,
        } => {
            let mut backend = Backend::open(&backend)?;
            let report = snapshot::restore(&mut backend, &name, keep_new)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "restored '{name}': {} files, {} removed, {} kept",
                    report.files_restored, report.removed, report.kept_new
                );
            }
        }
        SnapshotCmd::Delete { backend, name } => {
            let mut backend = Backend::open(&backend)?;
            snapshot::delete(&mut backend, &name)?;
            if json {
                println!("{}", serde_json::json!({ "deleted": name }));
            } else {
                println!("snapshot '{name}' deleted");
            }
        }
    }
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

/// Unmount via the system helper; non-root FUSE mounts need fusermount.
fn umount(mountpoint: &std::path::Path) -> Result<()> {
    for tool in ["fusermount3", "fusermount", "umount"] {
        debug!("trying {tool} -u {}", mountpoint.display());
        let result = Command::new(tool).arg("-u").arg(mountpoint).output();
        match result {
            Ok(output) if output.status.success() => return Ok(()),
            Ok(output) => {
                debug!("{tool}: {}", String::from_utf8_lossy(&output.stderr));
            }
            Err(_) => continue, // tool not installed
        }
    }
    bail!("could not unmount {}", mountpoint.display())
}

/// Normalize a user-supplied file path to the absolute in-filesystem form.
fn fs_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_owned()
    } else {
        format!("/{path}")
    }
}

/// Accept RFC 3339 or unix seconds; return unix nanoseconds.
fn parse_time(s: &str) -> Result<i64> {
    if let Ok(secs) = s.parse::<i64>() {
        return Ok(secs.saturating_mul(1_000_000_000));
    }
    let parsed = DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("unrecognized time '{s}' (want RFC 3339 or unix seconds)"))?;
    parsed
        .timestamp_nanos_opt()
        .ok_or_else(|| anyhow!("time '{s}' out of range"))
}

fn format_time(nanos: i64) -> String {
    let secs = nanos.div_euclid(1_000_000_000);
    let sub = nanos.rem_euclid(1_000_000_000) as u32;
    DateTime::<Utc>::from_timestamp(secs, sub)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| nanos.to_string())
}
