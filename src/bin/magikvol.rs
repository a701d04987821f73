//! magikvol - App Volume Administration CLI
//!
//! Thin operator front end over the volume engine. Must run as root.
//!
//! ## Usage
//!
//! ```sh
//! magikvol ensure <app> [--create]
//! magikvol snapshot <app>
//! magikvol restore <app> latest
//! magikvol branch create <app> <branch>
//! magikvol branch apply <app> <branch>
//! ```
//!
//! ## Environment
//!
//! - `MAGIKVOL_LOG` - log filter (default `info`)
//! - `MAGIKVOL_APPS_DIR`, `MAGIKVOL_SHADOW_DIR`, `MAGIKVOL_IMAGE`,
//!   `MAGIKVOL_CONTAINER_PREFIX`, `MAGIKVOL_BACKING_SIZE` - see `Settings`

use magikvol::{
    BranchManager, DockerCli, Settings, ShadowMergeEngine, SnapshotManager, VolumeStore,
};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug)]
enum BranchAction {
    List,
    Create,
    Delete,
    Apply,
}

#[derive(Debug)]
enum Command {
    Ensure { app: String, create: bool },
    Delete { app: String },
    Snapshot { app: String },
    Snapshots { app: String },
    Resolve { app: String, reference: String },
    Restore { app: String, reference: String },
    Branch {
        action: BranchAction,
        app: String,
        branch: Option<String>,
    },
    Version,
    Help,
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    let Some(command) = args.get(1) else {
        return Ok(Command::Help);
    };

    let app = |what: &str| -> Result<String, String> {
        args.get(2)
            .cloned()
            .ok_or_else(|| format!("{what} requires <app>"))
    };

    match command.as_str() {
        "ensure" => Ok(Command::Ensure {
            app: app("ensure")?,
            create: args.iter().skip(3).any(|a| a == "--create" || a == "-c"),
        }),
        "delete" => Ok(Command::Delete { app: app("delete")? }),
        "snapshot" => Ok(Command::Snapshot {
            app: app("snapshot")?,
        }),
        "snapshots" => Ok(Command::Snapshots {
            app: app("snapshots")?,
        }),
        "resolve" | "restore" => {
            let app = app(command)?;
            let reference = args
                .get(3)
                .cloned()
                .ok_or_else(|| format!("{command} requires <ref>"))?;
            if command == "resolve" {
                Ok(Command::Resolve { app, reference })
            } else {
                Ok(Command::Restore { app, reference })
            }
        }
        "branch" => {
            let action = match args.get(2).map(String::as_str) {
                Some("list") => BranchAction::List,
                Some("create") => BranchAction::Create,
                Some("delete") => BranchAction::Delete,
                Some("apply") => BranchAction::Apply,
                Some(other) => return Err(format!("unknown branch action: {other}")),
                None => return Err("branch requires an action".to_string()),
            };
            let app = args
                .get(3)
                .cloned()
                .ok_or_else(|| "branch requires <app>".to_string())?;
            let branch = args.get(4).cloned();
            if matches!(action, BranchAction::Create) && branch.is_none() {
                return Err("branch create requires <branch>".to_string());
            }
            Ok(Command::Branch {
                action,
                app,
                branch,
            })
        }
        "version" | "--version" | "-v" => Ok(Command::Version),
        "help" | "--help" | "-h" => Ok(Command::Help),
        unknown => Err(format!("unknown command: {unknown}")),
    }
}

// =============================================================================
// Commands
// =============================================================================

struct Engine {
    volumes: Arc<VolumeStore>,
    snapshots: Arc<SnapshotManager>,
    branches: Arc<BranchManager>,
}

impl Engine {
    fn from_env() -> Self {
        let volumes = Arc::new(VolumeStore::system(Settings::from_env()));
        let snapshots = Arc::new(SnapshotManager::new(
            Arc::clone(&volumes),
            Arc::new(DockerCli::new()),
        ));
        let branches = Arc::new(BranchManager::new(Arc::clone(&snapshots)));
        Self {
            volumes,
            snapshots,
            branches,
        }
    }

    fn container(&self, app: &str) -> String {
        self.volumes.settings().container_name(app)
    }
}

fn run(engine: &Engine, command: Command) -> magikvol::Result<()> {
    match command {
        Command::Ensure { app, create } => match engine.volumes.ensure_volume(&app, create)? {
            Some(cfg) => println!("{}", cfg.mount_dir.display()),
            None => println!("volume for {app} does not exist (use --create)"),
        },
        Command::Delete { app } => {
            engine.volumes.delete_volume(&app)?;
            println!("deleted {app}");
        }
        Command::Snapshot { app } => {
            let tag = engine.snapshots.create_snapshot(&engine.container(&app), &app)?;
            println!("{tag}");
        }
        Command::Snapshots { app } => {
            println!("TAG\tCREATED");
            for snapshot in engine.snapshots.list_snapshots(&app)? {
                let created = snapshot
                    .created
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                println!("{}\t{}", snapshot.tag, created);
            }
        }
        Command::Resolve { app, reference } => {
            println!("{}", engine.snapshots.resolve_snapshot_ref(&app, &reference)?);
        }
        Command::Restore { app, reference } => {
            let tag = engine.snapshots.resolve_snapshot_ref(&app, &reference)?;
            engine
                .snapshots
                .restore_snapshot(&engine.container(&app), &app, &tag)?;
            println!("restored {app} to {tag}");
        }
        Command::Branch {
            action,
            app,
            branch,
        } => run_branch(engine, action, &app, branch.as_deref())?,
        Command::Version => cmd_version(),
        Command::Help => cmd_help(),
    }
    Ok(())
}

fn run_branch(
    engine: &Engine,
    action: BranchAction,
    app: &str,
    branch: Option<&str>,
) -> magikvol::Result<()> {
    match (action, branch) {
        (BranchAction::List, _) => {
            println!("BRANCH\tBASE SNAPSHOT\tCREATED");
            for meta in engine.branches.list_branches(app)? {
                println!(
                    "{}\t{}\t{}",
                    meta.branch,
                    meta.base_snapshot_ref,
                    meta.created_at.to_rfc3339()
                );
            }
        }
        (BranchAction::Create, Some(branch)) => {
            let meta = engine.branches.create_branch(app, branch)?;
            println!(
                "created {} from {}",
                magikvol::derive_app_name(&meta.base_app, &meta.branch)?,
                meta.base_snapshot_ref
            );
        }
        (BranchAction::Create, None) => {
            return Err(magikvol::Error::InvalidName {
                name: String::new(),
                reason: "branch name is required".to_string(),
            });
        }
        (BranchAction::Delete, Some(branch)) => engine.branches.delete_branch(app, branch)?,
        (BranchAction::Delete, None) => engine.branches.delete_branch_for_app(app)?,
        (BranchAction::Apply, Some(branch)) => {
            ShadowMergeEngine::new(Arc::clone(&engine.branches)).apply_branch(app, branch)?;
        }
        (BranchAction::Apply, None) => {
            ShadowMergeEngine::new(Arc::clone(&engine.branches)).apply_branch_for_app(app)?;
        }
    }
    Ok(())
}

fn cmd_version() {
    println!("magikvol version {}", env!("CARGO_PKG_VERSION"));
}

fn cmd_help() {
    println!(
        r#"magikvol - copy-on-write app volumes

USAGE:
    magikvol <command> [options]

COMMANDS:
    ensure <app> [--create]             Attach and mount an app volume
    delete <app>                        Unmount and remove an app volume
    snapshot <app>                      Take the next v<N> snapshot
    snapshots <app>                     List snapshots
    resolve <app> <ref>                 Resolve latest or v<N> to a tag
    restore <app> <ref>                 Restore the live tree from a snapshot
    branch list <app>                   List branches of a base app
    branch create <app> <branch>        Fork a branch from a base app
    branch delete <app> [branch]        Delete a branch (or a branch app)
    branch apply <app> [branch]         Merge a branch back into its base
    version                             Show version info
    help                                Show this help

EXAMPLES:
    magikvol ensure web --create
    magikvol snapshot web
    magikvol restore web latest
    magikvol branch create web feature-1
    magikvol branch apply web--feature-1
"#
    );
}

// =============================================================================
// Main
// =============================================================================

fn init_logging() {
    let filter = EnvFilter::try_from_env("MAGIKVOL_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    match parse_args(&args) {
        Ok(command) => {
            init_logging();
            let engine = Engine::from_env();
            match run(&engine, command) {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("error: {e}");
                    ExitCode::FAILURE
                }
            }
        }
        Err(e) => {
            eprintln!("error: {e}");
            cmd_help();
            ExitCode::FAILURE
        }
    }
}
