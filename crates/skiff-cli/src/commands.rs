use std::env;
use std::io;
use std::path::Path;
use std::process::{Command, Stdio};

use eyre::{bail, Result, WrapErr};
use log::debug;

use skiff_core::driver::SyncDriver;
use skiff_core::executor::Executor;
use skiff_core::plan::{diff, Plan};
use skiff_core::session::Session;
use skiff_core::snapshot::{scan, Snapshot};
use skiff_core::state::State;

use crate::cli::{StateArgs, SyncArgs};

/// Scan (or blank) the current tree into the state file. An existing file
/// keeps its `command` and `remotecwd`; only the snapshot is replaced.
pub fn run_genstate(args: &StateArgs, empty: bool) -> Result<()> {
    prepare(args)?;
    let path = Path::new(&args.statefile);
    let mut state = State::load(path)?.unwrap_or_default();
    state.data = Some(if empty {
        Snapshot::new()
    } else {
        scan(Path::new("."), &args.statefile)?
    });
    state.save(path)
}

pub fn run_sync(args: &SyncArgs) -> Result<()> {
    prepare(&args.common)?;
    let statefile = &args.common.statefile;
    let path = Path::new(statefile);

    let Some(mut state) = State::load(path)? else {
        bail!("state file '{statefile}' not found; generate it with the 'genstate' command");
    };
    if !args.dryrun {
        if state.command.is_empty() {
            bail!(
                "no remote command configured; put the helper argv as an array in the \
                 'command' entry of '{statefile}'"
            );
        }
        if state.remotecwd.as_deref().map_or(true, str::is_empty) {
            bail!(
                "no target remote folder configured; put it in the 'remotecwd' entry \
                 of '{statefile}'"
            );
        }
    }
    let Some(old) = state.data.take() else {
        bail!("state file '{statefile}' has no snapshot; regenerate it with 'genstate'");
    };

    let new = scan(Path::new("."), statefile)?;
    let plan = diff(&old, &new);

    if args.dryrun {
        print_plan(&plan);
        return Ok(());
    }

    if plan.is_empty() {
        println!("Nothing to be done!");
    } else {
        run_session(&state, &plan, &new).wrap_err("sync failed")?;
    }

    state.data = Some(new);
    state.save(path)?;
    println!("Sync successful.");
    Ok(())
}

/// Serve the other side of the protocol on stdin/stdout. This is what the
/// configured `command` is expected to reach on the remote host, typically
/// as `ssh <host> skiff server`.
pub fn run_server() -> Result<()> {
    let stdin = io::stdin().lock();
    let stdout = io::stdout().lock();
    Executor::new(stdin, stdout)
        .run()
        .wrap_err("serving sync session")
}

/// Spawn the remote helper, drive the whole plan through it, and reap it.
fn run_session(state: &State, plan: &Plan, new: &Snapshot) -> Result<()> {
    let remotecwd = state.remotecwd.as_deref().unwrap_or_default();

    debug!("launching remote helper: {:?}", state.command);
    let mut child = Command::new(&state.command[0])
        .args(&state.command[1..])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .wrap_err_with(|| format!("launching remote helper '{}'", state.command[0]))?;
    let child_in = child.stdin.take().expect("child stdin was piped");
    let child_out = child.stdout.take().expect("child stdout was piped");

    let local_root = env::current_dir().wrap_err("resolving the local root")?;
    let outcome = (|| -> Result<()> {
        let mut session = Session::connect(child_out, child_in, remotecwd)?;
        SyncDriver::new(&mut session, &local_root).run(plan, new)?;
        Ok(())
    })();

    // The session (and with it the helper's stdin) is gone; the helper sees
    // EOF and exits on its own.
    let status = child.wait().wrap_err("waiting for the remote helper")?;
    outcome?;
    if !status.success() {
        bail!("remote helper exited with {status}");
    }
    Ok(())
}

fn prepare(args: &StateArgs) -> Result<()> {
    validate_statefile(&args.statefile)?;
    if let Some(cwd) = &args.cwd {
        env::set_current_dir(cwd)
            .wrap_err_with(|| format!("changing into {}", cwd.display()))?;
    }
    Ok(())
}

fn validate_statefile(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(std::path::MAIN_SEPARATOR)
    {
        bail!("invalid state file name '{name}': must be a bare file name");
    }
    Ok(())
}

fn print_plan(plan: &Plan) {
    if plan.to_delete.is_empty() {
        println!("(No remote files will be deleted)");
    } else {
        println!("These files will be deleted on the remote server:");
        for path in &plan.to_delete {
            println!("  {path}");
        }
    }
    println!();
    if plan.to_update.is_empty() {
        println!("(No remote files will be uploaded)");
    } else {
        println!("These files will be uploaded to the remote server:");
        for path in plan.to_update.keys() {
            println!("  {path}");
        }
    }
}
