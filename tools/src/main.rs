//! simlab-runner: headless JSON-lines front end for the lifecycle engine.
//!
//! Usage:
//!   simlab-runner --db simulations.db --data-dir ./data
//!   simlab-runner --db simulations.db --summary
//!
//! Each stdin line is one command; each response is one stdout line.

use anyhow::Result;
use simlab_core::{
    engine::LifecycleEngine,
    error::SimError,
    export::{ExportFormat, JsonRenderer},
    simulation::SimulationStatus,
    store::SimStore,
    types::OwnerRef,
};
use std::env;
use std::io::{self, BufRead, Write};

#[derive(serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum IpcCommand {
    Submit {
        owner: OwnerRef,
        input: serde_json::Value,
    },
    Regenerate {
        owner: OwnerRef,
        simulation_id: String,
    },
    Callback {
        #[serde(default)]
        raw: Option<String>,
        #[serde(default)]
        body: Option<serde_json::Value>,
        #[serde(default)]
        signature: Option<String>,
    },
    Status {
        simulation_id: String,
    },
    History {
        owner: OwnerRef,
    },
    Quota {
        owner: OwnerRef,
    },
    SetTier {
        owner: OwnerRef,
        tier: String,
    },
    Metrics {
        #[serde(default)]
        date: Option<chrono::NaiveDate>,
    },
    Expire,
    Export {
        simulation_id: String,
        format: String,
    },
    Quit,
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let summary_only = args.iter().any(|a| a == "--summary");
    let db = arg_value(&args, "--db").unwrap_or("simulations.db");
    let data_dir = arg_value(&args, "--data-dir").unwrap_or("./data");

    let store = SimStore::open(db)?;
    store.migrate()?;
    let engine = LifecycleEngine::build(store, data_dir)?;
    log::info!("simlab-runner ready (db {db}, data {data_dir})");

    if summary_only {
        print_summary(&engine)?;
    } else {
        run_ipc_loop(&engine)?;
    }
    Ok(())
}

fn run_ipc_loop(engine: &LifecycleEngine) -> Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut handle = stdin.lock();
    let mut buffer = String::new();

    loop {
        buffer.clear();
        let bytes_read = handle.read_line(&mut buffer)?;
        if bytes_read == 0 {
            break; // EOF
        }
        if buffer.trim().is_empty() {
            continue;
        }

        let cmd: IpcCommand = match serde_json::from_str(&buffer) {
            Ok(c) => c,
            Err(e) => {
                let err_json = serde_json::json!({
                    "ok": false,
                    "error": { "code": "BAD_COMMAND", "message": e.to_string() }
                });
                writeln!(stdout, "{}", err_json)?;
                stdout.flush()?;
                continue;
            }
        };
        let response = match handle_command(engine, cmd) {
            Ok(Some(data)) => serde_json::json!({ "ok": true, "data": data }),
            Ok(None) => break,
            Err(e) => error_response(&e),
        };
        writeln!(stdout, "{}", response)?;
        stdout.flush()?;
    }
    Ok(())
}

/// Run one command. `None` means the session is over.
fn handle_command(
    engine: &LifecycleEngine,
    cmd: IpcCommand,
) -> Result<Option<serde_json::Value>, SimError> {
    let value = match cmd {
        IpcCommand::Submit { owner, input } => {
            let record = engine.submit(&owner, input)?;
            serde_json::to_value(record.status_view())?
        }
        IpcCommand::Regenerate { owner, simulation_id } => {
            let record = engine.regenerate(&owner, &simulation_id)?;
            serde_json::to_value(record.status_view())?
        }
        IpcCommand::Callback { raw, body, signature } => {
            let bytes = match (raw, body) {
                (Some(raw), _) => raw.into_bytes(),
                (None, Some(body)) => serde_json::to_vec(&body)?,
                (None, None) => {
                    return Err(SimError::InvalidCallback("callback needs raw or body".into()))
                }
            };
            let accepted = engine.handle_callback(&bytes, signature.as_deref());
            serde_json::json!({ "accepted": accepted })
        }
        IpcCommand::Status { simulation_id } => {
            serde_json::to_value(engine.status(&simulation_id)?)?
        }
        IpcCommand::History { owner } => {
            let views: Vec<_> = engine
                .history(&owner)?
                .iter()
                .map(|r| r.status_view())
                .collect();
            serde_json::to_value(views)?
        }
        IpcCommand::Quota { owner } => serde_json::to_value(engine.quota_status(&owner)?)?,
        IpcCommand::SetTier { owner, tier } => {
            engine.set_tier(&owner, &tier)?;
            serde_json::to_value(engine.quota_status(&owner)?)?
        }
        IpcCommand::Metrics { date } => serde_json::to_value(engine.metrics_for(date)?)?,
        IpcCommand::Expire => serde_json::json!({ "expired": engine.expire_stale_processing()? }),
        IpcCommand::Export { simulation_id, format } => {
            let format: ExportFormat = format.parse()?;
            let bytes = engine.export(&simulation_id, format, &JsonRenderer)?;
            serde_json::json!({
                "content_type": format.content_type(),
                "document": serde_json::from_slice::<serde_json::Value>(&bytes)?,
            })
        }
        IpcCommand::Quit => return Ok(None),
    };
    Ok(Some(value))
}

fn error_response(err: &SimError) -> serde_json::Value {
    let mut error = serde_json::json!({ "code": err.code(), "message": err.to_string() });
    match err {
        SimError::QuotaExceeded { limit, used, tier } => {
            error["limit"] = (*limit).into();
            error["used"] = (*used).into();
            error["tier"] = tier.clone().into();
        }
        SimError::DispatchFailed { simulation_id, .. } => {
            error["simulation_id"] = simulation_id.clone().into();
        }
        _ => {}
    }
    serde_json::json!({ "ok": false, "error": error })
}

fn print_summary(engine: &LifecycleEngine) -> Result<()> {
    let today = engine.metrics_for(None)?;
    println!("=== SIMULATIONS ===");
    for status in [
        SimulationStatus::Pending,
        SimulationStatus::Processing,
        SimulationStatus::Completed,
        SimulationStatus::Failed,
    ] {
        println!("  {:<12} {}", status.as_str(), engine.store.simulation_count(status)?);
    }
    println!();
    println!("=== TODAY ({}) ===", today.date);
    println!("  requested:    {}", today.requested);
    println!("  regenerated:  {}", today.regenerated);
    println!("  completed:    {}", today.completed);
    println!("  failed:       {}", today.failed);
    println!("  avg seconds:  {}", today.average_processing_seconds);
    Ok(())
}

fn arg_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2)
        .find(|w| w[0] == flag)
        .map(|w| w[1].as_str())
}
