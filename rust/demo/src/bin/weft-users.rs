//! Look up one user and print the reply an HTTP trigger would send.
//!
//! Usage: `weft-users <USER_ID> [--fault] [--traceparent <HEADER>]`
//!
//! Logging is filtered by `WEFT_LOG` (default `info`); the runtime reads
//! `WEFT_SERVICE_NAME`, `WEFT_SPAN_EXPORT`, `WEFT_SPAN_BATCH_SIZE` and
//! `WEFT_TIMEOUT_MS`.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};
use weft_demo::{
    handle, service_layer, AuditLog, FaultyDirectory, InMemoryDirectory, UserDirectory,
};
use weft_effects::{Reply, Runtime, RuntimeConfig, TraceRoot};

const USAGE: &str = "usage: weft-users <USER_ID> [--fault] [--traceparent <HEADER>]";

struct Args {
    user_id: String,
    fault: bool,
    trace_root: Option<TraceRoot>,
}

fn parse_args() -> Result<Args> {
    let mut args = std::env::args().skip(1);
    let mut user_id = None;
    let mut fault = false;
    let mut trace_root = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--fault" => fault = true,
            "--traceparent" => {
                let header = args.next().ok_or_else(|| anyhow!(USAGE))?;
                let root = TraceRoot::from_traceparent(&header)
                    .ok_or_else(|| anyhow!("malformed traceparent `{header}`"))?;
                trace_root = Some(root);
            }
            "-h" | "--help" => {
                println!("{USAGE}");
                std::process::exit(0);
            }
            _ if user_id.is_none() => user_id = Some(arg),
            other => bail!("unexpected argument `{other}`\n{USAGE}"),
        }
    }

    Ok(Args {
        user_id: user_id.ok_or_else(|| anyhow!(USAGE))?,
        fault,
        trace_root,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_env("WEFT_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = parse_args()?;
    let config = RuntimeConfig::from_env().context("reading runtime configuration")?;
    let runtime = Runtime::from_config(&config);
    info!(service = runtime.service_name(), export = %config.export, "runtime ready");

    let directory: Arc<dyn UserDirectory> = if args.fault {
        Arc::new(FaultyDirectory::new("connection refused"))
    } else {
        Arc::new(InMemoryDirectory::seeded())
    };
    let layer = service_layer(directory, Arc::new(AuditLog::new()));

    let reply = handle(&runtime, &args.user_id, layer, args.trace_root).await;
    runtime.shutdown();

    match &reply {
        Reply::Respond { status, body } => {
            println!("{status}");
            println!("{}", serde_json::to_string_pretty(body)?);
        }
        Reply::NoReply => println!("no reply"),
    }
    Ok(())
}
