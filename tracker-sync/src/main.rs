use anyhow::Context;
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;
use tracker_core::Action;
use tracker_sync::{Session, SessionConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Status,
    Bootstrap,
    Drain,
    Exec(String),
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Status;
    let mut args = args.into_iter().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--status" => mode = CliMode::Status,
            "--bootstrap" => mode = CliMode::Bootstrap,
            "--drain" => mode = CliMode::Drain,
            "--exec" => {
                let action = args.next().context("--exec requires an action JSON argument")?;
                mode = CliMode::Exec(action);
            }
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tracker_sync=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

fn print_usage() {
    println!("Usage: tracker-sync [--status | --bootstrap | --drain | --exec <json>]");
    println!("  --status        Print connectivity, queue and cache freshness (default)");
    println!("  --bootstrap     Rebuild the local cache from a full workspace snapshot");
    println!("  --drain         Replay actions queued while offline");
    println!("  --exec <json>   Dispatch one action, e.g. '{{\"verb\":\"team.list\"}}'");
}

async fn run(session: &Session, mode: CliMode) -> anyhow::Result<Value> {
    match mode {
        CliMode::Status => Ok(serde_json::to_value(session.status().await)?),
        CliMode::Bootstrap => {
            let snapshot = session
                .bootstrap_engine()
                .bootstrap()
                .await
                .context("bootstrap failed")?;
            Ok(json!({
                "stored": snapshot.stored,
                "counts": snapshot.counts(),
                "totalRecords": snapshot.total_records,
            }))
        }
        CliMode::Drain => {
            let report = session.dispatcher().replay_pending().await;
            let abandoned: Vec<&str> = report
                .abandoned
                .iter()
                .map(|entry| entry.id.as_str())
                .collect();
            Ok(json!({
                "replayed": report.replayed,
                "requeued": report.requeued,
                "skipped": report.skipped,
                "abandoned": abandoned,
                "interrupted": report.interrupted,
                "pending": session.dispatcher().pending_count().await,
            }))
        }
        CliMode::Exec(raw) => {
            let action: Action = serde_json::from_str(&raw).context("invalid action JSON")?;
            let response = session.dispatcher().execute(action).await;
            Ok(serde_json::to_value(response)?)
        }
        CliMode::Help => anyhow::bail!("help does not open a session"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        print_usage();
        return Ok(());
    }
    init_tracing();

    let config = SessionConfig::from_env()?;
    let session = Session::open(config).await?;
    let result = run(&session, mode).await;
    session.close().await;

    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("tracker-sync")
            .chain(list.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn parse_cli_mode_defaults_to_status() {
        assert_eq!(parse_cli_mode(args(&[])).unwrap(), CliMode::Status);
    }

    #[test]
    fn parse_cli_mode_supports_each_command() {
        assert_eq!(parse_cli_mode(args(&["--bootstrap"])).unwrap(), CliMode::Bootstrap);
        assert_eq!(parse_cli_mode(args(&["--drain"])).unwrap(), CliMode::Drain);
        assert_eq!(parse_cli_mode(args(&["-h"])).unwrap(), CliMode::Help);
    }

    #[test]
    fn parse_cli_mode_takes_exec_payload() {
        let mode = parse_cli_mode(args(&["--exec", r#"{"verb":"team.list"}"#])).unwrap();
        assert_eq!(mode, CliMode::Exec(r#"{"verb":"team.list"}"#.to_string()));
    }

    #[test]
    fn parse_cli_mode_rejects_bad_input() {
        assert!(parse_cli_mode(args(&["--exec"])).is_err());
        assert!(parse_cli_mode(args(&["--frobnicate"])).is_err());
    }
}
