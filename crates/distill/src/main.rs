use std::path::{Path, PathBuf};
use std::process::ExitCode;

use distill::config::load_config;
use distill::engine::Engine;
use distill::error::DistillError;
use distill::pipeline::resolve;
use distill::router::SubmitRequest;
use distill::telemetry::init_logging;

const USAGE: &str = "\
usage:
  distilld [run] <config.json>
  distilld process <config.json> <request.json> [owner]";

const CLI_OWNER: &str = "local";

enum Command {
    Run { config: PathBuf },
    Process {
        config: PathBuf,
        request: PathBuf,
        owner: String,
    },
}

fn parse_args(args: &[String]) -> Option<Command> {
    match args {
        [cmd, config] if cmd == "run" => Some(Command::Run {
            config: PathBuf::from(config),
        }),
        [cmd, config, request, rest @ ..] if cmd == "process" && rest.len() <= 1 => {
            Some(Command::Process {
                config: PathBuf::from(config),
                request: PathBuf::from(request),
                owner: rest.first().cloned().unwrap_or_else(|| CLI_OWNER.to_string()),
            })
        }
        [config] if config != "process" && config != "run" => Some(Command::Run {
            config: PathBuf::from(config),
        }),
        _ => None,
    }
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = parse_args(&args) else {
        eprintln!("{}", USAGE);
        return ExitCode::from(2);
    };

    let outcome = match command {
        Command::Run { config } => run(&config),
        Command::Process {
            config,
            request,
            owner,
        } => process(&config, &request, &owner),
    };

    match outcome {
        Ok(code) => code,
        Err(e) => {
            log::error!("{}", e);
            eprintln!("distilld: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn start_engine(config_path: &Path) -> Result<Engine, DistillError> {
    let config = load_config(config_path)?;
    init_logging(&config.logging)?;
    log::info!(
        "Starting distilld v{} with {} workers",
        env!("CARGO_PKG_VERSION"),
        config.worker_count
    );

    let engine = Engine::from_config(config)?;
    let recovered = engine.start()?;
    if recovered > 0 {
        log::info!("Recovered {} pending jobs", recovered);
    }
    Ok(engine)
}

/// Runs the daemon until Ctrl-C.
fn run(config_path: &Path) -> Result<ExitCode, DistillError> {
    let engine = start_engine(config_path)?;

    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .map_err(|e| DistillError::Signal(e.to_string()))?;

    log::info!("distilld is running, press Ctrl-C to stop");
    let _ = stop_rx.recv();

    engine.shutdown();
    Ok(ExitCode::SUCCESS)
}

/// Runs a single request to completion and prints its final status.
fn process(
    config_path: &Path,
    request_path: &Path,
    owner: &str,
) -> Result<ExitCode, DistillError> {
    let invalid = |reason: String| DistillError::Request {
        path: request_path.to_path_buf(),
        reason,
    };
    let raw = std::fs::read_to_string(request_path).map_err(|e| invalid(e.to_string()))?;
    let request: SubmitRequest = serde_json::from_str(&raw).map_err(|e| invalid(e.to_string()))?;

    let engine = start_engine(config_path)?;
    let outcome = submit_and_wait(&engine, request, owner);
    engine.shutdown();
    outcome
}

fn submit_and_wait(
    engine: &Engine,
    request: SubmitRequest,
    owner: &str,
) -> Result<ExitCode, DistillError> {
    let stage_count = resolve(request.tool_type, request.content_type)
        .map(|p| p.stages.len() as u32)
        .unwrap_or(1);
    let receipt = engine.router().submit(request, owner)?;
    log::info!("Submitted job {}", receipt.job_id);

    let budget = engine.config().stage_timeout() * stage_count;
    let job = engine.wait_for(&receipt.job_id, budget);
    let status = engine.gateway().status(&receipt.job_id, owner)?;

    let mut report = serde_json::json!({ "status": status });
    let completed = job.map(|j| j.status == distill::job::JobStatus::Completed);
    if completed == Some(true) {
        let result = engine.gateway().result(&receipt.job_id, owner)?;
        report["result"] = serde_json::json!(result);
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&report).unwrap_or_else(|_| report.to_string())
    );

    Ok(if completed == Some(true) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_args() {
        assert!(matches!(
            parse_args(&args(&["distill.json"])),
            Some(Command::Run { .. })
        ));
        assert!(matches!(
            parse_args(&args(&["run", "distill.json"])),
            Some(Command::Run { .. })
        ));
        match parse_args(&args(&["process", "c.json", "r.json"])) {
            Some(Command::Process { owner, .. }) => assert_eq!(owner, CLI_OWNER),
            _ => panic!("expected process command"),
        }
        match parse_args(&args(&["process", "c.json", "r.json", "alice"])) {
            Some(Command::Process { owner, .. }) => assert_eq!(owner, "alice"),
            _ => panic!("expected process command"),
        }
        assert!(parse_args(&args(&[])).is_none());
        assert!(parse_args(&args(&["process", "c.json"])).is_none());
    }
}
