use pylab_runner::backends::ExecutionBackend;
use pylab_runner::backends::judge0::Judge0Backend;
use pylab_runner::backends::socket::SocketBackend;
use pylab_runner::banner;
use pylab_runner::config::{AppConfig, Transport};
use pylab_runner::errors::{Result, RunnerError};
use pylab_runner::models::ExecutionStatus;
use pylab_runner::runner::{Playground, RunOutcome};
use std::io::Read;
use std::process::ExitCode;
use std::time::Duration;

const CONNECT_WAIT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> ExitCode {
    banner::print_banner();

    if let Err(e) = dotenvy::dotenv() {
        eprintln!("⚠️  Could not load .env file: {}", e);
    }

    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    match run().await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("❌ {}", e);
            ExitCode::from(2)
        }
    }
}

/// Reads source from the path given as the first argument, or from stdin,
/// runs it once, and prints what the output pane would show.
async fn run() -> Result<bool> {
    let mut args = std::env::args().skip(1);
    let source = match args.next() {
        Some(path) => std::fs::read_to_string(path)?,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    let stdin = match args.next() {
        Some(path) => Some(std::fs::read_to_string(path)?),
        None => None,
    };

    let config = AppConfig::from_env()?;
    log::info!("Using {:?} transport", config.transport);

    match config.transport {
        Transport::Judge0 => {
            let judge0 = config
                .judge0
                .clone()
                .ok_or_else(|| RunnerError::Config("JUDGE0_API is not set".to_string()))?;
            let backend = Judge0Backend::new(reqwest::Client::new(), judge0, config.poll);
            Ok(run_once(&Playground::new(backend), &source, stdin.as_deref()).await)
        }
        Transport::Socket => {
            let socket = config
                .socket
                .clone()
                .ok_or_else(|| RunnerError::Config("PYLAB_SOCKET_HOST is not set".to_string()))?;
            let playground = Playground::new(SocketBackend::mount(socket));
            if tokio::time::timeout(CONNECT_WAIT, playground.backend().wait_until_open())
                .await
                .is_err()
            {
                log::warn!("Execution server not reachable after {}s", CONNECT_WAIT.as_secs());
            }
            let ok = run_once(&playground, &source, stdin.as_deref()).await;
            playground.backend().unmount().await;
            Ok(ok)
        }
    }
}

async fn run_once<B: ExecutionBackend>(playground: &Playground<B>, source: &str, stdin: Option<&str>) -> bool {
    let outcome = match stdin {
        Some(input) => playground.run_with_stdin(source, input).await,
        None => playground.run(source).await,
    };

    match outcome {
        RunOutcome::Completed { output, status, latency_ms } => {
            println!("{}", output);
            log::info!("Finished with status {} in {}ms", status, latency_ms);
            status == ExecutionStatus::Success
        }
        RunOutcome::Ignored | RunOutcome::Superseded => false,
    }
}
