//! CLI command execution.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use brood::config::ServerConfig;
use brood::logging::{LogLevel, LOG_ENV};
use brood::process::{
    chain, ChannelObserver, ExitResult, PipeLink, ProcessEvent, ProcessRunner, ProcessSpec,
    StderrRelay, StreamKind, StreamMode,
};
use brood::server;
use brood::worker::{compute, ticker, Worker, WorkerKind, WorkerPort};

use super::args::{Cli, Commands};

/// Execute the parsed CLI.
pub async fn execute(cli: Cli) -> Result<()> {
    let log_level = cli.log_level;

    match cli.command {
        Commands::Run {
            shell,
            cwd,
            env,
            mode,
            program,
            args,
        } => {
            let mut spec = if shell {
                ProcessSpec::shell(program).args(args)
            } else {
                ProcessSpec::new(program).args(args)
            };
            if let Some(dir) = cwd {
                spec = spec.working_dir(dir);
            }
            if !env.is_empty() {
                spec = spec.envs(env);
            }
            run(&spec.stream_mode(mode)).await
        }

        Commands::Pipe {
            stdin,
            shell,
            stages,
        } => pipe(&stages, shell, stdin).await,

        Commands::Fork { ticker, count } => {
            fork_ticker(Duration::from_millis(ticker.interval_ms), count, log_level).await
        }

        Commands::Serve {
            port,
            worker_timeout,
            no_timeout,
            compute,
            open,
        } => {
            let config = ServerConfig {
                port,
                worker_timeout: (!no_timeout).then(|| Duration::from_secs(worker_timeout)),
                compute_upto: compute.upto,
            };
            let worker = worker_spec(WorkerKind::Compute, log_level)?;
            server::start_server(config, ProcessRunner::default(), worker, open).await
        }

        Commands::Worker {
            kind,
            ticker,
            compute,
        } => {
            info!(kind = kind.as_str(), pid = std::process::id(), "worker started");
            match kind {
                WorkerKind::Compute => {
                    let mut port = WorkerPort::stdio();
                    compute::run(&mut port, compute.upto).await?;
                }
                WorkerKind::Ticker => {
                    ticker::run(
                        WorkerPort::stdio(),
                        Duration::from_millis(ticker.interval_ms),
                    )
                    .await?;
                }
            }
            info!(kind = kind.as_str(), "parent closed the channel, exiting");
            Ok(())
        }
    }
}

/// Spec for a built-in worker, carrying an explicit `--log-level` over to it.
fn worker_spec(kind: WorkerKind, log_level: Option<LogLevel>) -> Result<ProcessSpec> {
    let spec = kind
        .current_exe_spec()
        .context("Could not locate the brood executable")?;
    Ok(match log_level {
        Some(level) => spec.env(LOG_ENV, level.as_str()),
        None => spec,
    })
}

async fn run(spec: &ProcessSpec) -> Result<()> {
    let runner = ProcessRunner::default();
    let (observer, mut events) = ChannelObserver::new();

    let handle = runner
        .launch(spec, observer)
        .with_context(|| format!("Failed to run `{}`", spec.display_name()))?;

    if spec.stream_mode == StreamMode::Detached {
        println!(
            "started detached child {} (pid {})",
            handle.program(),
            handle.pid().map_or_else(|| "unknown".to_string(), |p| p.to_string())
        );
        return Ok(());
    }

    // Nothing to feed; let the child see EOF.
    handle.close_stdin().await;

    while let Some(event) = events.recv().await {
        match event {
            ProcessEvent::Data {
                stream: StreamKind::Stdout,
                bytes,
            } => print!("child stdout:\n{}", String::from_utf8_lossy(&bytes)),
            ProcessEvent::Data {
                stream: StreamKind::Stderr,
                bytes,
            } => eprint!("child stderr:\n{}", String::from_utf8_lossy(&bytes)),
            ProcessEvent::Data { .. } => {}
            ProcessEvent::Exit(result) => println!("child process exited with {result}"),
            ProcessEvent::Error { kind, message } => {
                error!(?kind, %message, "child process error");
            }
        }
    }

    Ok(())
}

fn stage_spec(stage: &str, shell: bool) -> Result<ProcessSpec> {
    let spec = if shell {
        ProcessSpec::shell(stage)
    } else {
        let mut parts = stage.split_whitespace();
        let Some(program) = parts.next() else {
            bail!("Empty pipeline stage");
        };
        ProcessSpec::new(program).args(parts)
    };
    Ok(spec.piped())
}

async fn pipe(stages: &[String], shell: bool, feed_stdin: bool) -> Result<()> {
    let runner = ProcessRunner::default();

    let mut handles = Vec::with_capacity(stages.len());
    for stage in stages {
        let spec = stage_spec(stage, shell)?;
        let handle = runner
            .spawn(&spec)
            .with_context(|| format!("Failed to start stage `{stage}`"))?;
        handles.push(handle);
    }

    let links = chain(&mut handles);

    let Some(first) = handles.first() else {
        bail!("No pipeline stages given");
    };
    if feed_stdin {
        // Not awaited: our stdin may never reach EOF. main() drops the
        // pending read at shutdown.
        let feed = PipeLink::from_reader(tokio::io::stdin(), first);
        debug!(active = feed.is_active(), "feeding stdin into the first stage");
    } else {
        first.close_stdin().await;
    }

    let Some((last, rest)) = handles.split_last_mut() else {
        bail!("No pipeline stages given");
    };

    for handle in rest.iter_mut() {
        handle.observe(StderrRelay)?;
    }

    let (observer, mut events) = ChannelObserver::new();
    last.observe(observer)?;

    let mut out = tokio::io::stdout();
    let mut last_exit = ExitResult::unobserved();
    while let Some(event) = events.recv().await {
        match event {
            ProcessEvent::Data {
                stream: StreamKind::Stdout,
                bytes,
            } => out.write_all(&bytes).await?,
            ProcessEvent::Data {
                stream: StreamKind::Stderr,
                bytes,
            } => tokio::io::stderr().write_all(&bytes).await?,
            ProcessEvent::Data { .. } => {}
            ProcessEvent::Exit(result) => last_exit = result,
            ProcessEvent::Error { kind, message } => {
                error!(?kind, %message, "pipeline stage error");
            }
        }
    }
    out.flush().await?;

    for link in links {
        link.finished().await;
    }

    for (id, result) in runner.wait_all().await {
        if !result.success() {
            warn!(id, %result, "pipeline stage failed");
        }
    }

    info!(%last_exit, "pipeline finished");
    Ok(())
}

async fn fork_ticker(every: Duration, count: usize, log_level: Option<LogLevel>) -> Result<()> {
    let runner = ProcessRunner::default();
    let spec = worker_spec(WorkerKind::Ticker, log_level)?
        .args(["--interval-ms".to_string(), every.as_millis().to_string()]);

    let mut worker = Worker::fork(&runner, &spec).context("Failed to fork ticker worker")?;
    worker.send(&json!({ "hello": "world" })).await?;

    for _ in 0..count {
        match worker.recv().await {
            Some(msg) => println!("message from child: {msg}"),
            None => bail!("Ticker worker exited before sending {count} messages"),
        }
    }

    let exit = worker.shutdown().await;
    info!(%exit, "ticker worker stopped");
    Ok(())
}
