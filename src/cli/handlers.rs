use anyhow::{Context, Result};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_log::LogTracer;
use tracing_subscriber::{fmt, EnvFilter};

use crate::cli::display::{FragmentEcho, Scoreboard};
use crate::cli::options::{EngineArgs, LoggingArgs};
use crate::config::Settings;
use crate::constants::{defaults, markers};
use crate::orchestrator::{Exchange, ExchangeOutcome, RiddleCore};
use crate::parser::ParsedReply;
use crate::runtime::{ModelBackend, ScriptedBackend};
use crate::session::Role;

/// Install the tracing subscriber. Keep the returned guard alive until exit
/// so buffered file output is flushed.
pub fn init_logging(args: &LoggingArgs) -> Result<Option<WorkerGuard>> {
    LogTracer::init().context("Failed to initialize log tracer")?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("warn,riddler_core={0},riddler={0}", args.log_level))
    });

    match &args.log_file {
        Some(path) => {
            let directory = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
            let file_name = path
                .file_name()
                .context("Log file path has no file name")?;
            let file_appender = RollingFileAppender::new(Rotation::NEVER, directory, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            let subscriber = fmt::Subscriber::builder()
                .with_env_filter(filter)
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
                .with_target(true)
                .compact()
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .context("Failed to install tracing subscriber")?;
            Ok(Some(guard))
        }
        None => {
            let subscriber = fmt::Subscriber::builder()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(true)
                .compact()
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .context("Failed to install tracing subscriber")?;
            Ok(None)
        }
    }
}

/// Load settings from every source, then apply command-line overrides
pub fn load_settings(config: Option<&Path>, engine: &EngineArgs) -> Result<Settings> {
    let mut settings = Settings::load(config).context("Failed to load configuration")?;
    engine.apply(&mut settings);
    settings.validate().context("Invalid configuration")?;
    Ok(settings)
}

fn select_backend(settings: &mut Settings, engine: &EngineArgs) -> Result<Arc<dyn ModelBackend>> {
    if engine.scripted {
        if !settings.model.path.is_file() {
            // Any existing file stands in for the weights
            settings.model.path = std::env::current_exe().context("Failed to locate placeholder model file")?;
            tracing::info!(path = %settings.model.path.display(), "Scripted run without a model file");
        }
        return Ok(Arc::new(ScriptedBackend::demo()));
    }
    native_backend()
}

#[cfg(feature = "llama")]
fn native_backend() -> Result<Arc<dyn ModelBackend>> {
    let backend = crate::runtime::llamacpp::LlamaCppBackend::new().context("Failed to initialize llama.cpp")?;
    Ok(Arc::new(backend))
}

#[cfg(not(feature = "llama"))]
fn native_backend() -> Result<Arc<dyn ModelBackend>> {
    anyhow::bail!("built without a native backend; rebuild with `--features llama` or pass --scripted")
}

async fn start_core(config: Option<&Path>, engine: &EngineArgs) -> Result<RiddleCore> {
    let mut settings = load_settings(config, engine)?;
    let backend = select_backend(&mut settings, engine)?;
    let mut core = RiddleCore::new(settings, backend, tokio::runtime::Handle::current())
        .context("Failed to create riddle core")?;
    core.initialize().await.context("Failed to load model")?;
    Ok(core)
}

/// Drain an exchange once per tick until it settles. Ctrl-C cancels it.
async fn drive<F>(mut exchange: Exchange, mut on_fragment: F) -> ExchangeOutcome
where
    F: FnMut(&str),
{
    let mut tick = tokio::time::interval(defaults::TICK_INTERVAL);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut cancelled = false;

    loop {
        tokio::select! {
            _ = tick.tick() => {
                if let Some(outcome) = exchange.poll(&mut on_fragment) {
                    return outcome;
                }
            }
            _ = &mut ctrl_c, if !cancelled => {
                tracing::info!(request_id = %exchange.id(), "Interrupted, cancelling request");
                exchange.cancel();
                cancelled = true;
            }
        }
    }
}

fn print_flush(text: &str) {
    if text.is_empty() {
        return;
    }
    let mut stdout = std::io::stdout().lock();
    let _ = stdout.write_all(text.as_bytes());
    let _ = stdout.flush();
}

fn riddle_echo(settings: &Settings) -> FragmentEcho {
    let mut hidden = vec![markers::ANSWER.to_string()];
    hidden.extend(settings.strip_markers(Role::Riddler));
    FragmentEcho::new(hidden)
}

pub async fn handle_play(config: Option<&Path>, engine: &EngineArgs, rounds: u32) -> Result<()> {
    let mut core = start_core(config, engine).await?;
    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
    let mut score = Scoreboard::default();
    let mut round = 0u32;

    println!("Type your answer after each riddle. Enter q to quit, Ctrl-C stops a reply.");

    while rounds == 0 || round < rounds {
        round += 1;
        println!("\n--- Round {} ---", round);

        let exchange = core.submit_riddle_request()?;
        let mut echo = riddle_echo(core.settings());
        let outcome = drive(exchange, |fragment| print_flush(echo.push(fragment))).await;
        print_flush(echo.finish());
        println!();

        let (riddle, answer) = match outcome {
            ExchangeOutcome::Completed { result, .. } => match result.reply {
                ParsedReply::Riddle { riddle, answer } => (riddle, answer),
                ParsedReply::Verdict { .. } => anyhow::bail!("riddler produced a verdict"),
            },
            ExchangeOutcome::Cancelled => {
                println!("(cancelled)");
                break;
            }
            ExchangeOutcome::Failed(reason) => {
                eprintln!("Could not generate a riddle: {}", reason);
                continue;
            }
        };

        if answer.is_empty() {
            println!("(the model gave no answer for this one, skipping)");
            continue;
        }

        print_flush("Your answer: ");
        let guess = tokio::select! {
            line = lines.next() => match line {
                Some(line) => line.context("Failed to read answer")?,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        };
        let guess = guess.trim();
        if guess.eq_ignore_ascii_case("q") {
            break;
        }

        let exchange = core.submit_grade_request(&riddle, &answer, guess)?;
        let mut echo = FragmentEcho::new(core.settings().strip_markers(Role::Grader));
        let outcome = drive(exchange, |fragment| print_flush(echo.push(fragment))).await;
        print_flush(echo.finish());
        println!();

        match outcome {
            ExchangeOutcome::Completed { result, .. } => {
                if let ParsedReply::Verdict { correct, .. } = result.reply {
                    score.record(correct);
                }
                println!("The answer was: {}", answer);
                println!("Score: {}", score);
            }
            ExchangeOutcome::Cancelled => {
                println!("(cancelled)");
                break;
            }
            ExchangeOutcome::Failed(reason) => {
                eprintln!("Could not grade your answer: {}", reason);
            }
        }
    }

    println!("\nFinal score: {}", score);
    core.shutdown();
    Ok(())
}

pub async fn handle_riddle(config: Option<&Path>, engine: &EngineArgs, json: bool) -> Result<()> {
    let mut core = start_core(config, engine).await?;
    let exchange = core.submit_riddle_request()?;

    let outcome = if json {
        drive(exchange, |_| {}).await
    } else {
        let mut echo = riddle_echo(core.settings());
        let outcome = drive(exchange, |fragment| print_flush(echo.push(fragment))).await;
        print_flush(echo.finish());
        println!();
        outcome
    };
    core.shutdown();

    match outcome {
        ExchangeOutcome::Completed {
            result,
            fragments,
            elapsed,
            ..
        } => {
            let (riddle, answer) = result.riddle().unwrap_or((result.sanitized.as_str(), ""));
            if json {
                let value = serde_json::json!({
                    "riddle": riddle,
                    "answer": answer,
                    "fragments": fragments,
                    "elapsed_ms": elapsed.as_millis() as u64,
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!("Answer: {}", answer);
            }
            Ok(())
        }
        ExchangeOutcome::Cancelled => {
            eprintln!("(cancelled)");
            Ok(())
        }
        ExchangeOutcome::Failed(reason) => anyhow::bail!("Could not generate a riddle: {}", reason),
    }
}

pub fn handle_config(config: Option<&Path>, engine: &EngineArgs) -> Result<()> {
    let settings = load_settings(config, engine)?;
    println!("{}", serde_json::to_string_pretty(&settings)?);
    Ok(())
}
