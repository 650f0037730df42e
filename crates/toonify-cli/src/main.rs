use std::io::{self, BufRead, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use toonify_contracts::chat::{parse_intent, Intent, SESSION_HELP_COMMANDS};
use toonify_contracts::events::EventWriter;
use toonify_contracts::{SessionState, StylePreset};
use toonify_engine::{EngineConfig, GenerationClient, Studio, StudioUpdate};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "toonify", version, about = "Turn a photo into a cartoon portrait")]
struct Cli {
    /// Log debug output to stderr.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the style presets.
    Styles,
    /// List the known image models.
    Models,
    /// Cartoonify one image and save the result.
    Generate(GenerateArgs),
    /// Interactive session reading commands from stdin.
    Session(SessionArgs),
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long, default_value = "pixar3d")]
    style: String,
    #[arg(long, default_value = ".")]
    out: PathBuf,
    #[arg(long)]
    model: Option<String>,
    /// Request timeout in seconds, clamped to 15..=300.
    #[arg(long)]
    timeout: Option<f64>,
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct SessionArgs {
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long, default_value = ".")]
    out: PathBuf,
}

const INPUT_POLL_INTERVAL: Duration = Duration::from_millis(200);

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("toonify error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match cli.command {
        Command::Styles => {
            run_styles();
            Ok(0)
        }
        Command::Models => {
            run_models(&EngineConfig::from_env());
            Ok(0)
        }
        Command::Generate(args) => run_generate(args),
        Command::Session(args) => {
            run_session(args)?;
            Ok(0)
        }
    }
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_env("TOONIFY_LOG").unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

fn run_styles() {
    for preset in StylePreset::CATALOG {
        let marker = if preset == StylePreset::DEFAULT { "*" } else { " " };
        println!("{marker} {:<12} {}", preset.id(), preset.label());
    }
}

fn run_models(config: &EngineConfig) {
    let client = GenerationClient::from_config(config);
    for model in client.models().list() {
        let marker = if model.name == client.model().name { "*" } else { " " };
        println!(
            "{marker} {:<28} {:<8} {}",
            model.name, model.provider, model.description
        );
    }
}

fn open_events(path: Option<&Path>) -> Option<EventWriter> {
    path.map(EventWriter::for_new_session)
}

fn run_generate(args: GenerateArgs) -> Result<i32> {
    let config = EngineConfig::from_env()
        .with_model(args.model.clone())
        .with_timeout(args.timeout);
    let client = GenerationClient::from_config(&config);
    let style = StylePreset::resolve(&args.style);
    let mut studio = Studio::new(client, open_events(args.events.as_deref()), style);

    if let Err(err) = studio.select_file(&args.image) {
        eprintln!("{}", err.user_message());
        tracing::debug!(error = %err, path = %args.image.display(), "image rejected");
        return Ok(1);
    }
    if studio.trigger().is_none() {
        eprintln!("No image selected.");
        return Ok(1);
    }
    eprintln!(
        "Generating {} with {}...",
        style.label(),
        studio.model().name
    );
    studio.wait();

    match studio.state() {
        SessionState::Succeeded { .. } => {
            let exported = studio.export(&args.out)?;
            println!("{}", exported.image_path.display());
            Ok(0)
        }
        SessionState::Failed { message, .. } => {
            eprintln!("{message}");
            Ok(1)
        }
        other => {
            eprintln!("Generation ended in unexpected state: {}", other.phase().as_str());
            Ok(1)
        }
    }
}

/// Reads stdin on its own thread so completions can be reported while idle.
fn spawn_line_reader() -> Result<mpsc::Receiver<io::Result<String>>> {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("toonify-stdin".to_string())
        .spawn(move || {
            let stdin = io::stdin();
            let mut lock = stdin.lock();
            loop {
                let mut line = String::new();
                match lock.read_line(&mut line) {
                    Ok(0) => break,
                    Ok(_) => {
                        if tx.send(Ok(line)).is_err() {
                            break;
                        }
                    }
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(err) => {
                        let _ = tx.send(Err(err));
                        break;
                    }
                }
            }
        })
        .context("failed to start stdin reader")?;
    Ok(rx)
}

fn run_session(args: SessionArgs) -> Result<()> {
    let config = EngineConfig::from_env().with_model(args.model.clone());
    let client = GenerationClient::from_config(&config);
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let mut studio = Studio::new(
        client,
        Some(EventWriter::for_new_session(&events_path)),
        StylePreset::DEFAULT,
    );

    println!(
        "Toonify session started ({}, style {}). Drop an image path or type /help.",
        studio.model().name,
        studio.session().style().label()
    );
    let lines = spawn_line_reader()?;
    prompt()?;

    loop {
        let line = match lines.recv_timeout(INPUT_POLL_INTERVAL) {
            Ok(line) => line?,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                let updates = studio.poll();
                if report_updates(&studio, updates) {
                    prompt()?;
                }
                continue;
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        };

        let updates = studio.poll();
        report_updates(&studio, updates);
        let intent = parse_intent(line.trim_end_matches(['\n', '\r']));
        if !handle_intent(&mut studio, &intent, &args.out)? {
            break;
        }
        prompt()?;
    }

    if studio.session().state().in_flight().is_some() {
        println!("Waiting for the current generation to finish...");
        let update = studio.wait();
        report_updates(&studio, update.into_iter().collect());
    }
    Ok(())
}

fn prompt() -> Result<()> {
    print!("> ");
    io::stdout().flush()?;
    Ok(())
}

/// Returns `false` when the session should end.
fn handle_intent(studio: &mut Studio, intent: &Intent, out_dir: &Path) -> Result<bool> {
    match intent.action.as_str() {
        "noop" => {}
        "help" => println!("Commands: {}", SESSION_HELP_COMMANDS.join(" ")),
        "quit" => return Ok(false),
        "list_styles" => {
            let current = studio.session().style();
            for preset in StylePreset::CATALOG {
                let marker = if preset == current { "*" } else { " " };
                println!("{marker} {:<12} {}", preset.id(), preset.label());
            }
        }
        "set_style" => {
            let Some(raw) = intent.arg_str("style") else {
                println!("/style requires a preset id (see /styles)");
                return Ok(true);
            };
            let style = StylePreset::resolve(raw);
            studio.set_style(style);
            println!("Style set to {}", style.label());
        }
        "set_image_model" => {
            let Some(name) = intent.arg_str("model") else {
                println!("Image model: {}", studio.model().name);
                return Ok(true);
            };
            match studio.set_model(name) {
                Ok(model) => println!("Image model set to {}", model.name),
                Err(err) => println!("{err}"),
            }
        }
        "select_image" => {
            let Some(path) = intent.arg_str("path") else {
                println!("/open requires a path");
                return Ok(true);
            };
            match studio.select_file(Path::new(path)) {
                Ok(()) => {
                    if let Some(image) = studio.state().image() {
                        println!(
                            "Image selected: {} ({}, {} bytes)",
                            path,
                            image.media_type(),
                            image.raw_bytes().len()
                        );
                    }
                }
                Err(err) => println!("{}", err.user_message()),
            }
        }
        "clear_image" => {
            studio.clear_image();
            println!("Image cleared.");
        }
        "generate" => match studio.trigger() {
            Some(attempt) => println!(
                "Generating {} {attempt} with {}...",
                studio.session().style().label(),
                studio.model().name
            ),
            None if studio.state().in_flight().is_some() => {
                println!("A generation is already running.")
            }
            None => println!("Select an image first (/open <path>)."),
        },
        "status" => print_status(studio),
        "export" => {
            let destination = intent
                .arg_str("path")
                .map(PathBuf::from)
                .unwrap_or_else(|| out_dir.to_path_buf());
            match studio.export(&destination) {
                Ok(exported) => println!("Saved {}", exported.image_path.display()),
                Err(err) => println!("Save failed: {err:#}"),
            }
        }
        "unknown" => {
            let command = intent.arg_str("command").unwrap_or_default();
            println!("Unknown command /{command}. Type /help for commands.");
        }
        other => tracing::debug!(action = other, "unhandled intent"),
    }
    Ok(true)
}

fn print_status(studio: &Studio) {
    let state = studio.state();
    println!(
        "State: {}  Style: {}  Model: {}",
        state.phase().as_str(),
        studio.session().style().label(),
        studio.model().name
    );
    if let Some(image) = state.image() {
        println!(
            "Image: {} ({} bytes)",
            image.media_type(),
            image.raw_bytes().len()
        );
    }
    if let Some(result) = state.result() {
        println!(
            "Result: {} via {} ({})",
            result.result_media_type,
            result.model,
            result.style_preset_used.label()
        );
    }
    if let Some(message) = state.error_message() {
        println!("Error: {message}");
    }
}

/// Prints what resolved since the last poll; `true` when anything was printed.
fn report_updates(studio: &Studio, updates: Vec<StudioUpdate>) -> bool {
    let mut printed = false;
    for update in updates {
        match update {
            StudioUpdate::Resolved { attempt, .. } => {
                printed = true;
                println!();
                match studio.state() {
                    SessionState::Succeeded { result, .. } => println!(
                        "Generation {attempt} finished ({}). Use /save to export it.",
                        result.style_preset_used.label()
                    ),
                    SessionState::Failed { message, .. } => {
                        println!("Generation {attempt} failed: {message}")
                    }
                    _ => {}
                }
            }
            StudioUpdate::Superseded { attempt } => {
                tracing::debug!(%attempt, "dropped superseded result");
            }
        }
    }
    printed
}
