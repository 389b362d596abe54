//! CaseGuard - multimodal case risk assessment
//!
//! A CLI front end over an asynchronous pipeline: submitted cases are
//! queued, their images, audio and video are analyzed by modality
//! sub-agents, and a tool-calling reasoning agent writes and archives
//! the final report.
//!
//! Exit codes:
//!   0 - Success
//!   1 - Runtime error (config, rejected submission, unknown id, etc.)
//!   2 - The submitted or inspected task failed

mod agent;
mod analysis;
mod cli;
mod config;
mod error;
mod llm;
mod models;
mod pipeline;
mod profile;
mod report;
mod retry;
mod scheduler;
mod store;

use agent::CaseChat;
use anyhow::{bail, Context, Result};
use base64::Engine;
use cli::{Args, Command};
use config::{Config, CONFIG_FILE_NAME};
use indicatif::{ProgressBar, ProgressStyle};
use llm::{CompletionEndpoint, OpenAiCompatClient, StreamChunk};
use models::{normalize_user_id, TaskRecord, TaskStatus};
use pipeline::CasePipeline;
use profile::{ProfileStore, StaticProfiles};
use scheduler::{SubmissionRequest, TaskScheduler};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use store::TaskStore;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse_args();

    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // No logging needed
    if matches!(args.command, Command::InitConfig) {
        return handle_init_config();
    }

    let (mut config, source) = match load_config(&args) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    };
    config.merge_with_args(&args);

    init_logging(&args, &config);

    info!("CaseGuard v{}", env!("CARGO_PKG_VERSION"));
    debug!("Configuration: {}", source);
    debug!("Arguments: {:?}", args);

    match run(args, config).await {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(e) => {
            error!("Command failed: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle `init-config`: generate a default .caseguard.toml.
fn handle_init_config() -> Result<()> {
    let path = Path::new(CONFIG_FILE_NAME);

    if path.exists() {
        eprintln!(
            "⚠️  {} already exists. Remove it first or edit it manually.",
            CONFIG_FILE_NAME
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content)
        .with_context(|| format!("Failed to write {}", CONFIG_FILE_NAME))?;

    println!("✅ Created {} with default settings.", CONFIG_FILE_NAME);
    println!("   Edit it to customize models, retries, queue size, and more.");
    Ok(())
}

/// Initialize logging based on verbosity settings.
fn init_logging(args: &Args, config: &Config) {
    let level = if !args.quiet && config.general.verbose {
        tracing::Level::DEBUG
    } else {
        args.log_level()
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

/// Load configuration from file or use defaults.
///
/// Also returns a description of where the configuration came from.
fn load_config(args: &Args) -> Result<(Config, String)> {
    if let Some(ref config_path) = args.config {
        let config = Config::load(config_path)?;
        return Ok((config, format!("loaded from {}", config_path.display())));
    }

    match Config::load_default() {
        Ok(Some(config)) => Ok((config, format!("loaded from {}", CONFIG_FILE_NAME))),
        Ok(None) => Ok((Config::default(), "defaults".to_string())),
        Err(e) => {
            eprintln!("⚠️  Ignoring unreadable {}: {:#}", CONFIG_FILE_NAME, e);
            Ok((Config::default(), "defaults".to_string()))
        }
    }
}

/// Dispatch the subcommand. Returns the exit code.
async fn run(args: Args, config: Config) -> Result<i32> {
    let user_id = normalize_user_id(
        args.user
            .as_deref()
            .unwrap_or(config.general.default_user.as_str()),
    );
    let store = Arc::new(TaskStore::open(&config.general.state_file));
    debug!("State file: {}", store.path().display());

    match args.command {
        Command::Submit {
            text,
            images,
            audios,
            videos,
        } => {
            let request = SubmissionRequest {
                text,
                images: encode_files(&images)?,
                audios: encode_files(&audios)?,
                videos: encode_files(&videos)?,
            };
            handle_submit(&config, store, &user_id, request, args.quiet).await
        }
        Command::Run => handle_run(&config, store, args.quiet).await,
        Command::Tasks => {
            print_task_list(&store, &user_id);
            Ok(0)
        }
        Command::History => {
            print_history(&store, &user_id);
            Ok(0)
        }
        Command::Show { id, json } => handle_show(&store, &user_id, &id, json),
        Command::Ask { question } => handle_ask(&config, store, &user_id, &question).await,
        Command::InitConfig => {
            handle_init_config()?;
            Ok(0)
        }
    }
}

/// Wire the endpoint, analyzers and agent into a running scheduler.
fn start_scheduler(config: &Config, store: Arc<TaskStore>) -> Result<TaskScheduler> {
    let client = OpenAiCompatClient::new(&config.model)?;
    let endpoint: Arc<dyn CompletionEndpoint> = Arc::new(client);
    let profiles: Arc<dyn ProfileStore> = Arc::new(StaticProfiles::from_config(&config.profiles));

    let pipeline = CasePipeline::from_config(config, endpoint, Arc::clone(&store), profiles);
    Ok(TaskScheduler::start(store, Arc::new(pipeline), &config.queue))
}

async fn handle_submit(
    config: &Config,
    store: Arc<TaskStore>,
    user_id: &str,
    request: SubmissionRequest,
    quiet: bool,
) -> Result<i32> {
    let scheduler = start_scheduler(config, Arc::clone(&store))?;

    let receipt = match scheduler.submit(user_id, request) {
        Ok(receipt) => receipt,
        Err(e) => {
            scheduler.shutdown().await;
            return Err(e).context("Submission rejected");
        }
    };

    println!(
        "📨 Task {} for {}: {} [{}]",
        receipt.task_id, user_id, receipt.message, receipt.status
    );
    println!("   Model: {}", config.model.main_model);
    println!("   Endpoint: {}", config.model.base_url);

    let spinner = spinner(format!("Assessing {}...", receipt.task_id), quiet);
    scheduler.shutdown().await;
    spinner.finish_and_clear();

    let Some(task) = store.get_task_detail_by_id(user_id, &receipt.task_id) else {
        bail!("Task {} disappeared from the store", receipt.task_id);
    };
    print_task_detail(&task);
    Ok(exit_code_for(&task))
}

async fn handle_run(config: &Config, store: Arc<TaskStore>, quiet: bool) -> Result<i32> {
    let scheduler = start_scheduler(config, store)?;

    let recovered = scheduler.recover_pending().await;
    if recovered == 0 {
        println!("✅ No unfinished tasks.");
        scheduler.shutdown().await;
        return Ok(0);
    }

    let spinner = spinner(format!("Processing {} unfinished task(s)...", recovered), quiet);
    scheduler.shutdown().await;
    spinner.finish_and_clear();

    println!("✅ Processed {} unfinished task(s).", recovered);
    Ok(0)
}

async fn handle_ask(
    config: &Config,
    store: Arc<TaskStore>,
    user_id: &str,
    question: &str,
) -> Result<i32> {
    let client = OpenAiCompatClient::new(&config.model)?;
    let endpoint: Arc<dyn CompletionEndpoint> = Arc::new(client);
    let profiles: Arc<dyn ProfileStore> = Arc::new(StaticProfiles::from_config(&config.profiles));
    let chat = CaseChat::from_config(config, endpoint, store, profiles);

    let (sink, mut chunks) = mpsc::channel(64);
    let printer = tokio::spawn(async move {
        let mut stdout = std::io::stdout();
        while let Some(chunk) = chunks.recv().await {
            match chunk {
                StreamChunk::Delta(text) => {
                    let _ = write!(stdout, "{}", text);
                    let _ = stdout.flush();
                }
                StreamChunk::Done => break,
            }
        }
        let _ = writeln!(stdout);
    });

    let result = chat.reply(user_id, question, sink).await;
    if let Err(e) = printer.await {
        error!("Answer printer stopped abnormally: {}", e);
    }
    result?;
    Ok(0)
}

fn handle_show(store: &TaskStore, user_id: &str, id: &str, json: bool) -> Result<i32> {
    let Some(task) = store.get_task_detail_by_id(user_id, id) else {
        bail!("No task or case {} for {}", id, user_id);
    };

    if json {
        let content =
            serde_json::to_string_pretty(&task).context("Failed to serialize task")?;
        println!("{}", content);
    } else {
        print_task_detail(&task);
    }
    Ok(exit_code_for(&task))
}

fn exit_code_for(task: &TaskRecord) -> i32 {
    if task.status == TaskStatus::Failed {
        2
    } else {
        0
    }
}

fn print_task_list(store: &TaskStore, user_id: &str) {
    let items = store.list_tasks(user_id);
    if items.is_empty() {
        println!("No tasks for {}.", user_id);
        return;
    }

    println!("📋 Tasks for {}:\n", user_id);
    for item in items {
        println!(
            "   {:<18} {:<11} {}  {}",
            item.task_id,
            item.status.to_string(),
            item.updated_at.format("%Y-%m-%d %H:%M:%S"),
            item.title
        );
    }
}

fn print_history(store: &TaskStore, user_id: &str) {
    let history = store.get_case_history(user_id);
    if history.is_empty() {
        println!("No archived cases for {}.", user_id);
        return;
    }

    println!("🗂️  Case history for {}:\n", user_id);
    for record in history {
        let marker = if record.error.is_some() { " (failed)" } else { "" };
        println!(
            "   {:<18} {:<6} {}  {}{}",
            record.record_id,
            record.risk_level.to_string(),
            record.created_at.format("%Y-%m-%d %H:%M:%S"),
            record.title,
            marker
        );
    }
}

fn print_task_detail(task: &TaskRecord) {
    let icon = match task.status {
        TaskStatus::Completed => "✅",
        TaskStatus::Failed => "⛔",
        _ => "⏳",
    };

    println!("\n{} {} [{}]", icon, task.task_id, task.status);
    println!("   Title: {}", task.title);
    println!("   Created: {}", task.created_at.format("%Y-%m-%d %H:%M:%S"));

    if !task.status.is_terminal() {
        println!("   The task has not finished yet.");
        return;
    }
    if !task.error.is_empty() {
        println!("   Error: {}", task.error);
    }
    if !task.report.is_empty() {
        println!("\n{}", task.report);
    }
}

/// Read media files and encode them as base64.
fn encode_files(paths: &[PathBuf]) -> Result<Vec<String>> {
    paths
        .iter()
        .map(|path| {
            let bytes = std::fs::read(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
        })
        .collect()
}

fn spinner(message: String, quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg} [{elapsed}]")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_encode_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clip.bin");
        std::fs::write(&path, b"hello").unwrap();

        let encoded = encode_files(&[path]).unwrap();
        assert_eq!(encoded, vec!["aGVsbG8=".to_string()]);

        assert!(encode_files(&[dir.path().join("missing.bin")]).is_err());
    }
}
