use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tempo_voice::controller::{ControllerDeps, VoiceController, VoiceEvent};
use tempo_voice::session::{LiveDeps, WsConnector};
use tempo_voice::tools::{DATE_FORMAT, ToolCall, ToolExecutor, ToolRequest};
use tempo_voice::voice::{
    AudioOutput, CpalMicrophone, CpalSpeaker, InputStream, Microphone, PlaybackScheduler, Speaker,
    SpeechToText, TranscribingRecognizer, rms,
};
use tempo_voice::{Config, SharedState, SqliteStore};

/// Tempo - project planner with a hands-free voice assistant
#[derive(Parser)]
#[command(name = "tempo", version, about)]
struct Cli {
    /// Directory holding the planner database
    #[arg(long, env = "TEMPO_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Listen for the wake phrase and talk to the assistant (default)
    Listen,
    /// List projects and their tasks
    Projects,
    /// Show the calendar
    Agenda,
    /// Create a project
    AddProject {
        name: String,
        /// Hex color, e.g. "#4f46e5"
        #[arg(short, long)]
        color: Option<String>,
        /// Free-form description
        #[arg(short, long)]
        details: Option<String>,
    },
    /// Add a task to the project whose name contains PROJECT
    AddTask { project: String, title: String },
    /// Put the task whose title contains TASK on DATE (YYYY-MM-DD)
    Schedule { task: String, date: String },
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,tempo_voice=info",
        1 => "info,tempo_voice=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let command = cli.command.unwrap_or(Command::Listen);

    match command {
        Command::TestMic { duration } => return test_mic(duration).await,
        Command::TestSpeaker => return test_speaker().await,
        _ => {}
    }

    let config = Config::load(cli.data_dir)?;
    let store = Arc::new(SqliteStore::open(config.database_path())?);
    let state = SharedState::open(store)?;

    match command {
        Command::Listen => listen(config, state).await,
        Command::Projects => {
            print_projects(&state).await;
            Ok(())
        }
        Command::Agenda => {
            print_agenda(&state).await;
            Ok(())
        }
        Command::AddProject {
            name,
            color,
            details,
        } => {
            edit(
                &state,
                "createProject",
                ToolRequest::CreateProject {
                    name,
                    color,
                    details,
                },
            )
            .await
        }
        Command::AddTask { project, title } => {
            edit(
                &state,
                "createTask",
                ToolRequest::CreateTask {
                    project_name: project,
                    title,
                },
            )
            .await
        }
        Command::Schedule { task, date } => {
            let date = chrono::NaiveDate::parse_from_str(&date, DATE_FORMAT)
                .map_err(|_| anyhow::anyhow!("invalid date '{date}', expected YYYY-MM-DD"))?;
            edit(
                &state,
                "scheduleTask",
                ToolRequest::ScheduleTask {
                    task_title: task,
                    date,
                },
            )
            .await
        }
        Command::TestMic { .. } | Command::TestSpeaker => Ok(()),
    }
}

/// Run the voice controller until Ctrl-C
async fn listen(config: Config, state: SharedState) -> anyhow::Result<()> {
    let api_key = config
        .voice
        .stt_api_key
        .clone()
        .ok_or_else(|| anyhow::anyhow!("OPENAI_API_KEY is required for wake phrase recognition"))?;

    let microphone: Arc<dyn Microphone> = Arc::new(CpalMicrophone);
    let speaker: Arc<dyn Speaker> = Arc::new(CpalSpeaker);
    let stt = SpeechToText::new(
        config.voice.stt_url.clone(),
        api_key,
        config.voice.stt_model.clone(),
    )?;
    let recognizer = Arc::new(TranscribingRecognizer::new(Arc::clone(&microphone), stt));

    let deps = ControllerDeps {
        recognizer,
        live: LiveDeps {
            connector: Arc::new(WsConnector::new(&config.assistant)),
            microphone,
            speaker,
        },
        state,
        voice: config.voice.clone(),
        assistant: config.assistant.clone(),
    };

    tracing::info!(
        wake_phrase = %config.voice.wake_phrase,
        assistant = %config.assistant.url,
        "starting tempo voice assistant"
    );

    let handle = VoiceController::spawn(deps);
    let mut events = handle.subscribe();
    handle.start();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                break;
            }
            event = events.recv() => match event {
                Ok(VoiceEvent::ModeChanged { to, .. }) => {
                    println!("[{to}] {}", to.description());
                }
                Ok(VoiceEvent::Fatal(message)) => {
                    eprintln!("Voice assistant stopped: {message}");
                }
                Ok(VoiceEvent::BatchProcessed { calls, committed }) => {
                    tracing::debug!(calls, committed, "assistant changed the planner");
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "missed controller events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    handle.stop();
    handle.shutdown().await;
    Ok(())
}

/// Apply one edit through the same path the assistant uses
async fn edit(state: &SharedState, name: &str, request: ToolRequest) -> anyhow::Result<()> {
    let call = ToolCall {
        id: "cli".to_string(),
        name: name.to_string(),
        request,
    };

    let result = state
        .update(|snapshot| {
            let (next, result) = ToolExecutor.apply(&call, std::mem::take(snapshot));
            *snapshot = next;
            result
        })
        .await?;

    println!("{}", result.status_text().unwrap_or_default());
    Ok(())
}

async fn print_projects(state: &SharedState) {
    let snapshot = state.snapshot().await;
    if snapshot.projects.is_empty() {
        println!("No projects yet.");
        return;
    }

    let selected = snapshot.selection.id();
    for project in &snapshot.projects {
        let marker = if selected == Some(project.id.as_str()) { '*' } else { ' ' };
        println!("{marker} {} ({})", project.name, project.color);
        if !project.details.is_empty() {
            println!("    {}", project.details);
        }
        for task in &project.tasks {
            let check = if task.done { 'x' } else { ' ' };
            println!("    [{check}] {}", task.title);
        }
    }
}

async fn print_agenda(state: &SharedState) {
    let snapshot = state.snapshot().await;
    if snapshot.calendar.is_empty() {
        println!("Nothing scheduled.");
        return;
    }

    for (date, ids) in &snapshot.calendar {
        println!("{date}");
        for id in ids {
            if let Some(task) = snapshot.task(id) {
                println!("  - {}", task.title);
            }
        }
    }
}

/// Test microphone input
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let buffer = Arc::new(Mutex::new(Vec::<f32>::new()));
    let sink = Arc::clone(&buffer);
    let mut input = CpalMicrophone.open(Box::new(move |data: &[f32]| {
        if let Ok(mut buf) = sink.lock() {
            buf.extend_from_slice(data);
        }
    }))?;

    println!("---");
    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let samples = buffer
            .lock()
            .map(|mut b| std::mem::take(&mut *b))
            .unwrap_or_default();
        let energy = rms(&samples);
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "#".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] RMS: {:.4} | Peak: {:.4} | [{}]",
            i + 1,
            energy,
            peak,
            meter
        );
    }

    input.close();

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Test speaker output with a sine wave, scheduled in chunks
#[allow(clippy::cast_precision_loss)]
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let output = CpalSpeaker.open()?;
    let sample_rate = output.sample_rate();
    let scheduler = PlaybackScheduler::new(output);

    let frequency = 440.0_f32;
    let chunk_len = usize::try_from(sample_rate / 4)?;

    for chunk in 0..8 {
        let samples: Vec<f32> = (0..chunk_len)
            .map(|i| {
                let t = (chunk * chunk_len + i) as f32 / sample_rate as f32;
                (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 // 30% volume
            })
            .collect();
        scheduler.enqueue(samples);
    }

    while scheduler.is_playing() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    scheduler.close();

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}
