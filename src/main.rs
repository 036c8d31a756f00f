use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use petcar_link::connection::{Terminal, WsConnector, run_server};
use petcar_link::engine::Engines;
use petcar_link::terminal::{
    AudioSource, LoggingDriver, MotionExecutor, RecordingSink, ScriptSource, WavFileSource,
};
use petcar_link::voice::{pcm_to_samples, samples_to_wav};
use petcar_link::Config;

/// Pause between streamed script chunks
const SCRIPT_CHUNK_DELAY: Duration = Duration::from_millis(200);

/// PetCar - streaming voice link between a pet car and its speech server
#[derive(Parser)]
#[command(name = "petcar", version, about)]
struct Cli {
    /// Config file to read instead of ~/.config/petcar/config.toml
    #[arg(short, long, env = "PETCAR_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the session host (default)
    Serve {
        /// Bind address
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run a terminal against a server
    Terminal {
        /// Server WebSocket URL
        #[arg(long)]
        url: Option<String>,
        /// 16 kHz mono WAV file to stream as the microphone
        #[arg(long, conflicts_with = "script", required_unless_present = "script")]
        wav: Option<PathBuf>,
        /// Text file, one utterance per line, for the scripted recognizer
        #[arg(long)]
        script: Option<PathBuf>,
        /// Save received reply audio to this WAV file
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Stay connected after the input is exhausted
        #[arg(long)]
        keep_open: bool,
    },
    /// Print the resolved configuration
    CheckConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,petcar_link=info",
        1 => "info,petcar_link=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load_from(cli.config.as_deref())?;

    match cli.command.unwrap_or(Command::Serve {
        host: None,
        port: None,
    }) {
        Command::Serve { host, port } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            serve(&config).await
        }
        Command::Terminal {
            url,
            wav,
            script,
            output,
            keep_open,
        } => {
            if let Some(url) = url {
                config.terminal.server_url = url;
            }
            let source: Box<dyn AudioSource> = match (wav, script) {
                (Some(path), _) => Box::new(WavFileSource::open(&path, config.terminal.chunk_bytes)?),
                (None, Some(path)) => Box::new(ScriptSource::from_file(&path, SCRIPT_CHUNK_DELAY)?),
                (None, None) => anyhow::bail!("either --wav or --script is required"),
            };
            terminal(&config, source, output, keep_open).await
        }
        Command::CheckConfig => {
            config.validate()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// Cancel the returned token on Ctrl-C
fn shutdown_on_interrupt() -> CancellationToken {
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            token.cancel();
        }
    });
    shutdown
}

async fn serve(config: &Config) -> anyhow::Result<()> {
    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        engine = ?config.engines.kind,
        wake_words = ?config.pipeline.wake_words,
        "starting petcar server"
    );

    let engines = Engines::from_config(&config.engines)?;
    run_server(config, engines, shutdown_on_interrupt()).await?;

    tracing::info!("server stopped");
    Ok(())
}

async fn terminal(
    config: &Config,
    source: Box<dyn AudioSource>,
    output: Option<PathBuf>,
    keep_open: bool,
) -> anyhow::Result<()> {
    tracing::info!(url = %config.terminal.server_url, "starting petcar terminal");

    let sink = RecordingSink::new();
    let executor = Arc::new(MotionExecutor::new(LoggingDriver::new()));
    let connector = WsConnector::new(
        config.terminal.server_url.clone(),
        config.terminal.watchdog_timeout,
    );

    let mut terminal = Terminal::new(
        config.terminal.clone(),
        source,
        Box::new(sink.clone()),
        executor,
    );
    if keep_open {
        terminal = terminal.keep_open();
    }

    let result = terminal.run(&connector, &shutdown_on_interrupt()).await;

    let received = sink.received();
    tracing::info!(
        connections = terminal.connections(),
        audio_chunks = sink.chunks(),
        audio_bytes = received.len(),
        "terminal finished"
    );

    if let Some(path) = output {
        let wav = samples_to_wav(&pcm_to_samples(&received), config.pipeline.output_sample_rate)?;
        std::fs::write(&path, wav)?;
        tracing::info!(path = %path.display(), "saved reply audio");
    }

    result.map_err(Into::into)
}
