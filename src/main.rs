use color_eyre::eyre::{eyre, Result};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use plotpilot::config::{Settings, WorkEnvelope};
use plotpilot::gcode::ChannelSink;
use plotpilot::input::GilrsSource;
use plotpilot::session::SessionHandle;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let settings = load_settings()?;
    let envelope = WorkEnvelope::default();

    info!("Initializing gamepad input source");
    let source = GilrsSource::new().map_err(|e| eyre!("Failed to open gamepad: {}", e))?;

    // Command lines go to stdout; a printer bridge can consume them from
    // there or this sink can be swapped for a serial writer.
    let (line_tx, line_rx) = mpsc::channel::<String>(1000);
    let writer = tokio::spawn(write_lines(line_rx));

    let session = SessionHandle::spawn(
        Box::new(source),
        Box::new(ChannelSink::new(line_tx)),
        settings,
        envelope,
    )
    .map_err(|e| eyre!("Failed to start session: {}", e))?;

    let mut status_rx = session.watch_status();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, stopping");
        }
        result = status_rx.wait_for(|status| !status.active) => {
            if let Ok(status) = result {
                if let Some(error) = &status.error {
                    warn!("Session terminated on its own: {}", error);
                }
            }
        }
    }

    session.shutdown(SHUTDOWN_TIMEOUT).await?;
    writer.abort();
    Ok(())
}

async fn write_lines(mut line_rx: mpsc::Receiver<String>) {
    let mut stdout = tokio::io::stdout();
    while let Some(line) = line_rx.recv().await {
        if let Err(e) = stdout.write_all(line.as_bytes()).await {
            warn!("Failed to write command line: {}", e);
            break;
        }
        if let Err(e) = stdout.flush().await {
            warn!("Failed to flush command output: {}", e);
            break;
        }
    }
}

fn load_settings() -> Result<Settings> {
    let path = Settings::default_path();
    if path.exists() {
        Ok(Settings::load(&path)?)
    } else {
        info!("No settings file at {}, using defaults", path.display());
        Ok(Settings::default())
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
