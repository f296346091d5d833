//! tandem-recorder peer
//!
//! Runs one peer against a directory-backed registry. Line commands on stdin
//! play the part of the page UI and capture instrumentation.

use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use tandem_recorder::config::Config;
use tandem_recorder::coordinator::{
    create_recorder_channels, Coordinator, RecorderHandle, RecorderStatus, Visibility,
};
use tandem_recorder::data::NetworkRecord;
use tandem_recorder::ids::PeerId;
use tandem_recorder::logging;
use tandem_recorder::registry::{DirectoryRegistry, Registry};
use tandem_recorder::upload::{HttpSink, Uploader};

/// One stdin command
#[derive(Debug, PartialEq)]
enum PeerCommand {
    Start,
    Stop,
    Hide,
    Show,
    Emit(serde_json::Value),
    Network(NetworkRecord),
    Draw(bool),
    Request,
    Status,
    Quit,
}

fn parse_command(line: &str) -> Result<PeerCommand> {
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };
    let command = match word {
        "start" => PeerCommand::Start,
        "stop" => PeerCommand::Stop,
        "hide" => PeerCommand::Hide,
        "show" => PeerCommand::Show,
        "emit" => PeerCommand::Emit(serde_json::from_str(rest).context("emit expects a JSON event")?),
        "net" => PeerCommand::Network(
            serde_json::from_str(rest).context("net expects a JSON network record")?,
        ),
        "draw" => match rest {
            "on" => PeerCommand::Draw(true),
            "off" => PeerCommand::Draw(false),
            _ => return Err(anyhow!("draw expects on or off")),
        },
        "request" => PeerCommand::Request,
        "status" => PeerCommand::Status,
        "quit" | "exit" => PeerCommand::Quit,
        other => return Err(anyhow!("unknown command: {}", other)),
    };
    Ok(command)
}

/// Returns false once the peer has been unloaded
async fn run_command(
    handle: &RecorderHandle,
    finisher: &HttpSink,
    sink_url: Option<&str>,
    command: PeerCommand,
) -> Result<bool> {
    match command {
        PeerCommand::Start => {
            let record_id = handle.start_recording_with_id(None).await?;
            println!("recording {}", record_id);
        }
        PeerCommand::Stop => {
            let outcome = handle.stop_recording(None).await?;
            println!(
                "stopped {} (delivered {}, discarded {})",
                outcome.record_id.as_deref().unwrap_or("-"),
                outcome.flush.delivered_count(),
                outcome.discarded
            );
            if let (true, Some(record_id), Some(sink)) =
                (outcome.should_prompt(), outcome.record_id.as_deref(), sink_url)
            {
                if let Err(e) = finisher.finish_session(sink, record_id, "").await {
                    warn!("Failed to finalize recording {}: {}", record_id, e);
                }
            }
        }
        PeerCommand::Hide => handle.set_visibility(Visibility::Hidden).await?,
        PeerCommand::Show => handle.set_visibility(Visibility::Visible).await?,
        PeerCommand::Emit(event) => handle.emit(event).await?,
        PeerCommand::Network(record) => handle.push_network_event(record).await?,
        PeerCommand::Draw(enabled) => {
            if !handle.set_drawing_mode(enabled).await? {
                println!("drawing mode needs an active recording");
            }
        }
        PeerCommand::Request => {
            if !handle.request_peer_events().await? {
                println!("not recording");
            }
        }
        PeerCommand::Status => {
            let state = handle.state().await?;
            println!(
                "peer {} {:?} record={} buffered={} primary={} drawing={} {:?}",
                state.peer_id,
                state.status,
                state.record_id.as_deref().unwrap_or("-"),
                state.buffered,
                state.is_primary,
                state.drawing_mode,
                state.visibility
            );
        }
        PeerCommand::Quit => {
            handle.unload().await?;
            return Ok(false);
        }
    }
    Ok(true)
}

async fn print_statuses(mut status_rx: broadcast::Receiver<RecorderStatus>) {
    loop {
        match status_rx.recv().await {
            Ok(status) => println!("status: {:?}", status),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("Status printer lagged, {} updates missed", missed);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }

    let _log_guard = logging::init_logging()?;
    info!("tandem-recorder starting...");

    let mut config = Config::load()?;
    if let Some(url) = arg_value(&args, "--url") {
        config.page.url = url;
    }
    let registry_dir = match arg_value(&args, "--registry") {
        Some(dir) => dir.into(),
        None => config.registry_directory()?,
    };
    info!("Page {} using registry {:?}", config.page.url, registry_dir);

    let runtime = tokio::runtime::Runtime::new()?;

    let peer_id = PeerId::generate();
    let backend = DirectoryRegistry::open(&registry_dir, peer_id.as_str())
        .with_context(|| format!("Failed to open registry at {:?}", registry_dir))?;
    let registry = Registry::new(Arc::new(backend));

    let sink = Arc::new(HttpSink::new(config.recording.upload_timeout()));
    let uploader = Uploader::new(sink.clone(), &config.recording, config.page.clone());
    let sink_url = config.upload.sink_url.clone();
    if sink_url.is_none() {
        warn!("No sink_url configured, events will only be kept locally");
    }

    let (cmd_tx, cmd_rx, status_tx, status_rx) = create_recorder_channels();
    let handle = RecorderHandle::new(cmd_tx);

    // Ctrl+C unloads: flush and hand the recording to another peer
    let ctrl_c_handle = handle.clone();
    let ctrl_c_runtime = runtime.handle().clone();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received, unloading...");
        let handle = ctrl_c_handle.clone();
        ctrl_c_runtime.spawn(async move {
            let _ = handle.unload().await;
        });
    })?;

    info!("Peer {} ready", peer_id);
    runtime.block_on(async move {
        let mut coordinator =
            Coordinator::new(peer_id, registry, uploader, &config, cmd_rx, status_tx);
        let mut task = tokio::spawn(async move { coordinator.run().await });
        tokio::spawn(print_statuses(status_rx));

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut unloaded = false;
        loop {
            tokio::select! {
                result = &mut task => {
                    if let Err(e) = result {
                        error!("Coordinator task failed: {}", e);
                    }
                    return;
                }
                line = lines.next_line(), if !unloaded => {
                    let line = match line {
                        Ok(Some(line)) => line,
                        Ok(None) => {
                            info!("stdin closed, unloading");
                            let _ = handle.unload().await;
                            unloaded = true;
                            continue;
                        }
                        Err(e) => {
                            error!("Failed to read stdin: {}", e);
                            let _ = handle.unload().await;
                            unloaded = true;
                            continue;
                        }
                    };
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let command = match parse_command(line) {
                        Ok(command) => command,
                        Err(e) => {
                            println!("{}", e);
                            continue;
                        }
                    };
                    match run_command(&handle, &sink, sink_url.as_deref(), command).await {
                        Ok(true) => {}
                        Ok(false) => unloaded = true,
                        Err(e) => {
                            warn!("Command failed: {}", e);
                            unloaded = true;
                        }
                    }
                }
            }
        }
    });

    // A pending stdin read would otherwise hold the runtime open
    runtime.shutdown_timeout(Duration::from_secs(1));
    info!("Shutdown complete");
    Ok(())
}

fn arg_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn print_help() {
    println!("tandem-recorder - one peer of a shared interaction recording");
    println!();
    println!("USAGE:");
    println!("    tandem-recorder [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help          Print this help message");
    println!("    --url <URL>         Page URL this peer reports");
    println!("    --registry <DIR>    Shared registry directory");
    println!();
    println!("COMMANDS (stdin):");
    println!("    start | stop | hide | show | request | status | quit");
    println!("    emit <json>         Buffer a captured event");
    println!("    net <json>          Buffer an intercepted network call");
    println!("    draw on|off         Toggle the drawing overlay flag");
    println!();
    println!("ENVIRONMENT:");
    println!("    RUST_LOG                   Set log level (e.g., debug, info, warn)");
    println!("    TANDEM_RECORDER_LOG_PATH   Override the log directory");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!(parse_command("start").unwrap(), PeerCommand::Start);
        assert_eq!(parse_command("draw off").unwrap(), PeerCommand::Draw(false));
        assert_eq!(parse_command("exit").unwrap(), PeerCommand::Quit);
    }

    #[test]
    fn test_parse_payload_commands() {
        assert_eq!(
            parse_command(r#"emit {"type":3,"data":{}}"#).unwrap(),
            PeerCommand::Emit(json!({ "type": 3, "data": {} }))
        );
        match parse_command(r#"net {"method":"POST","url":"https://api.example/x","status":201}"#)
            .unwrap()
        {
            PeerCommand::Network(record) => {
                assert_eq!(record.method, "POST");
                assert_eq!(record.status, Some(201));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(parse_command("emit not-json").is_err());
        assert!(parse_command("draw maybe").is_err());
        assert!(parse_command("dance").is_err());
    }

    #[test]
    fn test_arg_value() {
        let args: Vec<String> = ["bin", "--url", "https://a.example", "--registry"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(arg_value(&args, "--url").as_deref(), Some("https://a.example"));
        assert_eq!(arg_value(&args, "--registry"), None);
    }
}
