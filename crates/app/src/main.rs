use parley::config::ConfigStore;
use parley::{connect, telemetry};
use parley_sync::{EngineEvent, EngineState, MessageStatus, Role};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

const USAGE: &str = "usage: parley <document-id> [document-file]";

#[tokio::main]
async fn main() {
    telemetry::init();

    let mut args = std::env::args().skip(1);
    let Some(document_id) = args.next() else {
        eprintln!("{USAGE}");
        std::process::exit(2);
    };
    let document_file = args.next();

    let store = ConfigStore::load();
    let parley = match connect((*store.config()).clone()).await {
        Ok(parley) => parley,
        Err(error) => {
            eprintln!("parley: {error}");
            std::process::exit(1);
        }
    };

    if let Some(path) = document_file {
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => {
                if !parley.load_document_text(&text) {
                    tracing::info!(path = %path, "document text is ignored by the http backend");
                }
            }
            Err(error) => {
                eprintln!("parley: failed to read `{path}`: {error}");
                std::process::exit(1);
            }
        }
    }

    let engine = parley.engine();
    let mut events = engine.events();
    if let Err(error) = parley.open_document(&document_id) {
        eprintln!("parley: {error}");
        std::process::exit(1);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut printed_history = false;
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(error) => {
                        tracing::warn!(error = %error, "failed to read stdin");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                if let Err(error) = engine.send_question(&line) {
                    eprintln!("! {error}");
                }
            }
            event = events.recv() => match event {
                Ok(EngineEvent::ViewChanged) if !printed_history && engine.snapshot().loaded => {
                    printed_history = true;
                    for message in engine.current_view() {
                        let speaker = match message.role {
                            Role::User => "you",
                            Role::Assistant => "answer",
                        };
                        if message.status != MessageStatus::Pending {
                            println!("{speaker}: {}", message.text);
                        }
                    }
                }
                Ok(EngineEvent::Reveal(reveal)) if reveal.is_complete => {
                    println!("answer: {}", reveal.visible_text);
                }
                Ok(EngineEvent::StateChanged(EngineState::Error { message, .. })) => {
                    eprintln!("! {message}");
                }
                Ok(EngineEvent::WatcherStatusChanged(status)) if status.is_degraded() => {
                    eprintln!("! sync is degraded, retrying");
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "event receiver lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    engine.close();
}
