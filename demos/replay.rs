//! Print the events of a prediction stream as they arrive.
//!
//! Usage:
//!   cat captured_body.txt | cargo run --example replay
//!   cargo run --example replay -- --url http://localhost:3000 --flow <flow-id> "What is Rust?"
//!   cargo run --example replay -- --history ./turns --session s1 < captured_body.txt
//!
//! Set RUST_LOG=flowstream=debug to see chunk-level framing.

use std::io::{self, Write};
use std::time::Duration;

use clap::Parser;
use flowstream::{
    ChunkSource, Event, FileHistory, PredictionClient, ReaderSource, StreamConfig, TurnReader,
};

#[derive(Parser)]
#[command(name = "replay", about = "Reassemble an agent-flow prediction stream")]
struct Cli {
    /// Backend base URL. Reads the body from stdin when omitted.
    #[arg(long)]
    url: Option<String>,

    /// Flow to run (with --url)
    #[arg(long)]
    flow: Option<String>,

    /// API key for the backend (or FLOWSTREAM_API_KEY)
    #[arg(long)]
    api_key: Option<String>,

    /// Session id to continue
    #[arg(long)]
    session: Option<String>,

    /// Directory to store compacted turns in
    #[arg(long)]
    history: Option<String>,

    /// Abort the stream after this many seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Question to ask (with --url)
    question: Option<String>,
}

async fn build_source(cli: &Cli) -> Result<Box<dyn ChunkSource>, String> {
    let Some(ref url) = cli.url else {
        return Ok(Box::new(ReaderSource::new(tokio::io::stdin())));
    };
    let flow = cli.flow.as_deref().ok_or("--flow is required with --url")?;
    let question = cli
        .question
        .as_deref()
        .ok_or("a question is required with --url")?;

    let mut client = PredictionClient::new(url.as_str());
    let api_key = cli
        .api_key
        .clone()
        .or_else(|| std::env::var("FLOWSTREAM_API_KEY").ok());
    if let Some(key) = api_key {
        client = client.with_api_key(key);
    }
    let source = client
        .open(flow, question, cli.session.as_deref())
        .await
        .map_err(|e| e.to_string())?;
    Ok(Box::new(source))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let source = match build_source(&cli).await {
        Ok(source) => source,
        Err(e) => {
            eprintln!("\x1b[1;31merror:\x1b[0m {e}");
            std::process::exit(1);
        }
    };

    let mut config = StreamConfig::default();
    if let Some(ref sid) = cli.session {
        config = config.with_session(sid);
    }
    if let Some(secs) = cli.timeout {
        config = config.with_max_duration(Duration::from_secs(secs));
    }

    let mut reader = TurnReader::new(source, config);
    if let Some(ref dir) = cli.history {
        reader = reader.with_history(FileHistory::new(dir));
    }

    let (tx, mut rx) = tokio::sync::mpsc::channel::<Event>(64);

    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                Event::Token(text) => {
                    print!("{text}");
                    io::stdout().flush().ok();
                }
                Event::Start(_) => eprintln!("\x1b[2m[start]\x1b[0m"),
                Event::End(_) => println!(),
                Event::SessionId(id) => eprintln!("\x1b[35m[session: {id}]\x1b[0m"),
                other => eprintln!("\x1b[33m[{}]\x1b[0m {}", other.kind(), other.to_value()),
            }
        }
    });

    let result = reader.read_streaming(tx).await;
    printer.await.ok();

    match result {
        Ok(outcome) => {
            eprintln!(
                "\x1b[2m  [{} events after compaction, {} malformed]\x1b[0m",
                outcome.events.len(),
                outcome.malformed_frames
            );
            if let Some(sid) = outcome.session_id {
                eprintln!("\x1b[2m  [session {sid}]\x1b[0m");
            }
        }
        Err(e) => {
            eprintln!("\x1b[1;31merror processing response:\x1b[0m {e}");
            std::process::exit(1);
        }
    }
}
