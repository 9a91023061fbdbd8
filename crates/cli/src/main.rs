use clap::{Parser, Subcommand};
use lib::api::HttpApi;
use lib::channel::PhoenixTransport;
use lib::config::RawWidgetConfig;
use lib::frame::{FrameSink, InboundCommand};
use lib::widget::ChatWidget;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "widget")]
#[command(about = "Chat widget session CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Run an interactive widget session against a live backend. Typed lines
    /// are sent as messages; slash commands drive the embedder protocol.
    Chat {
        /// Account the widget belongs to.
        #[arg(long, value_name = "ID")]
        account_id: String,

        /// Backend base URL.
        #[arg(long, value_name = "URL")]
        base_url: Option<String>,

        /// Customer id cached from a previous session.
        #[arg(long, value_name = "ID")]
        customer_id: Option<String>,

        /// Visitor email attached to the customer.
        #[arg(long)]
        email: Option<String>,

        /// Visitor name attached to the customer.
        #[arg(long)]
        name: Option<String>,

        /// External id for host-app identity resolution.
        #[arg(long, value_name = "ID")]
        external_id: Option<String>,

        /// Greeting shown before any history exists.
        #[arg(long)]
        greeting: Option<String>,

        /// Require an email before the first message ("1" to enable).
        #[arg(long, value_name = "FLAG")]
        require_email_upfront: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("widget {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Chat {
            account_id,
            base_url,
            customer_id,
            email,
            name,
            external_id,
            greeting,
            require_email_upfront,
        }) => {
            let metadata = serde_json::json!({
                "email": email,
                "name": name,
                "external_id": external_id,
            });
            let raw = RawWidgetConfig {
                account_id: Some(account_id),
                base_url,
                customer_id,
                greeting,
                require_email_upfront,
                metadata: Some(metadata.to_string()),
                ..Default::default()
            };
            if let Err(e) = run_chat(raw).await {
                log::error!("chat failed: {}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

/// Prints every outbound frame and forwards it so the loop can play the
/// embedder's side of the open/close handshake.
struct PrintingSink(mpsc::UnboundedSender<Value>);

impl FrameSink for PrintingSink {
    fn emit(&self, frame: Value) {
        println!("<< {}", frame);
        let _ = self.0.send(frame);
    }
}

async fn run_chat(raw: RawWidgetConfig) -> anyhow::Result<()> {
    let config = raw.parse()?;
    let api = Arc::new(HttpApi::new(config.base_url.clone()));
    let transport = Arc::new(PhoenixTransport::new(config.websocket_url()));
    let (frames_tx, mut frames) = mpsc::unbounded_channel();
    let (mut widget, mut events) =
        ChatWidget::new(config, api, transport, Box::new(PrintingSink(frames_tx)));

    widget.boot().await?;
    println!("{}", widget.availability_text());
    println!("commands: /open /close /hide /show /agents /quit");

    let mut email: Option<String> = None;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let input = line.trim();
                if input.is_empty() {
                    continue;
                }
                match input {
                    "/quit" | "/exit" => break,
                    "/open" => widget.open(),
                    "/close" => widget.close(),
                    "/hide" => widget.handle_visibility_change(false).await,
                    "/show" => widget.handle_visibility_change(true).await,
                    "/agents" => println!("{}", widget.availability_text()),
                    _ => {
                        if let Some(address) = input.strip_prefix("/email ") {
                            email = Some(address.trim().to_string());
                            continue;
                        }
                        if widget.should_ask_for_email() && email.is_none() {
                            println!("an email is required first: /email you@example.com");
                            continue;
                        }
                        if let Err(e) = widget.send_message(input, email.as_deref()).await {
                            eprintln!("send error: {}", e);
                        }
                    }
                }
            }
            Some(event) = events.recv() => {
                widget.handle_topic_event(event).await;
            }
            Some(frame) = frames.recv() => {
                // Play the embedder: confirm open/close requests immediately.
                match frame["event"].as_str() {
                    Some("papercups:open") => {
                        widget.handle_command(InboundCommand::Toggle { is_open: true }).await;
                    }
                    Some("papercups:close") => {
                        widget.handle_command(InboundCommand::Toggle { is_open: false }).await;
                    }
                    _ => {}
                }
            }
        }
    }

    widget.teardown().await;
    Ok(())
}
