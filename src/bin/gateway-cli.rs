//! Interactive REPL client for a running gateway instance.
//!
//! Client-local `/commands` (exit, clear, stream toggle, ...) are
//! distinct from the gateway's in-band `!` commands, which travel as
//! ordinary chat messages.

use std::io::{self, BufRead, Write};
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use futures::StreamExt;
use serde_json::{json, Value};

use llm_gateway::llm::types::StreamChunk;

#[derive(Parser, Debug)]
#[command(name = "gateway-cli")]
#[command(version)]
#[command(about = "Interactive CLI against a running llm-gateway instance", long_about = None)]
struct Cli {
    /// Gateway URL
    #[arg(long, default_value = "http://localhost:8000")]
    url: String,

    /// Stream responses (toggle at runtime with /stream)
    #[arg(long, default_value_t = true)]
    stream: bool,

    /// System prompt
    #[arg(long)]
    system: Option<String>,
}

struct Session {
    base_url: String,
    client: reqwest::Client,
    probe: reqwest::Client,
    stream: bool,
    system: Option<String>,
    messages: Vec<Value>,
}

impl Session {
    fn new(cli: Cli) -> Result<Self> {
        Ok(Self {
            base_url: cli.url.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(120))
                .build()?,
            // health/capabilities probes use a short timeout
            probe: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()?,
            stream: cli.stream,
            system: cli.system,
            messages: Vec::new(),
        })
    }

    async fn get_probe(&self, path: &str) -> Option<Value> {
        self.probe
            .get(format!("{}{path}", self.base_url))
            .send()
            .await
            .ok()?
            .json()
            .await
            .ok()
    }

    async fn toggle_logging(&self, enable: bool) {
        let action = if enable { "enable" } else { "disable" };
        let result = self
            .probe
            .post(format!("{}/logging/{action}", self.base_url))
            .send()
            .await;
        match result {
            Ok(resp) => match resp.json::<Value>().await {
                Ok(body) => {
                    let state = if body["dialog_logging"] == true { "on" } else { "off" };
                    println!("[dialog logging {state}]");
                }
                Err(e) => eprintln!("[toggle failed: {e}]"),
            },
            Err(e) => eprintln!("[toggle failed: {e}]"),
        }
    }

    fn payload(&self) -> Value {
        let mut payload = json!({
            "messages": self.messages,
            "max_tokens": 2048,
        });
        if let Some(system) = &self.system {
            payload["system"] = json!(system);
        }
        payload
    }

    /// One turn against the gateway. Returns the assistant text, or
    /// `None` on transport failure (caller rolls the user turn back).
    async fn chat(&self) -> Option<String> {
        if self.stream {
            self.chat_streaming().await
        } else {
            self.chat_plain().await
        }
    }

    async fn chat_plain(&self) -> Option<String> {
        let resp = self
            .client
            .post(format!("{}/chat", self.base_url))
            .json(&self.payload())
            .send()
            .await
            .map_err(|e| eprintln!("\n[connection error] {e}"))
            .ok()?;
        let body: Value = resp.json().await.ok()?;
        if let Some(detail) = body.get("detail") {
            eprintln!("\n[error] {detail}");
            return None;
        }
        let content = body["content"].as_str().unwrap_or_default().to_string();
        println!("{content}");
        Some(content)
    }

    async fn chat_streaming(&self) -> Option<String> {
        let resp = self
            .client
            .post(format!("{}/chat/stream", self.base_url))
            .json(&self.payload())
            .send()
            .await
            .map_err(|e| eprintln!("\n[connection error] {e}"))
            .ok()?;

        let mut full = String::new();
        let mut buffer = String::new();
        let mut bytes = resp.bytes_stream();
        'read: while let Some(chunk) = bytes.next().await {
            let Ok(chunk) = chunk else { break };
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(pos) = buffer.find('\n') {
                let line: String = buffer.drain(..=pos).collect();
                let Some(data) = line.trim().strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    break 'read;
                }
                let Ok(parsed) = serde_json::from_str::<StreamChunk>(data) else {
                    continue;
                };
                match parsed {
                    StreamChunk::ContentDelta { content, .. } => {
                        print!("{content}");
                        let _ = io::stdout().flush();
                        full.push_str(&content);
                    }
                    StreamChunk::CommandResponse { command, result } => {
                        println!("\n[!{command}]");
                        println!(
                            "{}",
                            serde_json::to_string_pretty(&result).unwrap_or_default()
                        );
                        full = result.to_string();
                    }
                    StreamChunk::Error { error } => {
                        eprintln!("\n[error] {error}");
                    }
                    _ => {}
                }
            }
        }
        println!();
        Some(full)
    }
}

fn print_help() {
    println!(
        "
Commands:
  /exit, /quit    — quit
  /clear          — clear conversation history
  /stream         — toggle streaming
  /log on|off     — toggle dialog logging on the gateway
  /system <text>  — set the system prompt
  /info           — show provider capabilities
  /health         — health status
  /help           — this help
"
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut session = Session::new(cli)?;

    let Some(health) = session.get_probe("/health").await else {
        eprintln!("provider not reachable: {}", session.base_url);
        eprintln!("start the gateway or check the URL.");
        std::process::exit(1);
    };
    let info = session.get_probe("/capabilities").await.unwrap_or_default();
    let provider = info["provider"]
        .as_str()
        .or_else(|| health["provider"].as_str())
        .unwrap_or("unknown")
        .to_string();

    println!("llm-gateway CLI");
    println!("  provider : {provider}");
    println!("  url      : {}", session.base_url);
    println!("  streaming: {}", if session.stream { "on" } else { "off" });
    if let Some(system) = &session.system {
        println!("  system   : {system}");
    }
    println!("  /help for commands\n");

    let stdin = io::stdin();
    loop {
        print!("You: ");
        let _ = io::stdout().flush();
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim().to_string();
        if input.is_empty() {
            continue;
        }

        if let Some(command) = input.strip_prefix('/') {
            let lower = command.to_lowercase();
            match lower.as_str() {
                "exit" | "quit" => break,
                "clear" => {
                    session.messages.clear();
                    println!("[history cleared]");
                }
                "stream" => {
                    session.stream = !session.stream;
                    println!("[streaming {}]", if session.stream { "on" } else { "off" });
                }
                "info" => println!(
                    "{}",
                    serde_json::to_string_pretty(&info).unwrap_or_default()
                ),
                "health" => {
                    let health = session.get_probe("/health").await.unwrap_or_default();
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&health).unwrap_or_default()
                    );
                }
                "help" => print_help(),
                _ if lower.starts_with("log ") => {
                    session.toggle_logging(lower.ends_with("on")).await;
                }
                _ if lower.starts_with("system ") => {
                    session.system = Some(input["/system ".len()..].trim().to_string());
                    println!("[system prompt set]");
                }
                _ => println!("[unknown command: {input}]"),
            }
            continue;
        }

        session.messages.push(json!({ "role": "user", "content": input }));
        print!("Assistant: ");
        let _ = io::stdout().flush();

        match session.chat().await {
            Some(reply) if !reply.is_empty() => {
                session
                    .messages
                    .push(json!({ "role": "assistant", "content": reply }));
            }
            _ => {
                // roll back the user turn on failure
                session.messages.pop();
            }
        }
    }

    println!("bye!");
    Ok(())
}
