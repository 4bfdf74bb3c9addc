//! echo-relay interactive client
//!
//! Prompts for a response mode and a line of text, sends it, and prints the
//! server's answer. Exits on `q` or when the server goes away.

use clap::Parser;
use echo_relay::{Client, Message, MessageKind};
use std::io::{self, BufRead, Write};
use tracing_subscriber::EnvFilter;

/// Command-line arguments for the client
#[derive(Parser, Debug)]
#[command(name = "echo-relay-client")]
#[command(version = "0.1.0")]
#[command(about = "Interactive client for echo-relay", long_about = None)]
struct Args {
    /// Server host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(short, long, default_value = "60000")]
    port: u16,

    /// Largest response body to accept, in bytes
    #[arg(short = 'm', long, default_value_t = echo_relay::protocol::DEFAULT_MAX_BODY_SIZE)]
    max_body_size: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let args = Args::parse();

    let mut client = Client::new().with_max_body_size(args.max_body_size);
    client.connect(&args.host, args.port)?;

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    let mut request = Message::new(MessageKind::InOrder);

    while client.is_connected() {
        let Some(kind) = prompt_kind(&mut lines)? else {
            break;
        };

        print!("Enter message to send:\n> ");
        io::stdout().flush()?;
        let Some(text) = lines.next().transpose()? else {
            break;
        };

        request.clear();
        request.set_kind(kind);
        request.push_str(&text);

        match client.request(&request) {
            Ok(mut response) => println!("Response: {}\n", response.take_string()),
            Err(e) => {
                eprintln!("Client is disconnected: {e}");
                break;
            }
        }
    }

    client.disconnect();
    Ok(())
}

/// Ask for the response mode until a valid choice or `q` is entered.
fn prompt_kind<B: BufRead>(lines: &mut io::Lines<B>) -> io::Result<Option<MessageKind>> {
    loop {
        print!("Choose response mode:\n1) In order\n2) Reversed\nq) Quit\n> ");
        io::stdout().flush()?;

        let Some(line) = lines.next().transpose()? else {
            return Ok(None);
        };

        match line.trim() {
            "1" => return Ok(Some(MessageKind::InOrder)),
            "2" => return Ok(Some(MessageKind::Reverse)),
            "q" | "Q" => return Ok(None),
            other => println!("Invalid choice: {other}"),
        }
    }
}
