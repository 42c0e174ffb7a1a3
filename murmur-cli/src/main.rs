//! Murmur: terminal chat server and client.
//!
//! `murmur server` hosts a chatroom and reads operator commands from stdin.
//! `murmur client` joins one and sends each typed line as a message.

mod console;

use std::io::BufRead;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::{info, warn};
use tokio::sync::mpsc;

use console::{ConsoleDisplay, ConsoleObserver};
use murmur_chat::{AdmissionController, ChatError, ClientConfig, ClientSession, ServerConfig};

/// Command line arguments.
#[derive(Parser, Debug)]
#[command(name = "murmur", version)]
#[command(about = "Fixed-capacity chat over one shared message log")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Host a chatroom
    Server {
        /// Port to listen on
        #[arg(short, long, default_value_t = 9090, value_parser = clap::value_parser!(u16).range(1..))]
        port: u16,

        /// Maximum concurrent users
        #[arg(short, long, default_value_t = 10, value_parser = clap::value_parser!(u8).range(1..=99))]
        capacity: u8,

        /// Chatroom title shown to the first arrivals
        #[arg(short, long, default_value = "Chatroom")]
        title: String,

        /// Start offline; type `online` to open the room
        #[arg(long)]
        offline: bool,
    },
    /// Join a chatroom
    Client {
        /// Server host name or address
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Server port
        #[arg(short, long, default_value_t = 9090, value_parser = clap::value_parser!(u16).range(1..))]
        port: u16,

        /// Name shown next to your messages
        #[arg(long, value_name = "NAME")]
        handle: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Server {
            port,
            capacity,
            title,
            offline,
        } => run_server(ServerConfig::new(port, title, capacity.into()), offline).await?,
        Command::Client { host, port, handle } => run_client(&host, port, handle).await?,
    }
    Ok(())
}

async fn run_server(config: ServerConfig, offline: bool) -> murmur_chat::Result<()> {
    let server = AdmissionController::bind(config, Arc::new(ConsoleObserver)).await?;
    server.start().await?;
    if !offline {
        server.set_online(true).await?;
    }
    println!(
        "Listening on {}. Commands: online, offline, status, exit",
        server.local_addr()
    );

    let (tx, mut commands) = mpsc::unbounded_channel();
    spawn_stdin_reader(move |line| tx.send(line).is_ok());
    let finished = server.wait();
    tokio::pin!(finished);

    loop {
        tokio::select! {
            res = &mut finished => return res,
            line = commands.recv() => {
                let Some(line) = line else {
                    break;
                };
                match line.trim() {
                    "" => {}
                    "online" => server.set_online(true).await?,
                    "offline" => server.set_online(false).await?,
                    "status" => {
                        let stats = server.stats().await;
                        println!(
                            "{} | {}/{} users | {} messages | {} connections, {} turned away",
                            if stats.online { "Online" } else { "Offline" },
                            stats.active_connections,
                            stats.capacity,
                            stats.log_size,
                            stats.total_connections,
                            stats.rejected_full,
                        );
                    }
                    "exit" => break,
                    other => warn!("Unknown command: {other}"),
                }
            }
        }
    }

    info!("Shutting down");
    if server.is_online() {
        server.set_online(false).await?;
    }
    server.stop();
    Ok(())
}

async fn run_client(host: &str, port: u16, handle: String) -> murmur_chat::Result<()> {
    let display = Arc::new(ConsoleDisplay);
    let mut session = ClientSession::connect(host, port, handle, display, ClientConfig::default()).await?;
    // Typed lines become messages; EOF drops the outbox and leaves the room
    if let Some(outbox) = session.take_outbox() {
        spawn_stdin_reader(move |line| outbox.send(line));
    }

    match session.run().await {
        Ok(()) => Ok(()),
        // Already shown to the user by the display
        Err(ChatError::CapacityExceeded | ChatError::ServerOffline) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Feed stdin lines to `forward` on a plain thread until EOF or until
/// `forward` returns `false`.
fn spawn_stdin_reader<F>(mut forward: F)
where
    F: FnMut(String) -> bool + Send + 'static,
{
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if !forward(line) {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
}
