use std::error::Error;
use std::io::{BufRead, Write};

use log::debug;
use tokio::sync::mpsc;

use crate::session::{Session, SessionEvent};
use crate::utils::validate_username;
use crate::{CHANNEL_CAPACITY, CLOSE_COMMAND, MAX_USERNAME_LEN};

/// Run an interactive chat peer against the relay at `host:port`.
pub async fn run(host: &str, port: u16) -> Result<(), Box<dyn Error>> {
    let username = tokio::task::spawn_blocking(prompt_username).await??;

    let relay_addr = format!("{}:{}", host, port);
    debug!("Connecting to relay server at {}", relay_addr);
    let session = Session::connect(&relay_addr, &username).await?;
    println!("Successfully connected to server!");
    println!("Waiting for another client... (type {} to leave)", CLOSE_COMMAND);

    let (input_tx, input_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
    let (events_tx, events_rx) = mpsc::channel::<SessionEvent>(CHANNEL_CAPACITY);

    spawn_input_reader(input_tx);
    let printer = tokio::spawn(print_events(events_rx));

    let result = session.run(input_rx, events_tx).await;
    printer.await?;
    result?;
    Ok(())
}

fn prompt_username() -> Result<String, std::io::Error> {
    print!("What's your name?: ");
    std::io::stdout().flush()?;

    loop {
        let mut name = String::new();
        if std::io::stdin().read_line(&mut name)? == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stdin closed before a name was entered",
            ));
        }
        let name = name.trim().to_string();

        if validate_username(&name).is_ok() {
            return Ok(name);
        }
        print!(
            "Username must be at most {} characters, please try again: ",
            MAX_USERNAME_LEN
        );
        std::io::stdout().flush()?;
    }
}

/// Stdin is read on a plain thread: a blocked read must not keep the runtime
/// alive after the session has closed.
fn spawn_input_reader(input: mpsc::Sender<String>) {
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if input.blocking_send(line).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    eprintln!("Failed to read input: {}", e);
                    return;
                }
            }
        }
    });
}

async fn print_events(mut events: mpsc::Receiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Keyed => debug!("Shared key established"),
            SessionEvent::Joined(name) => println!("{} has joined the chatroom!", name),
            SessionEvent::Message { sender, text } => println!("{}: {}", sender, text),
            SessionEvent::DecryptionFailed => println!("DECRYPTION FAILED"),
            SessionEvent::PeerDisconnected(Some(name)) => {
                println!("{} disconnected, waiting for another client...", name)
            }
            SessionEvent::PeerDisconnected(None) => {
                println!("OTHER CLIENT DISCONNECTED, waiting for another client...")
            }
            SessionEvent::Undelivered(text) => {
                println!("No one is connected yet, message not sent: {}", text)
            }
            SessionEvent::ConnectionLost => println!("Connection to the relay was lost"),
            SessionEvent::Closed => return,
        }
    }
}
