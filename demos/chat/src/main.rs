//! A terminal chat room on top of netbus.
//!
//! ```text
//! netbus-chat host 7000
//! netbus-chat join 127.0.0.1 7000 alice
//! ```
//!
//! Set `NETBUS_CONFIG` to a JSON file to override [`NetConfig`] fields.

use std::io::BufRead;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use netbus::prelude::*;
use netbus::protocol::JsonCodec;
use serde::{Deserialize, Serialize};

const CHAT: MessageId = message_id("ChatLine");
const TICK: Duration = Duration::from_millis(16);

// ---------------------------------------------------------------------------
// Chat types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatLine {
    from: String,
    text: String,
}

enum Mode {
    Host { port: u16 },
    Join { host: String, port: u16, name: String },
}

fn parse_args() -> Option<Mode> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        ["host", port] => Some(Mode::Host {
            port: port.parse().ok()?,
        }),
        ["join", host, port, name] => Some(Mode::Join {
            host: (*host).to_string(),
            port: port.parse().ok()?,
            name: (*name).to_string(),
        }),
        _ => None,
    }
}

fn load_config() -> Result<NetConfig, Box<dyn std::error::Error>> {
    match std::env::var("NETBUS_CONFIG") {
        Ok(path) => Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?),
        Err(_) => Ok(NetConfig::default()),
    }
}

/// Lines typed on stdin, read on their own thread.
fn stdin_lines() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

// ---------------------------------------------------------------------------
// Main loop
// ---------------------------------------------------------------------------

fn main() -> Result<(), Box<dyn std::error::Error>> {
    netbus::logging::init();

    let Some(mode) = parse_args() else {
        eprintln!("usage: netbus-chat host <port> | join <ip> <port> <name>");
        std::process::exit(2);
    };

    let net = Arc::new(NetworkingManager::builder().config(load_config()?).build()?);
    let is_host = matches!(mode, Mode::Host { .. });
    let (address, name) = match mode {
        Mode::Host { port } => (Address::resolve("0.0.0.0", port)?, "host".to_string()),
        Mode::Join { host, port, name } => (Address::resolve(&host, port)?, name),
    };

    let connection = Connection::new(address, Arc::clone(net.bus()), net.clone(), DefaultHandshake);
    let peer = connection.open()?;

    // Lines received this tick, printed and (on the host) relayed.
    let inbox = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&inbox);
    net.bus().add_message_receiver(CHAT, move |message| {
        match message.decode_body::<_, ChatLine>(&JsonCodec) {
            Ok(line) => sink
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(line),
            Err(e) => tracing::warn!(error = %e, "unreadable chat line"),
        }
    });

    let lines = stdin_lines();
    let mut last_state = connection.state();
    println!("{last_state}");

    loop {
        net.dispatch_messages()?;

        let state = connection.state();
        if state != last_state {
            println!("[{state}]");
            last_state = state;
        }
        if state.is_terminal() {
            break;
        }

        let received: Vec<ChatLine> = std::mem::take(
            &mut *inbox
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );
        for line in received {
            println!("{}: {}", line.from, line.text);
            if is_host {
                let message = Message::encode_body(CHAT, &JsonCodec, &line)?;
                net.send(NetProtocol::BroadcastReliable, message)?;
            }
        }

        while let Ok(text) = lines.try_recv() {
            let line = ChatLine {
                from: name.clone(),
                text,
            };
            let message = Message::encode_body(CHAT, &JsonCodec, &line)?;
            let protocol = if is_host {
                println!("{}: {}", line.from, line.text);
                NetProtocol::BroadcastReliable
            } else {
                NetProtocol::Reliable(peer)
            };
            net.send(protocol, message)?;
        }

        std::thread::sleep(TICK);
    }

    drop(connection);
    match Arc::try_unwrap(net) {
        Ok(net) => net.shutdown()?,
        Err(_) => tracing::warn!("networking manager still shared at exit"),
    }
    Ok(())
}
