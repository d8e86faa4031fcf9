//! Interactive chat client reading lines from stdin.

use crate::protocol::{APPLICATION, ChatMessage, ROOM};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::time::Duration;
use switchboard_client::Client;
use tokio::io::{AsyncBufReadExt, BufReader};

fn print_message(message: &ChatMessage) {
    println!("<{}> {}", message.from, message.text);
}

pub async fn run(server: SocketAddr, name: String, heartbeat: Option<Duration>) -> anyhow::Result<()> {
    let mut builder = Client::builder();
    if let Some(interval) = heartbeat {
        builder = builder.heartbeat_interval(interval);
    }
    let client = builder.build();

    let app = APPLICATION.replacen('@', "@^", 1);
    let connection = client.connect_tcp(&app, server).await?;
    let room = connection.inspect_interface(ROOM).await?;
    tracing::info!("Connected to {} as {}", server, name);

    room.on("message", |args: &[Value]| {
        if let Some(message) = args.first().and_then(ChatMessage::from_value) {
            print_message(&message);
        }
    });
    room.on("system", |args: &[Value]| {
        if let Some(text) = args.first().and_then(Value::as_str) {
            println!("* {}", text);
        }
    });

    let history = room.call("join", vec![json!(name)]).await?;
    if let Some(Value::Array(messages)) = history.first() {
        for message in messages.iter().filter_map(ChatMessage::from_value) {
            print_message(&message);
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                match line {
                    "" => {}
                    "/quit" => break,
                    "/who" => {
                        let users = room.call("who", vec![]).await?;
                        let users: Vec<&str> = users.iter().filter_map(Value::as_str).collect();
                        println!("* here: {}", users.join(", "));
                    }
                    text => {
                        if let Err(e) = room.call("say", vec![json!(text)]).await {
                            println!("* {}", e);
                        }
                    }
                }
            }
            _ = connection.closed() => {
                tracing::warn!("Server closed the connection");
                return Ok(());
            }
        }
    }

    connection.close();
    Ok(())
}
