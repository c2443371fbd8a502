//! Subscribe to a DxHub stream, publish a few messages to it, and print what
//! comes back.
//!
//! ```sh
//! DXHUB_API_KEY=... cargo run -p dxhub-pubsub --example pubsub -- <DOMAIN> <GROUP> <STREAM> [COUNT]
//! ```
//!
//! Message payloads are printed to stdout, one per line.

use std::time::Duration;

use dxhub_pubsub::{Config, Connection, ConnectionEvent, Headers};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let usage = "usage: pubsub <DOMAIN> <GROUP> <STREAM> [COUNT]";
    let domain = args.first().ok_or(usage)?;
    let group = args.get(1).ok_or(usage)?;
    let stream = args.get(2).ok_or(usage)?;
    let count: usize = match args.get(3) {
        Some(n) => n.parse()?,
        None => 3,
    };

    let config = Config::new(group.as_str(), domain.as_str()).with_api_key(|| {
        std::env::var("DXHUB_API_KEY")
            .map(String::into_bytes)
            .map_err(|e| format!("DXHUB_API_KEY: {e}").into())
    });
    let conn = Connection::new(config)?;
    conn.connect().await?;
    eprintln!("connected, subscribing to '{stream}' ...");

    let mut sub = conn.subscribe(stream).await?;
    eprintln!("[subscribed] id={}", sub.id());

    let mut headers = Headers::new();
    headers.insert("content-type".to_string(), "text/plain".to_string());
    for i in 0..count {
        let payload = format!("hello #{i}");
        let result = conn
            .publish(stream, &headers, payload.as_bytes(), Duration::from_secs(10))
            .await?;
        match result.error {
            None => eprintln!("[published] id={}", result.id),
            Some(e) => eprintln!("[rejected] id={} {e}", result.id),
        }
    }

    let mut received = 0;
    while received < count {
        tokio::select! {
            event = sub.next() => match event {
                Some(Ok(msg)) => {
                    received += 1;
                    eprintln!("[message] id={} headers={:?}", msg.id, msg.headers);
                    println!("{}", String::from_utf8_lossy(&msg.payload));
                }
                Some(Err(e)) => eprintln!("[error] {e}"),
                None => break,
            },
            event = conn.next_event() => match event {
                Some(ConnectionEvent::Error(e)) => eprintln!("[connection] {e}"),
                Some(ConnectionEvent::Closed) | None => break,
            },
        }
    }

    conn.disconnect().await;
    eprintln!("[disconnected]");
    Ok(())
}
