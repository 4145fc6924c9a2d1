//! Relay Simulator
//!
//! Publishes a mix of relay envelopes to the `sms` topic so a running
//! sms-relay can be exercised without a real sender.
//!
//! Usage: cargo run --bin relay-sim -- [broker] [--username U] [--password P] [--to NUMBER]

use clap::Parser;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use sms_relay::broker::{Endpoint, TOPIC};
use sms_relay::relay::RelayEnvelope;
use tokio::time::{sleep, timeout, Duration};

#[derive(Parser)]
#[command(name = "relay-sim")]
#[command(about = "Publishes sample SMS relay envelopes to an MQTT broker")]
struct Args {
    /// Broker URI
    #[arg(default_value = "tcp://127.0.0.1:1883")]
    broker: String,

    #[arg(long, default_value = "")]
    username: String,

    #[arg(long, default_value = "")]
    password: String,

    /// Destination number used in the sample envelopes
    #[arg(long, default_value = "+15551234567")]
    to: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let endpoint = Endpoint::parse(&args.broker)?;

    println!("📨 SMS Relay Simulator");
    println!("  Broker: {}", endpoint);
    println!("  Topic: {}", TOPIC);
    println!("  Destination: {}", args.to);
    println!();

    let client_id = format!("relay-sim-{}", std::process::id());
    let mut options = MqttOptions::new(client_id, endpoint.host.clone(), endpoint.port);
    options.set_keep_alive(Duration::from_secs(30));
    if !args.username.is_empty() {
        options.set_credentials(args.username.clone(), args.password.clone());
    }
    if endpoint.tls {
        options.set_transport(rumqttc::Transport::tls_with_default_config());
    }

    let (client, mut eventloop) = AsyncClient::new(options, 10);

    match timeout(Duration::from_secs(10), wait_for_connack(&mut eventloop)).await {
        Ok(Ok(())) => println!("✅ Connected"),
        Ok(Err(e)) => {
            println!("❌ Failed to connect: {}", e);
            return Err(e);
        }
        Err(_) => anyhow::bail!("⏰ Timed out connecting to {}", endpoint),
    }
    println!();

    let long_body: String = "Long message split across carrier segments. "
        .repeat(8)
        .trim_end()
        .to_string();

    let scenarios = vec![
        (
            "Short message",
            RelayEnvelope::new(args.to.clone(), "Hello from relay-sim").encode(),
        ),
        (
            "Long message (multi-segment)",
            RelayEnvelope::new(args.to.clone(), long_body).encode(),
        ),
        (
            "Numeric phone number",
            format!(
                r#"{{"phoneNumber":{},"message":"numeric destination"}}"#,
                args.to.trim_start_matches('+')
            ),
        ),
        (
            "Missing message field (malformed)",
            format!(r#"{{"phoneNumber":"{}"}}"#, args.to),
        ),
        ("Not JSON (malformed)", "this is not json".to_string()),
    ];

    for (desc, payload) in &scenarios {
        println!("📡 Publishing: {}", desc);
        println!("   Payload: {} bytes", payload.len());

        client
            .publish(TOPIC, QoS::AtLeastOnce, false, payload.clone().into_bytes())
            .await?;

        match timeout(Duration::from_secs(2), wait_for_puback(&mut eventloop)).await {
            Ok(Ok(())) => println!("   ✅ PUBACK received"),
            Ok(Err(e)) => println!("   ❌ Broker error: {}", e),
            Err(_) => println!("   ⏰ No PUBACK (timeout)"),
        }
        println!();

        sleep(Duration::from_secs(1)).await;
    }

    client.disconnect().await?;
    // Flush the DISCONNECT
    let _ = timeout(Duration::from_secs(1), async {
        while let Ok(event) = eventloop.poll().await {
            if matches!(event, Event::Outgoing(Outgoing::Disconnect)) {
                break;
            }
        }
    })
    .await;

    println!("✨ Simulation complete!");
    Ok(())
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> anyhow::Result<()> {
    loop {
        if let Event::Incoming(Packet::ConnAck(_)) = eventloop.poll().await? {
            return Ok(());
        }
    }
}

async fn wait_for_puback(eventloop: &mut EventLoop) -> anyhow::Result<()> {
    loop {
        if let Event::Incoming(Packet::PubAck(_)) = eventloop.poll().await? {
            return Ok(());
        }
    }
}
