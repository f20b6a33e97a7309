//! ESP Round-Trip Example
//!
//! This example pushes packets through the ESP output pipeline, feeds the
//! encrypted result back into the input pipeline, and shows the replay
//! window rejecting a retransmitted packet.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example esp_roundtrip --features ipsec -- [gcm|chacha|cbc-sha256] [packets]
//! ```
//!
//! # Example
//!
//! ```bash
//! RUST_LOG=espx_proto=debug cargo run --example esp_roundtrip --features ipsec -- chacha 8
//! ```

use async_trait::async_trait;
use espx_proto::ipsec::{
    AddressFamily, AuthAlgorithm, DecryptedPacket, DomainTag, EncAlgorithm, EncryptedPacket,
    EspConfig, EspXform, Error, Packet, SecAssoc, SoftwareEngine, Xform, XformKind,
    XformRegistry, XformRequest, XformSink,
};
use std::env;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Outcome reported by the transform
#[derive(Debug)]
enum Outcome {
    Sent(EncryptedPacket),
    Received(DecryptedPacket),
    Dropped(u32, Error),
}

/// Sink forwarding every completion to the main task
struct PrintSink {
    tx: mpsc::UnboundedSender<Outcome>,
}

#[async_trait]
impl XformSink for PrintSink {
    async fn deliver_inet(&self, packet: DecryptedPacket) {
        let _ = self.tx.send(Outcome::Received(packet));
    }

    async fn deliver_inet6(&self, packet: DecryptedPacket) {
        let _ = self.tx.send(Outcome::Received(packet));
    }

    async fn output_done(&self, packet: EncryptedPacket) {
        let _ = self.tx.send(Outcome::Sent(packet));
    }

    async fn dropped(&self, spi: u32, err: &Error) {
        let _ = self.tx.send(Outcome::Dropped(spi, err.clone()));
    }
}

fn build_sa(suite: &str) -> Result<SecAssoc, Error> {
    let builder = SecAssoc::builder(0xc0ffee01);
    let builder = match suite {
        "gcm" => builder.with_cipher(EncAlgorithm::AesGcm16, vec![0x42; 20]),
        "chacha" => builder.with_cipher(EncAlgorithm::ChaCha20Poly1305, vec![0x42; 36]),
        "cbc-sha256" => builder
            .with_cipher(EncAlgorithm::AesCbc, vec![0x42; 16])
            .with_auth(AuthAlgorithm::HmacSha256_128, vec![0x24; 32]),
        other => return Err(Error::Config(format!("unknown suite {}", other))),
    };
    builder.build()
}

fn ipv4_udp(payload: &[u8]) -> Packet {
    let mut data = vec![0u8; 20];
    data[0] = 0x45;
    data[8] = 64;
    data[9] = 17;
    data.extend_from_slice(payload);
    Packet::from_slice(AddressFamily::Inet, &data)
}

fn request(sa: &Arc<SecAssoc>, packet: Packet) -> XformRequest {
    XformRequest {
        sa: sa.clone(),
        packet,
        skip: 20,
        protoff: 9,
        domain: DomainTag(0),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let suite = args.get(1).map(String::as_str).unwrap_or("gcm");
    let count: usize = match args.get(2) {
        Some(n) => n.parse()?,
        None => 4,
    };

    let esp = EspXform::new(Arc::new(SoftwareEngine::default()), EspConfig::default());
    let registry = XformRegistry::builder().with_xform(esp).build()?.install()?;

    let mut sa = build_sa(suite)?;
    registry.init_sa(XformKind::Esp, &mut sa)?;
    let sa = Arc::new(sa);
    let xform = registry.get(XformKind::Esp)?;

    println!(
        "SA 0x{:08x}: {} / {}",
        sa.spi(),
        sa.enc(),
        sa.auth().map_or("none", |a| a.name())
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    let sink: Arc<dyn XformSink> = Arc::new(PrintSink { tx });

    let mut wire = Vec::new();
    for i in 0..count {
        let payload = format!("datagram #{}", i);
        xform.output(request(&sa, ipv4_udp(payload.as_bytes())), sink.clone())?;
    }
    for _ in 0..count {
        match rx.recv().await {
            Some(Outcome::Sent(packet)) => {
                println!("sent seq {} ({} bytes)", packet.seq, packet.packet.len());
                wire.push(packet.packet);
            }
            other => println!("unexpected: {:?}", other),
        }
    }

    // Deliver everything once, then retransmit the first packet
    if let Some(first) = wire.first().cloned() {
        wire.push(first);
    }
    let expected = wire.len();
    for packet in wire {
        xform.input(request(&sa, packet), sink.clone())?;
    }
    for _ in 0..expected {
        match rx.recv().await {
            Some(Outcome::Received(packet)) => println!(
                "received seq {}: {:?}",
                packet.seq,
                String::from_utf8_lossy(&packet.packet.as_slice()[packet.skip..])
            ),
            Some(Outcome::Dropped(spi, err)) => println!("dropped on 0x{:08x}: {}", spi, err),
            other => println!("unexpected: {:?}", other),
        }
    }

    xform.zeroize_sa(&sa)?;
    println!("SA processed {} packets, {} bytes", sa.packets(), sa.bytes());
    Ok(())
}
