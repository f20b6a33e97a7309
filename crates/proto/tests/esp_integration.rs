//! ESP Integration Tests
//!
//! End-to-end tests driving packets through the output and input
//! pipelines with the software crypto engine.

#![cfg(feature = "ipsec")]

use async_trait::async_trait;
use espx_proto::ipsec::{
    crypto::{CryptoJob, EngineCaps, JobStatus, PendingJob, SessionId, SessionParams},
    esp_hdrsiz, AddressFamily, AuthAlgorithm, CryptoEngine, DecryptedPacket, DomainTag,
    EncAlgorithm, EncryptedPacket, EngineConfig, EspConfig, EspXform, Error, InputDisposition,
    Packet, PadPolicy, Result, SaFlags, SaState, SecAssoc, SoftwareEngine, Xform, XformKind,
    XformRegistry, XformRequest, XformSink,
};
use espx_proto::ipsec::sa::SecAssocBuilder;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

const SKIP: usize = 20;
const PROTOFF: usize = 9;
const IPPROTO_UDP: u8 = 17;

//
// Helpers
//

/// IPv4 header (no options) followed by `payload`
fn ipv4_packet(proto: u8, payload: &[u8]) -> Packet {
    let mut data = vec![0u8; SKIP];
    data[0] = 0x45;
    data[8] = 64;
    data[PROTOFF] = proto;
    data[12..16].copy_from_slice(&[10, 0, 0, 1]);
    data[16..20].copy_from_slice(&[10, 0, 0, 2]);
    data.extend_from_slice(payload);
    Packet::from_slice(AddressFamily::Inet, &data)
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 3) as u8).collect()
}

fn software_esp() -> (EspXform, Arc<SoftwareEngine>) {
    let engine = Arc::new(SoftwareEngine::default());
    let esp = EspXform::new(engine.clone(), EspConfig::default());
    (esp, engine)
}

fn mature(esp: &EspXform, builder: SecAssocBuilder) -> Arc<SecAssoc> {
    let registry = XformRegistry::builder()
        .with_xform(esp.clone())
        .build()
        .expect("registry");
    let mut sa = builder.build().expect("sa");
    registry.init_sa(XformKind::Esp, &mut sa).expect("init_sa");
    Arc::new(sa)
}

fn gcm_sa(esp: &EspXform) -> Arc<SecAssoc> {
    mature(
        esp,
        SecAssoc::builder(0x0000_1001).with_cipher(EncAlgorithm::AesGcm16, vec![0x11; 20]),
    )
}

fn request(sa: &Arc<SecAssoc>, packet: Packet) -> XformRequest {
    XformRequest {
        sa: sa.clone(),
        packet,
        skip: SKIP,
        protoff: PROTOFF,
        domain: DomainTag(7),
    }
}

async fn encrypt(esp: &EspXform, sa: &Arc<SecAssoc>, packet: Packet) -> Result<EncryptedPacket> {
    let pending = esp.begin_output(request(sa, packet))?;
    esp.finish_output(pending).await
}

async fn decrypt(esp: &EspXform, sa: &Arc<SecAssoc>, packet: Packet) -> Result<InputDisposition> {
    let pending = esp.begin_input(request(sa, packet))?;
    esp.finish_input(pending).await
}

async fn decrypt_delivered(esp: &EspXform, sa: &Arc<SecAssoc>, packet: Packet) -> DecryptedPacket {
    match decrypt(esp, sa, packet).await.expect("decrypt") {
        InputDisposition::Deliver(packet) => packet,
        InputDisposition::Dummy => panic!("unexpected dummy packet"),
    }
}

//
// Test Cases - Scenarios
//

#[tokio::test]
async fn test_gcm_round_trip_first_sequence() {
    let (esp, _engine) = software_esp();
    let sa = gcm_sa(&esp);
    let original = ipv4_packet(IPPROTO_UDP, &payload(64));

    let wire = encrypt(&esp, &sa, original.clone()).await.unwrap();
    assert_eq!(wire.seq, 1);
    assert_eq!(wire.domain, DomainTag(7));

    let bytes = wire.packet.as_slice();
    // hdr(20) + SPI/Seq(8) + IV(8) + payload(64) + pad(2) + trailer(2) + tag(16)
    assert_eq!(bytes.len(), 120);
    assert_eq!(bytes[PROTOFF], 50);
    assert_eq!(&bytes[20..24], &0x0000_1001u32.to_be_bytes());
    assert_eq!(&bytes[24..28], &1u32.to_be_bytes());
    assert_eq!(&bytes[28..36], &1u64.to_be_bytes());
    assert_ne!(&bytes[36..100], &payload(64)[..]);

    let plain = decrypt_delivered(&esp, &sa, wire.packet).await;
    assert_eq!(plain.seq, 1);
    assert_eq!(plain.next_proto, IPPROTO_UDP);
    assert_eq!(plain.packet, original);
    assert!(sa.replay().unwrap().read().has_seen(1));

    let m = esp.metrics().snapshot();
    assert_eq!(m.output, 1);
    assert_eq!(m.input, 1);
    assert_eq!(m.input_bytes, 64);
    assert_eq!(m.inflight, 0);
}

#[tokio::test]
async fn test_replayed_packet_rejected() {
    let (esp, _engine) = software_esp();
    let sa = gcm_sa(&esp);

    let wire = encrypt(&esp, &sa, ipv4_packet(IPPROTO_UDP, &payload(64)))
        .await
        .unwrap();
    let copy = wire.packet.clone();

    decrypt_delivered(&esp, &sa, wire.packet).await;
    let err = decrypt(&esp, &sa, copy).await.unwrap_err();
    assert_eq!(err, Error::ReplayDetected(1));
    assert!(err.is_security_event());
    assert_eq!(esp.metrics().snapshot().replay, 1);
}

#[tokio::test]
async fn test_null_cipher_bit_flip_fails_authentication() {
    let (esp, _engine) = software_esp();
    let sa = mature(
        &esp,
        SecAssoc::builder(0x0000_2002)
            .with_cipher_only(EncAlgorithm::Null)
            .with_auth(AuthAlgorithm::HmacSha256_128, vec![0x5a; 32]),
    );

    let wire = encrypt(&esp, &sa, ipv4_packet(IPPROTO_UDP, &payload(40)))
        .await
        .unwrap();

    // NULL encryption leaves the payload readable
    assert_eq!(&wire.packet.as_slice()[28..68], &payload(40)[..]);

    let mut tampered = wire.packet.clone();
    let byte = tampered.read_u8(30).unwrap();
    tampered.write_u8(30, byte ^ 0x01).unwrap();

    let err = decrypt(&esp, &sa, tampered).await.unwrap_err();
    assert!(matches!(err, Error::AuthenticationFailed(_)));
    assert_eq!(esp.metrics().snapshot().auth_failures, 1);

    // A failed packet does not consume its sequence number
    let plain = decrypt_delivered(&esp, &sa, wire.packet).await;
    assert_eq!(plain.seq, 1);
}

#[tokio::test]
async fn test_oversized_packet_rejected_before_dispatch() {
    let (esp, engine) = software_esp();
    let sa = gcm_sa(&esp);

    let err = encrypt(&esp, &sa, ipv4_packet(IPPROTO_UDP, &payload(65_500)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MessageTooLarge { max: 65_535, .. }));
    assert_eq!(engine.dispatched(), 0);
    assert_eq!(sa.last_seq(), 0);
    assert_eq!(esp.metrics().snapshot().toobig, 1);

    // hdr(20) + ESP/IV(16) + tag(16) leaves 65480 aligned ciphertext bytes
    let err = encrypt(&esp, &sa, ipv4_packet(IPPROTO_UDP, &payload(65_479)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MessageTooLarge { size: 65_536, .. }));

    let wire = encrypt(&esp, &sa, ipv4_packet(IPPROTO_UDP, &payload(65_478)))
        .await
        .unwrap();
    assert_eq!(wire.packet.len(), 65_532);
    assert_eq!(wire.seq, 1);
}

//
// Test Cases - Cipher Coverage
//

#[tokio::test]
async fn test_round_trip_all_ciphers() {
    let suites: Vec<(EncAlgorithm, usize, Option<AuthAlgorithm>)> = vec![
        (EncAlgorithm::Null, 0, Some(AuthAlgorithm::HmacSha1_96)),
        (EncAlgorithm::AesCbc, 16, None),
        (EncAlgorithm::AesCbc, 16, Some(AuthAlgorithm::HmacSha256_128)),
        (EncAlgorithm::AesCbc, 24, Some(AuthAlgorithm::HmacSha384_192)),
        (EncAlgorithm::AesCbc, 32, Some(AuthAlgorithm::HmacSha512_256)),
        (EncAlgorithm::AesCtr, 20, Some(AuthAlgorithm::HmacSha256_128)),
        (EncAlgorithm::AesCtr, 36, None),
        (EncAlgorithm::AesGcm16, 20, None),
        (EncAlgorithm::AesGcm16, 28, None),
        (EncAlgorithm::AesGcm16, 36, None),
        (EncAlgorithm::ChaCha20Poly1305, 36, None),
    ];

    let (esp, _engine) = software_esp();
    for (i, (enc, key_len, auth)) in suites.into_iter().enumerate() {
        let mut builder = SecAssoc::builder(0x3000 + i as u32).with_cipher(enc, vec![0x21; key_len]);
        if let Some(auth) = auth {
            builder = builder.with_auth(auth, vec![0x42; auth.key_len()]);
        }
        let sa = mature(&esp, builder);

        for len in [1, 13, 64, 255, 1400] {
            let original = ipv4_packet(IPPROTO_UDP, &payload(len));
            let wire = encrypt(&esp, &sa, original.clone()).await.unwrap();
            assert_eq!(wire.packet.len() % 4, 0, "{} len {}", enc, len);

            let plain = decrypt_delivered(&esp, &sa, wire.packet).await;
            assert_eq!(plain.packet, original, "{} len {}", enc, len);
        }
        assert_eq!(sa.packets(), 10);
    }
}

#[tokio::test]
async fn test_round_trip_esn() {
    let (esp, _engine) = software_esp();
    let gcm = mature(
        &esp,
        SecAssoc::builder(0x4001)
            .with_cipher(EncAlgorithm::AesGcm16, vec![0x31; 36])
            .with_esn(),
    );
    let cbc = mature(
        &esp,
        SecAssoc::builder(0x4002)
            .with_cipher(EncAlgorithm::AesCbc, vec![0x32; 16])
            .with_auth(AuthAlgorithm::HmacSha256_128, vec![0x33; 32])
            .with_esn(),
    );

    for sa in [gcm, cbc] {
        for _ in 0..3 {
            let original = ipv4_packet(IPPROTO_UDP, &payload(100));
            let wire = encrypt(&esp, &sa, original.clone()).await.unwrap();
            let plain = decrypt_delivered(&esp, &sa, wire.packet).await;
            assert_eq!(plain.packet, original);
        }
        assert!(sa.replay().unwrap().read().is_esn());
        assert_eq!(sa.replay().unwrap().read().highest_seq(), 3);
    }
}

#[tokio::test]
async fn test_old_header_round_trip() {
    let (esp, _engine) = software_esp();
    let sa = mature(
        &esp,
        SecAssoc::builder(0x5001)
            .with_cipher(EncAlgorithm::AesCbc, vec![0x44; 16])
            .with_flags(SaFlags {
                old_header: true,
                ..SaFlags::default()
            }),
    );
    assert!(sa.replay().is_none());

    let original = ipv4_packet(IPPROTO_UDP, &payload(30));
    let wire = encrypt(&esp, &sa, original.clone()).await.unwrap();
    // hdr(20) + SPI(4) + IV(16) + 30 + pad/trailer to 48
    assert_eq!(wire.packet.len(), 20 + 4 + 16 + 32);
    assert_eq!(wire.seq, 0);

    let copy = wire.packet.clone();
    let plain = decrypt_delivered(&esp, &sa, wire.packet).await;
    assert_eq!(plain.packet, original);

    // No sequence numbers, no replay protection
    assert!(decrypt(&esp, &sa, copy).await.is_ok());
}

#[tokio::test]
async fn test_native_block_padding() {
    let (esp, _engine) = software_esp();
    let sa = mature(
        &esp,
        SecAssoc::builder(0x5002)
            .with_cipher(EncAlgorithm::ChaCha20Poly1305, vec![0x45; 36])
            .with_flags(SaFlags {
                native_block: true,
                ..SaFlags::default()
            }),
    );

    let original = ipv4_packet(IPPROTO_UDP, &payload(10));
    let wire = encrypt(&esp, &sa, original.clone()).await.unwrap();
    let ciphertext = wire.packet.len() - SKIP - 16 - 16;
    assert_eq!(ciphertext, 64);

    let plain = decrypt_delivered(&esp, &sa, wire.packet).await;
    assert_eq!(plain.packet, original);
}

#[tokio::test]
async fn test_esp_hdrsiz() {
    let (esp, _engine) = software_esp();
    let gcm = gcm_sa(&esp);
    // 8 + IV 8 + worst pad 3 + trailer 2 + tag 16
    assert_eq!(esp_hdrsiz(&gcm), 37);

    let cbc = mature(
        &esp,
        SecAssoc::builder(0x5003)
            .with_cipher(EncAlgorithm::AesCbc, vec![0x46; 16])
            .with_auth(AuthAlgorithm::HmacSha1_96, vec![0x47; 20]),
    );
    assert_eq!(esp_hdrsiz(&cbc), 8 + 16 + 15 + 2 + 12);
}

//
// Test Cases - Padding Policy
//

#[tokio::test]
async fn test_pad_policies_round_trip() {
    let (esp, _engine) = software_esp();
    for (i, policy) in [PadPolicy::Sequential, PadPolicy::Zero, PadPolicy::Random]
        .into_iter()
        .enumerate()
    {
        let sa = mature(
            &esp,
            SecAssoc::builder(0x6000 + i as u32)
                .with_cipher(EncAlgorithm::AesCbc, vec![0x51; 16])
                .with_auth(AuthAlgorithm::HmacSha256_128, vec![0x52; 32])
                .with_pad_policy(policy),
        );
        for len in [0, 13, 14, 200] {
            let original = ipv4_packet(IPPROTO_UDP, &payload(len));
            let wire = encrypt(&esp, &sa, original.clone()).await.unwrap();
            let plain = decrypt_delivered(&esp, &sa, wire.packet).await;
            assert_eq!(plain.packet, original, "{:?} len {}", policy, len);
        }
    }
}

#[tokio::test]
async fn test_zero_padding_rejected_by_sequential_peer() {
    let (esp, _engine) = software_esp();
    let sender = mature(
        &esp,
        SecAssoc::builder(0x6101)
            .with_cipher(EncAlgorithm::AesCbc, vec![0x53; 16])
            .with_pad_policy(PadPolicy::Zero),
    );
    let receiver = mature(
        &esp,
        SecAssoc::builder(0x6101).with_cipher(EncAlgorithm::AesCbc, vec![0x53; 16]),
    );

    // 13 + 2 trailer bytes leaves one pad byte
    let wire = encrypt(&esp, &sender, ipv4_packet(IPPROTO_UDP, &payload(13)))
        .await
        .unwrap();
    let err = decrypt(&esp, &receiver, wire.packet).await.unwrap_err();
    assert_eq!(
        err,
        Error::InvalidPadding {
            pad_len: 1,
            available: 14
        }
    );
    assert_eq!(esp.metrics().snapshot().badenc, 1);
}

//
// Test Cases - Security Properties
//

#[tokio::test]
async fn test_every_tag_bit_flip_detected() {
    let (esp, _engine) = software_esp();
    let sa = gcm_sa(&esp);

    let wire = encrypt(&esp, &sa, ipv4_packet(IPPROTO_UDP, &payload(32)))
        .await
        .unwrap();
    let tag_start = wire.packet.len() - 16;

    for bit in 0..128 {
        let mut tampered = wire.packet.clone();
        let offset = tag_start + bit / 8;
        let byte = tampered.read_u8(offset).unwrap();
        tampered.write_u8(offset, byte ^ (1 << (bit % 8))).unwrap();

        let err = decrypt(&esp, &sa, tampered).await.unwrap_err();
        assert!(
            matches!(err, Error::AuthenticationFailed(_)),
            "bit {} gave {:?}",
            bit,
            err
        );
    }

    assert_eq!(esp.metrics().snapshot().auth_failures, 128);
    decrypt_delivered(&esp, &sa, wire.packet).await;
}

#[tokio::test]
async fn test_hmac_tag_bit_flip_detected() {
    let (esp, _engine) = software_esp();
    let sa = mature(
        &esp,
        SecAssoc::builder(0x7001)
            .with_cipher(EncAlgorithm::AesCbc, vec![0x61; 32])
            .with_auth(AuthAlgorithm::HmacSha1_96, vec![0x62; 20]),
    );

    let wire = encrypt(&esp, &sa, ipv4_packet(IPPROTO_UDP, &payload(50)))
        .await
        .unwrap();
    let tag_start = wire.packet.len() - 12;

    for bit in (0..96).step_by(5) {
        let mut tampered = wire.packet.clone();
        let offset = tag_start + bit / 8;
        let byte = tampered.read_u8(offset).unwrap();
        tampered.write_u8(offset, byte ^ (1 << (bit % 8))).unwrap();
        assert!(matches!(
            decrypt(&esp, &sa, tampered).await,
            Err(Error::AuthenticationFailed(_))
        ));
    }
}

#[tokio::test]
async fn test_counter_mode_explicit_ivs_unique() {
    let (esp, _engine) = software_esp();
    let sa = mature(
        &esp,
        SecAssoc::builder(0x7002).with_cipher(EncAlgorithm::AesCtr, vec![0x63; 20]),
    );

    let mut seen = HashSet::new();
    let mut last = 0u64;
    for _ in 0..200 {
        let wire = encrypt(&esp, &sa, ipv4_packet(IPPROTO_UDP, &payload(24)))
            .await
            .unwrap();
        let iv = wire.packet.slice(SKIP + 8, 8).unwrap();
        let counter = u64::from_be_bytes(iv.try_into().unwrap());
        assert!(counter > last);
        last = counter;
        assert!(seen.insert(iv.to_vec()));
    }
    assert_eq!(seen.len(), 200);
}

#[tokio::test]
async fn test_reordered_packets_accepted_once() {
    let (esp, _engine) = software_esp();
    let sa = gcm_sa(&esp);

    let mut wires = Vec::new();
    for _ in 0..6 {
        let wire = encrypt(&esp, &sa, ipv4_packet(IPPROTO_UDP, &payload(16)))
            .await
            .unwrap();
        wires.push(wire.packet);
    }

    for idx in [2, 0, 1, 5, 3, 4] {
        let plain = decrypt_delivered(&esp, &sa, wires[idx].clone()).await;
        assert_eq!(plain.seq, idx as u64 + 1);
    }
    for idx in [1, 5] {
        assert_eq!(
            decrypt(&esp, &sa, wires[idx].clone()).await.unwrap_err(),
            Error::ReplayDetected(idx as u64 + 1)
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_output_unique_sequence_numbers() {
    let (esp, _engine) = software_esp();
    let sa = gcm_sa(&esp);

    let mut tasks = Vec::new();
    for _ in 0..64 {
        let esp = esp.clone();
        let sa = sa.clone();
        tasks.push(tokio::spawn(async move {
            encrypt(&esp, &sa, ipv4_packet(IPPROTO_UDP, &payload(48)))
                .await
                .map(|wire| wire.seq)
        }));
    }

    let mut seqs = HashSet::new();
    for task in tasks {
        assert!(seqs.insert(task.await.unwrap().unwrap()));
    }
    assert_eq!(seqs, (1..=64).collect::<HashSet<u64>>());
    assert_eq!(esp.metrics().snapshot().inflight, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_input_commits_each_sequence_once() {
    let (esp, _engine) = software_esp();
    let sa = gcm_sa(&esp);

    let wire = encrypt(&esp, &sa, ipv4_packet(IPPROTO_UDP, &payload(48)))
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let esp = esp.clone();
        let sa = sa.clone();
        let packet = wire.packet.clone();
        tasks.push(tokio::spawn(async move { decrypt(&esp, &sa, packet).await }));
    }

    let mut accepted = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(err) => assert_eq!(err, Error::ReplayDetected(1)),
        }
    }
    assert_eq!(accepted, 1);
}

//
// Test Cases - Session Migration
//

#[tokio::test]
async fn test_migrated_session_retried_once() {
    let (esp, engine) = software_esp();
    let sa = gcm_sa(&esp);
    let old = sa.session_id();

    engine.force_migration(old).unwrap();

    let original = ipv4_packet(IPPROTO_UDP, &payload(64));
    let wire = encrypt(&esp, &sa, original.clone()).await.unwrap();
    assert_ne!(sa.session_id(), old);
    assert_eq!(esp.metrics().snapshot().rebinds, 1);

    let plain = decrypt_delivered(&esp, &sa, wire.packet).await;
    assert_eq!(plain.packet, original);

    // The rebind retired the old handle for good
    assert_eq!(engine.session_count(), 1);
    assert_eq!(engine.retired_count(), 0);

    esp.zeroize_sa(&sa).unwrap();
    assert_eq!(engine.session_count(), 0);
    assert_eq!(engine.retired_count(), 0);
}

#[tokio::test]
async fn test_concurrent_rebind_closes_surplus_session() {
    let (esp, engine) = software_esp();
    let sa = gcm_sa(&esp);
    engine.force_migration(sa.session_id()).unwrap();

    let first = esp
        .begin_output(request(&sa, ipv4_packet(IPPROTO_UDP, &payload(16))))
        .unwrap();
    let second = esp
        .begin_output(request(&sa, ipv4_packet(IPPROTO_UDP, &payload(16))))
        .unwrap();

    assert!(esp.finish_output(first).await.is_ok());
    assert!(esp.finish_output(second).await.is_ok());

    assert_eq!(esp.metrics().snapshot().rebinds, 2);
    assert_eq!(engine.session_count(), 1);
    assert_eq!(engine.retired_count(), 0);

    esp.zeroize_sa(&sa).unwrap();
    assert_eq!(engine.session_count(), 0);
    assert_eq!(engine.retired_count(), 0);
}

#[tokio::test]
async fn test_migration_after_teardown_closes_new_session() {
    let (esp, engine) = software_esp();
    let sa = gcm_sa(&esp);
    engine.force_migration(sa.session_id()).unwrap();

    let pending = esp
        .begin_output(request(&sa, ipv4_packet(IPPROTO_UDP, &payload(16))))
        .unwrap();
    esp.zeroize_sa(&sa).unwrap();

    let err = esp.finish_output(pending).await.unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
    assert_eq!(engine.session_count(), 0);
    assert_eq!(engine.retired_count(), 0);
    assert_eq!(esp.metrics().snapshot().inflight, 0);
}

#[tokio::test]
async fn test_migration_after_teardown_on_input() {
    let (esp, engine) = software_esp();
    let sa = gcm_sa(&esp);
    let wire = encrypt(&esp, &sa, ipv4_packet(IPPROTO_UDP, &payload(16)))
        .await
        .unwrap();
    engine.force_migration(sa.session_id()).unwrap();

    let pending = esp.begin_input(request(&sa, wire.packet)).unwrap();
    esp.zeroize_sa(&sa).unwrap();

    assert!(matches!(
        esp.finish_input(pending).await,
        Err(Error::InvalidState(_))
    ));
    assert_eq!(engine.session_count(), 0);
    assert_eq!(engine.retired_count(), 0);
    assert!(!sa.replay().unwrap().read().has_seen(1));
}

/// Engine whose sessions migrate on every dispatch
struct MigratingEngine {
    inner: SoftwareEngine,
    next: AtomicU64,
}

impl CryptoEngine for MigratingEngine {
    fn capabilities(&self) -> EngineCaps {
        self.inner.capabilities()
    }

    fn open_session(&self, params: SessionParams) -> Result<SessionId> {
        self.inner.open_session(params)
    }

    fn close_session(&self, session: SessionId) {
        self.inner.close_session(session)
    }

    fn dispatch(&self, job: CryptoJob) -> Result<PendingJob> {
        let session = self.next.fetch_add(1, Ordering::Relaxed);
        Ok(PendingJob::ready(job, JobStatus::Again { session }))
    }
}

#[tokio::test]
async fn test_second_migration_is_fatal() {
    let engine = Arc::new(MigratingEngine {
        inner: SoftwareEngine::default(),
        next: AtomicU64::new(1000),
    });
    let esp = EspXform::new(engine, EspConfig::default());
    let sa = gcm_sa(&esp);

    let err = encrypt(&esp, &sa, ipv4_packet(IPPROTO_UDP, &payload(16)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CryptoError(_)));
    assert_eq!(sa.session_id(), 1000);

    let m = esp.metrics().snapshot();
    assert_eq!(m.rebinds, 1);
    assert_eq!(m.crypto_failures, 1);
    assert_eq!(m.inflight, 0);
}

//
// Test Cases - Pipeline Rejections
//

#[tokio::test]
async fn test_dummy_packet_discarded() {
    let (esp, _engine) = software_esp();
    let sa = gcm_sa(&esp);

    let wire = encrypt(&esp, &sa, ipv4_packet(59, &payload(20)))
        .await
        .unwrap();
    let disposition = decrypt(&esp, &sa, wire.packet).await.unwrap();
    assert!(matches!(disposition, InputDisposition::Dummy));

    let m = esp.metrics().snapshot();
    assert_eq!(m.dummy, 1);
    assert!(sa.replay().unwrap().read().has_seen(1));
}

#[tokio::test]
async fn test_dead_sa_rejected() {
    let (esp, _engine) = software_esp();
    let sa = gcm_sa(&esp);

    let wire = encrypt(&esp, &sa, ipv4_packet(IPPROTO_UDP, &payload(16)))
        .await
        .unwrap();

    sa.set_state(SaState::Dying);
    let again = encrypt(&esp, &sa, ipv4_packet(IPPROTO_UDP, &payload(16))).await;
    assert!(again.is_ok());

    esp.zeroize_sa(&sa).unwrap();
    assert!(matches!(
        encrypt(&esp, &sa, ipv4_packet(IPPROTO_UDP, &payload(16))).await,
        Err(Error::InvalidState(_))
    ));
    assert!(matches!(
        decrypt(&esp, &sa, wire.packet).await,
        Err(Error::InvalidState(_))
    ));
    assert_eq!(esp.metrics().snapshot().pdrops, 2);
}

#[tokio::test]
async fn test_sa_dying_in_flight_drops_packet() {
    let (esp, _engine) = software_esp();
    let sa = gcm_sa(&esp);

    let pending = esp
        .begin_output(request(&sa, ipv4_packet(IPPROTO_UDP, &payload(16))))
        .unwrap();
    sa.set_state(SaState::Dead);

    let err = esp.finish_output(pending).await.unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
    assert_eq!(esp.metrics().snapshot().inflight, 0);
}

#[tokio::test]
async fn test_disabled_transform_drops() {
    let (esp, engine) = software_esp();
    let sa = gcm_sa(&esp);
    let wire = encrypt(&esp, &sa, ipv4_packet(IPPROTO_UDP, &payload(16)))
        .await
        .unwrap();

    esp.set_enabled(false);
    assert_eq!(
        encrypt(&esp, &sa, ipv4_packet(IPPROTO_UDP, &payload(16)))
            .await
            .unwrap_err(),
        Error::Disabled
    );
    assert_eq!(
        decrypt(&esp, &sa, wire.packet.clone()).await.unwrap_err(),
        Error::Disabled
    );
    assert_eq!(engine.dispatched(), 1);

    esp.set_enabled(true);
    decrypt_delivered(&esp, &sa, wire.packet).await;
}

#[tokio::test]
async fn test_malformed_input_rejected() {
    let (esp, engine) = software_esp();
    let sa = mature(
        &esp,
        SecAssoc::builder(0x8001)
            .with_cipher(EncAlgorithm::AesCbc, vec![0x71; 16])
            .with_auth(AuthAlgorithm::HmacSha256_128, vec![0x72; 32]),
    );
    let wire = encrypt(&esp, &sa, ipv4_packet(IPPROTO_UDP, &payload(30)))
        .await
        .unwrap();
    let dispatched = engine.dispatched();

    // Header offset off the 4-byte grid
    let mut req = request(&sa, wire.packet.clone());
    req.skip = 18;
    assert!(matches!(
        esp.begin_input(req),
        Err(Error::Misaligned { offset: 18, .. })
    ));

    // Packet length off the 4-byte grid
    let mut odd = wire.packet.clone();
    odd.extend(&[0]);
    assert!(matches!(
        decrypt(&esp, &sa, odd).await,
        Err(Error::Misaligned { .. })
    ));

    // Ciphertext no longer a whole number of blocks
    let mut short = wire.packet.clone();
    short.truncate(short.len() - 4);
    assert!(matches!(
        decrypt(&esp, &sa, short).await,
        Err(Error::BadPayloadLength { block_size: 16, .. })
    ));

    // Truncated below the fixed overhead
    let stub = ipv4_packet(50, &[0u8; 12]);
    assert!(matches!(
        decrypt(&esp, &sa, stub).await,
        Err(Error::BufferTooShort { .. })
    ));

    // Packet for another SA
    let mut foreign = wire.packet.clone();
    foreign.write_u32(SKIP, 0x9999).unwrap();
    assert_eq!(
        decrypt(&esp, &sa, foreign).await.unwrap_err(),
        Error::InvalidSpi(0x9999)
    );

    // Next-protocol offset pointing into the ESP payload
    let mut req = request(&sa, wire.packet.clone());
    req.protoff = SKIP + 4;
    assert!(matches!(esp.begin_input(req), Err(Error::Internal(_))));

    assert_eq!(engine.dispatched(), dispatched);
    let m = esp.metrics().snapshot();
    assert_eq!(m.hdrops, 4);
    assert_eq!(m.invalid, 1);
    assert_eq!(m.crypto_failures, 1);
}

#[tokio::test]
async fn test_sequence_zero_rejected() {
    let (esp, _engine) = software_esp();
    let sa = gcm_sa(&esp);
    let wire = encrypt(&esp, &sa, ipv4_packet(IPPROTO_UDP, &payload(16)))
        .await
        .unwrap();

    let mut zero = wire.packet.clone();
    zero.write_u32(SKIP + 4, 0).unwrap();
    assert!(matches!(
        decrypt(&esp, &sa, zero).await,
        Err(Error::ReplayDetected(_))
    ));
}

//
// Test Cases - Outer Pipeline Continuation
//

#[derive(Debug)]
enum Event {
    Inet(DecryptedPacket),
    Inet6(DecryptedPacket),
    Sent(EncryptedPacket),
    Dropped(u32, Error),
}

struct ChannelSink {
    tx: mpsc::UnboundedSender<Event>,
}

#[async_trait]
impl XformSink for ChannelSink {
    async fn deliver_inet(&self, packet: DecryptedPacket) {
        let _ = self.tx.send(Event::Inet(packet));
    }

    async fn deliver_inet6(&self, packet: DecryptedPacket) {
        let _ = self.tx.send(Event::Inet6(packet));
    }

    async fn output_done(&self, packet: EncryptedPacket) {
        let _ = self.tx.send(Event::Sent(packet));
    }

    async fn dropped(&self, spi: u32, err: &Error) {
        let _ = self.tx.send(Event::Dropped(spi, err.clone()));
    }
}

fn channel_sink() -> (Arc<dyn XformSink>, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(ChannelSink { tx }), rx)
}

#[tokio::test]
async fn test_sink_receives_completions() {
    let (esp, _engine) = software_esp();
    let sa = gcm_sa(&esp);
    let xform: Arc<dyn Xform> = sa.xform().cloned().unwrap();
    let (sink, mut events) = channel_sink();

    let original = ipv4_packet(IPPROTO_UDP, &payload(80));
    xform.output(request(&sa, original.clone()), sink.clone()).unwrap();
    let wire = match events.recv().await.unwrap() {
        Event::Sent(wire) => wire,
        other => panic!("expected output_done, got {:?}", other),
    };
    assert_eq!(wire.seq, 1);

    let mut tampered = wire.packet.clone();
    let last = tampered.len() - 1;
    tampered.write_u8(last, tampered.read_u8(last).unwrap() ^ 0x80).unwrap();
    xform.input(request(&sa, tampered), sink.clone()).unwrap();
    match events.recv().await.unwrap() {
        Event::Dropped(spi, Error::AuthenticationFailed(_)) => assert_eq!(spi, sa.spi()),
        other => panic!("expected drop, got {:?}", other),
    }

    xform.input(request(&sa, wire.packet), sink).unwrap();
    match events.recv().await.unwrap() {
        Event::Inet(plain) => {
            assert_eq!(plain.packet, original);
            assert_eq!(plain.domain, DomainTag(7));
        }
        other => panic!("expected IPv4 delivery, got {:?}", other),
    }
}

#[tokio::test]
async fn test_sink_ipv6_delivery() {
    let (esp, _engine) = software_esp();
    let sa = mature(
        &esp,
        SecAssoc::builder(0x9001)
            .with_family(AddressFamily::Inet6)
            .with_cipher(EncAlgorithm::ChaCha20Poly1305, vec![0x81; 36]),
    );
    let (sink, mut events) = channel_sink();

    // 40-byte IPv6 header, next header at offset 6
    let mut data = vec![0u8; 40];
    data[0] = 0x60;
    data[6] = IPPROTO_UDP;
    data.extend_from_slice(&payload(33));
    let original = Packet::from_slice(AddressFamily::Inet6, &data);

    let req = |packet| XformRequest {
        sa: sa.clone(),
        packet,
        skip: 40,
        protoff: 6,
        domain: DomainTag(2),
    };

    esp.output(req(original.clone()), sink.clone()).unwrap();
    let wire = match events.recv().await.unwrap() {
        Event::Sent(wire) => wire,
        other => panic!("expected output_done, got {:?}", other),
    };

    esp.input(req(wire.packet), sink).unwrap();
    match events.recv().await.unwrap() {
        Event::Inet6(plain) => {
            assert_eq!(plain.packet, original);
            assert_eq!(plain.skip, 40);
            assert_eq!(plain.next_proto, IPPROTO_UDP);
        }
        other => panic!("expected IPv6 delivery, got {:?}", other),
    }
}

#[tokio::test]
async fn test_synchronous_rejection_skips_sink() {
    let (esp, _engine) = software_esp();
    let sa = gcm_sa(&esp);
    let (sink, mut events) = channel_sink();

    esp.set_enabled(false);
    assert_eq!(
        esp.output(request(&sa, ipv4_packet(IPPROTO_UDP, &payload(8))), sink),
        Err(Error::Disabled)
    );
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_dummy_packet_skips_sink() {
    let (esp, _engine) = software_esp();
    let sa = gcm_sa(&esp);
    let (sink, mut events) = channel_sink();

    esp.output(request(&sa, ipv4_packet(59, &payload(12))), sink.clone())
        .unwrap();
    let wire = match events.recv().await.unwrap() {
        Event::Sent(wire) => wire,
        other => panic!("expected output_done, got {:?}", other),
    };

    esp.input(request(&sa, wire.packet), sink).unwrap();
    for _ in 0..200 {
        if esp.metrics().snapshot().dummy == 1 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    assert_eq!(esp.metrics().snapshot().dummy, 1);
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert!(events.try_recv().is_err());
}

#[test]
fn test_pipeline_needs_runtime() {
    let (esp, _engine) = software_esp();
    let sa = gcm_sa(&esp);
    let (sink, _events) = channel_sink();

    let err = esp
        .output(request(&sa, ipv4_packet(IPPROTO_UDP, &payload(8))), sink)
        .unwrap_err();
    assert!(matches!(err, Error::Internal(_)));
    assert_eq!(sa.last_seq(), 0);
}

//
// Test Cases - Registry
//

#[tokio::test]
async fn test_registry_install_and_lookup() {
    let engine = Arc::new(SoftwareEngine::new(
        EngineConfig::builder().with_max_inflight(16).build().unwrap(),
    ));
    let esp = EspXform::new(engine, EspConfig::default());

    let registry = XformRegistry::builder()
        .with_xform(esp.clone())
        .build()
        .unwrap()
        .install()
        .unwrap();
    assert!(XformRegistry::global().is_some());
    assert_eq!(registry.kinds(), vec![XformKind::Esp]);
    assert_eq!(
        registry.get(XformKind::Ah).err(),
        Some(Error::NoXform("ah".into()))
    );

    let second = XformRegistry::builder().build().unwrap().install();
    assert!(matches!(second, Err(Error::InvalidState(_))));

    let mut sa = SecAssoc::builder(0xa001)
        .with_cipher(EncAlgorithm::AesGcm16, vec![0x91; 20])
        .build()
        .unwrap();
    registry.init_sa(XformKind::Esp, &mut sa).unwrap();
    assert_eq!(sa.state(), SaState::Mature);
    assert_eq!(sa.auth(), Some(AuthAlgorithm::AesGmac128));

    let sa = Arc::new(sa);
    let original = ipv4_packet(IPPROTO_UDP, &payload(32));
    let wire = encrypt(&esp, &sa, original.clone()).await.unwrap();
    let plain = decrypt_delivered(&esp, &sa, wire.packet).await;
    assert_eq!(plain.packet, original);
}

#[tokio::test]
async fn test_custom_replay_window() {
    let esp = EspXform::new(
        Arc::new(SoftwareEngine::default()),
        EspConfig::builder()
            .with_default_replay_window(128)
            .build()
            .unwrap(),
    );
    let default = gcm_sa(&esp);
    assert_eq!(default.replay().unwrap().read().window_size(), 128);

    let custom = mature(
        &esp,
        SecAssoc::builder(0xa002)
            .with_cipher(EncAlgorithm::AesGcm16, vec![0x92; 20])
            .with_replay_window(32),
    );
    assert_eq!(custom.replay().unwrap().read().window_size(), 32);

    let none = mature(
        &esp,
        SecAssoc::builder(0xa003)
            .with_cipher(EncAlgorithm::AesGcm16, vec![0x93; 20])
            .without_replay(),
    );
    assert!(none.replay().is_none());

    let wire = encrypt(&esp, &none, ipv4_packet(IPPROTO_UDP, &payload(16)))
        .await
        .unwrap();
    assert!(decrypt(&esp, &none, wire.packet.clone()).await.is_ok());
    assert!(decrypt(&esp, &none, wire.packet).await.is_ok());
}
