//! End-to-end identity integration tests.

mod common;

use std::sync::Arc;

use huk_identity_core::der::{check_sequence, pem_to_der, read_header};
use huk_identity_core::derivation::IdentityDeriver;
use huk_identity_core::{
    cose, csr, export, CsrBuilder, CsrFormat, Device, EncodeFormat, IdentityConfig,
    IdentityError, KeyId, KeyRegistry, KeySlot, KeyStatus, KeyUsage, ProvisionRecord,
    SecureService,
};
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, VerifyingKey};
use regex::Regex;
use strum::IntoEnumIterator;

fn device() -> Device<huk_identity_core::EmulatedPartition> {
    common::init_tracing();
    let device = Device::new(common::partition(), IdentityConfig::default());
    assert_eq!(device.init(), 3);
    device
}

#[test]
fn test_uuid_format() {
    let pattern = Regex::new(
        r"^[0-9a-f]{8}-[0-9a-f]{4}-4[0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}$",
    )
    .expect("regex");

    for seed in 0..32u8 {
        let partition = huk_identity_core::EmulatedPartition::new([seed; 32]);
        let uuid = partition.generate_uuid().expect("uuid");
        assert!(pattern.is_match(&uuid), "{uuid}");
        assert_eq!(uuid, partition.generate_uuid().expect("cached uuid"));
    }
}

#[test]
fn test_uuid_depends_on_label_suffix() {
    let plain = common::partition();
    let suffixed = common::partition().with_label_suffix("_B");
    assert_ne!(
        plain.generate_uuid().expect("uuid"),
        suffixed.generate_uuid().expect("uuid")
    );
}

#[test]
fn test_import_failure_is_isolated() {
    common::init_tracing();
    let partition = common::FlakyPartition::rejecting(KeyId::COSE_ENCRYPT);
    let registry = KeyRegistry::new();

    assert_eq!(registry.init(&partition), 2);
    assert_eq!(partition.imports(), 3);

    let status = |key_id| registry.context(key_id).expect("context").status();
    assert_eq!(status(KeyId::CLIENT_TLS), KeyStatus::KeyGenerated);
    assert_eq!(status(KeyId::COSE_SIGN), KeyStatus::KeyGenerated);
    assert_eq!(status(KeyId::COSE_ENCRYPT), KeyStatus::NotProvisioned);

    // the unaffected keys stay usable
    let public_key =
        export::export_pubkey(&partition, &registry, KeyId::CLIENT_TLS).expect("export");
    assert_eq!(public_key[0], 0x04);

    // a second init only retries the failed slot
    assert_eq!(registry.init(&partition), 2);
    assert_eq!(partition.imports(), 4);
}

#[test]
fn test_reinit_keeps_key_material() {
    let partition = common::partition();
    let registry = KeyRegistry::new();
    registry.init(&partition);
    let before = partition.export_pubkey(KeyId::CLIENT_TLS).expect("export");

    registry.init(&partition);
    let fresh = KeyRegistry::new();
    assert_eq!(fresh.init(&partition), 3);
    let after = partition.export_pubkey(KeyId::CLIENT_TLS).expect("export");
    assert_eq!(before, after);

    // another partition on the same HUK reproduces the same keys
    let twin = common::partition();
    KeyRegistry::new().init(&twin);
    assert_eq!(twin.export_pubkey(KeyId::CLIENT_TLS).expect("export"), before);
}

#[test]
fn test_derived_scalar_imports_and_exports() {
    let partition = common::partition();
    let scalar = IdentityDeriver::new(&partition)
        .ec_private_key("X")
        .expect("derive");
    partition
        .import_ec_key(KeyId(0x6000), KeyUsage::SIGN_HASH, &scalar)
        .expect("import");

    let public_key = partition.export_pubkey(KeyId(0x6000)).expect("export");
    assert_eq!(public_key.len(), 65);
    assert_eq!(public_key[0], 0x04);
}

#[test]
fn test_csr_for_every_signing_slot() {
    let device = device();
    let uuid = device.uuid().expect("uuid");

    for slot in KeySlot::iter().filter(|slot| slot.usage().contains(KeyUsage::SIGN_HASH)) {
        let pem = device
            .generate_csr(slot.key_id(), CsrFormat::Pem)
            .expect("generate");
        let pem = String::from_utf8(pem).expect("utf8");
        let der = pem_to_der(csr::PEM_LABEL_CSR, &pem).expect("pem decode");
        let (_, content_len, header_len) = read_header(&der).expect("outer header");
        assert_eq!(header_len + content_len, der.len());
        assert_eq!(check_sequence(&der).expect("outer sequence"), content_len);

        let raw = device
            .generate_csr(slot.key_id(), CsrFormat::Der)
            .expect("generate der");
        assert_eq!(raw, der, "signing is deterministic");

        // the subject carries the device UUID and the slot label
        let text = String::from_utf8_lossy(&der);
        assert!(text.contains(&uuid));
        assert!(text.contains(slot.label()));
        assert!(text.contains("Linaro"));
    }
}

#[test]
fn test_csr_signature_verifies() {
    let device = device();
    let der = device
        .generate_csr(KeyId::CLIENT_TLS, CsrFormat::Der)
        .expect("generate");

    // CertificationRequest ::= SEQUENCE { tbs, algorithm, BIT STRING }
    let (_, _, outer_header) = read_header(&der).expect("outer header");
    let body = &der[outer_header..];
    let tbs_len = check_sequence_prefix(body);
    let tbs = &body[..tbs_len];
    let rest = &body[tbs_len..];

    let (_, alg_len, alg_header) = read_header(rest).expect("alg");
    let bit_string = &rest[alg_header + alg_len..];
    let (tag, _, bs_header) = read_header(bit_string).expect("bits");
    assert_eq!(tag, 0x03);
    assert_eq!(bit_string[bs_header], 0x00);
    let signature = Signature::from_der(&bit_string[bs_header + 1..]).expect("signature");

    let public_key = device.public_key(KeyId::CLIENT_TLS).expect("export");
    let verifying_key = VerifyingKey::from_sec1_bytes(&public_key).expect("key");
    verifying_key.verify(tbs, &signature).expect("verify");
}

fn check_sequence_prefix(input: &[u8]) -> usize {
    let (tag, len, header) = read_header(input).expect("header");
    assert_eq!(tag, 0x30);
    header + len
}

#[test]
fn test_csr_buffer_too_small() {
    let device = device();
    let uuid = device.uuid().expect("uuid");
    let config = IdentityConfig::default();
    let mut builder = CsrBuilder::new(device.service(), device.registry(), &config);

    let mut buf = [0u8; 64];
    match builder.generate_into(KeyId::CLIENT_TLS, &uuid, &mut buf) {
        Err(IdentityError::BufferTooSmall) => {}
        Err(err) => panic!("unexpected error: {err}"),
        Ok(_) => panic!("expected error"),
    }
    assert_eq!(
        builder.state(),
        &csr::CsrState::Failed(IdentityError::BufferTooSmall)
    );
}

#[test]
fn test_csr_unknown_key() {
    let device = device();
    match device.generate_csr(KeyId(0x5004), CsrFormat::Pem) {
        Err(IdentityError::UnknownKeyId) => {}
        Err(err) => panic!("unexpected error: {err}"),
        Ok(_) => panic!("expected error"),
    }
}

#[test]
fn test_cose_roundtrip_values() {
    let device = device();
    for value in [0.0f32, -0.0, 1.0, -1.5, f32::MAX, f32::MIN_POSITIVE, 0.841_470_96] {
        let cose = device
            .encode_value(value, EncodeFormat::CoseSign1)
            .expect("encode");
        let verified = device.verify(KeyId::COSE_SIGN, &cose).expect("verify");
        assert_eq!(verified.to_bits(), value.to_bits());
    }
}

#[test]
fn test_cose_tampering_detected() {
    let device = device();
    let cose = device
        .encode_value(0.75, EncodeFormat::CoseSign1)
        .expect("encode");
    let public_key = device.public_key(KeyId::COSE_SIGN).expect("export");

    // payload bstr content starts after the 8-byte prefix
    for index in 8..cose.len() {
        for bit in 0..8 {
            let mut tampered = cose.clone();
            tampered[index] ^= 1 << bit;
            match cose::verify(&tampered, &public_key) {
                Err(IdentityError::SignatureInvalid | IdentityError::MalformedCose) => {}
                Err(err) => panic!("unexpected error at {index}/{bit}: {err}"),
                Ok(value) => panic!("tampered input verified as {value} at {index}/{bit}"),
            }
        }
    }
}

#[test]
fn test_cose_wrong_public_key() {
    let device = device();
    let cose = device
        .encode_value(0.75, EncodeFormat::CoseSign1)
        .expect("encode");
    let other = huk_identity_core::EmulatedPartition::new([0x42; 32]);
    KeyRegistry::new().init(&other);
    let public_key = other.export_pubkey(KeyId::COSE_SIGN).expect("export");

    assert_eq!(
        cose::verify(&cose, &public_key),
        Err(IdentityError::SignatureInvalid)
    );
}

#[test]
fn test_provisioning_across_threads() {
    let device = Arc::new(device());

    let waiter = {
        let device = Arc::clone(&device);
        std::thread::spawn(move || {
            device.provisioner().wait_until_provisioned();
            let mut buf = [0u8; 32];
            let len = device.provisioner().get(&mut buf).expect("get");
            buf[..len].to_vec()
        })
    };

    let producer = {
        let device = Arc::clone(&device);
        std::thread::spawn(move || {
            device.provisioner().store(ProvisionRecord {
                cert_der: vec![0xAA, 0xBB],
                hubname: "h".to_string(),
                hubport: 1883,
            });
        })
    };

    producer.join().expect("producer join");
    let bytes = waiter.join().expect("waiter join");
    assert_eq!(bytes, vec![0xAA, 0xBB, b'h', 0x00, 0x07, 0x5B]);
}

#[test]
fn test_enrollment_flow() {
    let device = device();
    let der = device
        .generate_csr(KeyId::CLIENT_TLS, CsrFormat::Der)
        .expect("csr");
    let request = huk_identity_core::ca::encode_ca_request(&der).expect("request");
    assert_eq!(request[0], 0xA1);

    let response = {
        use ciborium::value::{Integer, Value};
        let map = Value::Map(vec![
            (Value::Integer(Integer::from(1u8)), Value::Integer(Integer::from(0u8))),
            (Value::Integer(Integer::from(2u8)), Value::Bytes(vec![0x30, 0x03, 0x02, 0x01, 0x01])),
            (Value::Integer(Integer::from(3u8)), Value::Text("hub.local".to_string())),
            (Value::Integer(Integer::from(4u8)), Value::Integer(Integer::from(8883u16))),
        ]);
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&map, &mut bytes).expect("encode response");
        bytes
    };

    device.apply_ca_response(&response).expect("apply");
    let record = device.wait_for_record().expect("record");
    assert_eq!(record.hubname, "hub.local");
    assert_eq!(
        device
            .registry()
            .context(KeyId::CLIENT_TLS)
            .expect("context")
            .status(),
        KeyStatus::CertificateGenerated
    );
}
