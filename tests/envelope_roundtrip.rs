use std::io::Read;
use std::sync::Arc;
use std::thread;

use content_envelope::{
    block_start, decode_key_list, encode_key_list, ByteRange, EncryptedSymmetricDataEncryptionKey,
    EnvelopeEncryption, EnvelopeError, InMemoryTransit, KeyManagementClient, KeyGenerator,
    Result, StoredDataEncryptionKey, TransitKeyWrapper, UnencryptedSymmetricDataEncryptionKey,
};

const GREETING: &[u8] = b"Hello Client-side encryption World!";

fn setup() -> (Arc<InMemoryTransit>, EnvelopeEncryption<InMemoryTransit>) {
    let kms = Arc::new(InMemoryTransit::new());
    let engine = EnvelopeEncryption::with_defaults(Arc::clone(&kms));
    engine.init().unwrap();
    (kms, engine)
}

fn encrypt(engine: &EnvelopeEncryption<InMemoryTransit>, plaintext: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let (mut stream, context) = engine.encrypt(plaintext, "shared-key").unwrap();
    let mut ciphertext = Vec::new();
    stream.read_to_end(&mut ciphertext).unwrap();
    (ciphertext, context)
}

fn decrypt(engine: &EnvelopeEncryption<InMemoryTransit>, context: &[u8], ciphertext: &[u8], offset: u64) -> Vec<u8> {
    let start = block_start(offset) as usize;
    let mut out = Vec::new();
    engine
        .decrypt(context, &ciphertext[start..], offset, "shared-key")
        .unwrap()
        .read_to_end(&mut out)
        .unwrap();
    out
}

#[test]
fn test_full_roundtrip() {
    let (_, engine) = setup();
    for len in [0usize, 1, 16, 64, 37] {
        let plaintext: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();
        let (ciphertext, context) = encrypt(&engine, &plaintext);
        assert_eq!(ciphertext.len(), plaintext.len());
        assert_eq!(decrypt(&engine, &context, &ciphertext, 0), plaintext);
    }
}

#[test]
fn test_offset_decrypt_yields_word() {
    let (_, engine) = setup();
    let (ciphertext, context) = encrypt(&engine, GREETING);

    let mut word = Vec::new();
    engine
        .decrypt(&context, &ciphertext[16..], 18, "shared-key")
        .unwrap()
        .take(10)
        .read_to_end(&mut word)
        .unwrap();
    assert_eq!(word, b"encryption");
}

#[test]
fn test_rotation_transparency() {
    let (kms, engine) = setup();
    let (ciphertext, context) = encrypt(&engine, GREETING);

    engine.rotate("shared-key").unwrap();
    engine.rotate("shared-key").unwrap();
    assert_eq!(kms.key_version("shared-key"), Some(3));
    assert_eq!(decrypt(&engine, &context, &ciphertext, 0), GREETING);
}

#[test]
fn test_retired_version_no_longer_decrypts() {
    let (kms, engine) = setup();
    let (ciphertext, context) = encrypt(&engine, GREETING);

    engine.rotate("shared-key").unwrap();
    kms.set_min_decryption_version("shared-key", 2).unwrap();
    assert_eq!(kms.trim("shared-key").unwrap(), 1);

    let result = engine.decrypt(&context, ciphertext.as_slice(), 0, "shared-key");
    assert!(matches!(result, Err(EnvelopeError::KeyManagement(_))));
}

#[test]
fn test_short_context_is_rejected() {
    let (_, engine) = setup();
    let (ciphertext, context) = encrypt(&engine, GREETING);

    let result = engine.decrypt(&context[..context.len() - 1], ciphertext.as_slice(), 0, "shared-key");
    assert!(matches!(result, Err(EnvelopeError::CorruptedContext(_))));
}

#[test]
fn test_stream_errors_convert_to_io() {
    let err: std::io::Error = EnvelopeError::CorruptedContext("bad".into()).into();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
}

#[test]
fn test_stored_key_encoding_is_deterministic() {
    let key = StoredDataEncryptionKey::from(EncryptedSymmetricDataEncryptionKey {
        wrapping_algorithm: "vault-transit".into(),
        wrapping_key_id: "shared-key".into(),
        wrapping_key_version: "1".into(),
        data_encryption_algorithm: "AES".into(),
        encrypted_key_data: b"vault:v1:payload".to_vec(),
        iv: vec![0u8; 16],
    });
    assert_eq!(key.to_bytes(), key.to_bytes());
    assert_eq!(StoredDataEncryptionKey::from_bytes(&key.to_bytes()).unwrap(), key);
}

#[test]
fn test_foreign_marker_is_no_match() {
    let raw = UnencryptedSymmetricDataEncryptionKey {
        algorithm: "AES".into(),
        key_data: vec![1u8; 32],
        iv: vec![2u8; 16],
    };
    let bytes = raw.to_bytes();
    assert_eq!(EncryptedSymmetricDataEncryptionKey::from_bytes(&bytes).unwrap(), None);
    assert_eq!(UnencryptedSymmetricDataEncryptionKey::from_bytes(&bytes).unwrap(), Some(raw));
}

#[test]
fn test_stored_keys_survive_persistence() {
    let (kms, engine) = setup();
    let transit = TransitKeyWrapper::new(kms, "shared-key");

    let (mut stream, keys) = engine.encrypt_with_wrappers(GREETING, &[&transit]).unwrap();
    let mut ciphertext = Vec::new();
    stream.read_to_end(&mut ciphertext).unwrap();

    let keys = decode_key_list(&encode_key_list(&keys)).unwrap();
    let range = ByteRange::parse("bytes=-6", Some(GREETING.len() as u64)).unwrap();
    let mut tail = Vec::new();
    engine
        .decrypt_with_wrappers(&keys, &[&transit], range, |aligned| {
            Ok(&ciphertext[aligned.start as usize..])
        })
        .unwrap()
        .read_to_end(&mut tail)
        .unwrap();
    assert_eq!(tail, b"World!");
}

/// Key service that is reachable but refuses to wrap
struct RefusingKms;

impl KeyManagementClient for RefusingKms {
    fn create_key(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    fn wrap(&self, name: &str, _base64_key: &str) -> Result<String> {
        Err(EnvelopeError::KeyManagement(format!("permission denied on {}", name)))
    }

    fn unwrap(&self, name: &str, _ciphertext: &str) -> Result<String> {
        Err(EnvelopeError::KeyManagement(format!("permission denied on {}", name)))
    }

    fn rotate(&self, _name: &str) -> Result<()> {
        Ok(())
    }
}

#[test]
fn test_wrap_failure_yields_no_context() {
    let engine = EnvelopeEncryption::with_defaults(Arc::new(RefusingKms));
    engine.init().unwrap();

    match engine.encrypt(GREETING, "shared-key") {
        Err(EnvelopeError::KeyManagement(msg)) => assert!(msg.contains("shared-key")),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("encrypt must fail when the key service refuses to wrap"),
    }
}

#[test]
fn test_concurrent_encrypt_decrypt() {
    let (_, engine) = setup();
    let engine = Arc::new(engine);
    let generator = KeyGenerator::global() as *const KeyGenerator as usize;

    let handles: Vec<_> = (0..8u8)
        .map(|i| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                let plaintext: Vec<u8> = (0..100u8).map(|b| b.wrapping_mul(i + 1)).collect();
                let (ciphertext, context) = encrypt(&engine, &plaintext);
                let tail = decrypt(&engine, &context, &ciphertext, 33);
                assert_eq!(tail, &plaintext[33..]);
                (context, KeyGenerator::global() as *const KeyGenerator as usize)
            })
        })
        .collect();

    let mut contexts = Vec::new();
    for handle in handles {
        let (context, seen) = handle.join().unwrap();
        assert_eq!(seen, generator);
        contexts.push(context);
    }
    contexts.sort();
    contexts.dedup();
    assert_eq!(contexts.len(), 8);
}
