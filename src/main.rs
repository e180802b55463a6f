use std::io::Read;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use content_envelope::{
    block_start, decode_key_list, encode_key_list, ByteRange, EngineConfig, EnvelopeEncryption,
    InMemoryTransit, TransitKeyWrapper, UnencryptedKeyWrapper,
};
use tracing_subscriber::EnvFilter;

fn b64(data: &[u8]) -> String {
    let encoded = STANDARD.encode(data);
    if encoded.len() > 16 {
        format!("{}...{}", &encoded[..8], &encoded[encoded.len() - 4..])
    } else {
        encoded
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("=== Envelope Encryption for Stored Content ===\n");

    let config = EngineConfig::from_env()?;
    let key_name = config.default_key_name.clone();
    let kms = Arc::new(InMemoryTransit::new());
    let engine = EnvelopeEncryption::new(Arc::clone(&kms), config)?;
    engine.init()?;

    println!("[INIT] Wrapping key: {}", key_name);
    println!("[INIT] Context layout: {:?}\n", engine.config().context_format);

    let plaintext = b"Hello Client-side encryption World!";
    let (mut stream, context) = engine.encrypt(&plaintext[..], &key_name)?;
    let mut ciphertext = Vec::new();
    stream.read_to_end(&mut ciphertext)?;

    println!("[ENCRYPT] Plaintext ({}B): {}", plaintext.len(), String::from_utf8_lossy(plaintext));
    println!("[ENCRYPT] Ciphertext ({}B): {}", ciphertext.len(), b64(&ciphertext));
    println!("[ENCRYPT] Context ({}B): {}\n", context.len(), b64(&context));

    let mut decrypted = Vec::new();
    engine
        .decrypt(&context, ciphertext.as_slice(), 0, &key_name)?
        .read_to_end(&mut decrypted)?;
    println!("[DECRYPT] Plaintext: {}\n", String::from_utf8_lossy(&decrypted));

    // Range fetch: only the ciphertext from the enclosing block onwards
    let range = ByteRange::parse("bytes=18-27", Some(ciphertext.len() as u64))?;
    let start = block_start(range.start) as usize;
    let mut word = Vec::new();
    engine
        .decrypt(&context, &ciphertext[start..], range.start, &key_name)?
        .take(range.len().unwrap_or(u64::MAX))
        .read_to_end(&mut word)?;
    println!("[RANGE] Requested: {}", range);
    println!("[RANGE] Fetched ciphertext from byte {}", start);
    println!("[RANGE] Plaintext: {}\n", String::from_utf8_lossy(&word));

    println!("=== Key Rotation ===\n");
    engine.rotate(&key_name)?;
    if let Some(info) = kms.key_info(&key_name) {
        println!("[ROTATE] Latest version: v{}", info.latest_version);
        println!("[ROTATE] Retained versions: {}", info.retained_versions);
    }

    let mut after = Vec::new();
    engine
        .decrypt(&context, ciphertext.as_slice(), 0, &key_name)?
        .read_to_end(&mut after)?;
    println!("[ROTATE] Old context still decrypts: {}\n", String::from_utf8_lossy(&after));

    println!("=== Stored Data Keys ===\n");
    let transit = TransitKeyWrapper::new(Arc::clone(&kms), key_name.as_str());
    let raw = UnencryptedKeyWrapper;
    let (mut stream, keys) = engine.encrypt_with_wrappers(&plaintext[..], &[&transit, &raw])?;
    let mut ciphertext = Vec::new();
    stream.read_to_end(&mut ciphertext)?;

    let stored = encode_key_list(&keys);
    println!("[KEYS] {} stored keys, list blob {}B: {}", keys.len(), stored.len(), b64(&stored));

    let keys = decode_key_list(&stored)?;
    let range = ByteRange::parse("bytes=6-16", None)?;
    let mut part = Vec::new();
    engine
        .decrypt_with_wrappers(&keys, &[&transit], range, |aligned| {
            println!("[KEYS] Fetching ciphertext {}", aligned);
            let end = aligned.end.map_or(ciphertext.len(), |e| e as usize + 1);
            Ok(&ciphertext[aligned.start as usize..end])
        })?
        .read_to_end(&mut part)?;
    println!("[KEYS] Plaintext {}: {}", range, String::from_utf8_lossy(&part));

    Ok(())
}
