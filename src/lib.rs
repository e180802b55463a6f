pub mod codec;
pub mod config;
pub mod context;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod keys;
pub mod kms;
pub mod range;
pub mod skip;
pub mod stream;
pub mod wrapper;

pub use config::{ContextFormat, EngineConfig, DEFAULT_KEY_NAME, VAULT_TRANSIT_WRAPPED_KEY_LEN};
pub use context::EncryptionContext;
pub use crypto::{
    block_remainder, block_start, iv_for_offset, KeyGenerator, SecureKey, AES_BLOCK_SIZE,
    NONCE_SIZE,
};
pub use envelope::{DecryptingReader, EnvelopeEncryption, RangeReader};
pub use error::{EnvelopeError, Result};
pub use keys::{
    decode_key_list, encode_key_list, EncryptedSymmetricDataEncryptionKey,
    StoredDataEncryptionKey, UnencryptedSymmetricDataEncryptionKey,
};
pub use kms::{InMemoryTransit, KeyManagementClient, TransitKeyInfo};
pub use range::ByteRange;
pub use skip::{OffsetSkipReader, SkipMode};
pub use stream::CtrReader;
pub use wrapper::{
    DataEncryptionKeyWrapper, EncryptionParameters, TransitKeyWrapper, UnencryptedKeyWrapper,
};
