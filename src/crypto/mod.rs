//! crypto — the envelope-encryption primitives: key hygiene ([`secret`] is
//! the sibling module, not re-exported here since it has no crypto::
//! dependencies of its own), the KMS transit protocol, the streaming AEAD
//! file codec, and whole-file checksums.

pub mod checksum;
pub mod codec;
pub mod kms;

pub use codec::FileCodec;
pub use kms::{health_with_retry, KmsProvider, StubKmsProvider, VaultTransitClient, WrappedKey};
