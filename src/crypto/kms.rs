//! crypto/kms — KmsProvider trait plus two implementations: a production
//! HTTP client against a Vault-transit-shaped endpoint, and an in-memory
//! stub for tests and offline CLI exercises.
//!
//! Wrapped-key strings carry the `kms:v<N>:<ciphertext>` prefix end to end:
//! the same opaque string returned by the transit API's `ciphertext` field
//! is what gets written to the `.key` sidecar and sent back on unwrap/rewrap.
//! Parsing that prefix lives entirely in [`WrappedKey`].

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use aes_gcm::aead::{generic_array::GenericArray, AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use byteorder::{BigEndian, ByteOrder};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::cancel::CancelToken;
use crate::consts::WRAPPED_KEY_PREFIX;
use crate::error::{Error, KmsError, Result};
use crate::secret::SecretBuffer;

const DEK_LEN: usize = 32;

/// A parsed `kms:v<N>:<ciphertext>` string. The ciphertext payload is kept
/// opaque — this crate never interprets it beyond passing it back to the
/// KMS on unwrap/rewrap.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WrappedKey {
    version: u32,
    raw: String,
}

impl WrappedKey {
    pub fn new(version: u32, ciphertext: impl Into<String>) -> Self {
        let ciphertext = ciphertext.into();
        let raw = format!("{WRAPPED_KEY_PREFIX}:v{version}:{ciphertext}");
        Self { version, raw }
    }

    /// Parse a sidecar line (or RPC `ciphertext` field) of the form
    /// `kms:v<N>:<ciphertext>`. Anything else is a format error.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let rest = s
            .strip_prefix(WRAPPED_KEY_PREFIX)
            .and_then(|r| r.strip_prefix(':'))
            .ok_or_else(|| Error::Format(format!("wrapped key missing '{WRAPPED_KEY_PREFIX}:' prefix: {s}")))?;
        let rest = rest
            .strip_prefix('v')
            .ok_or_else(|| Error::Format(format!("wrapped key missing version marker: {s}")))?;
        let (version_str, _) = rest
            .split_once(':')
            .ok_or_else(|| Error::Format(format!("wrapped key missing ciphertext separator: {s}")))?;
        let version: u32 = version_str
            .parse()
            .map_err(|_| Error::Format(format!("wrapped key version is not a decimal integer: {s}")))?;
        if version < 1 {
            return Err(Error::Format(format!("wrapped key version must be >= 1: {s}")));
        }
        Ok(Self { version, raw: s.to_string() })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// The ciphertext payload alone, stripped of the `kms:v<N>:` prefix —
    /// this is what gets sent back to the KMS on unwrap/rewrap calls.
    pub fn ciphertext(&self) -> &str {
        let after_prefix = &self.raw[WRAPPED_KEY_PREFIX.len() + 1..];
        let after_v = &after_prefix[1..];
        let sep = after_v.find(':').expect("parsed WrappedKey always has a ciphertext separator");
        &after_v[sep + 1..]
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl std::fmt::Display for WrappedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// KMS transit surface: generate a fresh DEK, recover one, re-encrypt one
/// under the current primary-key version, and check reachability.
pub trait KmsProvider: Send + Sync {
    /// Request a fresh 256-bit DEK bound to this provider's configured
    /// transit key. Returns the plaintext (already moved into a
    /// page-locked [`SecretBuffer`]) and its wrapped form.
    fn wrap(&self) -> Result<(SecretBuffer, WrappedKey)>;

    /// Recover the plaintext DEK behind a previously-wrapped key.
    fn unwrap(&self, wrapped: &WrappedKey) -> Result<SecretBuffer>;

    /// Re-encrypt the same plaintext DEK under the current primary-key
    /// version. The plaintext never reaches the caller.
    fn rewrap(&self, wrapped: &WrappedKey) -> Result<WrappedKey>;

    /// Confirm the KMS is reachable, initialized, and unsealed.
    fn health(&self) -> Result<()>;
}

/// Retry `health()` with exponential backoff capped at `cap`, the same
/// doubling-then-capping shape as the follower's reconnect loop. Aborts
/// early if `cancel` fires during a backoff sleep.
pub fn health_with_retry(
    provider: &dyn KmsProvider,
    attempts: u32,
    initial_delay: Duration,
    cap: Duration,
    cancel: &CancelToken,
) -> Result<()> {
    let mut delay = initial_delay;
    let mut last_err = None;
    for attempt in 1..=attempts.max(1) {
        match provider.health() {
            Ok(()) => return Ok(()),
            Err(e) => {
                log::warn!("kms health check failed (attempt {attempt}/{attempts}): {e}");
                last_err = Some(e);
                if attempt == attempts {
                    break;
                }
                if cancel.sleep(delay) {
                    return Err(Error::Cancelled);
                }
                delay = (delay * 2).min(cap);
            }
        }
    }
    Err(last_err.unwrap_or(Error::Kms(KmsError::Unreachable("no attempts made".into()))))
}

/// Production client against a Vault-transit-shaped HTTP API:
///
/// - `POST {endpoint}/v1/transit/datakey/plaintext/{key_name}`
/// - `POST {endpoint}/v1/transit/decrypt/{key_name}`
/// - `POST {endpoint}/v1/transit/rewrap/{key_name}`
/// - `GET  {endpoint}/v1/sys/health`
///
/// The `ciphertext` field of every response is already a full
/// `kms:v<N>:...` string, so this client only ever parses/forwards it —
/// it never performs its own AES-GCM wrapping.
pub struct VaultTransitClient {
    endpoint: String,
    token: String,
    key_name: String,
    agent: ureq::Agent,
}

impl VaultTransitClient {
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>, key_name: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            token: token.into(),
            key_name: key_name.into(),
            agent: ureq::AgentBuilder::new()
                .timeout(Duration::from_secs(10))
                .build(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint.trim_end_matches('/'), path)
    }

    fn post(&self, path: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        let resp = self
            .agent
            .post(&self.url(path))
            .set("X-Vault-Token", &self.token)
            .send_json(body)
            .map_err(classify_transport_error)?;
        parse_body(resp)
    }

    fn get(&self, path: &str) -> Result<serde_json::Value> {
        let resp = self
            .agent
            .get(&self.url(path))
            .set("X-Vault-Token", &self.token)
            .call()
            .map_err(classify_transport_error)?;
        parse_body(resp)
    }

    fn field<'a>(body: &'a serde_json::Value, path: &'static str) -> Result<&'a serde_json::Value> {
        let mut cur = body;
        for part in path.split('.') {
            cur = cur.get(part).ok_or(Error::Kms(KmsError::MissingField(path)))?;
        }
        Ok(cur)
    }
}

/// Read a response body and parse it as JSON, distinguishing a genuinely
/// empty body (Vault sometimes returns `200 OK` with nothing on certain
/// health/maintenance paths) from one that's merely unparseable.
fn parse_body(resp: ureq::Response) -> Result<serde_json::Value> {
    let text = resp
        .into_string()
        .map_err(|e| Error::Kms(KmsError::MalformedResponse(e.to_string())))?;
    if text.trim().is_empty() {
        return Err(Error::Kms(KmsError::EmptyResponse));
    }
    serde_json::from_str(&text).map_err(|e| Error::Kms(KmsError::MalformedResponse(e.to_string())))
}

fn classify_transport_error(e: ureq::Error) -> Error {
    match e {
        ureq::Error::Status(401, _) | ureq::Error::Status(403, _) => {
            Error::Kms(KmsError::AuthDenied("vault token rejected".into()))
        }
        ureq::Error::Status(code, _) => Error::Kms(KmsError::Unreachable(format!("http {code}"))),
        ureq::Error::Transport(t) => Error::Kms(KmsError::Unreachable(t.to_string())),
    }
}

impl KmsProvider for VaultTransitClient {
    fn wrap(&self) -> Result<(SecretBuffer, WrappedKey)> {
        let body = self.post(
            &format!("/v1/transit/datakey/plaintext/{}", self.key_name),
            serde_json::json!({}),
        )?;
        let plaintext_b64 = Self::field(&body, "data.plaintext")?
            .as_str()
            .ok_or(Error::Kms(KmsError::MissingField("data.plaintext")))?;
        let ciphertext = Self::field(&body, "data.ciphertext")?
            .as_str()
            .ok_or(Error::Kms(KmsError::MissingField("data.ciphertext")))?;

        let mut plaintext = base64::engine::general_purpose::STANDARD
            .decode(plaintext_b64)
            .map_err(|e| Error::Kms(KmsError::MalformedResponse(format!("plaintext base64: {e}"))))?;
        if plaintext.len() != DEK_LEN {
            return Err(Error::Kms(KmsError::MalformedResponse(format!(
                "expected a {DEK_LEN}-byte DEK, got {}",
                plaintext.len()
            ))));
        }
        let dek = SecretBuffer::from_slice(&plaintext);
        use zeroize::Zeroize;
        plaintext.zeroize();

        let wrapped = WrappedKey::parse(ciphertext)?;
        Ok((dek, wrapped))
    }

    fn unwrap(&self, wrapped: &WrappedKey) -> Result<SecretBuffer> {
        let body = self.post(
            &format!("/v1/transit/decrypt/{}", self.key_name),
            serde_json::json!({ "ciphertext": wrapped.as_str() }),
        )?;
        let plaintext_b64 = Self::field(&body, "data.plaintext")?
            .as_str()
            .ok_or(Error::Kms(KmsError::MissingField("data.plaintext")))?;
        let mut plaintext = base64::engine::general_purpose::STANDARD
            .decode(plaintext_b64)
            .map_err(|e| Error::Kms(KmsError::MalformedResponse(format!("plaintext base64: {e}"))))?;
        if plaintext.len() != DEK_LEN {
            return Err(Error::Kms(KmsError::MalformedResponse(format!(
                "expected a {DEK_LEN}-byte DEK, got {}",
                plaintext.len()
            ))));
        }
        let dek = SecretBuffer::from_slice(&plaintext);
        use zeroize::Zeroize;
        plaintext.zeroize();
        Ok(dek)
    }

    fn rewrap(&self, wrapped: &WrappedKey) -> Result<WrappedKey> {
        let body = self.post(
            &format!("/v1/transit/rewrap/{}", self.key_name),
            serde_json::json!({ "ciphertext": wrapped.as_str() }),
        )?;
        let ciphertext = Self::field(&body, "data.ciphertext")?
            .as_str()
            .ok_or(Error::Kms(KmsError::MissingField("data.ciphertext")))?;
        WrappedKey::parse(ciphertext)
    }

    fn health(&self) -> Result<()> {
        let body = self.get("/v1/sys/health")?;
        let initialized = body
            .get("initialized")
            .and_then(|v| v.as_bool())
            .ok_or(Error::Kms(KmsError::MissingField("initialized")))?;
        let sealed = body
            .get("sealed")
            .and_then(|v| v.as_bool())
            .ok_or(Error::Kms(KmsError::MissingField("sealed")))?;
        if !initialized {
            return Err(Error::Kms(KmsError::Unreachable("vault is not initialized".into())));
        }
        if sealed {
            return Err(Error::Kms(KmsError::Unreachable("vault is sealed".into())));
        }
        Ok(())
    }
}

/// Deterministic in-memory KMS for tests and offline CLI exercises.
/// Generalizes the teacher's `EnvKmsProvider` envelope scheme (AES-256-GCM,
/// random nonce, AAD-bound) from a single static KEK to a versioned keyring,
/// so `rewrap` and `key-versions` tests can bump the primary-key version
/// without any network dependency.
pub struct StubKmsProvider {
    keks: Mutex<std::collections::HashMap<u32, [u8; 32]>>,
    current_version: AtomicU32,
}

impl StubKmsProvider {
    pub fn new() -> Self {
        let mut first = [0u8; 32];
        OsRng.fill_bytes(&mut first);
        let mut keks = std::collections::HashMap::new();
        keks.insert(1, first);
        Self {
            keks: Mutex::new(keks),
            current_version: AtomicU32::new(1),
        }
    }

    /// Introduce a new primary-key version and make it current. Returns the
    /// new version number.
    pub fn bump_version(&self) -> u32 {
        let mut keks = self.keks.lock().unwrap();
        let next = self.current_version.load(Ordering::SeqCst) + 1;
        let mut kek = [0u8; 32];
        OsRng.fill_bytes(&mut kek);
        keks.insert(next, kek);
        self.current_version.store(next, Ordering::SeqCst);
        next
    }

    pub fn current_version(&self) -> u32 {
        self.current_version.load(Ordering::SeqCst)
    }

    fn kek_for_version(&self, version: u32) -> Result<[u8; 32]> {
        self.keks
            .lock()
            .unwrap()
            .get(&version)
            .copied()
            .ok_or_else(|| Error::Kms(KmsError::MalformedResponse(format!("unknown kek version {version}"))))
    }

    fn wrap_dek_under(&self, version: u32, dek: &[u8]) -> Result<WrappedKey> {
        let kek = self.kek_for_version(version)?;
        let mut nonce = [0u8; 12];
        OsRng.fill_bytes(&mut nonce);
        let mut pt = dek.to_vec();
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&kek));
        let aad = version_aad(version);
        let tag = cipher
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), &aad, &mut pt)
            .map_err(|e| Error::Kms(KmsError::MalformedResponse(format!("stub kms wrap: {e}"))))?;
        use zeroize::Zeroize;

        let mut blob = Vec::with_capacity(12 + 16 + pt.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(tag.as_slice());
        blob.extend_from_slice(&pt);
        pt.zeroize();

        let b64 = base64::engine::general_purpose::STANDARD.encode(&blob);
        Ok(WrappedKey::new(version, b64))
    }

    fn unwrap_to_buffer(&self, wrapped: &WrappedKey) -> Result<SecretBuffer> {
        let blob = base64::engine::general_purpose::STANDARD
            .decode(wrapped.ciphertext())
            .map_err(|e| Error::Format(format!("wrapped key ciphertext is not valid base64: {e}")))?;
        if blob.len() < 12 + 16 {
            return Err(Error::Format("wrapped key ciphertext too short".into()));
        }
        let kek = self.kek_for_version(wrapped.version())?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&kek));
        let aad = version_aad(wrapped.version());

        let nonce = &blob[..12];
        let tag_offset = blob.len() - 16;
        let tag = GenericArray::from_slice(&blob[tag_offset..]);
        let mut body = blob[12..tag_offset].to_vec();
        cipher
            .decrypt_in_place_detached(Nonce::from_slice(nonce), &aad, &mut body, tag)
            .map_err(|_| Error::Integrity("stub kms: wrapped key failed authentication".into()))?;
        Ok(SecretBuffer::from_slice(&body))
    }
}

impl Default for StubKmsProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn version_aad(version: u32) -> [u8; 4] {
    let mut aad = [0u8; 4];
    BigEndian::write_u32(&mut aad, version);
    aad
}

impl KmsProvider for StubKmsProvider {
    fn wrap(&self) -> Result<(SecretBuffer, WrappedKey)> {
        let mut dek = [0u8; DEK_LEN];
        OsRng.fill_bytes(&mut dek);
        let version = self.current_version();
        let wrapped = self.wrap_dek_under(version, &dek)?;
        let buf = SecretBuffer::from_slice(&dek);
        use zeroize::Zeroize;
        dek.zeroize();
        Ok((buf, wrapped))
    }

    fn unwrap(&self, wrapped: &WrappedKey) -> Result<SecretBuffer> {
        self.unwrap_to_buffer(wrapped)
    }

    fn rewrap(&self, wrapped: &WrappedKey) -> Result<WrappedKey> {
        let dek = self.unwrap_to_buffer(wrapped)?;
        let current = self.current_version();
        dek.with_bytes(|bytes| self.wrap_dek_under(current, bytes))
    }

    fn health(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapped_key_parse_roundtrip() {
        let w = WrappedKey::new(3, "QUJDRA==");
        assert_eq!(w.as_str(), "kms:v3:QUJDRA==");
        let parsed = WrappedKey::parse(w.as_str()).unwrap();
        assert_eq!(parsed.version(), 3);
        assert_eq!(parsed.ciphertext(), "QUJDRA==");
    }

    #[test]
    fn wrapped_key_rejects_malformed_prefix() {
        assert!(WrappedKey::parse("vault:v1:AAAA").is_err());
        assert!(WrappedKey::parse("kms:1:AAAA").is_err());
        assert!(WrappedKey::parse("kms:v0:AAAA").is_err());
        assert!(WrappedKey::parse("kms:vX:AAAA").is_err());
    }

    #[test]
    fn stub_wrap_unwrap_roundtrip() {
        let kms = StubKmsProvider::new();
        let (dek, wrapped) = kms.wrap().unwrap();
        assert_eq!(wrapped.version(), 1);
        let recovered = kms.unwrap(&wrapped).unwrap();
        dek.with_bytes(|a| recovered.with_bytes(|b| assert_eq!(a, b)));
    }

    #[test]
    fn stub_rewrap_bumps_version_and_preserves_dek() {
        let kms = StubKmsProvider::new();
        let (dek, wrapped_v1) = kms.wrap().unwrap();
        assert_eq!(wrapped_v1.version(), 1);

        let new_version = kms.bump_version();
        assert_eq!(new_version, 2);

        let wrapped_v2 = kms.rewrap(&wrapped_v1).unwrap();
        assert_eq!(wrapped_v2.version(), 2);

        let recovered = kms.unwrap(&wrapped_v2).unwrap();
        dek.with_bytes(|a| recovered.with_bytes(|b| assert_eq!(a, b)));
    }

    #[test]
    fn stub_unwrap_rejects_unknown_version() {
        let kms = StubKmsProvider::new();
        let forged = WrappedKey::new(99, "QUJDRA==");
        let err = kms.unwrap(&forged).unwrap_err();
        assert!(matches!(err, Error::Kms(KmsError::MalformedResponse(_))));
    }

    #[test]
    fn health_with_retry_succeeds_immediately_when_healthy() {
        let kms = StubKmsProvider::new();
        health_with_retry(&kms, 3, Duration::from_millis(1), Duration::from_millis(10), &CancelToken::new())
            .unwrap();
    }

    struct AlwaysDownKms;
    impl KmsProvider for AlwaysDownKms {
        fn wrap(&self) -> Result<(SecretBuffer, WrappedKey)> {
            unimplemented!()
        }
        fn unwrap(&self, _wrapped: &WrappedKey) -> Result<SecretBuffer> {
            unimplemented!()
        }
        fn rewrap(&self, _wrapped: &WrappedKey) -> Result<WrappedKey> {
            unimplemented!()
        }
        fn health(&self) -> Result<()> {
            Err(Error::Kms(KmsError::Unreachable("simulated outage".into())))
        }
    }

    #[test]
    fn health_with_retry_exhausts_attempts_and_surfaces_last_error() {
        let err = health_with_retry(
            &AlwaysDownKms,
            3,
            Duration::from_millis(1),
            Duration::from_millis(5),
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Kms(KmsError::Unreachable(_))));
    }
}
