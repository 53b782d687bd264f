//! FileCodec — streaming AES-256-GCM file encryption/decryption.
//!
//! On-disk format (big-endian everywhere, per the external wire-format
//! contract):
//!
//! ```text
//! offset 0   base_nonce           12 bytes
//! offset 12  original_size (u64, BE)   8 bytes
//! offset 20  chunk_size    (u32, BE)   4 bytes
//! offset 24  repeat:
//!            ciphertext_len (u32, BE)  4 bytes
//!            ciphertext             ciphertext_len bytes
//! ```
//!
//! Per-chunk nonce = base_nonce interpreted as a big-endian 96-bit integer,
//! plus the 0-based chunk index. AAD for every chunk is the header's 8-byte
//! original-size field, binding truncation attacks to authentication
//! failure on the very first chunk that's missing.

use std::io::{Read, Write};

use aes_gcm::aead::{generic_array::GenericArray, AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use byteorder::{BigEndian, ByteOrder};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::cancel::CancelToken;
use crate::consts::{
    CHUNK_LEN_PREFIX, HEADER_LEN, MAX_CHUNKS, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE, NONCE_LEN, TAG_LEN,
};
use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug)]
pub struct FileCodec {
    chunk_size: u32,
}

impl FileCodec {
    /// chunk_size must be in [64 KiB, 10 MiB]; construction validates this
    /// as a BoundsError up front so a misconfigured encryptor fails fast.
    pub fn new(chunk_size: u32) -> Result<Self> {
        validate_chunk_size(chunk_size)?;
        Ok(Self { chunk_size })
    }

    pub fn with_default_chunk_size() -> Self {
        Self {
            chunk_size: crate::consts::DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Encrypt the full contents of `reader` into `writer` under `key`
    /// (32 bytes). Streams in bounded memory: only one chunk is buffered at
    /// a time. `plaintext_len` must equal the number of bytes `reader` will
    /// yield; it is written into the header and bound into every chunk's
    /// AAD, so callers must know the size up front (e.g. from file
    /// metadata).
    pub fn encrypt<R: Read, W: Write>(
        &self,
        key: &[u8],
        plaintext_len: u64,
        mut reader: R,
        mut writer: W,
        cancel: &CancelToken,
    ) -> Result<()> {
        let n_chunks = plaintext_len.div_ceil(self.chunk_size as u64).max(1);
        if n_chunks > MAX_CHUNKS {
            return Err(Error::Bounds(format!(
                "input of {plaintext_len} bytes would need {n_chunks} chunks at chunk_size={}, exceeding the 2^32 ceiling",
                self.chunk_size
            )));
        }

        let mut base_nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut base_nonce);

        let mut header = [0u8; HEADER_LEN];
        header[..NONCE_LEN].copy_from_slice(&base_nonce);
        BigEndian::write_u64(&mut header[NONCE_LEN..NONCE_LEN + 8], plaintext_len);
        BigEndian::write_u32(&mut header[NONCE_LEN + 8..], self.chunk_size);
        writer
            .write_all(&header)
            .map_err(|e| Error::io("<codec output>", e))?;

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        let aad = &header[NONCE_LEN..NONCE_LEN + 8];

        let mut remaining = plaintext_len;
        let mut chunk_buf = vec![0u8; self.chunk_size as usize];
        let mut index: u64 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let want = (self.chunk_size as u64).min(remaining) as usize;
            reader
                .read_exact(&mut chunk_buf[..want])
                .map_err(|e| Error::io("<codec input>", e))?;

            let nonce_bytes = chunk_nonce(&base_nonce, index);
            let mut buf = chunk_buf[..want].to_vec();
            let tag = cipher
                .encrypt_in_place_detached(Nonce::from_slice(&nonce_bytes), aad, &mut buf)
                .map_err(|e| Error::Integrity(format!("encrypt chunk {index}: {e}")))?;

            let ct_len = buf.len() + TAG_LEN;
            let mut len_buf = [0u8; CHUNK_LEN_PREFIX];
            BigEndian::write_u32(&mut len_buf, ct_len as u32);
            writer
                .write_all(&len_buf)
                .map_err(|e| Error::io("<codec output>", e))?;
            writer
                .write_all(&buf)
                .map_err(|e| Error::io("<codec output>", e))?;
            writer
                .write_all(tag.as_slice())
                .map_err(|e| Error::io("<codec output>", e))?;

            remaining -= want as u64;
            index += 1;

            if remaining == 0 {
                break;
            }
            if index >= MAX_CHUNKS {
                return Err(Error::Bounds(
                    "chunk index reached the 2^32 ceiling mid-stream".into(),
                ));
            }
        }

        Ok(())
    }

    /// Decrypt `reader` (a full `.enc` stream) into `writer` under `key`.
    /// Reads chunk_size from the header rather than using `self`'s
    /// configured value, since a decryptor must follow whatever the
    /// encryptor recorded.
    pub fn decrypt<R: Read, W: Write>(
        key: &[u8],
        mut reader: R,
        mut writer: W,
        cancel: &CancelToken,
    ) -> Result<()> {
        let mut header = [0u8; HEADER_LEN];
        reader
            .read_exact(&mut header)
            .map_err(|e| Error::io("<codec input>", e))?;

        let base_nonce: [u8; NONCE_LEN] = header[..NONCE_LEN].try_into().unwrap();
        let plaintext_len = BigEndian::read_u64(&header[NONCE_LEN..NONCE_LEN + 8]);
        let chunk_size = BigEndian::read_u32(&header[NONCE_LEN + 8..]);
        validate_chunk_size(chunk_size)?;

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        let aad = &header[NONCE_LEN..NONCE_LEN + 8];

        let mut written: u64 = 0;
        let mut index: u64 = 0;
        let max_ct_len = chunk_size as u64 + TAG_LEN as u64;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let mut len_buf = [0u8; CHUNK_LEN_PREFIX];
            match read_exact_or_eof(&mut reader, &mut len_buf)? {
                ReadOutcome::Eof => break,
                ReadOutcome::Full => {}
            }
            let ct_len = BigEndian::read_u32(&len_buf) as u64;
            // A chunk must carry at least the GCM tag (L == TAG_LEN is the
            // zero-plaintext-chunk encoding some encoders use for an empty
            // file; this codec never emits it but accepts it on read).
            if ct_len < TAG_LEN as u64 || ct_len > max_ct_len {
                return Err(Error::Bounds(format!(
                    "chunk {index} ciphertext length {ct_len} out of bounds (tag={TAG_LEN}, chunk_size={chunk_size})"
                )));
            }

            let mut ct = vec![0u8; ct_len as usize];
            reader
                .read_exact(&mut ct)
                .map_err(|e| Error::io("<codec input>", e))?;

            let tag_offset = ct.len() - TAG_LEN;
            let tag = GenericArray::from_slice(&ct[tag_offset..]);
            let mut body = ct[..tag_offset].to_vec();

            let nonce_bytes = chunk_nonce(&base_nonce, index);
            cipher
                .decrypt_in_place_detached(Nonce::from_slice(&nonce_bytes), aad, &mut body, tag)
                .map_err(|_| Error::Integrity(format!("authentication failure at chunk {index}")))?;

            writer
                .write_all(&body)
                .map_err(|e| Error::io("<codec output>", e))?;
            written += body.len() as u64;
            index += 1;
        }

        if written != plaintext_len {
            return Err(Error::Integrity(format!(
                "decrypted {written} bytes but header declared {plaintext_len}"
            )));
        }

        Ok(())
    }
}

enum ReadOutcome {
    Full,
    Eof,
}

/// Reads exactly `buf.len()` bytes, distinguishing a clean EOF at the very
/// first byte (end of the chunk stream) from a short read partway through
/// (a truncated/corrupt file), which surfaces as an IO error via the normal
/// `read_exact` failure path.
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<ReadOutcome> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader
            .read(&mut buf[filled..])
            .map_err(|e| Error::io("<codec input>", e))?;
        if n == 0 {
            if filled == 0 {
                return Ok(ReadOutcome::Eof);
            }
            return Err(Error::Format("truncated chunk length prefix".into()));
        }
        filled += n;
    }
    Ok(ReadOutcome::Full)
}

fn chunk_nonce(base: &[u8; NONCE_LEN], index: u64) -> [u8; NONCE_LEN] {
    let base_int = u128::from_be_bytes({
        let mut padded = [0u8; 16];
        padded[4..].copy_from_slice(base);
        padded
    });
    let sum = base_int + index as u128;
    let mut out = [0u8; NONCE_LEN];
    out.copy_from_slice(&sum.to_be_bytes()[4..]);
    out
}

fn validate_chunk_size(chunk_size: u32) -> Result<()> {
    if chunk_size < MIN_CHUNK_SIZE || chunk_size > MAX_CHUNK_SIZE {
        return Err(Error::Bounds(format!(
            "chunk size {chunk_size} outside [{MIN_CHUNK_SIZE}, {MAX_CHUNK_SIZE}]"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn key32() -> [u8; 32] {
        [0x42u8; 32]
    }

    #[test]
    fn roundtrip_small_literal() {
        let codec = FileCodec::new(65_536).unwrap();
        let plaintext = b"hello world\n";
        let mut ciphertext = Vec::new();
        codec
            .encrypt(
                &key32(),
                plaintext.len() as u64,
                Cursor::new(plaintext),
                &mut ciphertext,
                &CancelToken::new(),
            )
            .unwrap();

        let mut out = Vec::new();
        FileCodec::decrypt(
            &key32(),
            Cursor::new(ciphertext),
            &mut out,
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(out, plaintext);
    }

    #[test]
    fn roundtrip_empty_input() {
        // Empty input encodes as exactly one zero-length plaintext chunk:
        // header(24) + len-prefix(4) + tag(16), no chunk body.
        let codec = FileCodec::new(65_536).unwrap();
        let mut ciphertext = Vec::new();
        codec
            .encrypt(&key32(), 0, Cursor::new(&[]), &mut ciphertext, &CancelToken::new())
            .unwrap();
        assert_eq!(ciphertext.len(), HEADER_LEN + CHUNK_LEN_PREFIX + TAG_LEN);

        let mut out = Vec::new();
        FileCodec::decrypt(&key32(), Cursor::new(ciphertext), &mut out, &CancelToken::new())
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn decrypt_accepts_zero_chunk_encoding_of_empty_input() {
        // A decoder must also accept the alternative empty-input encoding:
        // the header alone, with no chunks at all.
        let mut header = [0u8; HEADER_LEN];
        BigEndian::write_u32(&mut header[NONCE_LEN + 8..], 1_048_576);
        let mut out = Vec::new();
        FileCodec::decrypt(&key32(), Cursor::new(header), &mut out, &CancelToken::new())
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn roundtrip_multi_chunk_pattern() {
        let codec = FileCodec::new(1_048_576).unwrap();
        let len = 2_621_440usize;
        let plaintext: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
        let mut ciphertext = Vec::new();
        codec
            .encrypt(
                &key32(),
                len as u64,
                Cursor::new(&plaintext),
                &mut ciphertext,
                &CancelToken::new(),
            )
            .unwrap();

        // header(24) + 3 chunks * (4-byte len prefix + chunk + 16-byte tag)
        let expected_len = 24 + 20 * 3 + len;
        assert_eq!(ciphertext.len(), expected_len);

        let mut out = Vec::new();
        FileCodec::decrypt(&key32(), Cursor::new(&ciphertext), &mut out, &CancelToken::new())
            .unwrap();
        assert_eq!(out, plaintext);
    }

    #[test]
    fn single_byte_mutation_fails_authentication() {
        let codec = FileCodec::new(1_048_576).unwrap();
        let len = 2_621_440usize;
        let plaintext: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
        let mut ciphertext = Vec::new();
        codec
            .encrypt(
                &key32(),
                len as u64,
                Cursor::new(&plaintext),
                &mut ciphertext,
                &CancelToken::new(),
            )
            .unwrap();

        // First byte of the first chunk's ciphertext: offset 24 (header) + 4 (len prefix).
        ciphertext[24 + 4] ^= 0xFF;

        let mut out = Vec::new();
        let err = FileCodec::decrypt(&key32(), Cursor::new(&ciphertext), &mut out, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
        assert!(out.is_empty());
    }

    #[test]
    fn truncation_is_rejected_via_aad() {
        // Three chunks; drop the final chunk entirely. The remaining stream
        // still parses structurally (header + two well-formed chunks), so
        // only the AAD-bound size field catches the truncation: the
        // decoder hits a clean EOF after two chunks but the header declared
        // more plaintext than was actually produced.
        let codec = FileCodec::new(1_048_576).unwrap();
        let len = 2_621_440usize; // three 1 MiB-ish chunks
        let plaintext: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
        let mut ciphertext = Vec::new();
        codec
            .encrypt(
                &key32(),
                len as u64,
                Cursor::new(&plaintext),
                &mut ciphertext,
                &CancelToken::new(),
            )
            .unwrap();

        // Last chunk ciphertext length = (len - 2*1_048_576) + 16 tag.
        let last_chunk_len = (len - 2 * 1_048_576) + 16;
        let truncated = &ciphertext[..ciphertext.len() - (4 + last_chunk_len)];
        let mut out = Vec::new();
        let err = FileCodec::decrypt(&key32(), Cursor::new(truncated), &mut out, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
    }

    #[test]
    fn decrypt_rejects_oversized_header_chunk_size() {
        let mut header = [0u8; HEADER_LEN];
        BigEndian::write_u64(&mut header[NONCE_LEN..NONCE_LEN + 8], 100);
        BigEndian::write_u32(&mut header[NONCE_LEN + 8..], 32 * 1024 * 1024);
        let mut out = Vec::new();
        let err = FileCodec::decrypt(&key32(), Cursor::new(header), &mut out, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, Error::Bounds(_)));
        assert!(out.is_empty());
    }

    #[test]
    fn nonce_ceiling_rejected_before_any_io() {
        // chunk_size minimal, plaintext length chosen so the chunk count
        // would reach 2^32; we don't actually allocate that much memory,
        // we just check the arithmetic short-circuits.
        let codec = FileCodec::new(MIN_CHUNK_SIZE).unwrap();
        let huge_len = (MAX_CHUNKS) * MIN_CHUNK_SIZE as u64;
        let err = codec
            .encrypt(
                &key32(),
                huge_len,
                Cursor::new(&[] as &[u8]),
                &mut Vec::new(),
                &CancelToken::new(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Bounds(_)));
    }

    #[test]
    fn chunk_size_band_enforced_at_construction() {
        assert!(FileCodec::new(1024).is_err());
        assert!(FileCodec::new(32 * 1024 * 1024).is_err());
        assert!(FileCodec::new(crate::consts::DEFAULT_CHUNK_SIZE).is_ok());
    }
}
