//! Payload encryption for `.intunewin` containers
//!
//! Layout of the encrypted payload: `HMAC(32) || IV(16) || AES-256-CBC(PKCS7)`.
//! The HMAC-SHA256 covers `IV || ciphertext` and uses a key separate from the
//! encryption key. The file digest is SHA-256 over the plaintext.

use crate::error::{IntunePackError, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::generic_array::GenericArray;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::io::{Read, Seek, SeekFrom, Write};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;
pub const MAC_LEN: usize = 32;
const BLOCK_LEN: usize = 16;
const READ_BUFFER: usize = 64 * 1024;

/// Key material and digests produced while encrypting a payload
#[derive(Debug, Clone)]
pub struct EncryptedPayload {
    pub encryption_key: [u8; KEY_LEN],
    pub mac_key: [u8; KEY_LEN],
    pub iv: [u8; IV_LEN],
    pub mac: [u8; MAC_LEN],
    pub file_digest: [u8; 32],
    pub plain_size: u64,
    pub encrypted_size: u64,
}

impl EncryptedPayload {
    pub fn encryption_key_b64(&self) -> String {
        BASE64.encode(self.encryption_key)
    }

    pub fn mac_key_b64(&self) -> String {
        BASE64.encode(self.mac_key)
    }

    pub fn iv_b64(&self) -> String {
        BASE64.encode(self.iv)
    }

    pub fn mac_b64(&self) -> String {
        BASE64.encode(self.mac)
    }

    pub fn file_digest_b64(&self) -> String {
        BASE64.encode(self.file_digest)
    }
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

fn crypto_err(e: impl std::fmt::Display) -> IntunePackError {
    IntunePackError::CryptoError(e.to_string())
}

/// Encrypt `reader` into `writer` with fresh random keys
pub fn encrypt_stream<R: Read, W: Write + Seek>(
    reader: &mut R,
    writer: &mut W,
) -> Result<EncryptedPayload> {
    encrypt_stream_with_keys(reader, writer, random_bytes(), random_bytes(), random_bytes())
}

pub(crate) fn encrypt_stream_with_keys<R: Read, W: Write + Seek>(
    reader: &mut R,
    writer: &mut W,
    encryption_key: [u8; KEY_LEN],
    mac_key: [u8; KEY_LEN],
    iv: [u8; IV_LEN],
) -> Result<EncryptedPayload> {
    let mut cipher = Aes256CbcEnc::new_from_slices(&encryption_key, &iv).map_err(crypto_err)?;
    let mut mac = <HmacSha256 as Mac>::new_from_slice(&mac_key).map_err(crypto_err)?;
    let mut digest = Sha256::new();

    let start = writer.stream_position()?;
    // HMAC placeholder, filled in once the ciphertext is known
    writer.write_all(&[0u8; MAC_LEN])?;
    writer.write_all(&iv)?;
    mac.update(&iv);

    let mut buffer = vec![0u8; READ_BUFFER];
    let mut pending: Vec<u8> = Vec::with_capacity(READ_BUFFER + BLOCK_LEN);
    let mut plain_size = 0u64;
    let mut cipher_size = 0u64;

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        plain_size += read as u64;
        digest.update(&buffer[..read]);
        pending.extend_from_slice(&buffer[..read]);

        let whole = pending.len() - pending.len() % BLOCK_LEN;
        for block in pending[..whole].chunks_exact_mut(BLOCK_LEN) {
            cipher.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        writer.write_all(&pending[..whole])?;
        mac.update(&pending[..whole]);
        cipher_size += whole as u64;
        pending.drain(..whole);
    }

    // PKCS7 always emits a final block, a full one when the input was aligned
    let mut last = [0u8; BLOCK_LEN];
    last[..pending.len()].copy_from_slice(&pending);
    let tail = cipher
        .encrypt_padded_mut::<Pkcs7>(&mut last, pending.len())
        .map_err(crypto_err)?;
    writer.write_all(tail)?;
    mac.update(tail);
    cipher_size += tail.len() as u64;

    let mac_bytes: [u8; MAC_LEN] = mac.finalize().into_bytes().into();
    let end = writer.stream_position()?;
    writer.seek(SeekFrom::Start(start))?;
    writer.write_all(&mac_bytes)?;
    writer.seek(SeekFrom::Start(end))?;
    writer.flush()?;

    Ok(EncryptedPayload {
        encryption_key,
        mac_key,
        iv,
        mac: mac_bytes,
        file_digest: digest.finalize().into(),
        plain_size,
        encrypted_size: (MAC_LEN + IV_LEN) as u64 + cipher_size,
    })
}

/// Digests recovered while decrypting a payload
#[derive(Debug, Clone)]
pub struct DecryptedPayload {
    pub mac: [u8; MAC_LEN],
    pub file_digest: [u8; 32],
    pub plain_size: u64,
}

/// Check the HMAC over the whole payload, then decrypt it into `writer`
///
/// Reads `reader` twice, once for the HMAC and once for the plaintext, so
/// nothing is written unless the payload is authentic.
pub fn decrypt_stream<R: Read + Seek, W: Write>(
    reader: &mut R,
    writer: &mut W,
    encryption_key: &[u8],
    mac_key: &[u8],
) -> Result<DecryptedPayload> {
    let start = reader.stream_position()?;
    let mut stored_mac = [0u8; MAC_LEN];
    reader
        .read_exact(&mut stored_mac)
        .map_err(|_| IntunePackError::CryptoError("payload too short".into()))?;

    let mut mac = <HmacSha256 as Mac>::new_from_slice(mac_key).map_err(crypto_err)?;
    let mut buffer = vec![0u8; READ_BUFFER];
    let mut body_len = 0u64;
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        mac.update(&buffer[..read]);
        body_len += read as u64;
    }

    let min_len = (IV_LEN + BLOCK_LEN) as u64;
    if body_len < min_len || (body_len - IV_LEN as u64) % BLOCK_LEN as u64 != 0 {
        return Err(IntunePackError::CryptoError(format!(
            "payload is not IV plus whole AES blocks ({} bytes)",
            body_len + MAC_LEN as u64
        )));
    }
    mac.verify_slice(&stored_mac)
        .map_err(|_| IntunePackError::CryptoError("HMAC mismatch, payload was modified".into()))?;

    reader.seek(SeekFrom::Start(start + MAC_LEN as u64))?;
    let mut iv = [0u8; IV_LEN];
    reader.read_exact(&mut iv)?;
    let mut cipher = Aes256CbcDec::new_from_slices(encryption_key, &iv).map_err(crypto_err)?;
    let mut digest = Sha256::new();
    let mut plain_size = 0u64;

    // the last block carries the padding and is handled separately
    let mut remaining = body_len - IV_LEN as u64 - BLOCK_LEN as u64;
    while remaining > 0 {
        let take = remaining.min(READ_BUFFER as u64) as usize;
        reader.read_exact(&mut buffer[..take])?;
        for block in buffer[..take].chunks_exact_mut(BLOCK_LEN) {
            cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        digest.update(&buffer[..take]);
        writer.write_all(&buffer[..take])?;
        plain_size += take as u64;
        remaining -= take as u64;
    }

    let mut last = [0u8; BLOCK_LEN];
    reader.read_exact(&mut last)?;
    let tail = cipher
        .decrypt_padded_mut::<Pkcs7>(&mut last)
        .map_err(|e| IntunePackError::CryptoError(format!("invalid padding: {}", e)))?;
    digest.update(tail);
    writer.write_all(tail)?;
    plain_size += tail.len() as u64;
    writer.flush()?;

    Ok(DecryptedPayload {
        mac: stored_mac,
        file_digest: digest.finalize().into(),
        plain_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn encrypt(data: &[u8]) -> (EncryptedPayload, Vec<u8>) {
        let mut out = Cursor::new(Vec::new());
        let payload = encrypt_stream(&mut Cursor::new(data), &mut out).unwrap();
        (payload, out.into_inner())
    }

    fn decrypt(bytes: &[u8], payload: &EncryptedPayload) -> Result<(DecryptedPayload, Vec<u8>)> {
        let mut plain = Vec::new();
        let decrypted = decrypt_stream(
            &mut Cursor::new(bytes),
            &mut plain,
            &payload.encryption_key,
            &payload.mac_key,
        )?;
        Ok((decrypted, plain))
    }

    #[test]
    fn test_sizes_for_aligned_and_unaligned_input() {
        // 32 aligned bytes gain a full padding block, 33 bytes pad up to 48
        let (aligned, bytes) = encrypt(&[7u8; 32]);
        assert_eq!(aligned.encrypted_size, (MAC_LEN + IV_LEN + 48) as u64);
        assert_eq!(bytes.len() as u64, aligned.encrypted_size);

        let (unaligned, _) = encrypt(&[7u8; 33]);
        assert_eq!(unaligned.encrypted_size, (MAC_LEN + IV_LEN + 48) as u64);
        assert_eq!(unaligned.plain_size, 33);
    }

    #[test]
    fn test_decrypt_recovers_input_across_buffer_boundaries() {
        let data: Vec<u8> = (0..(READ_BUFFER * 2 + 5)).map(|i| (i % 251) as u8).collect();
        let (payload, bytes) = encrypt(&data);

        assert_eq!(&bytes[..MAC_LEN], &payload.mac);
        assert_eq!(&bytes[MAC_LEN..MAC_LEN + IV_LEN], &payload.iv);
        assert_eq!(&payload.file_digest[..], &Sha256::digest(&data)[..]);

        let (decrypted, plain) = decrypt(&bytes, &payload).unwrap();
        assert_eq!(plain, data);
        assert_eq!(decrypted.plain_size, data.len() as u64);
        assert_eq!(decrypted.file_digest, payload.file_digest);
        assert_eq!(decrypted.mac, payload.mac);
    }

    #[test]
    fn test_decrypt_aligned_input_strips_full_padding_block() {
        let data = vec![9u8; READ_BUFFER];
        let (payload, bytes) = encrypt(&data);
        let (decrypted, plain) = decrypt(&bytes, &payload).unwrap();
        assert_eq!(decrypted.plain_size, READ_BUFFER as u64);
        assert_eq!(plain, data);
    }

    #[test]
    fn test_truncated_payload_is_rejected_before_output() {
        let (payload, bytes) = encrypt(&[1u8; 100]);
        let mut plain = Vec::new();
        let err = decrypt_stream(
            &mut Cursor::new(&bytes[..bytes.len() - 3]),
            &mut plain,
            &payload.encryption_key,
            &payload.mac_key,
        )
        .unwrap_err();
        assert!(err.to_string().contains("whole AES blocks"));
        assert!(plain.is_empty());
    }

    #[test]
    fn test_tampered_payload_is_rejected() {
        let (payload, mut bytes) = encrypt(b"setup.exe /S");
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let err = decrypt(&bytes, &payload).unwrap_err();
        assert!(err.to_string().contains("HMAC"));
    }

    #[test]
    fn test_fixed_keys_are_deterministic() {
        let run = || {
            let mut out = Cursor::new(Vec::new());
            encrypt_stream_with_keys(
                &mut Cursor::new(b"payload"),
                &mut out,
                [1u8; KEY_LEN],
                [2u8; KEY_LEN],
                [3u8; IV_LEN],
            )
            .unwrap();
            out.into_inner()
        };
        assert_eq!(run(), run());
    }
}
