//! Frame codec: sentinel/length framing, zlib compression, optional
//! AES-256-CBC.
//!
//! Compression and decryption are deliberately best-effort: the decoder
//! attempts the inverse transform and treats failure as "the bytes were
//! already plain". That tolerance is what lets clear-text `Connection`
//! frames through while a session key is still being negotiated.

use std::io::{self, Read};

use aes::Aes256;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use flate2::read::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::NetError;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;

// ─── Frame sentinels ──────────────────────────────────────────

/// The start/end tetrads delimiting one frame. Configurable per pipeline but
/// both sides must agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodes {
    pub start: [u8; 4],
    pub end: [u8; 4],
}

impl Default for FrameCodes {
    fn default() -> Self {
        FrameCodes {
            start: [0xFD; 4],
            end: [0xFC; 4],
        }
    }
}

// ─── Compression ──────────────────────────────────────────────

/// Deflate `data`; on failure the input is forwarded unchanged.
pub fn compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(data, Compression::default());
    let mut out = Vec::new();
    match encoder.read_to_end(&mut out) {
        Ok(_) => out,
        Err(err) => {
            tracing::warn!("compression failed, forwarding raw bytes: {err}");
            data.to_vec()
        }
    }
}

/// Inflate `data`; bytes that do not inflate are treated as already plain.
pub fn decompress(data: &[u8]) -> Vec<u8> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    match decoder.read_to_end(&mut out) {
        Ok(_) => out,
        Err(_) => data.to_vec(),
    }
}

// ─── AES-256-CBC ──────────────────────────────────────────────

/// Session key material, base64-encoded for transport inside the
/// `Connection` handshake JSON.
#[derive(Debug, Clone)]
pub struct CipherKeys {
    pub key: String,
    pub iv: String,
}

/// Generate a fresh 32-byte key and 16-byte IV.
pub fn generate_keys() -> CipherKeys {
    let mut key = [0u8; KEY_LEN];
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut key);
    OsRng.fill_bytes(&mut iv);
    CipherKeys {
        key: BASE64.encode(key),
        iv: BASE64.encode(iv),
    }
}

fn decode_keys(keys: &CipherKeys) -> Result<(Vec<u8>, Vec<u8>), NetError> {
    let key = BASE64
        .decode(&keys.key)
        .map_err(|err| NetError::Cipher(format!("invalid key encoding: {err}")))?;
    let iv = BASE64
        .decode(&keys.iv)
        .map_err(|err| NetError::Cipher(format!("invalid iv encoding: {err}")))?;
    Ok((key, iv))
}

/// AES-256-CBC encrypt with PKCS#7 padding.
pub fn encrypt(data: &[u8], keys: &CipherKeys) -> Result<Vec<u8>, NetError> {
    if data.is_empty() {
        return Err(NetError::EmptyPayload);
    }
    let (key, iv) = decode_keys(keys)?;
    let cipher = Aes256CbcEnc::new_from_slices(&key, &iv)
        .map_err(|err| NetError::Cipher(format!("invalid key material: {err}")))?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(data))
}

/// AES-256-CBC decrypt. Fails on anything that is not well-padded ciphertext,
/// which callers use to detect frames that were never encrypted.
pub fn decrypt(data: &[u8], keys: &CipherKeys) -> Result<Vec<u8>, NetError> {
    if data.is_empty() {
        return Err(NetError::EmptyPayload);
    }
    let (key, iv) = decode_keys(keys)?;
    let cipher = Aes256CbcDec::new_from_slices(&key, &iv)
        .map_err(|err| NetError::Cipher(format!("invalid key material: {err}")))?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(data)
        .map_err(|err| NetError::Cipher(format!("decryption failed: {err}")))
}

// ─── Framing ──────────────────────────────────────────────────

/// Read one framed payload.
///
/// The state machine reads exactly the bytes each state needs: start bytes
/// one at a time (a mismatch drops the byte and restarts the match without
/// re-scanning), then the eight-byte little-endian length, then the payload
/// in chunks no larger than `buffer_size`, then the end tetrad. An end-code
/// mismatch drops the whole frame and framing restarts.
///
/// Returns the payload of the first valid frame, or the underlying I/O error
/// (EOF surfaces as `UnexpectedEof`).
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    codes: &FrameCodes,
    buffer_size: usize,
) -> io::Result<Vec<u8>> {
    let buffer_size = buffer_size.max(1);
    let mut chunk = vec![0u8; buffer_size];

    'frame: loop {
        let mut matched = 0;
        while matched < codes.start.len() {
            let mut byte = [0u8; 1];
            reader.read_exact(&mut byte).await?;
            if byte[0] == codes.start[matched] {
                matched += 1;
            } else {
                tracing::trace!("received unknown byte on the wire: {:#04x}", byte[0]);
                matched = 0;
            }
        }

        let mut len_bytes = [0u8; 8];
        reader.read_exact(&mut len_bytes).await?;
        let mut remaining = u64::from_le_bytes(len_bytes) as usize;

        let mut payload = Vec::new();
        while remaining > 0 {
            let take = remaining.min(buffer_size);
            reader.read_exact(&mut chunk[..take]).await?;
            payload.extend_from_slice(&chunk[..take]);
            remaining -= take;
        }

        for expected in codes.end {
            let mut byte = [0u8; 1];
            reader.read_exact(&mut byte).await?;
            if byte[0] != expected {
                tracing::debug!("drop read data: not matched end code");
                continue 'frame;
            }
        }

        return Ok(payload);
    }
}

/// Write one framed payload: `start || u64_le(len) || payload || end`, the
/// payload chunked so no single write exceeds `buffer_size`.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    codes: &FrameCodes,
    payload: &[u8],
    buffer_size: usize,
) -> io::Result<()> {
    let buffer_size = buffer_size.max(1);
    writer.write_all(&codes.start).await?;
    writer
        .write_all(&(payload.len() as u64).to_le_bytes())
        .await?;
    for chunk in payload.chunks(buffer_size) {
        writer.write_all(chunk).await?;
    }
    writer.write_all(&codes.end).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn frame_round_trip() {
        let (mut near, mut far) = tokio::io::duplex(4096);
        let codes = FrameCodes::default();
        let payload: Vec<u8> = (0..=255).collect();

        write_frame(&mut near, &codes, &payload, 64).await.unwrap();
        let read = read_frame(&mut far, &codes, 64).await.unwrap();
        assert_eq!(read, payload);
    }

    #[tokio::test]
    async fn empty_payload_frame() {
        let (mut near, mut far) = tokio::io::duplex(256);
        let codes = FrameCodes::default();

        write_frame(&mut near, &codes, &[], 16).await.unwrap();
        let read = read_frame(&mut far, &codes, 16).await.unwrap();
        assert!(read.is_empty());
    }

    #[tokio::test]
    async fn junk_before_frame_is_dropped() {
        let (mut near, mut far) = tokio::io::duplex(4096);
        let codes = FrameCodes::default();

        // A stray byte, a partial start code, then a valid frame.
        near.write_all(&[0xAB]).await.unwrap();
        near.write_all(&codes.start[..2]).await.unwrap();
        near.write_all(&[0x00]).await.unwrap();
        write_frame(&mut near, &codes, b"still here", 32)
            .await
            .unwrap();

        let read = read_frame(&mut far, &codes, 32).await.unwrap();
        assert_eq!(read, b"still here");
    }

    #[tokio::test]
    async fn bad_end_code_drops_frame_and_resyncs() {
        let (mut near, mut far) = tokio::io::duplex(4096);
        let codes = FrameCodes::default();

        // Hand-build a frame whose end code is wrong.
        near.write_all(&codes.start).await.unwrap();
        near.write_all(&(4u64).to_le_bytes()).await.unwrap();
        near.write_all(b"lost").await.unwrap();
        near.write_all(&[0xFC, 0xFC, 0xFC, 0x00]).await.unwrap();
        write_frame(&mut near, &codes, b"delivered", 32)
            .await
            .unwrap();

        let read = read_frame(&mut far, &codes, 32).await.unwrap();
        assert_eq!(read, b"delivered");
    }

    #[tokio::test]
    async fn eof_mid_frame_is_an_error() {
        let (mut near, mut far) = tokio::io::duplex(4096);
        let codes = FrameCodes::default();

        near.write_all(&codes.start).await.unwrap();
        near.write_all(&(100u64).to_le_bytes()).await.unwrap();
        near.write_all(b"short").await.unwrap();
        drop(near);

        let err = read_frame(&mut far, &codes, 32).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn custom_codes_must_agree() {
        let (mut near, mut far) = tokio::io::duplex(4096);
        let sender = FrameCodes {
            start: [1, 2, 3, 4],
            end: [4, 3, 2, 1],
        };

        write_frame(&mut near, &sender, b"tagged", 32).await.unwrap();
        drop(near);

        // A receiver with the default codes never syncs.
        let err = read_frame(&mut far, &FrameCodes::default(), 32)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn compression_round_trip() {
        let data = b"abcabcabcabcabcabcabcabc".repeat(64);
        let packed = compress(&data);
        assert!(packed.len() < data.len());
        assert_eq!(decompress(&packed), data);
    }

    #[test]
    fn decompress_falls_back_to_raw() {
        let data = vec![0x01, 0x02, 0x03, 0x04];
        assert_eq!(decompress(&data), data);
    }

    #[test]
    fn cipher_round_trip() {
        let keys = generate_keys();
        let data = b"secret payload".to_vec();
        let sealed = encrypt(&data, &keys).unwrap();
        assert_ne!(sealed, data);
        assert_eq!(decrypt(&sealed, &keys).unwrap(), data);
    }

    #[test]
    fn decrypt_rejects_plaintext() {
        let keys = generate_keys();
        // Not block-aligned, so this cannot be AES-CBC ciphertext.
        assert!(decrypt(b"clearly not encrypted", &keys).is_err());
    }

    #[test]
    fn decrypt_with_other_keys_fails_or_differs() {
        let keys = generate_keys();
        let other = generate_keys();
        let data = b"cross-key material".to_vec();
        let sealed = encrypt(&data, &keys).unwrap();
        match decrypt(&sealed, &other) {
            Ok(out) => assert_ne!(out, data),
            Err(_) => {}
        }
    }

    #[test]
    fn generated_keys_have_expected_lengths() {
        let keys = generate_keys();
        assert_eq!(BASE64.decode(&keys.key).unwrap().len(), KEY_LEN);
        assert_eq!(BASE64.decode(&keys.iv).unwrap().len(), IV_LEN);
    }
}
