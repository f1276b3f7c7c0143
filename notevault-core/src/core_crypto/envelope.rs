/*
    envelope.rs - IV-prefixed AES-256-GCM envelope

    Format (identical for the one-shot and the streaming paths):

        [IV: 12 bytes][ciphertext: len(plaintext)][tag: 16 bytes]

    A fresh IV is drawn from the OS RNG on every encryption.

    The streaming path exists so that multi-megabyte files can be encrypted
    and re-keyed in bounded memory. aes-gcm only offers whole-buffer AEAD, so
    the stream is assembled from the same primitives aes-gcm composes:
    AES-256 in 32-bit big-endian counter mode plus GHASH over the ciphertext.
    The tag is produced (or checked) only after the last input byte.

    decrypt_stream writes plaintext before the tag has been verified. Callers
    must send that output somewhere disposable and drop it if this function
    returns an error.
*/

use super::errors::{CryptoError, CryptoResult};
use super::master_key::MasterKey;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use aes::Aes256;
use aes_gcm::aead::{Aead, AeadCore, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use ghash::universal_hash::UniversalHash;
use ghash::GHash;
use std::io::{ErrorKind, Read, Write};
use subtle::ConstantTimeEq;

/// IV length for AES-GCM (12 bytes = 96 bits)
pub const IV_LEN: usize = 12;

/// GCM authentication tag length
pub const TAG_LEN: usize = 16;

/// Default chunk size for streaming operations
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

const BLOCK_LEN: usize = 16;

/// GCM limit on a single message: (2^32 - 2) counter blocks
const MAX_STREAM_LEN: u64 = ((1u64 << 32) - 2) * BLOCK_LEN as u64;

type Aes256Ctr = ctr::Ctr32BE<Aes256>;

/// Encrypt `plaintext` into a new envelope
pub fn encrypt(key: &MasterKey, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = key
        .cipher()
        .encrypt(&nonce, plaintext)
        .map_err(|e| CryptoError::Cipher(e.to_string()))?;

    let mut result = Vec::with_capacity(IV_LEN + ciphertext.len());
    result.extend_from_slice(&nonce);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Decrypt an envelope produced by [`encrypt`] or [`encrypt_stream`]
pub fn decrypt(key: &MasterKey, envelope: &[u8]) -> CryptoResult<Vec<u8>> {
    if envelope.len() < IV_LEN + TAG_LEN {
        return Err(CryptoError::Truncated {
            len: envelope.len(),
        });
    }

    let nonce = Nonce::from_slice(&envelope[..IV_LEN]);

    key.cipher()
        .decrypt(nonce, &envelope[IV_LEN..])
        .map_err(|_| CryptoError::Authentication)
}

/// Encrypt everything `reader` yields into `writer`, `chunk_size` bytes at a time
///
/// Returns the number of envelope bytes written.
pub fn encrypt_stream<R: Read, W: Write>(
    key: &MasterKey,
    mut reader: R,
    writer: W,
    chunk_size: usize,
) -> CryptoResult<u64> {
    let mut sealed = EncryptingWriter::new(key, writer)?;

    let mut buf = vec![0u8; chunk_size.max(1)];
    loop {
        let n = read_some(&mut reader, &mut buf)?;
        if n == 0 {
            break;
        }
        sealed.write_all(&buf[..n])?;
    }

    let written = sealed.envelope_len();
    sealed.finish()?;
    Ok(written)
}

/// `Write` adapter that seals everything written to it into one envelope
///
/// The IV is written on construction and the tag by [`EncryptingWriter::finish`].
/// Dropping the writer without calling `finish` leaves an envelope that will
/// never authenticate.
pub struct EncryptingWriter<W: Write> {
    inner: W,
    gcm: StreamingGcm,
    scratch: Vec<u8>,
}

impl<W: Write> EncryptingWriter<W> {
    pub fn new(key: &MasterKey, mut inner: W) -> CryptoResult<Self> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&nonce);

        inner.write_all(&iv)?;

        Ok(EncryptingWriter {
            inner,
            gcm: StreamingGcm::new(key, &iv),
            scratch: Vec::with_capacity(DEFAULT_CHUNK_SIZE),
        })
    }

    /// Envelope bytes produced so far plus the pending tag
    pub fn envelope_len(&self) -> u64 {
        (IV_LEN + TAG_LEN) as u64 + self.gcm.ciphertext_len
    }

    /// Append the tag and hand back the inner writer
    pub fn finish(self) -> CryptoResult<W> {
        let EncryptingWriter { mut inner, gcm, .. } = self;
        let tag = gcm.finalize();
        inner.write_all(&tag)?;
        inner.flush()?;
        Ok(inner)
    }
}

impl<W: Write> Write for EncryptingWriter<W> {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        let n = data.len().min(DEFAULT_CHUNK_SIZE);
        self.scratch.clear();
        self.scratch.extend_from_slice(&data[..n]);

        self.gcm
            .encrypt_chunk(&mut self.scratch)
            .map_err(|e| std::io::Error::new(ErrorKind::Other, e))?;
        self.inner.write_all(&self.scratch)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Decrypt an envelope read from `reader` into `writer`
///
/// The trailing tag is held back while streaming and verified once the
/// reader is exhausted. Returns the number of plaintext bytes written.
pub fn decrypt_stream<R: Read, W: Write>(
    key: &MasterKey,
    mut reader: R,
    mut writer: W,
    chunk_size: usize,
) -> CryptoResult<u64> {
    let mut iv = [0u8; IV_LEN];
    let got = read_full(&mut reader, &mut iv)?;
    if got < IV_LEN {
        return Err(CryptoError::Truncated { len: got });
    }

    let mut gcm = StreamingGcm::new(key, &iv);

    let mut buf = vec![0u8; chunk_size.max(1) + TAG_LEN];
    let mut held = 0usize;
    let mut plaintext_len = 0u64;
    loop {
        let n = read_some(&mut reader, &mut buf[held..])?;
        if n == 0 {
            break;
        }
        held += n;

        if held > TAG_LEN {
            let ready = held - TAG_LEN;
            gcm.decrypt_chunk(&mut buf[..ready])?;
            writer.write_all(&buf[..ready])?;
            plaintext_len += ready as u64;
            buf.copy_within(ready..held, 0);
            held = TAG_LEN;
        }
    }

    if held < TAG_LEN {
        return Err(CryptoError::Truncated {
            len: IV_LEN + plaintext_len as usize + held,
        });
    }

    let expected = gcm.finalize();
    if !bool::from(expected[..].ct_eq(&buf[..TAG_LEN])) {
        return Err(CryptoError::Authentication);
    }

    writer.flush()?;
    Ok(plaintext_len)
}

/// Incremental AES-256-GCM with an empty AAD
struct StreamingGcm {
    keystream: Aes256Ctr,
    ghash: GHash,
    /// E(K, J0), XORed into the GHASH output to form the tag
    tag_mask: [u8; BLOCK_LEN],
    partial: [u8; BLOCK_LEN],
    partial_len: usize,
    ciphertext_len: u64,
}

impl StreamingGcm {
    fn new(key: &MasterKey, iv: &[u8; IV_LEN]) -> Self {
        let key_bytes = GenericArray::from_slice(&key.as_bytes()[..]);
        let block_cipher = Aes256::new(key_bytes);

        let mut hash_key = GenericArray::from([0u8; BLOCK_LEN]);
        block_cipher.encrypt_block(&mut hash_key);

        // J0 = IV || 0^31 || 1
        let mut counter = [0u8; BLOCK_LEN];
        counter[..IV_LEN].copy_from_slice(iv);
        counter[BLOCK_LEN - 1] = 1;

        let mut mask = GenericArray::from(counter);
        block_cipher.encrypt_block(&mut mask);
        let mut tag_mask = [0u8; BLOCK_LEN];
        tag_mask.copy_from_slice(&mask);

        // Payload keystream starts at inc32(J0)
        counter[BLOCK_LEN - 1] = 2;
        let keystream = Aes256Ctr::new(key_bytes, GenericArray::from_slice(&counter));

        StreamingGcm {
            keystream,
            ghash: GHash::new(&hash_key),
            tag_mask,
            partial: [0u8; BLOCK_LEN],
            partial_len: 0,
            ciphertext_len: 0,
        }
    }

    fn encrypt_chunk(&mut self, data: &mut [u8]) -> CryptoResult<()> {
        self.check_len(data.len())?;
        self.keystream.apply_keystream(data);
        self.absorb(data);
        Ok(())
    }

    fn decrypt_chunk(&mut self, data: &mut [u8]) -> CryptoResult<()> {
        self.check_len(data.len())?;
        self.absorb(data);
        self.keystream.apply_keystream(data);
        Ok(())
    }

    fn check_len(&self, additional: usize) -> CryptoResult<()> {
        if self.ciphertext_len + additional as u64 > MAX_STREAM_LEN {
            return Err(CryptoError::Cipher(
                "Stream exceeds the GCM message length limit".to_string(),
            ));
        }
        Ok(())
    }

    /// Feed ciphertext into GHASH, buffering partial blocks across chunks
    fn absorb(&mut self, mut data: &[u8]) {
        self.ciphertext_len += data.len() as u64;

        if self.partial_len > 0 {
            let take = (BLOCK_LEN - self.partial_len).min(data.len());
            self.partial[self.partial_len..self.partial_len + take].copy_from_slice(&data[..take]);
            self.partial_len += take;
            data = &data[take..];

            if self.partial_len < BLOCK_LEN {
                return;
            }
            let block = GenericArray::from(self.partial);
            self.ghash.update(&[block]);
            self.partial_len = 0;
        }

        let mut blocks = data.chunks_exact(BLOCK_LEN);
        for chunk in &mut blocks {
            self.ghash.update(&[GenericArray::clone_from_slice(chunk)]);
        }

        let rest = blocks.remainder();
        self.partial[..rest.len()].copy_from_slice(rest);
        self.partial_len = rest.len();
    }

    fn finalize(mut self) -> [u8; TAG_LEN] {
        if self.partial_len > 0 {
            self.ghash.update_padded(&self.partial[..self.partial_len]);
        }

        // len(A) || len(C), in bits
        let mut lengths = [0u8; BLOCK_LEN];
        lengths[8..].copy_from_slice(&(self.ciphertext_len * 8).to_be_bytes());
        self.ghash.update(&[GenericArray::from(lengths)]);

        let digest = self.ghash.finalize();
        let mut tag = [0u8; TAG_LEN];
        for (i, byte) in tag.iter_mut().enumerate() {
            *byte = digest[i] ^ self.tag_mask[i];
        }
        tag
    }
}

fn read_some<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    loop {
        match reader.read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Fill `buf` unless the reader ends first; returns how many bytes were read
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = read_some(reader, &mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
