//! Streaming AES-256-GCM over whole files.
//!
//! The file is a single GCM message with empty associated data, so the
//! envelope `nonce || ciphertext || tag` is byte-identical to a one-shot
//! AES-256-GCM encryption while memory stays bounded by [`CHUNK_SIZE`].

use super::{EncryptionKey, NONCE_LEN, TAG_LEN};
use crate::utils::{BackupError, Result};
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use aes::Aes256;
use ctr::Ctr32BE;
use ghash::universal_hash::UniversalHash;
use ghash::GHash;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Plaintext is processed in chunks of this size.
pub const CHUNK_SIZE: usize = 64 * 1024;

const BLOCK_LEN: usize = 16;

/// Largest message GCM can protect with a 32-bit block counter.
const MAX_MESSAGE_LEN: u64 = ((1u64 << 32) - 2) * BLOCK_LEN as u64;

type Block = GenericArray<u8, aes::cipher::consts::U16>;

/// Incremental GCM state for one message.
struct GcmStream {
    keystream: Ctr32BE<Aes256>,
    ghash: GHash,
    tag_mask: Block,
    pending: [u8; BLOCK_LEN],
    pending_len: usize,
    message_len: u64,
}

impl GcmStream {
    fn new(key: &EncryptionKey, nonce: &[u8; NONCE_LEN]) -> Self {
        let cipher = Aes256::new(GenericArray::from_slice(key.as_bytes()));

        let mut hash_key = Block::default();
        cipher.encrypt_block(&mut hash_key);
        let ghash = GHash::new(&hash_key);

        // J0 = nonce || 1; its encryption masks the tag
        let mut tag_mask = Block::default();
        tag_mask[..NONCE_LEN].copy_from_slice(nonce);
        tag_mask[BLOCK_LEN - 1] = 1;
        cipher.encrypt_block(&mut tag_mask);

        // Payload keystream starts at J0 + 1
        let mut counter = [0u8; BLOCK_LEN];
        counter[..NONCE_LEN].copy_from_slice(nonce);
        counter[BLOCK_LEN - 1] = 2;
        let keystream = Ctr32BE::<Aes256>::new(
            GenericArray::from_slice(key.as_bytes()),
            GenericArray::from_slice(&counter),
        );

        Self {
            keystream,
            ghash,
            tag_mask,
            pending: [0u8; BLOCK_LEN],
            pending_len: 0,
            message_len: 0,
        }
    }

    fn encrypt_chunk(&mut self, buf: &mut [u8]) -> Result<()> {
        self.apply_keystream(buf)?;
        self.absorb(buf);
        Ok(())
    }

    fn decrypt_chunk(&mut self, buf: &mut [u8]) -> Result<()> {
        self.absorb(buf);
        self.apply_keystream(buf)
    }

    fn apply_keystream(&mut self, buf: &mut [u8]) -> Result<()> {
        let total = self.message_len + buf.len() as u64;
        if total > MAX_MESSAGE_LEN {
            return Err(BackupError::Encryption(format!(
                "message exceeds the GCM limit of {} bytes",
                MAX_MESSAGE_LEN
            )));
        }
        self.keystream
            .try_apply_keystream(buf)
            .map_err(|_| BackupError::Encryption("GCM counter exhausted".to_string()))?;
        self.message_len = total;
        Ok(())
    }

    /// Feed ciphertext into GHASH, carrying partial blocks across calls.
    fn absorb(&mut self, mut data: &[u8]) {
        if self.pending_len > 0 {
            let take = (BLOCK_LEN - self.pending_len).min(data.len());
            self.pending[self.pending_len..self.pending_len + take].copy_from_slice(&data[..take]);
            self.pending_len += take;
            data = &data[take..];
            if self.pending_len < BLOCK_LEN {
                return;
            }
            self.ghash.update(&[Block::clone_from_slice(&self.pending)]);
            self.pending_len = 0;
        }

        let whole = data.len() - data.len() % BLOCK_LEN;
        for block in data[..whole].chunks_exact(BLOCK_LEN) {
            self.ghash.update(&[Block::clone_from_slice(block)]);
        }

        let rest = &data[whole..];
        self.pending[..rest.len()].copy_from_slice(rest);
        self.pending_len = rest.len();
    }

    fn finish_hash(mut self) -> (GHash, Block) {
        if self.pending_len > 0 {
            self.ghash.update_padded(&self.pending[..self.pending_len]);
        }
        // len(A) = 0 || len(C) in bits
        let mut lengths = Block::default();
        lengths[8..].copy_from_slice(&(self.message_len * 8).to_be_bytes());
        self.ghash.update(&[lengths]);
        (self.ghash, self.tag_mask)
    }

    fn tag(self) -> [u8; TAG_LEN] {
        let (ghash, mask) = self.finish_hash();
        let mut tag = [0u8; TAG_LEN];
        for (i, (s, m)) in ghash.finalize().iter().zip(mask.iter()).enumerate() {
            tag[i] = s ^ m;
        }
        tag
    }

    /// Constant-time tag comparison.
    fn verify(self, tag: &[u8; TAG_LEN]) -> Result<()> {
        let (ghash, mask) = self.finish_hash();
        let mut expected = Block::default();
        for (i, (t, m)) in tag.iter().zip(mask.iter()).enumerate() {
            expected[i] = t ^ m;
        }
        ghash
            .verify(&expected)
            .map_err(|_| BackupError::AuthenticationFailed)
    }
}

/// Encrypt `input` into `output` as `nonce || ciphertext || tag`.
///
/// Returns the size of the written envelope. A partially written output is
/// removed on failure.
pub fn encrypt_file(
    key: &EncryptionKey,
    nonce: &[u8; NONCE_LEN],
    input: &Path,
    output: &Path,
) -> Result<u64> {
    let result = write_envelope(key, nonce, input, output);
    if result.is_err() {
        let _ = fs::remove_file(output);
    }
    result
}

fn write_envelope(
    key: &EncryptionKey,
    nonce: &[u8; NONCE_LEN],
    input: &Path,
    output: &Path,
) -> Result<u64> {
    let mut reader = File::open(input)?;
    let mut writer = BufWriter::new(File::create(output)?);
    let mut gcm = GcmStream::new(key, nonce);

    writer.write_all(nonce)?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = read_full(&mut reader, &mut buf)?;
        if n == 0 {
            break;
        }
        gcm.encrypt_chunk(&mut buf[..n])?;
        writer.write_all(&buf[..n])?;
    }
    let written = (NONCE_LEN + TAG_LEN) as u64 + gcm.message_len;
    writer.write_all(&gcm.tag())?;

    let file = writer
        .into_inner()
        .map_err(|e| BackupError::Io(e.into_error()))?;
    file.sync_all()?;
    Ok(written)
}

/// Decrypt an envelope produced by [`encrypt_file`].
///
/// Plaintext goes to a sibling `.partial` file that is renamed over `output`
/// only after the tag verifies; on any failure nothing is left at either path.
pub fn decrypt_file(key: &EncryptionKey, input: &Path, output: &Path) -> Result<u64> {
    let partial = partial_path(output);
    match read_envelope(key, input, &partial) {
        Ok(len) => {
            fs::rename(&partial, output)?;
            Ok(len)
        }
        Err(e) => {
            let _ = fs::remove_file(&partial);
            Err(e)
        }
    }
}

fn read_envelope(key: &EncryptionKey, input: &Path, partial: &Path) -> Result<u64> {
    let mut reader = File::open(input)?;
    let total = reader.metadata()?.len();
    let overhead = (NONCE_LEN + TAG_LEN) as u64;
    if total < overhead {
        return Err(BackupError::Encryption(format!(
            "encrypted file is {} bytes, shorter than the {} byte envelope",
            total, overhead
        )));
    }

    let mut nonce = [0u8; NONCE_LEN];
    reader.read_exact(&mut nonce)?;

    let mut gcm = GcmStream::new(key, &nonce);
    let mut writer = BufWriter::new(File::create(partial)?);
    let mut remaining = total - overhead;
    let mut buf = vec![0u8; CHUNK_SIZE];
    while remaining > 0 {
        let want = remaining.min(CHUNK_SIZE as u64) as usize;
        reader.read_exact(&mut buf[..want])?;
        gcm.decrypt_chunk(&mut buf[..want])?;
        writer.write_all(&buf[..want])?;
        remaining -= want as u64;
    }
    let plaintext_len = gcm.message_len;

    let mut tag = [0u8; TAG_LEN];
    reader.read_exact(&mut tag)?;
    gcm.verify(&tag)?;

    writer
        .into_inner()
        .map_err(|e| BackupError::Io(e.into_error()))?
        .sync_all()?;
    Ok(plaintext_len)
}

fn partial_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

/// Read until `buf` is full or EOF.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
