//! Artifact encoding: gzip compression, AES-256-GCM encryption and checksums.
//!
//! Artifacts are streamed file to file and never held in memory whole.
//! Encrypted artifacts are laid out as `LCE2 | nonce prefix (7 bytes) |
//! segments`, each segment sealing up to 64 KiB of the compressed stream with
//! the STREAM construction, so truncation and reordering are detected.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::stream::{DecryptorBE32, EncryptorBE32};
use aes_gcm::aead::{AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key};
use flate2::write::{GzDecoder, GzEncoder};
use sha2::{Digest, Sha256};

use super::metadata::Compression;
use crate::error::{LifecycleError, Result};

const ENCRYPTION_MAGIC: &[u8; 4] = b"LCE2";
const NONCE_PREFIX_LEN: usize = 7;
const HEADER_LEN: usize = ENCRYPTION_MAGIC.len() + NONCE_PREFIX_LEN;
/// Plaintext bytes per sealed segment.
const SEGMENT_LEN: usize = 64 * 1024;
const TAG_LEN: usize = 16;
const SEALED_SEGMENT_LEN: usize = SEGMENT_LEN + TAG_LEN;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
/// Bytes read when sniffing headers.
const SNIFF_LEN: usize = 16;

/// 256-bit artifact encryption key.
#[derive(Clone)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    #[must_use]
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse a key from 64 hex characters.
    pub fn from_hex(text: &str) -> Result<Self> {
        let bytes = hex::decode(text.trim()).map_err(|e| {
            LifecycleError::Configuration(format!("Encryption key is not valid hex: {e}"))
        })?;
        let key: [u8; 32] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            LifecycleError::Configuration(format!(
                "Encryption key must be 32 bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(key))
    }

    /// Read the key from an environment variable; `None` when unset.
    pub fn from_env(var: &str) -> Result<Option<Self>> {
        match std::env::var(var) {
            Ok(value) if !value.trim().is_empty() => Self::from_hex(&value).map(Some),
            _ => Ok(None),
        }
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

/// Sizes and checksum of an encoded artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    /// Bytes read from the raw dump.
    pub raw_bytes: u64,
    /// Bytes written to the artifact.
    pub artifact_bytes: u64,
    /// `sha256:<hex>` of the artifact.
    pub checksum: String,
}

/// Turns raw dumps into stored artifacts and back.
#[derive(Debug, Clone)]
pub struct ArtifactCodec {
    pub compression: Compression,
    encrypt: bool,
    /// Also used to decrypt older artifacts when new ones are written in clear.
    key: Option<EncryptionKey>,
}

impl ArtifactCodec {
    pub fn new(
        compression: Compression,
        encrypt: bool,
        key: Option<EncryptionKey>,
    ) -> Result<Self> {
        if encrypt && key.is_none() {
            return Err(LifecycleError::Configuration(
                "Backup encryption is enabled but no encryption key is configured".into(),
            ));
        }
        Ok(Self {
            compression,
            encrypt,
            key,
        })
    }

    #[must_use]
    pub fn encrypts(&self) -> bool {
        self.encrypt
    }

    /// Object key suffix for artifacts produced by this codec.
    #[must_use]
    pub fn extension(&self) -> String {
        let mut ext = String::new();
        if self.compression == Compression::Gzip {
            ext.push_str(".gz");
        }
        if self.encrypts() {
            ext.push_str(".enc");
        }
        ext
    }

    /// Compress, then encrypt, `raw` into `artifact`, hashing on the way out.
    pub fn encode_file(&self, raw: &Path, artifact: &Path) -> Result<Encoded> {
        let key = if self.encrypt { self.key.as_ref() } else { None };
        let mut source = BufReader::new(File::open(raw)?);
        let sink = HashingWriter::new(BufWriter::new(File::create(artifact)?));
        let sealed = SealingWriter::new(sink, key)?;
        let mut compressor = Compressor::new(sealed, self.compression);

        let raw_bytes = io::copy(&mut source, &mut compressor)?;
        let (checksum, artifact_bytes) = compressor.finish()?.finish()?.finish()?;
        Ok(Encoded {
            raw_bytes,
            artifact_bytes,
            checksum,
        })
    }

    /// Decrypt, then decompress, `artifact` into `raw`. Uses the recorded
    /// flags rather than the codec's own, so artifacts written with other
    /// settings still decode. Returns the decoded size.
    pub fn decode_file(
        &self,
        artifact: &Path,
        raw: &Path,
        compression: Compression,
        encrypted: bool,
    ) -> Result<u64> {
        let key = if encrypted {
            Some(self.decryption_key()?.clone())
        } else {
            None
        };
        let mut source = BufReader::new(File::open(artifact)?);
        let sink = BufWriter::new(File::create(raw)?);
        let mut opener = OpeningWriter::new(Decompressor::new(sink, compression), key);

        io::copy(&mut source, &mut opener).map_err(stream_error)?;
        let mut sink = opener
            .finish()
            .and_then(Decompressor::finish)
            .map_err(stream_error)?;
        sink.flush()?;
        Ok(std::fs::metadata(raw)?.len())
    }

    /// Leading bytes of the payload under the encryption layer, enough to
    /// recognise the compression. Decrypts at most one segment.
    pub fn payload_prefix(&self, artifact: &Path, encrypted: bool) -> Result<Vec<u8>> {
        let mut file = BufReader::new(File::open(artifact)?);
        if !encrypted {
            return Ok(read_up_to(&mut file, SNIFF_LEN)?);
        }
        let key = self.decryption_key()?;
        let header = read_up_to(&mut file, HEADER_LEN)?;
        let prefix = nonce_prefix(&header).map_err(stream_error)?;
        let first = read_up_to(&mut file, SEALED_SEGMENT_LEN + 1)?;

        let mut decryptor =
            DecryptorBE32::from_aead(key.cipher(), GenericArray::from_slice(prefix));
        let plain = if first.len() > SEALED_SEGMENT_LEN {
            decryptor.decrypt_next(&first[..SEALED_SEGMENT_LEN])
        } else {
            decryptor.decrypt_last(first.as_slice())
        }
        .map_err(|_| LifecycleError::Integrity("artifact could not be decrypted".into()))?;
        Ok(plain.into_iter().take(SNIFF_LEN).collect())
    }

    fn decryption_key(&self) -> Result<&EncryptionKey> {
        self.key.as_ref().ok_or_else(|| {
            LifecycleError::Configuration(
                "Artifact is encrypted but no encryption key is configured".into(),
            )
        })
    }
}

/// `sha256:<hex>` over a file, read in chunks.
pub fn checksum_file(path: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    io::copy(&mut BufReader::new(File::open(path)?), &mut hasher)?;
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

/// First bytes of a file, for [`is_encrypted`] and [`is_gzip`].
pub fn read_header(path: &Path) -> Result<Vec<u8>> {
    Ok(read_up_to(&mut File::open(path)?, SNIFF_LEN)?)
}

/// Whether the bytes carry the encryption header.
#[must_use]
pub fn is_encrypted(bytes: &[u8]) -> bool {
    bytes.len() >= HEADER_LEN && bytes.starts_with(ENCRYPTION_MAGIC)
}

/// Whether the bytes start a gzip stream.
#[must_use]
pub fn is_gzip(bytes: &[u8]) -> bool {
    bytes.starts_with(&GZIP_MAGIC)
}

fn read_up_to(reader: &mut impl Read, limit: usize) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(limit);
    reader.take(limit as u64).read_to_end(&mut buf)?;
    Ok(buf)
}

fn nonce_prefix(header: &[u8]) -> io::Result<&[u8]> {
    if is_encrypted(header) {
        Ok(&header[ENCRYPTION_MAGIC.len()..HEADER_LEN])
    } else {
        Err(invalid("artifact is missing the encryption header"))
    }
}

fn invalid(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

/// Corrupt input surfaces as an integrity error, anything else as I/O.
fn stream_error(e: io::Error) -> LifecycleError {
    match e.kind() {
        io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput | io::ErrorKind::UnexpectedEof => {
            LifecycleError::Integrity(e.to_string())
        }
        _ => LifecycleError::Io(e),
    }
}

/// Hashes and counts everything written through it.
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    fn finish(mut self) -> io::Result<(String, u64)> {
        self.inner.flush()?;
        let digest = format!("sha256:{}", hex::encode(self.hasher.finalize()));
        Ok((digest, self.written))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Seals the stream in segments; passes it through without a key.
struct SealingWriter<W> {
    inner: W,
    encryptor: Option<EncryptorBE32<Aes256Gcm>>,
    pending: Vec<u8>,
}

impl<W: Write> SealingWriter<W> {
    fn new(mut inner: W, key: Option<&EncryptionKey>) -> io::Result<Self> {
        let encryptor = match key {
            Some(key) => {
                let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
                let prefix = &nonce[..NONCE_PREFIX_LEN];
                inner.write_all(ENCRYPTION_MAGIC)?;
                inner.write_all(prefix)?;
                Some(EncryptorBE32::from_aead(
                    key.cipher(),
                    GenericArray::from_slice(prefix),
                ))
            }
            None => None,
        };
        Ok(Self {
            inner,
            encryptor,
            pending: Vec::new(),
        })
    }

    fn finish(mut self) -> io::Result<W> {
        if let Some(encryptor) = self.encryptor.take() {
            let sealed = encryptor
                .encrypt_last(self.pending.as_slice())
                .map_err(|_| io::Error::other("artifact encryption failed"))?;
            self.inner.write_all(&sealed)?;
        }
        Ok(self.inner)
    }
}

impl<W: Write> Write for SealingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let Some(encryptor) = self.encryptor.as_mut() else {
            return self.inner.write(buf);
        };
        self.pending.extend_from_slice(buf);
        // The final segment is sealed by `finish`, so keep at least one byte back.
        while self.pending.len() > SEGMENT_LEN {
            let sealed = encryptor
                .encrypt_next(&self.pending[..SEGMENT_LEN])
                .map_err(|_| io::Error::other("artifact encryption failed"))?;
            self.inner.write_all(&sealed)?;
            self.pending.drain(..SEGMENT_LEN);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Opens sealed segments; passes the stream through without a key.
struct OpeningWriter<W> {
    inner: W,
    key: Option<EncryptionKey>,
    decryptor: Option<DecryptorBE32<Aes256Gcm>>,
    pending: Vec<u8>,
}

impl<W: Write> OpeningWriter<W> {
    fn new(inner: W, key: Option<EncryptionKey>) -> Self {
        Self {
            inner,
            key,
            decryptor: None,
            pending: Vec::new(),
        }
    }

    fn finish(mut self) -> io::Result<W> {
        if self.key.is_some() {
            let decryptor = self
                .decryptor
                .take()
                .ok_or_else(|| invalid("artifact is missing the encryption header"))?;
            let plain = decryptor
                .decrypt_last(self.pending.as_slice())
                .map_err(|_| invalid("artifact could not be decrypted"))?;
            self.inner.write_all(&plain)?;
        }
        Ok(self.inner)
    }
}

impl<W: Write> Write for OpeningWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let Some(key) = &self.key else {
            return self.inner.write(buf);
        };
        self.pending.extend_from_slice(buf);
        if self.decryptor.is_none() {
            if self.pending.len() < HEADER_LEN {
                return Ok(buf.len());
            }
            let prefix = nonce_prefix(&self.pending[..HEADER_LEN])?;
            let decryptor =
                DecryptorBE32::from_aead(key.cipher(), GenericArray::from_slice(prefix));
            self.decryptor = Some(decryptor);
            self.pending.drain(..HEADER_LEN);
        }
        if let Some(decryptor) = self.decryptor.as_mut() {
            while self.pending.len() > SEALED_SEGMENT_LEN {
                let plain = decryptor
                    .decrypt_next(&self.pending[..SEALED_SEGMENT_LEN])
                    .map_err(|_| invalid("artifact could not be decrypted"))?;
                self.inner.write_all(&plain)?;
                self.pending.drain(..SEALED_SEGMENT_LEN);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

enum Compressor<W: Write> {
    Gzip(GzEncoder<W>),
    Plain(W),
}

impl<W: Write> Compressor<W> {
    fn new(inner: W, compression: Compression) -> Self {
        match compression {
            Compression::Gzip => Self::Gzip(GzEncoder::new(inner, flate2::Compression::default())),
            Compression::None => Self::Plain(inner),
        }
    }

    fn finish(self) -> io::Result<W> {
        match self {
            Self::Gzip(encoder) => encoder.finish(),
            Self::Plain(inner) => Ok(inner),
        }
    }
}

impl<W: Write> Write for Compressor<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Gzip(encoder) => encoder.write(buf),
            Self::Plain(inner) => inner.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Gzip(encoder) => encoder.flush(),
            Self::Plain(inner) => inner.flush(),
        }
    }
}

enum Decompressor<W: Write> {
    Gzip(GzDecoder<W>),
    Plain(W),
}

impl<W: Write> Decompressor<W> {
    fn new(inner: W, compression: Compression) -> Self {
        match compression {
            Compression::Gzip => Self::Gzip(GzDecoder::new(inner)),
            Compression::None => Self::Plain(inner),
        }
    }

    fn finish(self) -> io::Result<W> {
        match self {
            Self::Gzip(decoder) => decoder.finish(),
            Self::Plain(inner) => Ok(inner),
        }
    }
}

impl<W: Write> Write for Decompressor<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Gzip(decoder) => decoder.write(buf),
            Self::Plain(inner) => inner.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Gzip(decoder) => decoder.flush(),
            Self::Plain(inner) => inner.flush(),
        }
    }
}
