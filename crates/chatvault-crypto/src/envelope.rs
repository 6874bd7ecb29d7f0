use std::fs;
use std::path::Path;

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use chatvault_types::VaultError;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::debug;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Magic prefix of the backup envelope.
const MAGIC: &[u8; 4] = b"BKP1";

const SALT_LEN: usize = 16;
const IV_LEN: usize = 16;

/// PBKDF2 rounds for the raw envelope. Wire-compatible constant.
const PBKDF2_ROUNDS: u32 = 10_000;

/// Key for the backup envelope: SHA-256(password || salt).
fn derive_key_sha256(password: &[u8], salt: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(password);
    hasher.update(salt);
    hasher.finalize().into()
}

/// Key for the raw envelope: PBKDF2-HMAC-SHA256, 10 000 rounds.
fn derive_key_pbkdf2(password: &[u8], salt: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, PBKDF2_ROUNDS, &mut key);
    key
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    rand::rng().fill_bytes(&mut buf);
    buf
}

fn cbc_encrypt(key: &[u8; 32], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, VaultError> {
    let enc = Aes256CbcEnc::new_from_slices(key, iv)
        .map_err(|e| VaultError::Internal(format!("cipher init: {e}")))?;
    Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

fn cbc_decrypt(key: &[u8; 32], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, VaultError> {
    let dec = Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|e| VaultError::Internal(format!("cipher init: {e}")))?;
    // A failed PKCS#7 unpad is how a wrong password shows up in CBC.
    dec.decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| VaultError::BadPassword)
}

/// Encrypt into the magic-framed backup envelope.
pub fn seal(plaintext: &[u8], password: &str) -> Result<Vec<u8>, VaultError> {
    let salt = random_bytes::<SALT_LEN>();
    let iv = random_bytes::<IV_LEN>();
    let key = derive_key_sha256(password.as_bytes(), &salt);

    let ciphertext = cbc_encrypt(&key, &iv, plaintext)?;

    let mut out = Vec::with_capacity(MAGIC.len() + SALT_LEN + IV_LEN + ciphertext.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a magic-framed backup envelope.
pub fn open(bytes: &[u8], password: &str) -> Result<Vec<u8>, VaultError> {
    if bytes.len() < MAGIC.len() + SALT_LEN + IV_LEN {
        return Err(VaultError::Corrupt("envelope shorter than header".into()));
    }
    if &bytes[..MAGIC.len()] != MAGIC {
        return Err(VaultError::Corrupt("bad envelope magic".into()));
    }
    let salt = &bytes[MAGIC.len()..MAGIC.len() + SALT_LEN];
    let iv = &bytes[MAGIC.len() + SALT_LEN..MAGIC.len() + SALT_LEN + IV_LEN];
    let ciphertext = &bytes[MAGIC.len() + SALT_LEN + IV_LEN..];

    let key = derive_key_sha256(password.as_bytes(), salt);
    cbc_decrypt(&key, iv, ciphertext)
}

/// Encrypt into the headerless envelope (share descriptors, file payloads).
pub fn seal_raw(plaintext: &[u8], password: &str) -> Result<Vec<u8>, VaultError> {
    let salt = random_bytes::<SALT_LEN>();
    let iv = random_bytes::<IV_LEN>();
    let key = derive_key_pbkdf2(password.as_bytes(), &salt);

    let ciphertext = cbc_encrypt(&key, &iv, plaintext)?;

    let mut out = Vec::with_capacity(SALT_LEN + IV_LEN + ciphertext.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a headerless envelope.
pub fn open_raw(bytes: &[u8], password: &str) -> Result<Vec<u8>, VaultError> {
    if bytes.len() < SALT_LEN + IV_LEN {
        return Err(VaultError::Corrupt("envelope shorter than header".into()));
    }
    let salt = &bytes[..SALT_LEN];
    let iv = &bytes[SALT_LEN..SALT_LEN + IV_LEN];
    let ciphertext = &bytes[SALT_LEN + IV_LEN..];

    let key = derive_key_pbkdf2(password.as_bytes(), salt);
    cbc_decrypt(&key, iv, ciphertext)
}

/// Encrypt a file on disk into the raw envelope (pre-upload encryption).
pub fn encrypt_file(input: &Path, output: &Path, password: &str) -> Result<(), VaultError> {
    let plaintext = fs::read(input)?;
    let sealed = seal_raw(&plaintext, password)?;
    fs::write(output, sealed)?;
    debug!(
        input = %input.display(),
        output = %output.display(),
        "encrypted file payload"
    );
    Ok(())
}

/// Decrypt a raw-envelope file back to plaintext (post-download decryption).
pub fn decrypt_file(input: &Path, output: &Path, password: &str) -> Result<(), VaultError> {
    let sealed = fs::read(input)?;
    let plaintext = open_raw(&sealed, password)?;
    fs::write(output, plaintext)?;
    debug!(
        input = %input.display(),
        output = %output.display(),
        "decrypted file payload"
    );
    Ok(())
}

/// Encrypt a file into the magic-framed backup envelope (catalog backups).
pub fn encrypt_backup_file(input: &Path, output: &Path, password: &str) -> Result<(), VaultError> {
    let plaintext = fs::read(input)?;
    let sealed = seal(&plaintext, password)?;
    fs::write(output, sealed)?;
    Ok(())
}

/// Decrypt a magic-framed backup envelope file.
pub fn decrypt_backup_file(input: &Path, output: &Path, password: &str) -> Result<(), VaultError> {
    let sealed = fs::read(input)?;
    let plaintext = open(&sealed, password)?;
    fs::write(output, plaintext)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatvault_types::ErrorKind;

    #[test]
    fn backup_envelope_round_trip() {
        let msg = b"catalog bytes";
        let sealed = seal(msg, "hunter2").unwrap();
        assert_eq!(&sealed[..4], b"BKP1");
        assert_ne!(&sealed[36..], msg.as_slice());

        let opened = open(&sealed, "hunter2").unwrap();
        assert_eq!(opened, msg);
    }

    #[test]
    fn raw_envelope_round_trip() {
        let msg = vec![7u8; 4096];
        let sealed = seal_raw(&msg, "abc").unwrap();
        // no magic: first bytes are random salt, so length is the only frame
        assert_eq!(sealed.len() % 16, 0);
        assert_eq!(open_raw(&sealed, "abc").unwrap(), msg);
    }

    #[test]
    fn empty_plaintext_round_trips() {
        let sealed = seal_raw(b"", "p").unwrap();
        assert_eq!(open_raw(&sealed, "p").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn wrong_password_is_bad_password_never_plaintext() {
        // Without an authenticator a wrong key can, rarely, produce bytes
        // whose padding happens to validate; what it can never produce is
        // the plaintext.
        let sealed = seal(b"secret", "right").unwrap();
        match open(&sealed, "wrong") {
            Err(err) => assert_eq!(err.kind(), ErrorKind::BadPassword),
            Ok(bytes) => assert_ne!(bytes, b"secret"),
        }

        let sealed = seal_raw(b"secret", "right").unwrap();
        match open_raw(&sealed, "wrong") {
            Err(err) => assert_eq!(err.kind(), ErrorKind::BadPassword),
            Ok(bytes) => assert_ne!(bytes, b"secret"),
        }
    }

    #[test]
    fn truncated_envelope_is_corrupt() {
        let err = open(b"BKP1short", "p").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupt);

        let err = open_raw(&[0u8; 31], "p").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn missing_magic_is_corrupt() {
        let mut sealed = seal(b"data", "p").unwrap();
        sealed[0] = b'X';
        let err = open(&sealed, "p").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("plain.bin");
        let enc = dir.path().join("plain.bin.encrypted");
        let back = dir.path().join("restored.bin");

        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&plain, &payload).unwrap();

        encrypt_file(&plain, &enc, "pw").unwrap();
        assert_ne!(fs::read(&enc).unwrap(), payload);

        decrypt_file(&enc, &back, "pw").unwrap();
        assert_eq!(fs::read(&back).unwrap(), payload);
    }

    #[test]
    fn envelopes_are_not_interchangeable() {
        // A raw envelope must not open as a backup envelope: the magic check
        // rejects it before any key derivation happens.
        let sealed = seal_raw(b"data", "p").unwrap();
        assert!(open(&sealed, "p").is_err());
    }
}
