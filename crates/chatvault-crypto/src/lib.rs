//! At-rest crypto envelope for chatvault.
//!
//! One ciphertext layout, two framings:
//! - backup envelope: `"BKP1" || salt(16) || iv(16) || AES-256-CBC ct`,
//!   key = SHA-256(password || salt);
//! - raw envelope (share descriptors, file-level encryption):
//!   `salt(16) || iv(16) || AES-256-CBC ct`,
//!   key = PBKDF2-HMAC-SHA256(password, salt, 10 000 rounds).
//!
//! Both are authenticator-free; chunk-level content hashes carry integrity.

pub mod envelope;
pub mod hash;

pub use envelope::{
    decrypt_backup_file, decrypt_file, encrypt_backup_file, encrypt_file, open, open_raw, seal,
    seal_raw,
};
pub use hash::{sha256_file, sha256_hex};
