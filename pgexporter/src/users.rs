//! Users and admins vaults.
//!
//! Vault files carry one `username:secret` entry per non-comment line, where
//! the secret is `base64(AES-256-CBC(password))` keyed by the master key in
//! `$HOME/.pgexporter/master.key`. The `.pgexporter` directory must be mode
//! 0700 and the key file 0600, both owned by the running user; anything looser
//! refuses to load.

use std::os::unix::fs::MetadataExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use thiserror::Error;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const IV_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path} has mode {mode:o}, expected {expected:o}")]
    Permissions { path: PathBuf, mode: u32, expected: u32 },
    #[error("{path} is not owned by the running user")]
    Ownership { path: PathBuf },
    #[error("no master key found at {path}")]
    MissingMasterKey { path: PathBuf },
    #[error("line {line}: malformed vault entry")]
    Malformed { line: usize },
    #[error("line {line}: cannot decrypt password for {user:?}")]
    Decrypt { line: usize, user: String },
    #[error("duplicate vault entry for {user:?}")]
    Duplicate { user: String },
}

/// One decrypted vault entry.
#[derive(Debug, Clone)]
pub struct User {
    pub name: String,
    pub password: String,
}

/// Loads and base64-decodes `$HOME/.pgexporter/master.key`, enforcing the
/// 0700/0600 permission contract.
pub fn master_key() -> Result<Vec<u8>, VaultError> {
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/"));
    master_key_at(&home.join(".pgexporter"))
}

/// Same as [`master_key`], rooted at an explicit directory (for tests).
pub fn master_key_at(dir: &Path) -> Result<Vec<u8>, VaultError> {
    let key_path = dir.join("master.key");
    if !key_path.exists() {
        return Err(VaultError::MissingMasterKey { path: key_path });
    }

    check_mode(dir, 0o700)?;
    check_mode(&key_path, 0o600)?;

    let text = std::fs::read_to_string(&key_path)
        .map_err(|source| VaultError::Read { path: key_path.clone(), source })?;
    BASE64
        .decode(text.trim())
        .map_err(|_| VaultError::MissingMasterKey { path: key_path })
}

fn check_mode(path: &Path, expected: u32) -> Result<(), VaultError> {
    let metadata = std::fs::metadata(path)
        .map_err(|source| VaultError::Read { path: path.to_path_buf(), source })?;
    let mode = metadata.permissions().mode() & 0o777;
    if mode != expected {
        return Err(VaultError::Permissions { path: path.to_path_buf(), mode, expected });
    }
    // SAFETY of the vault depends on it belonging to us.
    let uid = unsafe { libc_geteuid() };
    if metadata.uid() != uid {
        return Err(VaultError::Ownership { path: path.to_path_buf() });
    }
    Ok(())
}

// Avoids a libc dependency for one call.
unsafe fn libc_geteuid() -> u32 {
    extern "C" {
        fn geteuid() -> u32;
    }
    geteuid()
}

/// Loads a users or admins file, decrypting each entry with the master key.
pub fn load_vault(path: &Path, master_key: &[u8]) -> Result<Vec<User>, VaultError> {
    let text = std::fs::read_to_string(path)
        .map_err(|source| VaultError::Read { path: path.to_path_buf(), source })?;

    let mut users: Vec<User> = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (name, secret) =
            line.split_once(':').ok_or(VaultError::Malformed { line: line_no })?;
        if users.iter().any(|u| u.name == name) {
            return Err(VaultError::Duplicate { user: name.to_string() });
        }
        let password = decrypt_password(secret, master_key)
            .ok_or_else(|| VaultError::Decrypt { line: line_no, user: name.to_string() })?;
        users.push(User { name: name.to_string(), password });
    }
    Ok(users)
}

/// Encrypts a password for vault storage: `base64(iv || ciphertext)` with the
/// AES key being `sha256(master_key)`.
pub fn encrypt_password(password: &str, master_key: &[u8], iv: &[u8; IV_LEN]) -> String {
    let key: [u8; 32] = Sha256::digest(master_key).into();
    let cipher = Aes256CbcEnc::new(&key.into(), iv.into());
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(password.as_bytes());

    let mut blob = Vec::with_capacity(IV_LEN + ciphertext.len());
    blob.extend_from_slice(iv);
    blob.extend_from_slice(&ciphertext);
    BASE64.encode(blob)
}

fn decrypt_password(secret: &str, master_key: &[u8]) -> Option<String> {
    let blob = BASE64.decode(secret.trim()).ok()?;
    if blob.len() <= IV_LEN {
        return None;
    }
    let (iv, ciphertext) = blob.split_at(IV_LEN);
    let key: [u8; 32] = Sha256::digest(master_key).into();
    let iv: [u8; IV_LEN] = iv.try_into().ok()?;
    let cipher = Aes256CbcDec::new(&key.into(), &iv.into());
    let plaintext = cipher.decrypt_padded_vec_mut::<Pkcs7>(ciphertext).ok()?;
    String::from_utf8(plaintext).ok()
}

/// Finds a vault entry by name.
pub fn find<'a>(users: &'a [User], name: &str) -> Option<&'a User> {
    users.iter().find(|u| u.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_round_trip() {
        let master = b"super-secret-master";
        let iv = [7u8; IV_LEN];
        let secret = encrypt_password("hunter2", master, &iv);
        assert_eq!(decrypt_password(&secret, master).as_deref(), Some("hunter2"));
        assert_eq!(decrypt_password(&secret, b"wrong-key"), None);
    }

    #[test]
    fn vault_file_parsing() {
        let master = b"master";
        let iv = [1u8; IV_LEN];
        let dir = std::env::temp_dir().join(format!("pgexporter-vault-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("users");
        let body = format!(
            "# comment\nprom:{}\nadmin:{}\n",
            encrypt_password("scrape", master, &iv),
            encrypt_password("letmein", master, &iv),
        );
        std::fs::write(&path, body).unwrap();

        let users = load_vault(&path, master).unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(find(&users, "prom").unwrap().password, "scrape");
        assert_eq!(find(&users, "admin").unwrap().password, "letmein");
        assert!(find(&users, "nobody").is_none());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn duplicate_entries_fail() {
        let master = b"master";
        let iv = [1u8; IV_LEN];
        let dir = std::env::temp_dir().join(format!("pgexporter-vault-dup-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("users");
        let entry = encrypt_password("x", master, &iv);
        std::fs::write(&path, format!("a:{entry}\na:{entry}\n")).unwrap();

        assert!(matches!(load_vault(&path, master), Err(VaultError::Duplicate { .. })));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
