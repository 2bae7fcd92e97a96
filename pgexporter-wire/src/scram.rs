//! SCRAM-SHA-256 (RFC 5802 / RFC 7677) client exchange, plus the server-side
//! verifier used by the remote management endpoint.
//!
//! The client keeps every exchange message (`client-first-bare`,
//! `server-first`, the assembled auth message) as owned strings for the whole
//! lifetime of the value: server-final verification reads them after the
//! client-final message has been sent.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::WireError;

type HmacSha256 = Hmac<Sha256>;

/// The only mechanism spoken on either side.
pub const MECHANISM: &str = "SCRAM-SHA-256";

const CLIENT_KEY: &[u8] = b"Client Key";
const SERVER_KEY: &[u8] = b"Server Key";
const GS2_HEADER: &str = "n,,";
const CHANNEL_BINDING: &str = "c=biws";
const NONCE_RAW_LEN: usize = 18;
const DEFAULT_ITERATIONS: u32 = 4096;

/// Rejects passwords the exchange cannot represent: printable ASCII stands in
/// for a full SASLprep table.
pub fn prepare_password(password: &str) -> Result<&str, WireError> {
    if password.bytes().all(|b| (0x20..=0x7e).contains(&b)) {
        Ok(password)
    } else {
        Err(WireError::AuthUnsupported(
            "password contains bytes outside printable ASCII".into(),
        ))
    }
}

fn random_nonce() -> String {
    let mut raw = [0u8; NONCE_RAW_LEN];
    rand::rng().fill_bytes(&mut raw);
    BASE64.encode(raw)
}

fn hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// PBKDF2-HMAC-SHA-256 with a single block, the `Hi()` of RFC 5802.
fn salted_password(password: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut block = Vec::with_capacity(salt.len() + 4);
    block.extend_from_slice(salt);
    block.extend_from_slice(&1u32.to_be_bytes());

    let mut prev = hmac(password.as_bytes(), &block);
    let mut result = prev;
    for _ in 1..iterations {
        prev = hmac(password.as_bytes(), &prev);
        for (r, p) in result.iter_mut().zip(prev.iter()) {
            *r ^= p;
        }
    }
    result
}

fn attribute<'a>(message: &'a str, key: char) -> Result<&'a str, WireError> {
    message
        .split(',')
        .find_map(|part| part.strip_prefix(key).and_then(|rest| rest.strip_prefix('=')))
        .ok_or_else(|| WireError::protocol(format!("missing SCRAM attribute '{key}'")))
}

/// Client half of the exchange.
pub struct ScramClient {
    nonce: String,
    client_first_bare: String,
    server_key: Option<[u8; 32]>,
    auth_message: Option<String>,
}

impl ScramClient {
    /// Starts an exchange with a fresh random nonce. PostgreSQL ignores the
    /// SASL username (it comes from the startup message), so it is left empty.
    pub fn new() -> Self {
        Self::with_nonce("", random_nonce())
    }

    /// Starts an exchange with a caller-chosen username and nonce.
    pub fn with_nonce(username: &str, nonce: String) -> Self {
        let client_first_bare = format!("n={username},r={nonce}");
        ScramClient { nonce, client_first_bare, server_key: None, auth_message: None }
    }

    /// The full client-first-message, including the GS2 header.
    pub fn client_first_message(&self) -> String {
        format!("{GS2_HEADER}{}", self.client_first_bare)
    }

    /// Consumes the server-first-message and produces the client-final-message.
    pub fn client_final_message(
        &mut self,
        server_first: &str,
        password: &str,
    ) -> Result<String, WireError> {
        let password = prepare_password(password)?;

        let server_nonce = attribute(server_first, 'r')?;
        if !server_nonce.starts_with(self.nonce.as_str()) || server_nonce.len() <= self.nonce.len()
        {
            return Err(WireError::protocol("server nonce does not extend client nonce"));
        }
        let salt = BASE64
            .decode(attribute(server_first, 's')?)
            .map_err(|_| WireError::protocol("invalid base64 salt in server-first"))?;
        let iterations: u32 = attribute(server_first, 'i')?
            .parse()
            .map_err(|_| WireError::protocol("invalid iteration count in server-first"))?;

        let salted = salted_password(password, &salt, iterations);
        let client_key = hmac(&salted, CLIENT_KEY);
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();

        let without_proof = format!("{CHANNEL_BINDING},r={server_nonce}");
        let auth_message =
            format!("{},{},{}", self.client_first_bare, server_first, without_proof);

        let client_signature = hmac(&stored_key, auth_message.as_bytes());
        let mut proof = client_key;
        for (p, s) in proof.iter_mut().zip(client_signature.iter()) {
            *p ^= s;
        }

        self.server_key = Some(hmac(&salted, SERVER_KEY));
        self.auth_message = Some(auth_message);

        Ok(format!("{without_proof},p={}", BASE64.encode(proof)))
    }

    /// Verifies the server-final-message signature.
    pub fn verify_server_final(&self, server_final: &str) -> Result<(), WireError> {
        if let Ok(err) = attribute(server_final, 'e') {
            return Err(WireError::protocol(format!("server rejected SCRAM exchange: {err}")));
        }
        let (server_key, auth_message) = match (&self.server_key, &self.auth_message) {
            (Some(k), Some(m)) => (k, m),
            _ => return Err(WireError::protocol("server-final before client-final")),
        };
        let verifier = BASE64
            .decode(attribute(server_final, 'v')?)
            .map_err(|_| WireError::protocol("invalid base64 verifier in server-final"))?;
        if verifier != hmac(server_key, auth_message.as_bytes()) {
            return Err(WireError::protocol("server signature mismatch"));
        }
        Ok(())
    }
}

impl Default for ScramClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Server half, used by the management endpoint to authenticate admins whose
/// plaintext passwords come out of the admins vault.
pub struct ScramServer {
    salt: Vec<u8>,
    iterations: u32,
    nonce_extension: String,
    username: String,
    combined_nonce: String,
    client_first_bare: String,
    server_first: String,
}

impl ScramServer {
    pub fn new() -> Self {
        let mut salt = vec![0u8; 16];
        rand::rng().fill_bytes(&mut salt);
        Self::with_params(salt, DEFAULT_ITERATIONS, random_nonce())
    }

    /// Fixed parameters, for tests.
    pub fn with_params(salt: Vec<u8>, iterations: u32, nonce_extension: String) -> Self {
        ScramServer {
            salt,
            iterations,
            nonce_extension,
            username: String::new(),
            combined_nonce: String::new(),
            client_first_bare: String::new(),
            server_first: String::new(),
        }
    }

    /// Username announced in the client-first-message, available after
    /// [`ScramServer::server_first_message`].
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Consumes the client-first-message and produces the server-first-message.
    pub fn server_first_message(&mut self, client_first: &str) -> Result<String, WireError> {
        let bare = client_first
            .strip_prefix(GS2_HEADER)
            .ok_or_else(|| WireError::protocol("client-first missing GS2 header"))?;
        let client_nonce = attribute(bare, 'r')?;
        self.username = attribute(bare, 'n').unwrap_or("").to_string();
        self.client_first_bare = bare.to_string();
        self.combined_nonce = format!("{client_nonce}{}", self.nonce_extension);
        self.server_first = format!(
            "r={},s={},i={}",
            self.combined_nonce,
            BASE64.encode(&self.salt),
            self.iterations
        );
        Ok(self.server_first.clone())
    }

    /// Verifies the client proof against `password` and returns the
    /// server-final-message.
    pub fn verify_client_final(
        &self,
        client_final: &str,
        password: &str,
    ) -> Result<String, WireError> {
        let password = prepare_password(password)?;

        let nonce = attribute(client_final, 'r')?;
        if nonce != self.combined_nonce {
            return Err(WireError::protocol("client-final nonce mismatch"));
        }
        let proof = BASE64
            .decode(attribute(client_final, 'p')?)
            .map_err(|_| WireError::protocol("invalid base64 proof in client-final"))?;

        let without_proof = match client_final.rfind(",p=") {
            Some(idx) => &client_final[..idx],
            None => return Err(WireError::protocol("client-final missing proof")),
        };
        let auth_message =
            format!("{},{},{}", self.client_first_bare, self.server_first, without_proof);

        let salted = salted_password(password, &self.salt, self.iterations);
        let client_key = hmac(&salted, CLIENT_KEY);
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();
        let client_signature = hmac(&stored_key, auth_message.as_bytes());

        let mut expected = client_key;
        for (e, s) in expected.iter_mut().zip(client_signature.iter()) {
            *e ^= s;
        }
        if proof != expected {
            return Err(WireError::AuthBadPassword {
                user: self.username.clone(),
                message: "SCRAM proof verification failed".into(),
            });
        }

        let server_key = hmac(&salted, SERVER_KEY);
        let signature = hmac(&server_key, auth_message.as_bytes());
        Ok(format!("v={}", BASE64.encode(signature)))
    }
}

impl Default for ScramServer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 7677 SCRAM-SHA-256 example exchange.
    const RFC_USER: &str = "user";
    const RFC_PASSWORD: &str = "pencil";
    const RFC_CLIENT_NONCE: &str = "rOprNGfwEbeRWgbNEkqO";
    const RFC_SERVER_FIRST: &str =
        "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";
    const RFC_CLIENT_FINAL: &str =
        "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ=";
    const RFC_SERVER_FINAL: &str = "v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=";

    #[test]
    fn rfc7677_client_vector() {
        let mut client = ScramClient::with_nonce(RFC_USER, RFC_CLIENT_NONCE.to_string());
        assert_eq!(client.client_first_message(), "n,,n=user,r=rOprNGfwEbeRWgbNEkqO");

        let final_message =
            client.client_final_message(RFC_SERVER_FIRST, RFC_PASSWORD).unwrap();
        assert_eq!(final_message, RFC_CLIENT_FINAL);

        client.verify_server_final(RFC_SERVER_FINAL).unwrap();
    }

    #[test]
    fn rfc7677_server_vector() {
        let salt = BASE64.decode("W22ZaJ0SNY7soEsUEjb6gQ==").unwrap();
        let mut server = ScramServer::with_params(
            salt,
            4096,
            "%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0".to_string(),
        );
        let server_first =
            server.server_first_message("n,,n=user,r=rOprNGfwEbeRWgbNEkqO").unwrap();
        assert_eq!(server_first, RFC_SERVER_FIRST);
        assert_eq!(server.username(), "user");

        let server_final = server.verify_client_final(RFC_CLIENT_FINAL, RFC_PASSWORD).unwrap();
        assert_eq!(server_final, RFC_SERVER_FINAL);
    }

    #[test]
    fn round_trip_with_random_parameters() {
        let mut server = ScramServer::new();
        let mut client = ScramClient::new();

        let server_first = server.server_first_message(&client.client_first_message()).unwrap();
        let client_final = client.client_final_message(&server_first, "s3cret").unwrap();
        let server_final = server.verify_client_final(&client_final, "s3cret").unwrap();
        client.verify_server_final(&server_final).unwrap();
    }

    #[test]
    fn wrong_password_is_rejected() {
        let mut server = ScramServer::new();
        let mut client = ScramClient::new();

        let server_first = server.server_first_message(&client.client_first_message()).unwrap();
        let client_final = client.client_final_message(&server_first, "wrong").unwrap();
        assert!(matches!(
            server.verify_client_final(&client_final, "right"),
            Err(WireError::AuthBadPassword { .. })
        ));
    }

    #[test]
    fn non_ascii_password_is_unsupported() {
        let mut client = ScramClient::new();
        assert!(matches!(
            client.client_final_message(RFC_SERVER_FIRST, "pénalité"),
            Err(WireError::AuthUnsupported(_))
        ));
    }

    #[test]
    fn tampered_server_signature_is_detected() {
        let mut server = ScramServer::new();
        let mut client = ScramClient::new();

        let server_first = server.server_first_message(&client.client_first_message()).unwrap();
        let _ = client.client_final_message(&server_first, "s3cret").unwrap();
        let bogus = format!("v={}", BASE64.encode([0u8; 32]));
        assert!(client.verify_server_final(&bogus).is_err());
    }
}
