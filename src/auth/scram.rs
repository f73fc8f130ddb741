//! SCRAM-SHA-256: the server side used to authenticate clients against
//! a stored secret, and the client side used to log in to servers.
use crate::constants;
use crate::errors::Error;
use base64::engine::general_purpose;
use base64::Engine;
use bytes::BytesMut;
use hmac::{Hmac, Mac};
use rand::distr::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::borrow::Cow;

type HmacSha = Hmac<Sha256>;

pub struct ServerSecret {
    pub iteration: i32,
    pub salt_base64: String,
    pub stored_key: Vec<u8>,
    pub server_key: Vec<u8>,
}

pub struct ServerFirstMessage {
    nonce: String,
    client_first_bare: String,
    pub server_first_bare: String,
}

pub struct ClientFinalMessage {
    channel_binding: Vec<u8>,
    pub nonce: String,
    proof: Vec<u8>,
    client_final_without_proof: String,
}

#[derive(Debug)]
pub struct ClientFirstMessage {
    authcid: String,
    authzid: Option<String>,
    pub nonce: String,
    gs2_flag: char,
    pub client_first_bare: String,
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>, Error> {
    let mut mac = HmacSha::new_from_slice(key)
        .map_err(|err| Error::ScramServerError(format!("hmac key: {err}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Hi() from RFC 5802: PBKDF2 with HMAC-SHA-256 and one output block.
fn salted_password(password: &[u8], salt: &[u8], iterations: u32) -> Result<Vec<u8>, Error> {
    let mut first = salt.to_vec();
    first.extend_from_slice(&[0, 0, 0, 1]);
    let mut prev = hmac(password, &first)?;
    let mut result = prev.clone();
    for _ in 1..iterations {
        prev = hmac(password, &prev)?;
        for (r, p) in result.iter_mut().zip(prev.iter()) {
            *r ^= p;
        }
    }
    Ok(result)
}

fn normalize(password: &str) -> Vec<u8> {
    match stringprep::saslprep(password) {
        Ok(prepared) => prepared.into_owned().into_bytes(),
        // Passwords SASLprep rejects are used as is, like libpq does.
        Err(_) => password.as_bytes().to_vec(),
    }
}

/// Parses a part of a SCRAM message, after it has been split on commas.
/// Checks the key and returns everything after the '='.
macro_rules! parse_part {
    ($iter:expr, $key:expr, $what:expr) => {
        match $iter.next() {
            Some(part) if part.len() >= 2 && &part.as_bytes()[..2] == $key => &part[2..],
            _ => return Err(Error::ScramServerError(format!("unexpected {}", $what))),
        }
    };
}

/// Parse SASLInitialResponse body: mechanism, length and client-first-message.
pub fn parse_client_first_message(message: Cow<str>) -> Result<ClientFirstMessage, Error> {
    let data = match message.get(constants::SCRAM_SHA_256.len() + 4 + 1..) {
        Some(data) => data,
        None => return Err(Error::ScramServerError("message length".to_string())),
    };

    let mut parts = data.split(',');

    // Channel binding: 'n' (not supported by client) or 'y' (supported, not used).
    let gs2_flag = match parts.next() {
        Some("n") => 'n',
        Some("y") => 'y',
        _ => {
            return Err(Error::ScramServerError(
                "unsupported channel binding".to_string(),
            ))
        }
    };

    let authzid = match parts.next() {
        Some("") => None,
        Some(part) if part.starts_with("a=") => Some(part[2..].to_string()),
        _ => return Err(Error::ScramServerError("unexpected authzid".to_string())),
    };

    let authcid = parse_part!(parts, b"n=", "authcid");
    let nonce = parse_part!(parts, b"r=", "nonce");

    let client_first_bare = data.splitn(3, ',').nth(2).unwrap_or_default();

    Ok(ClientFirstMessage {
        authcid: authcid.to_string(),
        authzid,
        nonce: nonce.to_string(),
        gs2_flag,
        client_first_bare: client_first_bare.to_string(),
    })
}

/// Parses a stored secret, e.g.
/// SCRAM-SHA-256$4096:L6Nhfyy6pos5mpvTRXQOTQ==$RMoA1BGLjB/LmVJ2iP5N91E0ri/9siV5E3D5DEvfqXU=:/aRx7mRpU0txwFSzZ5lcj/u/FHCc503fUfGrF12nGx0=
pub fn parse_server_secret(data: &str) -> Result<ServerSecret, Error> {
    let not_scram = || Error::ScramServerError("password secret is not scram".to_string());

    // <iterations>:<salt>$<storedkey>:<serverkey>
    let itr_salt_keys = match data.split_once('$') {
        Some((constants::SCRAM_SHA_256, rest)) => rest,
        _ => return Err(not_scram()),
    };
    let (iterations, salt_keys) = itr_salt_keys.split_once(':').ok_or_else(not_scram)?;
    let iteration = iterations.parse::<i32>().map_err(|_| not_scram())?;
    let (salt, keys) = salt_keys.split_once('$').ok_or_else(not_scram)?;
    general_purpose::STANDARD
        .decode(salt)
        .map_err(|_| not_scram())?;
    let (stored_key, server_key) = keys.split_once(':').ok_or_else(not_scram)?;

    Ok(ServerSecret {
        iteration,
        salt_base64: salt.to_string(),
        stored_key: general_purpose::STANDARD
            .decode(stored_key)
            .map_err(|_| not_scram())?,
        server_key: general_purpose::STANDARD
            .decode(server_key)
            .map_err(|_| not_scram())?,
    })
}

/// r=client_nonce+server_nonce,s=salt,i=iterations
pub fn prepare_server_first_response(
    client_nonce: &str,
    client_first_bare: &str,
    server_salt: &str,
    server_iteration: i32,
) -> ServerFirstMessage {
    let key = rand::rng().random::<[u8; 18]>(); // 18 bytes -> 24 base64 chars
    let nonce = client_nonce.to_owned() + &general_purpose::STANDARD.encode(key);

    let server_first_bare = format!("r={nonce},s={server_salt},i={server_iteration}");
    ServerFirstMessage {
        nonce,
        client_first_bare: client_first_bare.to_string(),
        server_first_bare,
    }
}

/// Parse c=biws,r=<nonce>[,extensions],p=<proof>
pub fn parse_client_final_message(data: Cow<str>) -> Result<ClientFinalMessage, Error> {
    let bad = |what: &str| Error::ScramServerError(format!("parse {what}"));

    let (channel_binding, rest) = match data.split_once(',') {
        Some((cbind, rest)) => match cbind.strip_prefix("c=") {
            Some(cbind) => (cbind, rest),
            None => return Err(bad("channel binding")),
        },
        None => return Err(bad("channel binding")),
    };

    let nonce = match rest.split(',').next().and_then(|part| part.strip_prefix("r=")) {
        Some(nonce) => nonce,
        None => return Err(bad("nonce")),
    };

    // Extension fields may come between nonce and proof, the proof is always last.
    let (client_final_without_proof, proof) = match data.rsplit_once(',') {
        Some((without_proof, last)) => match last.strip_prefix("p=") {
            Some(proof) => (without_proof, proof),
            None => return Err(bad("proof")),
        },
        None => return Err(bad("proof")),
    };

    Ok(ClientFinalMessage {
        channel_binding: general_purpose::STANDARD
            .decode(channel_binding)
            .map_err(|_| bad("channel binding"))?,
        nonce: nonce.to_string(),
        proof: general_purpose::STANDARD
            .decode(proof)
            .map_err(|_| bad("proof"))?,
        client_final_without_proof: client_final_without_proof.to_string(),
    })
}

/// Verify the client proof and build the server-final-message (v=signature).
pub fn prepare_server_final_message(
    client_first: ClientFirstMessage,
    client_final: ClientFinalMessage,
    server_first: ServerFirstMessage,
    server_key: &[u8],
    stored_key: &[u8],
) -> Result<String, Error> {
    let gs2_header = match &client_first.authzid {
        Some(authzid) => format!("{},a={},", client_first.gs2_flag, authzid),
        None => format!("{},,", client_first.gs2_flag),
    };
    if client_final.channel_binding != gs2_header.as_bytes() {
        return Err(Error::ScramServerError(
            "e=channel-bindings-dont-match".to_string(),
        ));
    }
    if server_first.nonce != client_final.nonce {
        return Err(Error::ScramServerError("e=nonce-mismatch".to_string()));
    }

    let auth_message = format!(
        "{},{},{}",
        server_first.client_first_bare,
        server_first.server_first_bare,
        client_final.client_final_without_proof
    );

    // ClientKey = ClientProof XOR HMAC(StoredKey, AuthMessage)
    let client_signature = hmac(stored_key, auth_message.as_bytes())?;
    if client_final.proof.len() != client_signature.len() {
        return Err(Error::ScramServerError("e=invalid-proof".to_string()));
    }
    let client_key: Vec<u8> = client_final
        .proof
        .iter()
        .zip(client_signature.iter())
        .map(|(x, y)| x ^ y)
        .collect();

    let computed_stored_key = Sha256::digest(&client_key);
    if computed_stored_key.len() != stored_key.len() {
        return Err(Error::ScramServerError("e=mismatch-key-length".to_string()));
    }
    let mut is_not_equal: u8 = 0;
    for (a, b) in stored_key.iter().zip(computed_stored_key.iter()) {
        is_not_equal |= a ^ b;
    }
    if is_not_equal != 0 {
        return Err(Error::ScramServerError("e=invalid-proof".to_string()));
    }

    // ServerSignature = HMAC(ServerKey, AuthMessage)
    let server_signature = hmac(server_key, auth_message.as_bytes())?;
    Ok(format!(
        "v={}",
        general_purpose::STANDARD.encode(server_signature)
    ))
}

impl std::fmt::Display for ClientFirstMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{{ authzid: {:?}, authcid: {:?}, client_first_bare: {} }}",
            self.authzid, self.authcid, self.client_first_bare
        )
    }
}

enum ClientState {
    Initial,
    WaitingFinal {
        server_key: Vec<u8>,
        auth_message: String,
    },
    Done,
}

/// Client side of SCRAM-SHA-256 used when a server asks us for SASL.
pub struct ScramSha256 {
    password: Vec<u8>,
    nonce: String,
    client_first_bare: String,
    state: ClientState,
}

impl ScramSha256 {
    pub fn new(password: &str) -> ScramSha256 {
        let nonce: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(constants::NONCE_LENGTH)
            .map(char::from)
            .collect();
        Self::with_nonce(password, nonce)
    }

    fn with_nonce(password: &str, nonce: String) -> ScramSha256 {
        ScramSha256 {
            password: normalize(password),
            client_first_bare: format!("n=,r={nonce}"),
            nonce,
            state: ClientState::Initial,
        }
    }

    /// client-first-message for SASLInitialResponse.
    pub fn message(&self) -> BytesMut {
        BytesMut::from(format!("n,,{}", self.client_first_bare).as_bytes())
    }

    /// Consume server-first-message (SASLContinue), return client-final-message.
    pub fn update(&mut self, message: &[u8]) -> Result<BytesMut, Error> {
        let server_first = String::from_utf8_lossy(message).to_string();

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for part in server_first.split(',') {
            match part.split_at_checked(2) {
                Some(("r=", value)) => nonce = Some(value),
                Some(("s=", value)) => salt = Some(value),
                Some(("i=", value)) => iterations = value.parse::<u32>().ok(),
                _ => {}
            }
        }
        let (nonce, salt, iterations) = match (nonce, salt, iterations) {
            (Some(nonce), Some(salt), Some(iterations)) if iterations > 0 => {
                (nonce, salt, iterations)
            }
            _ => {
                return Err(Error::ScramClientError(format!(
                    "invalid server-first-message: {server_first}"
                )))
            }
        };
        if !nonce.starts_with(&self.nonce) {
            return Err(Error::ScramClientError("server nonce mismatch".to_string()));
        }
        let salt = general_purpose::STANDARD
            .decode(salt)
            .map_err(|err| Error::ScramClientError(format!("salt is not base64: {err}")))?;

        let salted = salted_password(&self.password, &salt, iterations)?;
        let client_key = hmac(&salted, b"Client Key")?;
        let server_key = hmac(&salted, b"Server Key")?;
        let stored_key = Sha256::digest(&client_key);

        let client_final_without_proof = format!("c=biws,r={nonce}");
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, server_first, client_final_without_proof
        );
        let signature = hmac(&stored_key, auth_message.as_bytes())?;
        let proof: Vec<u8> = client_key
            .iter()
            .zip(signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        self.state = ClientState::WaitingFinal {
            server_key,
            auth_message,
        };

        Ok(BytesMut::from(
            format!(
                "{},p={}",
                client_final_without_proof,
                general_purpose::STANDARD.encode(proof)
            )
            .as_bytes(),
        ))
    }

    /// Verify server-final-message (SASLFinal).
    pub fn finish(&mut self, message: &[u8]) -> Result<(), Error> {
        let (server_key, auth_message) = match &self.state {
            ClientState::WaitingFinal {
                server_key,
                auth_message,
            } => (server_key, auth_message),
            _ => {
                return Err(Error::ScramClientError(
                    "SASLFinal before SASLContinue".to_string(),
                ))
            }
        };

        let message = String::from_utf8_lossy(message);
        let verifier = match message.split(',').next().and_then(|v| v.strip_prefix("v=")) {
            Some(verifier) => verifier,
            None => {
                return Err(Error::ScramClientError(format!(
                    "invalid server-final-message: {message}"
                )))
            }
        };
        let verifier = general_purpose::STANDARD
            .decode(verifier)
            .map_err(|err| Error::ScramClientError(format!("verifier is not base64: {err}")))?;

        if hmac(server_key, auth_message.as_bytes())? != verifier {
            return Err(Error::ScramClientError(
                "server signature mismatch".to_string(),
            ));
        }
        self.state = ClientState::Done;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn build_secret(password: &str, salt: &[u8], iterations: u32) -> String {
        let salted = salted_password(&normalize(password), salt, iterations).unwrap();
        let client_key = hmac(&salted, b"Client Key").unwrap();
        let server_key = hmac(&salted, b"Server Key").unwrap();
        format!(
            "SCRAM-SHA-256${}:{}${}:{}",
            iterations,
            general_purpose::STANDARD.encode(salt),
            general_purpose::STANDARD.encode(Sha256::digest(&client_key)),
            general_purpose::STANDARD.encode(server_key)
        )
    }

    fn initial_response(client: &ScramSha256) -> String {
        let first = client.message();
        let mut body = BytesMut::new();
        body.put_slice(constants::SCRAM_SHA_256.as_bytes());
        body.put_u8(0);
        body.put_i32(first.len() as i32);
        body.put_slice(&first);
        String::from_utf8_lossy(&body).to_string()
    }

    #[test]
    fn good_parse_server_secret() {
        let result = parse_server_secret(
            "SCRAM-SHA-256$4096:L6Nhfyy6pos5mpvTRXQOTQ==$RMoA1BGLjB/LmVJ2iP5N91E0ri/9siV5E3D5DEvfqXU=:/aRx7mRpU0txwFSzZ5lcj/u/FHCc503fUfGrF12nGx0=").unwrap();
        assert_eq!(4096, result.iteration);
        assert_eq!("L6Nhfyy6pos5mpvTRXQOTQ==", result.salt_base64);
        assert_eq!(result.stored_key.len(), 32);
    }

    #[test]
    fn bad_parse_server_secret() {
        assert!(parse_server_secret("SCRAM-SHA-256$4096:").is_err());
        assert!(parse_server_secret("md5abcdef").is_err());
    }

    #[test]
    fn good_parse_client_first_message() {
        let result = parse_client_first_message(Cow::from(
            "SCRAM-SHA-256\0\0\0\0 n,,n=,r=5DAkMQDUZpG/3GcwewTYJZbD",
        ))
        .unwrap();
        assert_eq!("n=,r=5DAkMQDUZpG/3GcwewTYJZbD", result.client_first_bare);
        assert_eq!("5DAkMQDUZpG/3GcwewTYJZbD", result.nonce);
    }

    #[test]
    fn rejects_channel_binding_required() {
        assert!(parse_client_first_message(Cow::from(
            "SCRAM-SHA-256\0\0\0\0 p=tls-server-end-point,,n=,r=abc",
        ))
        .is_err());
    }

    #[test]
    fn good_parse_client_final_message() {
        let msg = "c=biws,r=BOyfcmcVyYfKDshzppisKFQi;v3%I#&aaEle7p7Tf=PGhp%t,p=UtWlJlm9fN1ojyd4yuCcb6f56txj0GEqYmtTTrXoMEA=";
        let result = parse_client_final_message(Cow::from(msg)).unwrap();
        assert_eq!(
            "BOyfcmcVyYfKDshzppisKFQi;v3%I#&aaEle7p7Tf=PGhp%t",
            result.nonce
        );
        assert_eq!(
            "c=biws,r=BOyfcmcVyYfKDshzppisKFQi;v3%I#&aaEle7p7Tf=PGhp%t",
            result.client_final_without_proof
        );
    }

    #[test]
    fn client_and_server_interop() {
        let secret = parse_server_secret(&build_secret("pencil", b"0123456789abcdef", 4096)).unwrap();
        let mut client = ScramSha256::new("pencil");

        let client_first = parse_client_first_message(Cow::from(initial_response(&client))).unwrap();
        let server_first = prepare_server_first_response(
            &client_first.nonce,
            &client_first.client_first_bare,
            &secret.salt_base64,
            secret.iteration,
        );

        let client_final = client
            .update(server_first.server_first_bare.as_bytes())
            .unwrap();
        let client_final =
            parse_client_final_message(String::from_utf8_lossy(&client_final)).unwrap();

        let server_final = prepare_server_final_message(
            client_first,
            client_final,
            server_first,
            &secret.server_key,
            &secret.stored_key,
        )
        .unwrap();

        client.finish(server_final.as_bytes()).unwrap();
    }

    #[test]
    fn wrong_password_is_rejected() {
        let secret = parse_server_secret(&build_secret("pencil", b"saltsaltsaltsalt", 16)).unwrap();
        let mut client = ScramSha256::new("crayon");

        let client_first = parse_client_first_message(Cow::from(initial_response(&client))).unwrap();
        let server_first = prepare_server_first_response(
            &client_first.nonce,
            &client_first.client_first_bare,
            &secret.salt_base64,
            secret.iteration,
        );
        let client_final = client
            .update(server_first.server_first_bare.as_bytes())
            .unwrap();
        let client_final =
            parse_client_final_message(String::from_utf8_lossy(&client_final)).unwrap();

        assert!(prepare_server_final_message(
            client_first,
            client_final,
            server_first,
            &secret.server_key,
            &secret.stored_key,
        )
        .is_err());
    }

    #[test]
    fn client_rejects_foreign_nonce() {
        let mut client = ScramSha256::with_nonce("pencil", "abc".to_string());
        assert!(client.update(b"r=xyz123,s=c2FsdA==,i=4096").is_err());
        assert!(client.finish(b"v=AAAA").is_err());
    }
}
