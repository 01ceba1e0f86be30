//! Access-token gate in front of the streaming endpoints
//!
//! A token is `hex(iv ‖ AES-CFB(json identity))`, produced by the control
//! plane with a key shared with every agent.

use aes::{Aes128, Aes192, Aes256};
use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};
use chrono::{DateTime, FixedOffset, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::Config;
use crate::error::{Error, Result};

/// Header and form field carrying the token
pub const ACCESS_TOKEN_KEY: &str = "access-token";

const BLOCK_SIZE: usize = 16;

/// Identity sealed inside an access token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(rename = "userName")]
    pub user_name: String,
    /// Lifetime in seconds, counted from `create_time`
    pub expire: i64,
    #[serde(rename = "createTime")]
    pub create_time: DateTime<FixedOffset>,
}

#[derive(Debug, Clone)]
pub struct AccessTokenValidator {
    key: Vec<u8>,
    user: String,
    enabled: bool,
}

impl AccessTokenValidator {
    pub fn new(key: impl Into<Vec<u8>>, user: impl Into<String>, enabled: bool) -> Self {
        Self {
            key: key.into(),
            user: user.into(),
            enabled,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.access_token_key.as_bytes().to_vec(),
            config.access_token_user.clone(),
            config.access_token_enabled,
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn validate(&self, token: Option<&str>, uid: &str) -> Result<()> {
        self.validate_at(token, uid, Utc::now())
    }

    pub fn validate_at(&self, token: Option<&str>, uid: &str, now: DateTime<Utc>) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let token = match token {
            Some(t) if !t.is_empty() => t,
            _ => return Err(Error::NoAccessToken),
        };

        let identity = self.open(token).map_err(|e| {
            warn!("failed to unmarshal token, err={}, uid={}", e, uid);
            e
        })?;
        if identity.user_name != self.user {
            warn!("invalid user name={}, uid={}", identity.user_name, uid);
            return Err(Error::InvalidUser);
        }
        let age = now
            .signed_duration_since(identity.create_time)
            .num_seconds();
        if age > identity.expire {
            warn!(
                "access token is expired, create at {}, uid={}",
                identity.create_time, uid
            );
            return Err(Error::TokenExpired);
        }
        Ok(())
    }

    fn open(&self, token: &str) -> Result<Identity> {
        let raw = hex::decode(token).map_err(|e| Error::MalformedToken(e.to_string()))?;
        if raw.len() < BLOCK_SIZE {
            return Err(Error::MalformedToken("ciphertext too short".to_string()));
        }
        let (iv, sealed) = raw.split_at(BLOCK_SIZE);
        let mut plain = sealed.to_vec();
        cfb_decrypt(&self.key, iv, &mut plain)?;
        serde_json::from_slice(&plain).map_err(|e| Error::MalformedToken(e.to_string()))
    }

    /// Seal `identity` into a token with a random IV
    pub fn issue(&self, identity: &Identity) -> Result<String> {
        let plain = serde_json::to_vec(identity).map_err(|e| Error::Internal(e.to_string()))?;
        let mut iv = [0u8; BLOCK_SIZE];
        rand::thread_rng().fill_bytes(&mut iv);

        let mut sealed = plain;
        cfb_encrypt(&self.key, &iv, &mut sealed)?;

        let mut raw = Vec::with_capacity(BLOCK_SIZE + sealed.len());
        raw.extend_from_slice(&iv);
        raw.extend_from_slice(&sealed);
        Ok(hex::encode(raw))
    }
}

fn cfb_decrypt(key: &[u8], iv: &[u8], buf: &mut [u8]) -> Result<()> {
    match key.len() {
        16 => cfb_mode::Decryptor::<Aes128>::new_from_slices(key, iv)
            .map_err(|_| Error::CreateSignature)?
            .decrypt(buf),
        24 => cfb_mode::Decryptor::<Aes192>::new_from_slices(key, iv)
            .map_err(|_| Error::CreateSignature)?
            .decrypt(buf),
        32 => cfb_mode::Decryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(|_| Error::CreateSignature)?
            .decrypt(buf),
        _ => return Err(Error::CreateSignature),
    }
    Ok(())
}

fn cfb_encrypt(key: &[u8], iv: &[u8], buf: &mut [u8]) -> Result<()> {
    match key.len() {
        16 => cfb_mode::Encryptor::<Aes128>::new_from_slices(key, iv)
            .map_err(|_| Error::CreateSignature)?
            .encrypt(buf),
        24 => cfb_mode::Encryptor::<Aes192>::new_from_slices(key, iv)
            .map_err(|_| Error::CreateSignature)?
            .encrypt(buf),
        32 => cfb_mode::Encryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(|_| Error::CreateSignature)?
            .encrypt(buf),
        _ => return Err(Error::CreateSignature),
    }
    Ok(())
}
