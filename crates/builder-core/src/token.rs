//! Build tokens.

use derive_more::Display;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// Number of random bytes behind every token.
pub const TOKEN_BYTES: usize = 16;

/// An unguessable identifier for a build.
/// Both the registry key and the capability handed out in URLs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
#[serde(transparent)]
pub struct BuildToken(String);

impl BuildToken {
    /// Generate a fresh token from the OS random source, base58 encoded.
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(bs58::encode(bytes).into_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for BuildToken {
    type Err = crate::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| crate::Error::InvalidInput(format!("malformed token: {}", e)))?;
        if bytes.len() < TOKEN_BYTES {
            return Err(crate::Error::InvalidInput("token too short".to_string()));
        }
        Ok(Self(s.to_string()))
    }
}
