//! Credential cipher seam.
//!
//! The store encrypts credential columns on write and decrypts on read
//! through this trait. The actual cipher is an external collaborator;
//! [`PassthroughCipher`] is the default wiring.

/// Encrypts/decrypts secret columns. Implementations must be infallible for
/// round trips of their own output.
pub trait SecretCipher: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String, String>;
    fn decrypt(&self, stored: &str) -> Result<String, String>;
}

/// Stores secrets verbatim. Stands in until a real cipher is injected.
pub struct PassthroughCipher;

impl SecretCipher for PassthroughCipher {
    fn encrypt(&self, plaintext: &str) -> Result<String, String> {
        Ok(plaintext.to_string())
    }

    fn decrypt(&self, stored: &str) -> Result<String, String> {
        Ok(stored.to_string())
    }
}
