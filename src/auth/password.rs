//! Password hashing, policy and temporary password generation

use crate::{config::SecurityConfig, error::AppError};
use argon2::{
    password_hash::{
        rand_core::OsRng, PasswordHash, PasswordHasher as _, PasswordVerifier, SaltString,
    },
    Algorithm, Argon2, Params, Version,
};
use rand::{seq::SliceRandom, Rng};

/// Argon2id hasher. Hashes embed salt and parameters (PHC string), so
/// hashes produced under older parameters keep verifying.
#[derive(Clone)]
pub struct PasswordHasher {
    argon2: Argon2<'static>,
}

impl PasswordHasher {
    pub fn from_config(security: &SecurityConfig) -> Result<Self, AppError> {
        let params = Params::new(
            security.argon2_memory_kib,
            security.argon2_iterations,
            security.argon2_parallelism,
            None,
        )
        .map_err(|e| AppError::Config(format!("Invalid Argon2 params: {}", e)))?;

        Ok(Self {
            argon2: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        })
    }

    /// Hash a password with a fresh random salt
    pub fn hash(&self, password: &str) -> Result<String, AppError> {
        let salt = SaltString::generate(&mut OsRng);

        let password_hash = self
            .argon2
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| {
                tracing::error!("Failed to hash password: {:?}", e);
                AppError::Internal(format!("Failed to hash password: {}", e))
            })?
            .to_string();

        Ok(password_hash)
    }

    /// `Ok(false)` on mismatch; `Err` only when the stored hash is unreadable
    pub fn verify(&self, password: &str, hash: &str) -> Result<bool, AppError> {
        let parsed_hash = PasswordHash::new(hash).map_err(|e| {
            tracing::error!("Stored password hash is malformed: {:?}", e);
            AppError::Internal(format!("Failed to parse password hash: {}", e))
        })?;

        Ok(self
            .argon2
            .verify_password(password.as_bytes(), &parsed_hash)
            .is_ok())
    }
}

/// Complexity rules applied to every new password
#[derive(Debug, Clone)]
pub struct PasswordPolicy {
    pub min_length: usize,
    pub max_length: usize,
    pub require_uppercase: bool,
    pub require_lowercase: bool,
    pub require_digit: bool,
    pub require_special: bool,
    pub disallow_username: bool,
}

impl PasswordPolicy {
    pub fn from_config(security: &SecurityConfig) -> Self {
        Self {
            min_length: security.password_min_length,
            max_length: security.password_max_length,
            require_uppercase: security.password_require_uppercase,
            require_lowercase: security.password_require_lowercase,
            require_digit: security.password_require_digit,
            require_special: security.password_require_special,
            disallow_username: security.password_disallow_username,
        }
    }

    /// Every violated rule, in a stable order. Empty means acceptable.
    pub fn violations(&self, password: &str, username: Option<&str>) -> Vec<String> {
        let mut errors = Vec::new();
        let length = password.chars().count();

        if length < self.min_length {
            errors.push(format!(
                "Password must be at least {} characters",
                self.min_length
            ));
        }
        if length > self.max_length {
            errors.push(format!(
                "Password must not exceed {} characters",
                self.max_length
            ));
        }
        if self.require_uppercase && !password.chars().any(|c| c.is_uppercase()) {
            errors.push("Password must contain at least one uppercase letter".to_string());
        }
        if self.require_lowercase && !password.chars().any(|c| c.is_lowercase()) {
            errors.push("Password must contain at least one lowercase letter".to_string());
        }
        if self.require_digit && !password.chars().any(|c| c.is_ascii_digit()) {
            errors.push("Password must contain at least one digit".to_string());
        }
        if self.require_special && !password.chars().any(|c| !c.is_alphanumeric()) {
            errors.push("Password must contain at least one special character".to_string());
        }
        if self.disallow_username {
            if let Some(name) = username.filter(|n| !n.is_empty()) {
                if password.to_lowercase().contains(&name.to_lowercase()) {
                    errors.push("Password must not contain your username".to_string());
                }
            }
        }

        errors
    }

    /// Fails with `PolicyViolation` listing every rule that failed
    pub fn validate(&self, password: &str, username: Option<&str>) -> Result<(), AppError> {
        let errors = self.violations(password, username);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(AppError::PolicyViolation(errors))
        }
    }

    /// Random password that satisfies this policy for `username`.
    /// Candidates that happen to contain the username are discarded.
    pub fn generate_temporary_password(&self, username: Option<&str>) -> String {
        loop {
            let candidate = self.random_candidate();
            if self.violations(&candidate, username).is_empty() {
                return candidate;
            }
        }
    }

    /// One character of each class, filled up from the full alphabet, then shuffled
    fn random_candidate(&self) -> String {
        const UPPER: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ";
        const LOWER: &[u8] = b"abcdefghijkmnopqrstuvwxyz";
        const DIGITS: &[u8] = b"23456789";
        const SPECIAL: &[u8] = b"!@#$%^&*-_=+?";

        let length = self.min_length.max(16).min(self.max_length);
        let mut rng = rand::rngs::OsRng;

        let mut chars: Vec<u8> = [UPPER, LOWER, DIGITS, SPECIAL]
            .iter()
            .map(|class| class[rng.gen_range(0..class.len())])
            .collect();

        let alphabet: Vec<u8> = [UPPER, LOWER, DIGITS, SPECIAL].concat();
        while chars.len() < length {
            chars.push(alphabet[rng.gen_range(0..alphabet.len())]);
        }
        chars.shuffle(&mut rng);

        chars.into_iter().map(char::from).collect()
    }
}
