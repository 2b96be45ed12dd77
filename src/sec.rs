//! SEC nonce generation.
//!
//! The panel validates state-changing requests with a `key:value` pair sent
//! as the `SEC` query parameter and mirrored in an `ATERNOS_SEC_<key>`
//! cookie.

use std::fmt;
use std::ops::RangeInclusive;

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

use crate::cookies::CookieJar;

/// Prefix of the cookie that mirrors the SEC pair.
pub const SEC_COOKIE_PREFIX: &str = "ATERNOS_SEC_";

const PART_LEN: RangeInclusive<usize> = 11..=16;

/// One minted SEC pair.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SecToken {
    pub key: String,
    pub value: String,
}

impl SecToken {
    pub fn cookie_name(&self) -> String {
        format!("{SEC_COOKIE_PREFIX}{}", self.key)
    }
}

impl fmt::Display for SecToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.key, self.value)
    }
}

/// Mints SEC pairs from the thread-local CSPRNG.
#[derive(Clone, Debug, Default)]
pub struct SecTokenGenerator;

impl SecTokenGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Generates a fresh pair and registers its cookie in `jar`.
    pub fn generate(&self, jar: &CookieJar) -> SecToken {
        let token = SecToken {
            key: random_part(),
            value: random_part(),
        };
        jar.set(token.cookie_name(), token.value.clone());
        token
    }
}

fn random_part() -> String {
    let mut rng = thread_rng();
    let len = rng.gen_range(PART_LEN);
    (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{SecTokenGenerator, PART_LEN, SEC_COOKIE_PREFIX};
    use crate::cookies::CookieJar;

    #[test]
    fn parts_are_alphanumeric_with_bounded_length() {
        let generator = SecTokenGenerator::new();
        let jar = CookieJar::new();
        for _ in 0..64 {
            let token = generator.generate(&jar);
            for part in [&token.key, &token.value] {
                assert!(PART_LEN.contains(&part.len()), "bad length: {part}");
                assert!(part.chars().all(|c| c.is_ascii_alphanumeric()));
            }
        }
    }

    #[test]
    fn registers_mirroring_cookie() {
        let generator = SecTokenGenerator::new();
        let jar = CookieJar::new();
        let token = generator.generate(&jar);

        let rendered = token.to_string();
        let (key, value) = rendered.split_once(':').expect("key:value");
        assert_eq!(key, token.key);
        assert_eq!(
            jar.get(&format!("{SEC_COOKIE_PREFIX}{key}")).as_deref(),
            Some(value)
        );
    }

    #[test]
    fn consecutive_tokens_differ() {
        let generator = SecTokenGenerator::new();
        let jar = CookieJar::new();
        let first = generator.generate(&jar);
        let second = generator.generate(&jar);
        assert_ne!(first, second);
    }
}
