//! Session token generation.
//!
//! Tokens are `jlab:srvr:` followed by the hex encoding of random bytes
//! from the operating system. The prefix marks the value as issued by this
//! app so it can be told apart from a user-chosen password.

use rand::rngs::OsRng;
use rand::RngCore;

pub const TOKEN_PREFIX: &str = "jlab:srvr:";

/// Random bytes per token (152 bits of entropy).
pub const TOKEN_BYTES: usize = 19;

/// Total length of a generated token.
pub const TOKEN_LEN: usize = TOKEN_PREFIX.len() + TOKEN_BYTES * 2;

/// Generate a fresh session token.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    format!("{}{}", TOKEN_PREFIX, hex::encode(bytes))
}

/// Whether `token` has the shape of a token produced by [`generate_token`].
pub fn is_app_token(token: &str) -> bool {
    token.len() == TOKEN_LEN
        && token
            .strip_prefix(TOKEN_PREFIX)
            .is_some_and(|hex| hex.bytes().all(|b| b.is_ascii_hexdigit()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_token_shape() {
        let token = generate_token();
        assert!(token.starts_with(TOKEN_PREFIX));
        assert_eq!(token.len(), TOKEN_LEN);
        assert!(is_app_token(&token));
    }

    #[test]
    fn test_tokens_do_not_repeat() {
        let tokens: HashSet<String> = (0..10_000).map(|_| generate_token()).collect();
        assert_eq!(tokens.len(), 10_000);
        assert!(tokens.iter().all(|t| t.len() == TOKEN_LEN));
    }

    #[test]
    fn test_foreign_tokens_rejected() {
        assert!(!is_app_token("jupyter:abcdef"));
        assert!(!is_app_token("jlab:srvr:xyz"));
        assert!(!is_app_token(""));
    }
}
