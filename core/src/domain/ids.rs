// Copyright (c) 2026 Termflux
// SPDX-License-Identifier: AGPL-3.0

//! Short opaque token generator shared by session and run identifiers.

use rand::Rng;

const TOKEN_LEN: usize = 12;
const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Generate a 12-character lowercase alphanumeric token.
pub fn short_id() -> String {
    let mut rng = rand::thread_rng();
    (0..TOKEN_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_twelve_lowercase_alphanumerics() {
        for _ in 0..100 {
            let id = short_id();
            assert_eq!(id.len(), 12);
            assert!(id.bytes().all(|b| ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn tokens_are_not_repeated() {
        let a = short_id();
        let b = short_id();
        assert_ne!(a, b);
    }
}
