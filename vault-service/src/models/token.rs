//! Random tokens for application secrets and authorization codes.

use rand::Rng;

const CHARSET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Length of generated secrets and codes; matches the `code` column width.
pub const TOKEN_LEN: usize = 30;

/// Draw a token of `len` characters from `[0-9A-Za-z]`.
///
/// Uniqueness is enforced by the storage layer, a collision surfaces there as a
/// conflict.
pub fn generate_token<R: Rng + ?Sized>(rng: &mut R, len: usize) -> String {
    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn tokens_are_alphanumeric_and_sized() {
        let token = generate_token(&mut rand::thread_rng(), TOKEN_LEN);
        assert_eq!(token.len(), TOKEN_LEN);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn seeded_rng_is_reproducible() {
        let a = generate_token(&mut StdRng::seed_from_u64(7), TOKEN_LEN);
        let b = generate_token(&mut StdRng::seed_from_u64(7), TOKEN_LEN);
        let c = generate_token(&mut StdRng::seed_from_u64(8), TOKEN_LEN);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
