//! Relay identity: the 256-bit seed and derived name a service's overlay
//! endpoint is built from.

use rand::RngCore;

/// Generate a fresh 256-bit seed, encoded as 64 lowercase hex characters.
pub fn generate_seed_hex() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex_encode(&bytes)
}

/// Derive a short human-readable name from a seed. Deterministic in the seed
/// so the same identity always surfaces the same name in logs and the admin
/// status endpoint.
pub fn derive_name(service: &str, seed_hex: &str) -> String {
    format!("{}-{}", service, &seed_hex[..8])
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0f) as usize] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_is_64_hex_chars() {
        let seed = generate_seed_hex();
        assert_eq!(seed.len(), 64);
        assert!(seed.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn seeds_are_not_trivially_repeated() {
        let a = generate_seed_hex();
        let b = generate_seed_hex();
        assert_ne!(a, b);
    }

    #[test]
    fn derived_name_is_deterministic_in_the_seed() {
        let seed = "a".repeat(64);
        assert_eq!(derive_name("ollama_farm", &seed), derive_name("ollama_farm", &seed));
        assert_ne!(derive_name("ollama_farm", &seed), derive_name("piper_tts", &seed));
    }
}
