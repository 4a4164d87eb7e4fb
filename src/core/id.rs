use rand::Rng;

/// Length of an instance ID in hex characters.
const ID_LEN: usize = 16;

/// Generate a random hex instance ID (16 hex chars = 8 random bytes).
pub fn generate_id() -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..ID_LEN / 2).map(|_| rng.gen()).collect();
    hex_encode(&bytes)
}

/// Encode bytes as a lowercase hex string.
fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_id_has_correct_length() {
        assert_eq!(generate_id().len(), ID_LEN);
    }

    #[test]
    fn generated_id_is_lowercase_hex() {
        let id = generate_id();
        assert!(id
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
