use chrono::Utc;
use rand::RngCore;

/// Generate an opaque identifier of the shape `prefix-<12 hex millis>-<4 hex
/// random>`.
///
/// The millisecond component makes natural string/lexical ordering track
/// creation order closely enough for human-facing listings; it is not relied
/// on for correctness anywhere a real `ORDER BY created_at` is available.
pub fn generate(prefix: &str) -> String {
    let millis = Utc::now().timestamp_millis().max(0) as u64;
    let mut rnd = [0u8; 2];
    rand::rng().fill_bytes(&mut rnd);
    format!("{prefix}-{millis:012x}-{}", hex::encode(rnd))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_have_expected_shape() {
        let id = generate("mis");
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "mis");
        assert_eq!(parts[1].len(), 12);
        assert_eq!(parts[2].len(), 4);
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = generate("prj");
        let b = generate("prj");
        assert_ne!(a, b);
    }
}
