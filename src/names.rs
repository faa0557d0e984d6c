//! Random job names.

use petname::Generator;
use petname::Petnames;
use rand::Rng;

/// Generates a random job name.
///
/// Returns a name in the format `adjective-noun-xxxxxx` (e.g.,
/// `happy-elephant-a1b2c3`).
pub fn generate_job_name() -> String {
    let petname = Petnames::default()
        .generate_one(2, "-")
        .unwrap_or_else(|| "gantry-job".to_string());

    format!("{petname}-{suffix}", suffix = random_suffix(6))
}

/// Generates a random suffix of `len` lowercase hex digits.
pub fn random_suffix(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| {
            let digit: u32 = rng.random_range(0..16);
            char::from_digit(digit, 16).unwrap_or('0')
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn names_have_a_hex_suffix() {
        let name = generate_job_name();
        let (_, suffix) = name.rsplit_once('-').unwrap();
        assert_eq!(suffix.len(), 6);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn suffix_lengths() {
        for len in [4, 7] {
            let suffix = random_suffix(len);
            assert_eq!(suffix.len(), len);
            assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }
}
