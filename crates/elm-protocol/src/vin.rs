use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Length of a Vehicle Identification Number.
pub const VIN_LENGTH: usize = 17;

// ISO 3779 alphabet: no I, O or Q.
static RE_VIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^[A-HJ-NPR-Z0-9]{17}$").unwrap());

/// Whether `vin` is 17 characters drawn from the VIN alphabet.
pub fn is_valid_vin(vin: &str) -> bool {
    RE_VIN.is_match(vin)
}

/// A decoded VIN. Candidates outside the VIN alphabet are kept but flagged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VinRecord {
    pub vin: String,
    pub valid: bool,
}

impl VinRecord {
    pub fn new(vin: impl Into<String>) -> Self {
        let vin = vin.into();
        let valid = is_valid_vin(&vin);
        Self { vin, valid }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_real_vins() {
        assert!(is_valid_vin("1HGCM82633A004352"));
        assert!(is_valid_vin("wdbabc1234567890z"));
    }

    #[test]
    fn rejects_forbidden_letters_and_lengths() {
        assert!(!is_valid_vin("1HGCM82633A00435O"));
        assert!(!is_valid_vin("1HGCM82633A00435"));
        assert!(!is_valid_vin("1HGCM82633A0043521"));
    }

    #[test]
    fn record_flags_invalid() {
        let record = VinRecord::new("IIIIIIIIIIIIIIIII");
        assert!(!record.valid);
        assert_eq!(record.vin.len(), VIN_LENGTH);
    }
}
