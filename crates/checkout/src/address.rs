//! Shipping address checks.

use stock_ledger::ShippingAddress;

use crate::error::{PlacementError, Result};

/// Checks that an address has every required field and a two-letter country code.
pub fn validate_address(address: &ShippingAddress) -> Result<()> {
    let required = [
        ("recipient", &address.recipient),
        ("line1", &address.line1),
        ("city", &address.city),
        ("postal_code", &address.postal_code),
    ];
    for (field, value) in required {
        if value.trim().is_empty() {
            return Err(PlacementError::InvalidAddress(format!("{field} is required")));
        }
    }

    let country = address.country.trim();
    if country.len() != 2 || !country.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(PlacementError::InvalidAddress(format!(
            "country must be a two-letter code, got {:?}",
            address.country
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address() -> ShippingAddress {
        ShippingAddress {
            recipient: "Ada Lovelace".to_string(),
            line1: "12 St James's Square".to_string(),
            line2: None,
            city: "London".to_string(),
            postal_code: "SW1Y 4JH".to_string(),
            country: "GB".to_string(),
        }
    }

    #[test]
    fn complete_address_passes() {
        assert!(validate_address(&address()).is_ok());
    }

    #[test]
    fn blank_field_is_rejected() {
        let mut blank_city = address();
        blank_city.city = "   ".to_string();

        let err = validate_address(&blank_city).unwrap_err();
        assert!(err.to_string().contains("city"));
    }

    #[test]
    fn country_must_be_two_letters() {
        for country in ["GBR", "", "1A"] {
            let mut bad = address();
            bad.country = country.to_string();
            assert!(matches!(
                validate_address(&bad),
                Err(PlacementError::InvalidAddress(_))
            ));
        }
    }
}
