//! Recipient addressing
//!
//! Phone numbers arrive from HTTP callers as bare digits (`5511999999999`),
//! E.164 (`+5511999999999`) or a full address (`5511999999999@s.whatsapp.net`).

use crate::error::{GatewayError, Result};

/// Server suffix for individual accounts.
pub const USER_SERVER: &str = "s.whatsapp.net";

const MIN_DIGITS: usize = 10;
const MAX_DIGITS: usize = 15;

/// A validated message destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    number: String,
    address: String,
}

impl Recipient {
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(GatewayError::invalid_input(
                "Required parameters: number and message",
            ));
        }

        if let Some((user, server)) = input.split_once('@') {
            if user.is_empty() || server.is_empty() {
                return Err(GatewayError::invalid_input(format!(
                    "Invalid address: {}",
                    input
                )));
            }
            return Ok(Self {
                number: user.to_string(),
                address: input.to_string(),
            });
        }

        let digits = input.trim_start_matches('+');
        if !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(GatewayError::invalid_input(format!(
                "Invalid number: {} (use digits with country code, e.g. 5511999999999)",
                input
            )));
        }
        if !(MIN_DIGITS..=MAX_DIGITS).contains(&digits.len()) {
            return Err(GatewayError::invalid_input(format!(
                "Invalid number: {} (expected {}-{} digits including country code)",
                input, MIN_DIGITS, MAX_DIGITS
            )));
        }

        Ok(Self {
            number: digits.to_string(),
            address: format!("{}@{}", digits, USER_SERVER),
        })
    }

    /// The user part, as echoed back to callers.
    pub fn number(&self) -> &str {
        &self.number
    }

    /// Full protocol address.
    pub fn address(&self) -> &str {
        &self.address
    }
}

impl std::fmt::Display for Recipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use rstest::rstest;

    #[test]
    fn test_bare_number() {
        let r = Recipient::parse("5511999999999").unwrap();
        assert_eq!(r.number(), "5511999999999");
        assert_eq!(r.address(), "5511999999999@s.whatsapp.net");
    }

    #[test]
    fn test_e164_number() {
        let r = Recipient::parse(" +5511999999999 ").unwrap();
        assert_eq!(r.address(), "5511999999999@s.whatsapp.net");
    }

    #[test]
    fn test_full_address_passes_through() {
        let r = Recipient::parse("120363025246125486@g.us").unwrap();
        assert_eq!(r.address(), "120363025246125486@g.us");
        assert_eq!(r.number(), "120363025246125486");
    }

    #[rstest]
    #[case("")]
    #[case("   ")]
    #[case("12345")]
    #[case("55 11 99999-9999")]
    #[case("1234567890123456")]
    #[case("@s.whatsapp.net")]
    #[case("5511999999999@")]
    fn test_rejects_invalid(#[case] input: &str) {
        let err = Recipient::parse(input).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidInput);
    }
}
