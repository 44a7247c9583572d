//! Digital Twin Model Identifier
//!
//! See https://github.com/Azure/digital-twin-model-identifier

use std::error::Error;
use std::fmt;
use std::str::FromStr;

/// A validated model identifier of the form `dtmi:<path>;<version>`.
///
/// The path is one or more colon separated segments. A segment starts with a letter, contains
/// only letters, digits and underscores, and does not end with an underscore. The version is
/// one to nine digits without a leading zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dtmi(String);

impl Dtmi {
    /// The identifier as announced to the hub
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Dtmi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Returned when a given string cannot be validated as a DTMI.
#[derive(Debug)]
pub struct DtmiValidationError(String);

impl fmt::Display for DtmiValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' is not a valid DTMI", self.0)
    }
}

impl Error for DtmiValidationError {}

impl FromStr for Dtmi {
    type Err = DtmiValidationError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let valid = input
            .strip_prefix("dtmi:")
            .and_then(|rest| rest.split_once(';'))
            .map(|(path, version)| path.split(':').all(valid_segment) && valid_version(version))
            .unwrap_or(false);

        if valid {
            Ok(Dtmi(input.to_owned()))
        } else {
            Err(DtmiValidationError(input.to_owned()))
        }
    }
}

fn valid_segment(segment: &str) -> bool {
    segment.starts_with(|c: char| c.is_ascii_alphabetic())
        && !segment.ends_with('_')
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn valid_version(version: &str) -> bool {
    (1..=9).contains(&version.len())
        && !version.starts_with('0')
        && version.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    #[test]
    fn dtmi_from_str() {
        let cases = vec![
            ("foo", false),
            ("dtmi:", false),
            ("dtmi:foo", false),
            ("dtmi:foo:", false),
            ("dtmi:foo;", false),
            ("dtmi:foo;f", false),
            ("dtmi:1b;f", false),
            ("dtmi:k;f", false),
            ("dtmi:foo_;1", false),
            ("dtmi:foo::bar;1", false),
            ("dtmi:foo_bar:u_16:baz33:qux;12", true),
            ("dtmi:com:example:TemperatureController;2", true),
            ("dtmi:mb56228c18_d7ff_11eb_bd6b_5ac573913239;123456789", true),
            ("dtmi:mb56228c18_d7ff_11eb_bd6b_5ac573913239;0123456789", false),
            ("dtmi:mb56228c18_d7ff_11eb_bd6b_5ac573913239;1234567890", false),
        ];

        for (input, should_be_accepted) in cases {
            let parsed = input.parse::<super::Dtmi>();
            assert_eq!(
                parsed.is_ok(),
                should_be_accepted,
                "unexpected result for '{}'",
                input
            );
        }
    }
}
