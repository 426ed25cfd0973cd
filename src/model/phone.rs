use std::{ops::Deref, str::FromStr};

use mongodb::bson::{to_bson, Bson};
use phonenumber::PhoneNumber;
use serde::{Deserialize, Serialize};

/// A voter's mobile number, as used by the phone-challenge signing provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Msisdn {
    inner: PhoneNumber,
}

impl Deref for Msisdn {
    type Target = PhoneNumber;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl FromStr for Msisdn {
    type Err = phonenumber::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Msisdn {
            inner: s.parse::<PhoneNumber>()?,
        })
    }
}

impl TryFrom<String> for Msisdn {
    type Error = phonenumber::ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Msisdn> for String {
    fn from(msisdn: Msisdn) -> Self {
        msisdn.inner.to_string()
    }
}

impl std::fmt::Display for Msisdn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl From<Msisdn> for Bson {
    fn from(msisdn: Msisdn) -> Self {
        to_bson(&msisdn).unwrap() // Valid because `PhoneNumber` serialization doesn't fail
    }
}

/// Example data for tests.
#[cfg(test)]
mod examples {
    use super::*;

    impl Msisdn {
        pub fn example() -> Self {
            "+37251234567".parse().unwrap()
        }
    }
}
