//! Snowflake identifiers.
//!
//! Discord identifies everything with 64-bit unsigned integers. The JSON
//! encoding transmits them as decimal strings to avoid precision loss in
//! JavaScript consumers; the binary ETF encoding transmits them as plain
//! integers. Both wire forms are accepted on decode.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// A 64-bit Discord identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Snowflake(pub u64);

impl Snowflake {
    /// Create a new Snowflake from a u64 value.
    #[inline]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw u64 value.
    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Milliseconds since the Discord epoch (2015-01-01T00:00:00Z).
    #[inline]
    pub const fn timestamp(self) -> u64 {
        (self.0 >> 22) + 1420070400000
    }
}

impl fmt::Display for Snowflake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Snowflake {
    #[inline]
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Snowflake> for u64 {
    #[inline]
    fn from(snowflake: Snowflake) -> Self {
        snowflake.0
    }
}

impl Serialize for Snowflake {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Snowflake {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct SnowflakeVisitor;

        impl serde::de::Visitor<'_> for SnowflakeVisitor {
            type Value = Snowflake;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a string or integer snowflake id")
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(Snowflake(value))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(Snowflake(value as u64))
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                value
                    .parse()
                    .map(Snowflake)
                    .map_err(|_| E::custom(format!("invalid snowflake: {value}")))
            }
        }

        deserializer.deserialize_any(SnowflakeVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snowflake_serializes_as_string() {
        let id = Snowflake::new(175928847299117063);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"175928847299117063\"");
    }

    #[test]
    fn test_snowflake_accepts_both_wire_forms() {
        let from_string: Snowflake = serde_json::from_str("\"175928847299117063\"").unwrap();
        let from_integer: Snowflake = serde_json::from_str("175928847299117063").unwrap();
        assert_eq!(from_string, from_integer);
        assert_eq!(from_string.get(), 175928847299117063);
    }

    #[test]
    fn test_snowflake_timestamp() {
        let id = Snowflake::new(175928847299117063);
        assert_eq!(id.timestamp(), 1462015105796);
    }
}
