//  INTERVAL.rs
//    by OrbitMesh contributors
//
//  Description:
//!   Defines the [`Interval`] type, a thin wrapper around a [`Duration`]
//!   that parses and serializes as the `<n>[smhd]` syntax used in
//!   OrbitMesh config files (e.g., `30s`, `5m`, `1h`, `7d`).
//

use std::fmt::{Display, Formatter, Result as FResult};
use std::str::FromStr;
use std::time::Duration;

use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

pub use crate::errors::IntervalParseError as Error;


/***** LIBRARY *****/
/// A duration with the `<n>[smhd]` string form.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct Interval(pub Duration);
impl Interval {
    /// Constructor for an Interval of the given number of seconds.
    #[inline]
    pub fn from_secs(secs: u64) -> Self { Self(Duration::from_secs(secs)) }

    /// Returns the wrapped [`Duration`].
    #[inline]
    pub fn duration(&self) -> Duration { self.0 }
}

impl Display for Interval {
    fn fmt(&self, f: &mut Formatter<'_>) -> FResult {
        let secs: u64 = self.0.as_secs();
        // Render in the largest unit that divides evenly
        if secs > 0 && secs % (24 * 3600) == 0 {
            write!(f, "{}d", secs / (24 * 3600))
        } else if secs > 0 && secs % 3600 == 0 {
            write!(f, "{}h", secs / 3600)
        } else if secs > 0 && secs % 60 == 0 {
            write!(f, "{}m", secs / 60)
        } else {
            write!(f, "{secs}s")
        }
    }
}

impl FromStr for Interval {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s: &str = s.trim();
        if s.is_empty() {
            return Err(Error::Empty);
        }

        // Split off the unit suffix
        let (num, unit): (&str, char) = match s.chars().last() {
            Some(unit) if unit.is_ascii_alphabetic() => (&s[..s.len() - 1], unit),
            Some(_) => {
                return Err(Error::MissingUnit { raw: s.into() });
            },
            None => {
                return Err(Error::Empty);
            },
        };
        let num: u64 = match u64::from_str(num) {
            Ok(num) => num,
            Err(err) => {
                return Err(Error::IllegalNumber { raw: s.into(), err });
            },
        };

        // Scale by the unit
        let secs: u64 = match unit {
            's' => num,
            'm' => num * 60,
            'h' => num * 3600,
            'd' => num * 24 * 3600,
            unit => {
                return Err(Error::UnknownUnit { raw: s.into(), unit });
            },
        };
        Ok(Self(Duration::from_secs(secs)))
    }
}

impl Serialize for Interval {
    #[inline]
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> { serializer.serialize_str(&self.to_string()) }
}
impl<'de> Deserialize<'de> for Interval {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        /// Visitor for the Interval.
        struct IntervalVisitor;
        impl Visitor<'_> for IntervalVisitor {
            type Value = Interval;

            fn expecting(&self, f: &mut Formatter<'_>) -> FResult { write!(f, "an interval of the form '<n>[smhd]'") }

            #[inline]
            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> { Interval::from_str(v).map_err(E::custom) }
        }

        deserializer.deserialize_str(IntervalVisitor)
    }
}

impl From<Interval> for Duration {
    #[inline]
    fn from(value: Interval) -> Self { value.0 }
}





/***** TESTS *****/
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_parse() {
        assert_eq!(Interval::from_str("30s").unwrap(), Interval::from_secs(30));
        assert_eq!(Interval::from_str("5m").unwrap(), Interval::from_secs(300));
        assert_eq!(Interval::from_str("2h").unwrap(), Interval::from_secs(7200));
        assert_eq!(Interval::from_str("1d").unwrap(), Interval::from_secs(86400));
        assert_eq!(Interval::from_str(" 10s ").unwrap(), Interval::from_secs(10));
    }

    #[test]
    fn test_interval_parse_errors() {
        assert!(matches!(Interval::from_str(""), Err(Error::Empty)));
        assert!(matches!(Interval::from_str("30"), Err(Error::MissingUnit { .. })));
        assert!(matches!(Interval::from_str("30x"), Err(Error::UnknownUnit { unit: 'x', .. })));
        assert!(matches!(Interval::from_str("abcs"), Err(Error::IllegalNumber { .. })));
    }

    #[test]
    fn test_interval_display_roundtrip() {
        for raw in ["45s", "5m", "2h", "7d"] {
            let interval: Interval = Interval::from_str(raw).unwrap();
            assert_eq!(interval.to_string(), raw);
            assert_eq!(Interval::from_str(&interval.to_string()).unwrap(), interval);
        }
        // Non-even values fall back to seconds
        assert_eq!(Interval::from_secs(90).to_string(), "90s");
    }
}
