//! Core value types shared by every Granary component: availability zones,
//! service/resource/rate identifiers, units, AZ-sharded containers and the
//! overcommit factor arithmetic.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Days, Months, Utc};
use serde::{Deserialize, Serialize};

/// A physical locality label.
///
/// Real AZs are configured per cluster; the three pseudo-AZs have fixed
/// semantics: `any` holds values that are not sharded by AZ (flat resources),
/// `unknown` collects samples whose AZ is not configured, and `total` only
/// ever appears in report output as a synthesized sum.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AvailabilityZone(String);

impl AvailabilityZone {
    pub const ANY: &'static str = "any";
    pub const UNKNOWN: &'static str = "unknown";
    pub const TOTAL: &'static str = "total";

    pub fn new(name: impl Into<String>) -> Self {
        AvailabilityZone(name.into())
    }

    pub fn any() -> Self {
        AvailabilityZone(Self::ANY.to_string())
    }

    pub fn unknown() -> Self {
        AvailabilityZone(Self::UNKNOWN.to_string())
    }

    pub fn total() -> Self {
        AvailabilityZone(Self::TOTAL.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_any(&self) -> bool {
        self.0 == Self::ANY
    }

    pub fn is_unknown(&self) -> bool {
        self.0 == Self::UNKNOWN
    }

    pub fn is_total(&self) -> bool {
        self.0 == Self::TOTAL
    }

    /// A real AZ is non-empty and not one of the pseudo-AZ names.
    pub fn is_real(&self) -> bool {
        !self.0.is_empty() && !self.is_any() && !self.is_unknown() && !self.is_total()
    }
}

impl fmt::Display for AvailabilityZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AvailabilityZone {
    fn from(s: &str) -> Self {
        AvailabilityZone(s.to_string())
    }
}

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                $name(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                $name(s)
            }
        }
    };
}

string_newtype! {
    /// Identifies one backend service within the cluster (e.g. `compute`).
    ServiceType
}

string_newtype! {
    /// Identifies one resource within a service (e.g. `cores`).
    ResourceName
}

string_newtype! {
    /// Identifies one rate within a service (e.g. `instance-creations`).
    RateName
}

/// Unit of measurement for resources and rates. `None` renders as the
/// empty string on the wire and in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Unit {
    #[default]
    #[serde(rename = "")]
    None,
    #[serde(rename = "B")]
    Bytes,
    #[serde(rename = "KiB")]
    Kibibytes,
    #[serde(rename = "MiB")]
    Mebibytes,
    #[serde(rename = "GiB")]
    Gibibytes,
    #[serde(rename = "TiB")]
    Tebibytes,
}

impl Unit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Unit::None => "",
            Unit::Bytes => "B",
            Unit::Kibibytes => "KiB",
            Unit::Mebibytes => "MiB",
            Unit::Gibibytes => "GiB",
            Unit::Tebibytes => "TiB",
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Unit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "none" => Ok(Unit::None),
            "B" => Ok(Unit::Bytes),
            "KiB" => Ok(Unit::Kibibytes),
            "MiB" => Ok(Unit::Mebibytes),
            "GiB" => Ok(Unit::Gibibytes),
            "TiB" => Ok(Unit::Tebibytes),
            other => Err(format!("unknown unit: {other:?}")),
        }
    }
}

/// An ordered map from availability zone to some value, iterated in AZ order
/// so downstream output is deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PerAZ<T>(BTreeMap<AvailabilityZone, T>);

impl<T> Default for PerAZ<T> {
    fn default() -> Self {
        PerAZ(BTreeMap::new())
    }
}

impl<T> PerAZ<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, az: &AvailabilityZone) -> Option<&T> {
        self.0.get(az)
    }

    pub fn insert(&mut self, az: AvailabilityZone, value: T) -> Option<T> {
        self.0.insert(az, value)
    }

    pub fn remove(&mut self, az: &AvailabilityZone) -> Option<T> {
        self.0.remove(az)
    }

    pub fn contains(&self, az: &AvailabilityZone) -> bool {
        self.0.contains_key(az)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AvailabilityZone, &T)> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &AvailabilityZone> {
        self.0.keys()
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.0.values()
    }

    pub fn entry_or_default(&mut self, az: AvailabilityZone) -> &mut T
    where
        T: Default,
    {
        self.0.entry(az).or_default()
    }
}

impl<T> IntoIterator for PerAZ<T> {
    type Item = (AvailabilityZone, T);
    type IntoIter = std::collections::btree_map::IntoIter<AvailabilityZone, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<T> FromIterator<(AvailabilityZone, T)> for PerAZ<T> {
    fn from_iter<I: IntoIterator<Item = (AvailabilityZone, T)>>(iter: I) -> Self {
        PerAZ(iter.into_iter().collect())
    }
}

impl PerAZ<u64> {
    pub fn sum(&self) -> u64 {
        self.0.values().sum()
    }

    /// Fold entries for AZs outside `real_azs` into the pseudo-AZ `unknown`,
    /// summing values. Entries for `any` survive unchanged (flat resources
    /// live there).
    pub fn normalize(self, real_azs: &[AvailabilityZone]) -> PerAZ<u64> {
        let mut result = PerAZ::new();
        for (az, value) in self.0 {
            let target = if az.is_any() || real_azs.contains(&az) {
                az
            } else {
                AvailabilityZone::unknown()
            };
            *result.0.entry(target).or_insert(0) += value;
        }
        result
    }
}

/// A symbolic span of wall-clock time ("1 year", "3 months, 15 days").
///
/// Commitment durations and the usage retention period are stated in
/// calendar units rather than seconds so that "1 year" survives leap days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeSpan {
    pub years: u32,
    pub months: u32,
    pub days: u32,
    pub hours: u32,
    pub minutes: u32,
    pub seconds: u32,
}

impl TimeSpan {
    pub fn is_zero(&self) -> bool {
        *self == TimeSpan::default()
    }

    fn sub_day_duration(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.hours))
            + chrono::Duration::minutes(i64::from(self.minutes))
            + chrono::Duration::seconds(i64::from(self.seconds))
    }

    pub fn add_to(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let months = Months::new(self.years * 12 + self.months);
        let days = Days::new(u64::from(self.days));
        t.checked_add_months(months)
            .and_then(|t| t.checked_add_days(days))
            .map(|t| t + self.sub_day_duration())
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn subtract_from(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let months = Months::new(self.years * 12 + self.months);
        let days = Days::new(u64::from(self.days));
        t.checked_sub_months(months)
            .and_then(|t| t.checked_sub_days(days))
            .map(|t| t - self.sub_day_duration())
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

impl fmt::Display for TimeSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        for (amount, unit) in [
            (self.years, "year"),
            (self.months, "month"),
            (self.days, "day"),
            (self.hours, "hour"),
            (self.minutes, "minute"),
            (self.seconds, "second"),
        ] {
            if amount > 0 {
                let plural = if amount == 1 { "" } else { "s" };
                parts.push(format!("{amount} {unit}{plural}"));
            }
        }
        if parts.is_empty() {
            return f.write_str("0 days");
        }
        f.write_str(&parts.join(", "))
    }
}

impl FromStr for TimeSpan {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut span = TimeSpan::default();
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let mut tokens = part.split_whitespace();
            let amount: u32 = tokens
                .next()
                .ok_or_else(|| format!("invalid time span: {s:?}"))?
                .parse()
                .map_err(|_| format!("invalid time span: {s:?}"))?;
            let unit = tokens
                .next()
                .ok_or_else(|| format!("invalid time span: {s:?}"))?;
            if tokens.next().is_some() {
                return Err(format!("invalid time span: {s:?}"));
            }
            match unit {
                "year" | "years" => span.years += amount,
                "month" | "months" => span.months += amount,
                "day" | "days" => span.days += amount,
                "hour" | "hours" => span.hours += amount,
                "minute" | "minutes" => span.minutes += amount,
                "second" | "seconds" => span.seconds += amount,
                other => return Err(format!("unknown time unit: {other:?}")),
            }
        }
        if span.is_zero() {
            return Err(format!("time span must be positive: {s:?}"));
        }
        Ok(span)
    }
}

impl Serialize for TimeSpan {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TimeSpan {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Multiplier between raw capacity (what the backend physically has) and
/// effective capacity (what Granary hands out as quota). Zero means
/// "not configured" and behaves like 1.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OvercommitFactor(pub f64);

impl OvercommitFactor {
    pub fn is_set(&self) -> bool {
        self.0 > 0.0
    }

    /// Effective capacity for a raw capacity: `floor(raw * factor)`.
    pub fn apply_to(&self, raw: u64) -> u64 {
        if !self.is_set() {
            return raw;
        }
        (raw as f64 * self.0).floor() as u64
    }

    /// Smallest raw capacity whose effective capacity covers `effective`.
    /// `apply_to(apply_in_reverse_to(x)) >= x`, off by at most one from the
    /// exact quotient.
    pub fn apply_in_reverse_to(&self, effective: u64) -> u64 {
        if !self.is_set() {
            return effective;
        }
        let mut raw = (effective as f64 / self.0).ceil() as u64;
        // floating-point floor/ceil may land one unit short
        while self.apply_to(raw) < effective {
            raw += 1;
        }
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_az_predicates() {
        assert!(AvailabilityZone::new("az-one").is_real());
        assert!(!AvailabilityZone::any().is_real());
        assert!(!AvailabilityZone::unknown().is_real());
        assert!(!AvailabilityZone::total().is_real());
        assert!(!AvailabilityZone::new("").is_real());
        assert!(AvailabilityZone::any().is_any());
    }

    #[test]
    fn test_unit_round_trip() {
        for unit in [
            Unit::None,
            Unit::Bytes,
            Unit::Kibibytes,
            Unit::Mebibytes,
            Unit::Gibibytes,
            Unit::Tebibytes,
        ] {
            assert_eq!(unit.as_str().parse::<Unit>().unwrap(), unit);
        }
        assert!("XiB".parse::<Unit>().is_err());
    }

    #[test]
    fn test_per_az_sum_and_order() {
        let mut per_az = PerAZ::new();
        per_az.insert(AvailabilityZone::new("az-two"), 20u64);
        per_az.insert(AvailabilityZone::new("az-one"), 10u64);
        assert_eq!(per_az.sum(), 30);

        let keys: Vec<_> = per_az.keys().map(|az| az.as_str().to_string()).collect();
        assert_eq!(keys, vec!["az-one", "az-two"]);
    }

    #[test]
    fn test_per_az_normalize_folds_unknown() {
        let real = vec![
            AvailabilityZone::new("az-one"),
            AvailabilityZone::new("az-two"),
        ];
        let mut per_az = PerAZ::new();
        per_az.insert(AvailabilityZone::new("az-one"), 100u64);
        per_az.insert(AvailabilityZone::new("az-two"), 200u64);
        per_az.insert(AvailabilityZone::new("foo"), 7u64);
        per_az.insert(AvailabilityZone::new("bar"), 3u64);

        let normalized = per_az.normalize(&real);
        assert_eq!(
            normalized.get(&AvailabilityZone::new("az-one")).copied(),
            Some(100)
        );
        assert_eq!(
            normalized.get(&AvailabilityZone::new("az-two")).copied(),
            Some(200)
        );
        assert_eq!(
            normalized.get(&AvailabilityZone::unknown()).copied(),
            Some(10)
        );
        assert!(!normalized.contains(&AvailabilityZone::new("foo")));
    }

    #[test]
    fn test_per_az_normalize_keeps_any() {
        let real = vec![AvailabilityZone::new("az-one")];
        let mut per_az = PerAZ::new();
        per_az.insert(AvailabilityZone::any(), 42u64);
        let normalized = per_az.normalize(&real);
        assert_eq!(normalized.get(&AvailabilityZone::any()).copied(), Some(42));
    }

    #[test]
    fn test_time_span_parse() {
        let span: TimeSpan = "1 year".parse().unwrap();
        assert_eq!(span.years, 1);

        let span: TimeSpan = "3 months, 15 days".parse().unwrap();
        assert_eq!(span.months, 3);
        assert_eq!(span.days, 15);

        assert!("".parse::<TimeSpan>().is_err());
        assert!("5 fortnights".parse::<TimeSpan>().is_err());
        assert!("0 days".parse::<TimeSpan>().is_err());
    }

    #[test]
    fn test_time_span_display_round_trip() {
        for input in ["1 year", "2 years, 6 months", "90 days", "12 hours"] {
            let span: TimeSpan = input.parse().unwrap();
            assert_eq!(span.to_string(), input);
        }
    }

    #[test]
    fn test_time_span_arithmetic() {
        let base = Utc.with_ymd_and_hms(2024, 1, 31, 12, 0, 0).unwrap();
        let span: TimeSpan = "1 month".parse().unwrap();
        // chrono clamps to the end of February
        assert_eq!(
            span.add_to(base),
            Utc.with_ymd_and_hms(2024, 2, 29, 12, 0, 0).unwrap()
        );

        let span: TimeSpan = "1 year".parse().unwrap();
        assert_eq!(
            span.subtract_from(base),
            Utc.with_ymd_and_hms(2023, 1, 31, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_overcommit_round_trip() {
        for factor in [0.5, 1.0, 1.2, 1.5, 2.0, 3.7] {
            let factor = OvercommitFactor(factor);
            for raw in [0u64, 1, 2, 10, 99, 100, 12345] {
                let effective = factor.apply_to(raw);
                let recovered = factor.apply_in_reverse_to(effective);
                assert!(
                    recovered >= raw.saturating_sub(1) && factor.apply_to(recovered) >= effective,
                    "round trip failed for raw={raw} factor={factor:?}"
                );
                assert!(recovered.abs_diff(raw) <= 1);
            }
        }
    }

    #[test]
    fn test_overcommit_unset_is_identity() {
        let factor = OvercommitFactor(0.0);
        assert_eq!(factor.apply_to(42), 42);
        assert_eq!(factor.apply_in_reverse_to(42), 42);
    }
}
