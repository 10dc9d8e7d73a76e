use std::convert::TryFrom;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// Seconds since the [`UNIX_EPOCH`].
///
/// Backed by a non-negative [`i64`] rather than [`u64`] so it composes
/// cleanly with `jsonwebtoken`'s `exp`/`iat` claims, which are signed.
///
/// Serializes as an RFC 3339 / ISO-8601 UTC string rather than a raw epoch
/// integer: every sidecar and HTTP response that carries a `TimestampSecs`
/// (invite tokens, enrolled-user records, admin token generation) is
/// specified in terms of ISO-8601 timestamps.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TimestampSecs(i64);

impl TimestampSecs {
    /// Panics if the current time is not representable (clock before 1970).
    pub fn now() -> Self {
        Self::try_from(SystemTime::now()).expect("system clock is before the epoch")
    }

    pub fn from_secs(secs: i64) -> Self {
        Self(secs)
    }

    pub fn as_secs(self) -> i64 {
        self.0
    }

    pub fn plus(self, duration: Duration) -> Self {
        Self(self.0 + duration.as_secs() as i64)
    }

    pub fn is_past(self) -> bool {
        self < Self::now()
    }

    /// Render as an RFC 3339 / ISO-8601 UTC timestamp, the format used by the
    /// invite-token and session sidecar files.
    pub fn to_rfc3339(self) -> String {
        chrono::DateTime::<chrono::Utc>::from(SystemTime::from(self)).to_rfc3339()
    }

    pub fn from_rfc3339(s: &str) -> anyhow::Result<Self> {
        let dt = chrono::DateTime::parse_from_rfc3339(s)
            .with_context(|| format!("invalid RFC3339 timestamp: {s}"))?;
        Self::try_from(SystemTime::from(dt.with_timezone(&chrono::Utc)))
    }
}

impl From<TimestampSecs> for SystemTime {
    fn from(timestamp: TimestampSecs) -> Self {
        let secs = u64::try_from(timestamp.0).expect("non-negative invariant was violated");
        UNIX_EPOCH + Duration::from_secs(secs)
    }
}

impl TryFrom<SystemTime> for TimestampSecs {
    type Error = anyhow::Error;
    fn try_from(system_time: SystemTime) -> anyhow::Result<Self> {
        system_time
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_secs())
            .map(i64::try_from)
            .map(|res| res.map(Self))
            .context("current time is before January 1st, 1970")?
            .context("current time is more than 292 billion years past epoch")
    }
}

impl Serialize for TimestampSecs {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_rfc3339())
    }
}

impl<'de> Deserialize<'de> for TimestampSecs {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        TimestampSecs::from_rfc3339(&value).map_err(|e| de::Error::custom(e.to_string()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn serializes_as_rfc3339_string() {
        let t = TimestampSecs::from_secs(0);
        assert_eq!(serde_json::to_string(&t).unwrap(), "\"1970-01-01T00:00:00+00:00\"");
    }

    #[test]
    fn deserialize_rejects_non_rfc3339_input() {
        assert!(serde_json::from_str::<TimestampSecs>("42").is_err());
        assert!(serde_json::from_str::<TimestampSecs>("\"not-a-date\"").is_err());
        assert_eq!(
            serde_json::from_str::<TimestampSecs>("\"1970-01-01T00:00:00Z\"")
                .unwrap()
                .as_secs(),
            0
        );
    }

    #[test]
    fn rfc3339_roundtrip() {
        let now = TimestampSecs::now();
        let s = now.to_rfc3339();
        let parsed = TimestampSecs::from_rfc3339(&s).unwrap();
        assert_eq!(now, parsed);
    }

    #[test]
    fn plus_adds_seconds() {
        let t = TimestampSecs::from_secs(1000);
        assert_eq!(t.plus(Duration::from_secs(15 * 60)).as_secs(), 1900);
    }
}
