//! Expiration policies.
//!
//! A policy answers one question: given when a ticket was created, when it
//! was last used and what time it is now, is the ticket still valid? Every
//! policy reduces to a single *deadline*; a ticket is expired when `now` is
//! strictly after it. At the deadline itself the ticket is still valid.
//!
//! | Policy | Deadline |
//! |--------|----------|
//! | [`NeverExpires`](ExpirationPolicy::NeverExpires) | none |
//! | [`TimeToLive`](ExpirationPolicy::TimeToLive) | `creation + ttl` |
//! | [`IdleTimeout`](ExpirationPolicy::IdleTimeout) | `min(last_used + idle, creation + max_lifetime)` |
//! | [`ThrottledRate`](ExpirationPolicy::ThrottledRate) | `last_used + time_to_kill` |
//!
//! [`ThrottledRate`](ExpirationPolicy::ThrottledRate) additionally limits how
//! often the same ticket may be used; see [`ExpirationPolicy::check_throttle`].

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Per-ticket-type expiration rule.
///
/// Serialized with the ticket record and never changed after the ticket is
/// created.
///
/// ```
/// use std::time::Duration;
///
/// use chrono::{TimeDelta, Utc};
/// use sso_tickets::ExpirationPolicy;
///
/// let policy = ExpirationPolicy::TimeToLive { ttl: Duration::from_secs(10) };
/// let created = Utc::now();
/// assert!(!policy.is_expired(created, created, created + TimeDelta::seconds(10)));
/// assert!(policy.is_expired(created, created, created + TimeDelta::seconds(11)));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ExpirationPolicy {
    /// Never expires. Reserved for administrative and system tickets.
    NeverExpires,

    /// Expires a fixed time after creation.
    TimeToLive {
        /// Lifetime measured from creation.
        #[serde(with = "humantime_serde")]
        ttl: Duration,
    },

    /// Expires after a period of inactivity, and in any case once the
    /// maximum lifetime is reached. Use never extends the ticket beyond
    /// `max_lifetime`.
    IdleTimeout {
        /// Maximum time between uses.
        #[serde(with = "humantime_serde")]
        idle: Duration,
        /// Hard lifetime cap measured from creation.
        #[serde(with = "humantime_serde")]
        max_lifetime: Duration,
    },

    /// Limits the rate at which one ticket may be used, and expires it once
    /// unused for `time_to_kill`.
    ThrottledRate {
        /// Minimum interval between consecutive uses of the same ticket.
        #[serde(with = "humantime_serde")]
        min_interval: Duration,
        /// Expiry measured from the last use.
        #[serde(with = "humantime_serde")]
        time_to_kill: Duration,
    },
}

fn add(at: DateTime<Utc>, by: Duration) -> Option<DateTime<Utc>> {
    at.checked_add_signed(TimeDelta::from_std(by).ok()?)
}

impl ExpirationPolicy {
    /// Returns the instant after which the ticket is expired, or `None` if
    /// it never expires (or the deadline is beyond the representable range).
    #[must_use]
    pub fn deadline(
        &self,
        creation_time: DateTime<Utc>,
        last_used_time: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match *self {
            Self::NeverExpires => None,
            Self::TimeToLive { ttl } => add(creation_time, ttl),
            Self::IdleTimeout { idle, max_lifetime } => {
                match (add(last_used_time, idle), add(creation_time, max_lifetime)) {
                    (Some(idle), Some(max)) => Some(idle.min(max)),
                    (deadline, None) | (None, deadline) => deadline,
                }
            },
            Self::ThrottledRate { time_to_kill, .. } => add(last_used_time, time_to_kill),
        }
    }

    /// Returns `true` if `now` is strictly after the policy's deadline.
    #[must_use]
    pub fn is_expired(
        &self,
        creation_time: DateTime<Utc>,
        last_used_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        self.deadline(creation_time, last_used_time).is_some_and(|deadline| now > deadline)
    }

    /// Checks the minimum interval between uses.
    ///
    /// Only [`ThrottledRate`](Self::ThrottledRate) throttles, and only once
    /// the ticket has been used at least once. Returns `Err(retry_after)`
    /// when the ticket is presented again before `min_interval` has passed
    /// since its last use.
    ///
    /// # Errors
    ///
    /// Returns the remaining wait time on a violation.
    pub fn check_throttle(
        &self,
        last_used_time: DateTime<Utc>,
        usage_count: u64,
        now: DateTime<Utc>,
    ) -> Result<(), Duration> {
        let Self::ThrottledRate { min_interval, .. } = *self else {
            return Ok(());
        };
        if usage_count == 0 {
            return Ok(());
        }
        let Some(allowed_at) = add(last_used_time, min_interval) else {
            return Err(min_interval);
        };
        if now < allowed_at {
            return Err((allowed_at - now).to_std().unwrap_or(min_interval));
        }
        Ok(())
    }

    /// Returns how long until the deadline, or `None` if the ticket never
    /// expires. Zero once the deadline has passed.
    #[must_use]
    pub fn remaining(
        &self,
        creation_time: DateTime<Utc>,
        last_used_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<Duration> {
        let deadline = self.deadline(creation_time, last_used_time)?;
        Some((deadline - now).to_std().unwrap_or(Duration::ZERO))
    }

    /// Returns `true` for policies that never expire a ticket.
    #[must_use]
    pub fn is_never_expiring(&self) -> bool {
        matches!(self, Self::NeverExpires)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + TimeDelta::seconds(secs)
    }

    #[test]
    fn test_never_expires() {
        let policy = ExpirationPolicy::NeverExpires;
        assert!(!policy.is_expired(at(0), at(0), DateTime::<Utc>::MAX_UTC));
        assert_eq!(policy.remaining(at(0), at(0), at(5)), None);
    }

    #[test]
    fn test_idle_timeout_is_capped_by_max_lifetime() {
        let policy = ExpirationPolicy::IdleTimeout {
            idle: Duration::from_secs(60),
            max_lifetime: Duration::from_secs(100),
        };
        // Recently used, but past the hard cap.
        assert!(policy.is_expired(at(0), at(90), at(101)));
        // Within the cap but idle too long.
        assert!(policy.is_expired(at(0), at(10), at(71)));
        // Used recently and within the cap.
        assert!(!policy.is_expired(at(0), at(50), at(100)));
    }

    #[test]
    fn test_throttle_allows_first_use() {
        let policy = ExpirationPolicy::ThrottledRate {
            min_interval: Duration::from_secs(5),
            time_to_kill: Duration::from_secs(60),
        };
        assert!(policy.check_throttle(at(0), 0, at(0)).is_ok());
    }

    #[test]
    fn test_throttle_rejects_burst_and_reports_retry_after() {
        let policy = ExpirationPolicy::ThrottledRate {
            min_interval: Duration::from_secs(5),
            time_to_kill: Duration::from_secs(60),
        };
        assert_eq!(policy.check_throttle(at(10), 1, at(12)), Err(Duration::from_secs(3)));
        assert!(policy.check_throttle(at(10), 1, at(15)).is_ok());
        // Throttling is separate from expiry.
        assert!(!policy.is_expired(at(0), at(10), at(12)));
        assert!(policy.is_expired(at(0), at(10), at(71)));
    }

    #[test]
    fn test_other_policies_never_throttle() {
        let policy = ExpirationPolicy::TimeToLive { ttl: Duration::from_secs(1) };
        assert!(policy.check_throttle(at(0), 10, at(0)).is_ok());
    }

    #[test]
    fn test_serde_humantime_representation() {
        let policy = ExpirationPolicy::IdleTimeout {
            idle: Duration::from_secs(7200),
            max_lifetime: Duration::from_secs(8 * 3600),
        };
        let json = serde_json::to_string(&policy).unwrap();
        assert_eq!(json, r#"{"policy":"idle_timeout","idle":"2h","max_lifetime":"8h"}"#);
        assert_eq!(serde_json::from_str::<ExpirationPolicy>(&json).unwrap(), policy);
    }

    proptest! {
        #[test]
        fn prop_ttl_boundary_is_strict(
            created in 0i64..4_000_000_000,
            ttl_ms in 1u64..100_000_000,
        ) {
            let policy = ExpirationPolicy::TimeToLive { ttl: Duration::from_millis(ttl_ms) };
            let creation = at(created);
            let deadline = creation + TimeDelta::milliseconds(ttl_ms as i64);
            let one_ms = TimeDelta::milliseconds(1);

            prop_assert!(!policy.is_expired(creation, creation, deadline - one_ms));
            prop_assert!(!policy.is_expired(creation, creation, deadline));
            prop_assert!(policy.is_expired(creation, creation, deadline + one_ms));
        }

        #[test]
        fn prop_idle_never_extends_past_max_lifetime(
            idle_s in 1u64..10_000,
            max_s in 1u64..10_000,
            last_used_offset in 0i64..20_000,
        ) {
            let policy = ExpirationPolicy::IdleTimeout {
                idle: Duration::from_secs(idle_s),
                max_lifetime: Duration::from_secs(max_s),
            };
            let creation = at(0);
            let past_cap = at(max_s as i64 + 1);
            let last_used = at(last_used_offset.min(max_s as i64));
            prop_assert!(policy.is_expired(creation, last_used, past_cap));
        }
    }
}
