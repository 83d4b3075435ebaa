use std::{cmp::Ordering, time::Duration};

use tokio::time::Instant;

/// An absolute point in time after which a wait is considered expired.
///
/// A deadline is either reachable, wrapping a monotonic [`Instant`], or
/// [`unreachable`](Deadline::unreachable), which never expires. Deadlines are
/// totally ordered, with the unreachable deadline greater than every
/// reachable one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
	/// A deadline that never expires.
	#[must_use]
	pub const fn unreachable() -> Self {
		Self(None)
	}

	/// A deadline at the given instant.
	#[must_use]
	pub const fn at(instant: Instant) -> Self {
		Self(Some(instant))
	}

	/// A deadline the given duration from now.
	///
	/// A zero duration yields a deadline that is already reached.
	#[must_use]
	pub fn after(duration: Duration) -> Self {
		Self(Some(Instant::now() + duration))
	}

	#[must_use]
	pub const fn is_unreachable(&self) -> bool {
		self.0.is_none()
	}

	/// Whether the deadline has already expired. Never true for an
	/// unreachable deadline.
	#[must_use]
	pub fn is_reached(&self) -> bool {
		self.0.is_some_and(|instant| instant <= Instant::now())
	}

	/// The wrapped instant, or `None` for an unreachable deadline.
	#[must_use]
	pub const fn instant(&self) -> Option<Instant> {
		self.0
	}

	/// Time remaining until the deadline, saturating at zero once it has
	/// passed. `None` for an unreachable deadline.
	#[must_use]
	pub fn time_left(&self) -> Option<Duration> {
		self.0
			.map(|instant| instant.saturating_duration_since(Instant::now()))
	}
}

impl Ord for Deadline {
	fn cmp(&self, other: &Self) -> Ordering {
		match (self.0, other.0) {
			(Some(lhs), Some(rhs)) => lhs.cmp(&rhs),
			(Some(_), None) => Ordering::Less,
			(None, Some(_)) => Ordering::Greater,
			(None, None) => Ordering::Equal,
		}
	}
}

impl PartialOrd for Deadline {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

impl Default for Deadline {
	/// The unreachable deadline.
	fn default() -> Self {
		Self::unreachable()
	}
}

impl From<Duration> for Deadline {
	fn from(duration: Duration) -> Self {
		Self::after(duration)
	}
}

impl From<Instant> for Deadline {
	fn from(instant: Instant) -> Self {
		Self::at(instant)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn zero_duration_is_already_reached() {
		assert!(Deadline::after(Duration::ZERO).is_reached());
	}

	#[test]
	fn unreachable_never_expires() {
		let deadline = Deadline::unreachable();
		assert!(deadline.is_unreachable());
		assert!(!deadline.is_reached());
		assert_eq!(deadline.time_left(), None);
	}

	#[test]
	fn total_order_puts_unreachable_last() {
		let now = Instant::now();
		let sooner = Deadline::at(now);
		let later = Deadline::at(now + Duration::from_secs(1));
		let never = Deadline::unreachable();

		assert!(sooner < later);
		assert!(later < never);
		assert_eq!(never, Deadline::unreachable());
		assert_eq!(never.cmp(&Deadline::unreachable()), Ordering::Equal);
	}

	#[test]
	fn time_left_saturates_at_zero() {
		let expired = Deadline::at(Instant::now() - Duration::from_secs(1));
		assert_eq!(expired.time_left(), Some(Duration::ZERO));
		assert!(expired.is_reached());
	}
}
