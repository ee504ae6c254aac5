//! Per-source-IP token bucket, applied only to requests that fail the
//! token format gate. Well-formed traffic is never throttled here.

use std::{
	collections::HashMap,
	net::IpAddr,
	sync::Mutex,
	time::Instant,
};

struct Bucket {
	tokens: f64,
	last_refill: Instant,
}

pub struct RateLimiter {
	buckets: Mutex<HashMap<IpAddr, Bucket>>,
	rate_per_second: f64,
	burst: f64,
}

impl RateLimiter {
	pub fn new(rate_per_second: f64, burst: f64) -> Self {
		Self { buckets: Mutex::new(HashMap::new()), rate_per_second, burst }
	}

	/// Take one token for `ip`. Returns false when the bucket is empty and
	/// the request should be dropped.
	pub fn check(&self, ip: IpAddr) -> bool {
		self.check_at(ip, Instant::now())
	}

	fn check_at(&self, ip: IpAddr, now: Instant) -> bool {
		let mut buckets = self.buckets.lock().expect("rate limiter lock");
		let bucket = buckets
			.entry(ip)
			.or_insert(Bucket { tokens: self.burst, last_refill: now });

		let elapsed = now.saturating_duration_since(bucket.last_refill);
		bucket.tokens =
			(bucket.tokens + elapsed.as_secs_f64() * self.rate_per_second).min(self.burst);
		bucket.last_refill = now;

		if bucket.tokens >= 1.0 {
			bucket.tokens -= 1.0;
			true
		} else {
			false
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	fn ip(last: u8) -> IpAddr {
		IpAddr::from([10, 0, 0, last])
	}

	#[test]
	fn burst_then_deny() {
		let limiter = RateLimiter::new(10.0, 20.0);
		let now = Instant::now();
		for _ in 0..20 {
			assert!(limiter.check_at(ip(1), now));
		}
		assert!(!limiter.check_at(ip(1), now));
	}

	#[test]
	fn refills_at_the_configured_rate() {
		let limiter = RateLimiter::new(10.0, 20.0);
		let now = Instant::now();
		for _ in 0..20 {
			limiter.check_at(ip(1), now);
		}
		assert!(!limiter.check_at(ip(1), now));

		// 10/s: half a second buys five tokens.
		let later = now + Duration::from_millis(500);
		for _ in 0..5 {
			assert!(limiter.check_at(ip(1), later));
		}
		assert!(!limiter.check_at(ip(1), later));
	}

	#[test]
	fn buckets_are_per_source_address() {
		let limiter = RateLimiter::new(10.0, 1.0);
		let now = Instant::now();
		assert!(limiter.check_at(ip(1), now));
		assert!(!limiter.check_at(ip(1), now));
		assert!(limiter.check_at(ip(2), now));
	}
}
