use jacquard_common::types::tid::Tid;
use std::sync::atomic::{AtomicU64, Ordering};

const S32_CHAR: &[u8] = b"234567abcdefghijklmnopqrstuvwxyz";

fn s32_encode(mut i: u64) -> String {
    let mut out = [0u8; 13];
    for slot in out.iter_mut().rev() {
        *slot = S32_CHAR[(i & 0x1F) as usize];
        i >>= 5;
    }
    out.iter().map(|&c| c as char).collect()
}

fn s32_decode(s: &str) -> u64 {
    s.bytes().fold(0u64, |acc, c| {
        let digit = S32_CHAR.iter().position(|&x| x == c).unwrap_or(0) as u64;
        (acc << 5) | digit
    })
}

/// Numeric view of a [`Tid`] used as a repository revision.
///
/// The 13 base32-sortable characters hold microseconds since the epoch in
/// the high bits and a 10-bit clock id in the low bits, so comparing
/// `as_str()` compares revisions in time order.
pub trait TidExt {
    /// Build a TID from microseconds since the epoch and a clock id (masked to 10 bits)
    fn from_micros(micros: u64, clkid: u16) -> Tid;

    /// The integer this TID encodes
    fn to_u64(&self) -> u64;

    /// Microseconds since the epoch
    fn timestamp_micros(&self) -> u64 {
        self.to_u64() >> 10
    }
}

impl TidExt for Tid {
    fn from_micros(micros: u64, clkid: u16) -> Tid {
        // Bit 63 is masked off, so the leading character is always in [2-j].
        let value = ((micros << 10) & 0x7FFF_FFFF_FFFF_FC00) | (clkid as u64 & 0x3FF);
        Tid::raw(s32_encode(value))
    }

    fn to_u64(&self) -> u64 {
        s32_decode(self.as_str())
    }
}

/// Issues strictly increasing revisions.
///
/// Each call returns something newer than both the last TID this clock issued
/// and the optional previous revision supplied by the caller, even if the
/// wall clock stalls or runs backwards.
#[derive(Debug)]
pub struct TidClock {
    clkid: u16,
    last: AtomicU64,
}

impl TidClock {
    /// Create a clock with the given clock id
    pub fn new(clkid: u16) -> Self {
        Self {
            clkid: clkid & 0x3FF,
            last: AtomicU64::new(0),
        }
    }

    /// Next revision, newer than `prev` and anything issued before
    pub fn next(&self, prev: Option<&Tid>) -> Tid {
        let micros = chrono::Utc::now().timestamp_micros().max(0) as u64;
        let now = Tid::from_micros(micros, self.clkid).to_u64();
        let floor = prev.map(TidExt::to_u64).unwrap_or(0);
        let clk = self.clkid as u64;
        let bump = |after: u64| (((after >> 10) + 1) << 10) | clk;

        let mut chosen = 0;
        let _ = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                let mut candidate = now;
                if candidate <= last {
                    candidate = bump(last);
                }
                if candidate <= floor {
                    candidate = bump(floor);
                }
                chosen = candidate;
                Some(candidate)
            });
        Tid::from_micros(chosen >> 10, self.clkid)
    }
}

impl Default for TidClock {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode() {
        let tid = Tid::from_micros(1_700_000_000_000_000, 7);
        assert_eq!(tid.as_str().len(), 13);
        assert!(Tid::new(tid.as_str()).is_ok());
        assert_eq!(tid.timestamp_micros(), 1_700_000_000_000_000);
        assert_eq!(tid.to_u64() & 0x3FF, 7);
    }

    #[test]
    fn string_order_matches_time_order() {
        let a = Tid::from_micros(1_000, 0);
        let b = Tid::from_micros(1_001, 0);
        assert!(a.as_str() < b.as_str());
        assert!(a.to_u64() < b.to_u64());
    }

    #[test]
    fn largest_timestamp_is_still_valid() {
        let tid = Tid::from_micros(u64::MAX, 0x3FF);
        assert!(Tid::new(tid.as_str()).is_ok());
    }

    #[test]
    fn clock_is_strictly_increasing() {
        let clock = TidClock::new(1);
        let mut prev = clock.next(None);
        for _ in 0..1000 {
            let next = clock.next(None);
            assert!(next.as_str() > prev.as_str());
            prev = next;
        }
    }

    #[test]
    fn clock_outruns_future_prev() {
        let clock = TidClock::default();
        let future = Tid::from_micros(u64::MAX >> 12, 0);
        let next = clock.next(Some(&future));
        assert!(next.as_str() > future.as_str());
    }
}
