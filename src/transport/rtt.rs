//! Retransmission timeout estimation (RFC 6298)

use std::time::Duration;

/// Clock granularity term in the RTO formula
const CLOCK_GRANULARITY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,
    min_rto: Duration,
    max_rto: Duration,
}

impl RttEstimator {
    pub fn new(initial_rto: Duration, min_rto: Duration, max_rto: Duration) -> Self {
        Self {
            srtt: None,
            rttvar: Duration::ZERO,
            rto: initial_rto.clamp(min_rto, max_rto),
            min_rto,
            max_rto,
        }
    }

    /// Feed one round-trip measurement from a segment sent exactly once
    pub fn sample(&mut self, rtt: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(rtt);
                self.rttvar = rtt / 2;
            }
            Some(srtt) => {
                let delta = if srtt > rtt { srtt - rtt } else { rtt - srtt };
                self.rttvar = (self.rttvar * 3 + delta) / 4;
                self.srtt = Some((srtt * 7 + rtt) / 8);
            }
        }

        let srtt = self.srtt.unwrap_or(rtt);
        let margin = (self.rttvar * 4).max(CLOCK_GRANULARITY);
        self.rto = (srtt + margin).clamp(self.min_rto, self.max_rto);
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    /// Base timeout with no backoff applied
    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// Timeout after `backoff` consecutive expirations, capped at the ceiling
    pub fn backed_off(&self, backoff: u32) -> Duration {
        let factor = 1u32.checked_shl(backoff.min(16)).unwrap_or(u32::MAX);
        self.rto.saturating_mul(factor).min(self.max_rto)
    }
}
