use crate::error::ProtocolResult;
use crate::flow::Estimate;

/// One measurement of the path: stream at a rate for a duration and learn the
/// resulting (rho, sigma).
#[cfg_attr(test, mockall::automock)]
pub trait Probe {
    /// Stream at `rate_kbps` for `duration_secs` and return the observed estimate.
    fn measure(&mut self, rate_kbps: u64, duration_secs: u64) -> ProtocolResult<Estimate>;

    /// Unmeasured stream sent before the first probe. Default impl does nothing.
    fn warm_up(&mut self) -> ProtocolResult<()> {
        Ok(())
    }
}
