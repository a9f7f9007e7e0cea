//! Configuration accepted once at init (§6). `Config` is validated at build
//! time and then frozen — nothing here is mutated after `Tracker::install`.

use crate::error::{Error, Result};

/// `sampling_rate` config option: one of `EVERY_1 .. EVERY_512`. The
/// underlying value is the bitmask `M = R - 1` the sampler ANDs against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum SamplingRate {
    Every1 = 0,
    Every2 = 1,
    Every4 = 3,
    Every8 = 7,
    Every16 = 15,
    Every32 = 31,
    Every64 = 63,
    Every128 = 127,
    Every256 = 255,
    Every512 = 511,
}

impl SamplingRate {
    /// The mask `M` the sampler ANDs the address hash against.
    pub fn mask(self) -> u32 {
        self as u32
    }

    /// The nominal rate `R` (1 in `R` addresses tracked), for diagnostics
    /// and the P2 rate-concentration test.
    pub fn rate(self) -> u32 {
        self.mask() + 1
    }
}

/// Which predicate `should_track` evaluates (§4.A). `AlignmentBiased` is a
/// strict generalization of `AlignmentAware`: both favor page-aligned
/// addresses, but the biased policy tracks increasingly-aligned addresses
/// at increasingly higher rates instead of an all-or-nothing cutoff.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SamplePolicy {
    #[default]
    Uniform,
    AlignmentAware,
    AlignmentBiased,
}

/// Upper bound on `stack_capture_bytes`; `AllocationEvent::stack` is a
/// fixed-size inline array sized to this constant so capturing a stack
/// prefix never allocates.
pub const MAX_STACK_CAPTURE_BYTES: usize = 8192;

/// Default value for `mean_interval_bytes`: sample on average once per
/// 512 KiB allocated per thread.
pub const DEFAULT_MEAN_INTERVAL_BYTES: u64 = 512 * 1024;

#[derive(Clone, Debug)]
pub struct Config {
    pub sampling_rate: SamplingRate,
    pub sample_policy: SamplePolicy,
    pub mean_interval_bytes: u64,
    pub shards: u32,
    pub shard_slots: u32,
    pub probe_limit: u32,
    pub stack_capture_bytes: usize,
    /// Number of per-producer slots behind the Producer Linearizer. Not a
    /// spec.md option by name — it is the "S parallel producers" from
    /// §3/§4.E made concrete, sized to the host's CPU count by default.
    pub num_producers: usize,
    /// Capacity of each producer's ring, in events.
    pub producer_ring_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        ConfigBuilder::new().build().expect("default config is valid")
    }
}

pub struct ConfigBuilder {
    sampling_rate: SamplingRate,
    sample_policy: SamplePolicy,
    mean_interval_bytes: u64,
    shards: u32,
    shard_slots: u32,
    probe_limit: u32,
    stack_capture_bytes: usize,
    num_producers: usize,
    producer_ring_capacity: usize,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            sampling_rate: SamplingRate::Every512,
            sample_policy: SamplePolicy::Uniform,
            mean_interval_bytes: DEFAULT_MEAN_INTERVAL_BYTES,
            shards: 64,
            shard_slots: 16384,
            probe_limit: 32,
            stack_capture_bytes: 4096,
            num_producers: default_num_producers(),
            producer_ring_capacity: 256,
        }
    }

    pub fn sampling_rate(mut self, rate: SamplingRate) -> Self {
        self.sampling_rate = rate;
        self
    }

    pub fn sample_policy(mut self, policy: SamplePolicy) -> Self {
        self.sample_policy = policy;
        self
    }

    pub fn mean_interval_bytes(mut self, n: u64) -> Self {
        self.mean_interval_bytes = n;
        self
    }

    pub fn shards(mut self, k: u32) -> Self {
        self.shards = k;
        self
    }

    pub fn shard_slots(mut self, n: u32) -> Self {
        self.shard_slots = n;
        self
    }

    pub fn probe_limit(mut self, p: u32) -> Self {
        self.probe_limit = p;
        self
    }

    pub fn stack_capture_bytes(mut self, n: usize) -> Self {
        self.stack_capture_bytes = n;
        self
    }

    pub fn num_producers(mut self, n: usize) -> Self {
        self.num_producers = n.max(1);
        self
    }

    pub fn producer_ring_capacity(mut self, n: usize) -> Self {
        self.producer_ring_capacity = n;
        self
    }

    pub fn build(self) -> Result<Config> {
        if !self.shards.is_power_of_two() {
            return Err(Error::ShardsNotPowerOfTwo(self.shards));
        }
        if !self.shard_slots.is_power_of_two() {
            return Err(Error::SlotsNotPowerOfTwo(self.shard_slots));
        }
        if self.mean_interval_bytes == 0 {
            return Err(Error::InvalidConfig(
                "mean_interval_bytes must be positive".into(),
            ));
        }
        if self.probe_limit == 0 || self.probe_limit > self.shard_slots {
            return Err(Error::InvalidConfig(
                "probe_limit must be in 1..=shard_slots".into(),
            ));
        }
        if self.stack_capture_bytes > MAX_STACK_CAPTURE_BYTES {
            return Err(Error::StackBudgetTooLarge {
                requested: self.stack_capture_bytes,
                max: MAX_STACK_CAPTURE_BYTES,
            });
        }
        Ok(Config {
            sampling_rate: self.sampling_rate,
            sample_policy: self.sample_policy,
            mean_interval_bytes: self.mean_interval_bytes,
            shards: self.shards,
            shard_slots: self.shard_slots,
            probe_limit: self.probe_limit,
            stack_capture_bytes: self.stack_capture_bytes,
            num_producers: self.num_producers,
            producer_ring_capacity: self.producer_ring_capacity,
        })
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn default_num_producers() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n > 0 { n as usize } else { 1 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = ConfigBuilder::new().build().unwrap();
        assert_eq!(cfg.shards, 64);
        assert_eq!(cfg.shard_slots, 16384);
        assert_eq!(cfg.probe_limit, 32);
    }

    #[test]
    fn rejects_non_power_of_two_shards() {
        let err = ConfigBuilder::new().shards(60).build().unwrap_err();
        assert!(matches!(err, Error::ShardsNotPowerOfTwo(60)));
    }

    #[test]
    fn rejects_non_power_of_two_slots() {
        let err = ConfigBuilder::new().shard_slots(1000).build().unwrap_err();
        assert!(matches!(err, Error::SlotsNotPowerOfTwo(1000)));
    }

    #[test]
    fn rejects_oversized_stack_budget() {
        let err = ConfigBuilder::new()
            .stack_capture_bytes(MAX_STACK_CAPTURE_BYTES + 1)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::StackBudgetTooLarge { .. }));
    }

    #[test]
    fn sampling_rate_mask_and_rate_agree() {
        assert_eq!(SamplingRate::Every8.mask(), 7);
        assert_eq!(SamplingRate::Every8.rate(), 8);
        assert_eq!(SamplingRate::Every1.mask(), 0);
        assert_eq!(SamplingRate::Every1.rate(), 1);
    }
}
