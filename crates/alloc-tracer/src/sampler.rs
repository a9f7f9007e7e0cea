//! Stateless address sampling (§4.A). `should_track` takes no lock and
//! touches no shared memory — the same address must produce the same
//! decision on every thread, forever, so that the free hook can mirror
//! the alloc hook's choice without any coordination between them.

use crate::config::SamplePolicy;

/// MurmurHash3-style 64-bit mixer, applied to `addr >> 4`. Shared by the
/// sampler and the live-address table so both agree on how an address
/// hashes.
#[inline]
pub fn mix64(addr: u64) -> u64 {
    let mut h = addr >> 4;
    h = h.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    h ^= h >> 32;
    h = h.wrapping_mul(0x85EB_CA77_C2B2_AE63);
    h ^= h >> 32;
    h
}

/// Count trailing zero bits of `addr | 1` — the alignment tier used by
/// the biased policy. OR-ing in the low bit means a zero address (never
/// a valid pointer, but harmless here) doesn't special-case to 64.
#[inline]
fn alignment_tier(addr: u64) -> u32 {
    (addr | 1).trailing_zeros()
}

#[inline]
fn uniform(addr: u64, mask: u32) -> bool {
    (mix64(addr) as u32) & mask == 0
}

/// `should_track` under the `Uniform` policy.
#[inline]
pub fn should_track_uniform(addr: u64, mask: u32) -> bool {
    uniform(addr, mask)
}

/// `should_track` under the `AlignmentAware` policy: a page-aligned
/// address is always tracked, otherwise fall through to uniform.
#[inline]
pub fn should_track_alignment_aware(addr: u64, mask: u32) -> bool {
    if addr & 0xFFF == 0 {
        return true;
    }
    uniform(addr, mask)
}

/// `should_track` under the `AlignmentBiased` policy: the more aligned an
/// address is, the more likely it is tracked, in discrete tiers.
#[inline]
pub fn should_track_alignment_biased(addr: u64, mask: u32) -> bool {
    let tier = alignment_tier(addr);
    if tier >= 12 {
        return true;
    }
    if tier >= 10 {
        return uniform(addr, mask >> 2);
    }
    if tier >= 8 {
        return uniform(addr, mask >> 1);
    }
    uniform(addr, mask)
}

/// Dispatches to the configured policy. `mask` is `SamplingRate::mask()`.
#[inline]
pub fn should_track(addr: u64, mask: u32, policy: SamplePolicy) -> bool {
    match policy {
        SamplePolicy::Uniform => should_track_uniform(addr, mask),
        SamplePolicy::AlignmentAware => should_track_alignment_aware(addr, mask),
        SamplePolicy::AlignmentBiased => should_track_alignment_biased(addr, mask),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SamplingRate;

    // P1: determinism.
    #[test]
    fn deterministic() {
        let addr = 0x7f00_badb_eef0u64;
        let mask = SamplingRate::Every4.mask();
        let first = should_track_uniform(addr, mask);
        for _ in 0..100 {
            assert_eq!(should_track_uniform(addr, mask), first);
        }
    }

    // Two separate "sampler instances" (stateless here, so just two calls
    // against the same address) must agree.
    #[test]
    fn cross_thread_consistent() {
        let mask = SamplingRate::Every8.mask();
        let mut addr = 0x1234_5678_9abc_0000u64;
        for _ in 0..1000 {
            addr = addr.wrapping_add(0x30) & !0xF;
            assert_eq!(
                should_track_uniform(addr, mask),
                should_track_uniform(addr, mask)
            );
        }
    }

    // P2 / scenario 2: rate concentration for EVERY_8.
    #[test]
    fn sampling_rate_every_8() {
        let mask = SamplingRate::Every8.mask();
        let mut tracked = 0u32;
        for i in 0..100_000u64 {
            if should_track_uniform(i * 64, mask) {
                tracked += 1;
            }
        }
        assert!(tracked >= 10_500, "too few tracked: {tracked}");
        assert!(tracked <= 13_000, "too many tracked: {tracked}");
    }

    #[test]
    fn sampling_rate_every_16() {
        let mask = SamplingRate::Every16.mask();
        let mut tracked = 0u32;
        for i in 0..100_000u64 {
            if should_track_uniform(i * 64, mask) {
                tracked += 1;
            }
        }
        let rate = tracked as f64 / 100_000.0;
        assert!(rate > 0.05 && rate < 0.08, "rate {rate} out of band");
    }

    #[test]
    fn track_all_under_every_1() {
        let mask = SamplingRate::Every1.mask();
        let mut addr = 0xdead_beef_0000u64;
        for _ in 0..1000 {
            addr = addr.wrapping_add(0x40);
            assert!(should_track_uniform(addr, mask));
        }
    }

    // P3-adjacent: alloc and free must make the same decision for the
    // same address (the contract the hook core relies on).
    #[test]
    fn realistic_malloc_pattern_round_trips() {
        let mask = SamplingRate::Every32.mask();
        let mut allocated = Vec::new();
        let mut current = 0x7f0000000000u64;
        for _ in 0..10_000 {
            allocated.push(current);
            current += 64;
        }
        for addr in allocated {
            let at_alloc = should_track_uniform(addr, mask);
            let at_free = should_track_uniform(addr, mask);
            assert_eq!(at_alloc, at_free);
        }
    }

    #[test]
    fn alignment_aware_always_tracks_page_aligned() {
        let mask = SamplingRate::Every512.mask();
        assert!(should_track_alignment_aware(0x1000, mask));
        assert!(should_track_alignment_aware(0x7f00_1000, mask));
    }

    #[test]
    fn alignment_biased_tier_thresholds() {
        let mask = SamplingRate::Every512.mask();
        // ctz(0x1000) == 12 -> always tracked regardless of mask.
        assert!(should_track_alignment_biased(0x1000, mask));
        // A 1-aligned (odd) address falls to plain uniform.
        let odd = 0x7f00_0000_0001u64;
        assert_eq!(
            should_track_alignment_biased(odd, mask),
            should_track_uniform(odd, mask)
        );
    }
}
