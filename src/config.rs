// channeld-core: payment channel daemon core library
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! Policy knobs used by the packet acceptors in [`crate::packets`].

/// Local node policy limits against which inbound `OPEN` and `ADD_HTLC`
/// packets are validated.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Config {
    /// Largest `to_self_delay` (in blocks) we are willing to accept.
    pub locktime_max: u32,

    /// Largest `min_depth` the remote peer may require of us.
    pub anchor_confirms_max: u32,

    /// Lower bound, as a percentage of our own fee-rate estimate, for an
    /// acceptable `initial_fee_rate` in an `OPEN` packet.
    pub min_fee_percent: u32,

    /// Upper bound, as a percentage of our own fee-rate estimate, for an
    /// acceptable `initial_fee_rate` in an `OPEN` packet.
    pub max_fee_percent: u32,

    /// Our own fee-rate estimate (sat per 1000 bytes), against which
    /// `min_fee_percent`/`max_fee_percent` are applied.
    pub our_fee_rate: u32,

    /// HTLC outputs below this many satoshis are dust: they do not count
    /// towards `num_nondust_htlcs` and are folded into the miner fee.
    pub dust_limit_satoshis: u64,

    /// Per BOLT-2 style limits: no more than this many HTLCs may be
    /// offered to a single side of the channel.
    pub max_htlcs_per_side: u16,
}

impl Config {
    /// Returns the `[min, max]` acceptable range for a peer's
    /// `initial_fee_rate`, inclusive.
    pub fn fee_rate_range(&self) -> (u32, u32) {
        let lowest = self.our_fee_rate * self.min_fee_percent / 100;
        let highest = self.our_fee_rate * self.max_fee_percent / 100;
        (lowest, highest)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            locktime_max: 2016,
            anchor_confirms_max: 144,
            min_fee_percent: 50,
            max_fee_percent: 1000,
            our_fee_rate: 50_000,
            dust_limit_satoshis: 546,
            max_htlcs_per_side: 300,
        }
    }
}
