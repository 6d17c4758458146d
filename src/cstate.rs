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

//! Pure value type modeling the balance/fee arithmetic of one commitment.
//!
//! [`ChannelState`] never touches the network, the database or a clock: it
//! is the same deterministic arithmetic both peers must reproduce bit for
//! bit, or they cannot sign compatible commitment transactions.

/// Byte size of a commitment transaction with no HTLC outputs.
pub const COMMIT_TX_BASE_BYTES: u64 = 338;

/// Additional bytes contributed by each non-dust HTLC output.
pub const COMMIT_TX_BYTES_PER_HTLC: u64 = 32;

/// Which of the two channel parties a balance belongs to.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
#[display(Debug)]
pub enum Side {
    /// The local node.
    Ours,
    /// The counterparty.
    Theirs,
}

impl Side {
    /// Returns the other side.
    pub fn other(self) -> Side {
        match self {
            Side::Ours => Side::Theirs,
            Side::Theirs => Side::Ours,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum CStateError {
    /// anchor funding of {anchor_satoshis} sat cannot cover the initial fee
    /// of {fee_msat} msat
    FeeExceedsAnchor { anchor_satoshis: u64, fee_msat: u64 },

    /// anchor funding of {0} sat exceeds the maximum representable amount
    AnchorTooLarge(u64),
}

/// Balance bookkeeping for one side of the channel.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct SideState {
    pub pay_msat: u64,
    pub fee_msat: u64,
    pub num_htlcs: u64,
    /// Combined value of this side's outstanding (offered but unresolved)
    /// HTLCs. Reserved out of `pay_msat` when offered, so it must be
    /// counted separately to keep the conservation invariant checkable
    /// while HTLCs are pending.
    pub htlc_value_msat: u64,
}

impl SideState {
    /// The balance this side owns before the fee is deducted from it; the
    /// quantity recomputation always starts from, per the "fold the prior
    /// fee back first" rule.
    fn raw(&self) -> u64 {
        self.pay_msat + self.fee_msat
    }
}

/// A complete, self-consistent snapshot of channel balances, fees and HTLC
/// counts — what either side's next commitment transaction would encode if
/// built right now.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ChannelState {
    pub anchor_satoshis: u64,
    pub fee_rate: u32,
    pub num_nondust_htlcs: u64,
    ours: SideState,
    theirs: SideState,
}

impl ChannelState {
    /// Builds the initial state of a freshly-funded channel with no HTLCs.
    ///
    /// The funding side bears the entire initial fee: the fundee has
    /// nothing to pay it with.
    pub fn initial(
        anchor_satoshis: u64,
        fee_rate: u32,
        funder: Side,
    ) -> Result<Self, CStateError> {
        if anchor_satoshis > (u32::MAX as u64) / 1000 {
            return Err(CStateError::AnchorTooLarge(anchor_satoshis));
        }
        let mut cstate = ChannelState {
            anchor_satoshis,
            fee_rate,
            num_nondust_htlcs: 0,
            ours: SideState::default(),
            theirs: SideState::default(),
        };
        let raw_msat = anchor_satoshis * 1000;
        match funder {
            Side::Ours => cstate.ours.pay_msat = raw_msat,
            Side::Theirs => cstate.theirs.pay_msat = raw_msat,
        }
        let fee_msat = cstate.compute_fee_msat();
        if raw_msat < fee_msat {
            return Err(CStateError::FeeExceedsAnchor { anchor_satoshis, fee_msat });
        }
        cstate.recompute_fee();
        Ok(cstate)
    }

    pub fn side(&self, side: Side) -> &SideState {
        match side {
            Side::Ours => &self.ours,
            Side::Theirs => &self.theirs,
        }
    }

    fn side_mut(&mut self, side: Side) -> &mut SideState {
        match side {
            Side::Ours => &mut self.ours,
            Side::Theirs => &mut self.theirs,
        }
    }

    /// Commitment transaction byte count for the current HTLC count.
    pub fn commit_tx_bytes(&self) -> u64 {
        COMMIT_TX_BASE_BYTES + COMMIT_TX_BYTES_PER_HTLC * self.num_nondust_htlcs
    }

    /// Fee, in millisatoshi, for the commitment transaction as currently
    /// shaped. Truncates to an even satoshi count before scaling to msat,
    /// per the formula in the spec.
    pub fn compute_fee_msat(&self) -> u64 {
        let product = self.commit_tx_bytes() * self.fee_rate as u64;
        let fee_sat = 2 * (product / 2000);
        fee_sat * 1000
    }

    /// Recomputes `fee_msat`/`pay_msat` on both sides from their current raw
    /// (pre-fee) balances and the freshly computed fee. This is the single
    /// place fee-sharing happens; every mutator ends by calling it.
    fn recompute_fee(&mut self) {
        let fee_msat = self.compute_fee_msat();
        let raw_ours = self.ours.raw();
        let raw_theirs = self.theirs.raw();
        let (fee_ours, fee_theirs) = Self::share_fee(raw_ours, raw_theirs, fee_msat);
        self.ours.fee_msat = fee_ours;
        self.ours.pay_msat = raw_ours - fee_ours;
        self.theirs.fee_msat = fee_theirs;
        self.theirs.pay_msat = raw_theirs - fee_theirs;
    }

    /// Splits `fee_msat` symmetrically between two raw balances. Each side
    /// first owes half; a side unable to cover its half drains entirely and
    /// the shortfall spills to the counterparty, which in turn spills to
    /// zero if it is also insufficient.
    fn share_fee(raw_ours: u64, raw_theirs: u64, fee_msat: u64) -> (u64, u64) {
        let half = fee_msat / 2;
        let fee_ours = half.min(raw_ours);
        let shortfall = half - fee_ours;
        let owed_theirs = half + shortfall;
        let fee_theirs = owed_theirs.min(raw_theirs);
        let shortfall2 = owed_theirs - fee_theirs;
        let fee_ours = (fee_ours + shortfall2).min(raw_ours);
        (fee_ours, fee_theirs)
    }

    /// Proposes adding an HTLC offered by `owner`. Returns `false` (leaving
    /// `self` unchanged) if `owner`'s side cannot afford the HTLC value plus
    /// its post-addition half of the fee.
    pub fn add_htlc(&mut self, owner: Side, msat: u64, dust: bool) -> bool {
        let raw_payer = self.side(owner).raw();
        if raw_payer < msat {
            return false;
        }
        let raw_payer_after = raw_payer - msat;

        let prev_num_htlcs = self.side(owner).num_htlcs;
        let prev_nondust = self.num_nondust_htlcs;
        self.side_mut(owner).num_htlcs = prev_num_htlcs + 1;
        if !dust {
            self.num_nondust_htlcs += 1;
        }

        let new_fee = self.compute_fee_msat();
        let half = new_fee / 2;
        if raw_payer_after < half {
            self.side_mut(owner).num_htlcs = prev_num_htlcs;
            self.num_nondust_htlcs = prev_nondust;
            return false;
        }

        let other = owner.other();
        let raw_other = self.side(other).raw();
        self.side_mut(owner).pay_msat = raw_payer_after;
        self.side_mut(owner).fee_msat = 0;
        self.side_mut(owner).htlc_value_msat += msat;
        self.side_mut(other).pay_msat = raw_other;
        self.side_mut(other).fee_msat = 0;
        self.recompute_fee();
        debug_assert!(self.check_invariant());
        true
    }

    /// Resolves an HTLC as fulfilled: its value moves to the offerer's
    /// counterparty. Infallible — the value was already reserved out of the
    /// offerer's balance when the HTLC was added.
    pub fn fulfill_htlc(&mut self, owner: Side, msat: u64, dust: bool) {
        self.resolve_htlc(owner, msat, dust, |other_raw| other_raw + msat, |owner_raw| owner_raw);
    }

    /// Resolves an HTLC as failed: its value is refunded to the offerer.
    pub fn fail_htlc(&mut self, owner: Side, msat: u64, dust: bool) {
        self.resolve_htlc(owner, msat, dust, |other_raw| other_raw, |owner_raw| owner_raw + msat);
    }

    fn resolve_htlc(
        &mut self,
        owner: Side,
        msat: u64,
        dust: bool,
        other_delta: impl FnOnce(u64) -> u64,
        owner_delta: impl FnOnce(u64) -> u64,
    ) {
        self.side_mut(owner).num_htlcs -= 1;
        self.side_mut(owner).htlc_value_msat -= msat;
        if !dust {
            self.num_nondust_htlcs -= 1;
        }
        let other = owner.other();
        let raw_owner = owner_delta(self.side(owner).raw());
        let raw_other = other_delta(self.side(other).raw());
        self.side_mut(owner).pay_msat = raw_owner;
        self.side_mut(owner).fee_msat = 0;
        self.side_mut(other).pay_msat = raw_other;
        self.side_mut(other).fee_msat = 0;
        self.recompute_fee();
        debug_assert!(self.check_invariant());
    }

    /// Updates the fee-rate used for future commitments and re-splits the
    /// fee accordingly. Both peers apply the identical recomputation.
    pub fn adjust_fee(&mut self, fee_rate: u32) {
        self.fee_rate = fee_rate;
        self.recompute_fee();
    }

    /// Forces a specific fee (bypassing the formula), returning `false`
    /// (unchanged) if it cannot be funded from the combined raw balance.
    pub fn force_fee(&mut self, fee_msat: u64) -> bool {
        let raw_ours = self.ours.raw();
        let raw_theirs = self.theirs.raw();
        if raw_ours + raw_theirs < fee_msat {
            return false;
        }
        let (fee_ours, fee_theirs) = Self::share_fee(raw_ours, raw_theirs, fee_msat);
        self.ours.fee_msat = fee_ours;
        self.ours.pay_msat = raw_ours - fee_ours;
        self.theirs.fee_msat = fee_theirs;
        self.theirs.pay_msat = raw_theirs - fee_theirs;
        true
    }

    /// Conservation invariant: the anchor value never appears nor
    /// disappears, it only moves between `pay_msat` and `fee_msat` on
    /// either side.
    pub fn check_invariant(&self) -> bool {
        self.anchor_satoshis * 1000
            == self.ours.pay_msat
                + self.ours.fee_msat
                + self.ours.htlc_value_msat
                + self.theirs.pay_msat
                + self.theirs.fee_msat
                + self.theirs.htlc_value_msat
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_1_open_no_htlcs() {
        let cstate = ChannelState::initial(1_000_000, 50_000, Side::Ours).unwrap();
        assert_eq!(cstate.num_nondust_htlcs, 0);
        assert_eq!(cstate.commit_tx_bytes(), 338);
        assert_eq!(cstate.compute_fee_msat(), 16_900_000);
        assert_eq!(cstate.side(Side::Ours).pay_msat, 983_100_000);
        assert_eq!(cstate.side(Side::Ours).fee_msat, 16_900_000);
        assert_eq!(cstate.side(Side::Theirs).pay_msat, 0);
        assert_eq!(cstate.side(Side::Theirs).fee_msat, 0);
        assert!(cstate.check_invariant());
    }

    #[test]
    fn scenario_2_add_nondust_htlc() {
        let mut cstate = ChannelState::initial(1_000_000, 50_000, Side::Ours).unwrap();
        assert!(cstate.add_htlc(Side::Ours, 100_000_000, false));
        assert_eq!(cstate.num_nondust_htlcs, 1);
        assert_eq!(cstate.commit_tx_bytes(), 370);
        assert_eq!(cstate.compute_fee_msat(), 18_500_000);
        assert_eq!(cstate.side(Side::Ours).fee_msat, 18_500_000);
        assert_eq!(cstate.side(Side::Ours).pay_msat, 881_500_000);
        assert_eq!(cstate.side(Side::Theirs).pay_msat, 0);
        assert_eq!(cstate.side(Side::Theirs).fee_msat, 0);
        assert!(cstate.check_invariant());
    }

    #[test]
    fn scenario_3_fulfill_htlc() {
        let mut cstate = ChannelState::initial(1_000_000, 50_000, Side::Ours).unwrap();
        assert!(cstate.add_htlc(Side::Ours, 100_000_000, false));
        cstate.fulfill_htlc(Side::Ours, 100_000_000, false);
        assert_eq!(cstate.num_nondust_htlcs, 0);
        assert_eq!(cstate.compute_fee_msat(), 16_900_000);
        assert_eq!(cstate.side(Side::Theirs).pay_msat, 91_550_000);
        assert!(cstate.check_invariant());
    }

    #[test]
    fn add_htlc_rejected_when_unaffordable() {
        let mut cstate = ChannelState::initial(1_000_000, 50_000, Side::Ours).unwrap();
        let before = cstate;
        assert!(!cstate.add_htlc(Side::Theirs, 1, false));
        assert_eq!(cstate, before);
    }

    #[test]
    fn dust_htlc_does_not_count_towards_nondust() {
        let mut cstate = ChannelState::initial(1_000_000, 50_000, Side::Ours).unwrap();
        assert!(cstate.add_htlc(Side::Ours, 100, true));
        assert_eq!(cstate.num_nondust_htlcs, 0);
        assert_eq!(cstate.commit_tx_bytes(), 338);
        assert!(cstate.check_invariant());
    }

    #[test]
    fn initial_rejects_anchor_too_large() {
        let err = ChannelState::initial(u32::MAX as u64, 50_000, Side::Ours).unwrap_err();
        assert!(matches!(err, CStateError::AnchorTooLarge(_)));
    }

    #[test]
    fn fail_htlc_refunds_offerer() {
        let mut cstate = ChannelState::initial(1_000_000, 50_000, Side::Ours).unwrap();
        assert!(cstate.add_htlc(Side::Ours, 100_000_000, false));
        cstate.fail_htlc(Side::Ours, 100_000_000, false);
        let expected = ChannelState::initial(1_000_000, 50_000, Side::Ours).unwrap();
        assert_eq!(cstate.side(Side::Ours).pay_msat, expected.side(Side::Ours).pay_msat);
        assert!(cstate.check_invariant());
    }
}
