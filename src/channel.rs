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

//! The Commitment/Revocation Engine: the state machine that turns local
//! intent and accepted packets into signed commitment transactions and
//! revocation preimages.
//!
//! This is the only module allowed to mutate [`crate::cstate::ChannelState`]
//! or HTLC states — every other module either observes the channel or
//! proposes a [`crate::packets::Delta`] for it to apply.

use bitcoin_hashes::{sha256, Hash};

pub use crate::cstate::Side;
use crate::cstate::ChannelState;
use crate::htlc::{HtlcState, Registry};

/// Which party put up the anchor (funding) amount.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
#[display(Debug)]
pub enum Funder {
    Ours,
    Theirs,
}

/// The anchor (funding) output, once known.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Anchor {
    pub amount_satoshis: u64,
    pub funder: Funder,
    pub txid: [u8; 32],
    pub output_index: u32,
    pub min_depth: u32,
    pub confirmed_depth: u32,
}

/// Snapshot of one commitment in a side's chain.
///
/// The transaction itself is an opaque placeholder: assembling a real,
/// signable Bitcoin transaction from a `ChannelState` is outside this
/// crate's scope, but the byte-count/fee arithmetic the transaction would
/// need is modeled in full by [`ChannelState`].
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CommitInfo {
    pub commit_num: u64,
    pub revocation_hash: [u8; 32],
    pub order: u64,
    pub sig: Option<Vec<u8>>,
    pub cstate: ChannelState,
}

/// Everything a channel tracks about one side's long-term identity and
/// commitment chain.
#[derive(Clone, Debug)]
pub struct PeerSide {
    pub commit_key: Vec<u8>,
    pub final_key: Vec<u8>,
    pub delay_blocks: u32,
    pub min_depth: u32,
    pub fee_rate: u32,
    pub next_revocation_hash: [u8; 32],
    pub commit: Option<CommitInfo>,
    pub staging_cstate: ChannelState,
}

/// The witness we owe a revocation reply for: the hash of the preimage that
/// will revoke the counterparty's previous commitment. Load-bearing, per
/// the original "hack where we temporarily store their previous revocation
/// hash" comment — it is the only thing that lets us verify their eventual
/// `UPDATE_REVOCATION`.
pub type PendingRevocationWitness = Option<[u8; 32]>;

/// Cooperative-close bookkeeping, tracked once the channel enters shutdown.
#[derive(Clone, Debug, Default)]
pub struct Closing {
    pub our_fee: u64,
    pub their_fee: u64,
    pub their_sig: Option<Vec<u8>>,
    pub our_script: Option<Vec<u8>>,
    pub their_script: Option<Vec<u8>>,
    pub shutdown_order: u64,
    pub closing_order: u64,
    pub sigs_in: u32,
}

#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum ChannelError {
    /// revocation preimage does not match the witness we were holding
    RevocationMismatch,

    /// no commitment is pending to revoke
    NoPendingRevocation,

    /// local or remote side cannot afford this operation
    CapacityRejected,
}

/// A bidirectional payment channel between two public-key-identified peers.
pub struct Channel {
    pub anchor: Option<Anchor>,
    pub local: PeerSide,
    pub remote: PeerSide,
    pub htlcs: Registry,
    pub their_prev_revocation_hash: PendingRevocationWitness,
    pub closing: Option<Closing>,
}

impl Channel {
    /// Opens a channel once both `OPEN` packets have been exchanged and the
    /// initial balances are known.
    pub fn new(
        anchor_satoshis: u64,
        fee_rate: u32,
        funder: Side,
        local: PeerSide,
        remote: PeerSide,
    ) -> Result<Self, crate::cstate::CStateError> {
        let _ = ChannelState::initial(anchor_satoshis, fee_rate, funder)?;
        Ok(Channel {
            anchor: None,
            local,
            remote,
            htlcs: Registry::new(),
            their_prev_revocation_hash: None,
            closing: None,
        })
    }

    #[cfg(test)]
    pub(crate) fn new_for_test() -> Self {
        let cstate = ChannelState::initial(1_000_000, 50_000, Side::Ours).unwrap();
        let side = |cstate: ChannelState| PeerSide {
            commit_key: vec![],
            final_key: vec![],
            delay_blocks: 144,
            min_depth: 1,
            fee_rate: 50_000,
            next_revocation_hash: [0u8; 32],
            commit: None,
            staging_cstate: cstate,
        };
        Channel {
            anchor: None,
            local: side(cstate),
            remote: side(cstate),
            htlcs: Registry::new(),
            their_prev_revocation_hash: None,
            closing: None,
        }
    }

    /// The `order_counter` value to stamp on the next outgoing commitment or
    /// closing action, reconstructed after a restart as `1 + max` of every
    /// ordering counter we have persisted.
    pub fn next_order(&self) -> u64 {
        let mut max = 0u64;
        if let Some(commit) = &self.local.commit {
            max = max.max(commit.order);
        }
        if let Some(commit) = &self.remote.commit {
            max = max.max(commit.order);
        }
        if let Some(closing) = &self.closing {
            max = max.max(closing.shutdown_order).max(closing.closing_order);
        }
        max + 1
    }

    /// Applies a locally-originated add/fulfill/fail to both staging
    /// cstates and advances the HTLC's state, per step 1 of the protocol.
    pub fn apply_local_add(
        &mut self,
        id: u64,
        msatoshis: u64,
        rhash: [u8; 32],
        expiry: u32,
        routing: Vec<u8>,
        dust: bool,
    ) -> bool {
        if !self.local.staging_cstate.add_htlc(Side::Ours, msatoshis, dust) {
            return false;
        }
        if !self.remote.staging_cstate.add_htlc(Side::Ours, msatoshis, dust) {
            self.local.staging_cstate.fail_htlc(Side::Ours, msatoshis, dust);
            return false;
        }
        self.htlcs.new_htlc(Side::Ours, msatoshis, rhash, expiry, routing, Some(id));
        true
    }

    /// Resolves a locally-known HTLC we offered (step 1, removal side).
    pub fn apply_local_resolve(&mut self, id: u64, fulfilled: bool, dust: bool) {
        let htlc = self.htlcs.get(Side::Ours, id).expect("resolve of unknown local HTLC");
        let msatoshis = htlc.msatoshis;
        if fulfilled {
            self.local.staging_cstate.fulfill_htlc(Side::Ours, msatoshis, dust);
            self.remote.staging_cstate.fulfill_htlc(Side::Ours, msatoshis, dust);
        } else {
            self.local.staging_cstate.fail_htlc(Side::Ours, msatoshis, dust);
            self.remote.staging_cstate.fail_htlc(Side::Ours, msatoshis, dust);
        }
        self.htlcs
            .transition(Side::Ours, id, HtlcState::SentRemoveHtlc)
            .expect("illegal local resolve transition");
    }

    /// Step 2: we emit `UPDATE_COMMIT`. Every HTLC offered by us that is
    /// currently in `SENT_ADD_HTLC`/`SENT_REMOVE_HTLC` advances one step; a
    /// new `remote.commit` is minted from `remote.staging_cstate`.
    pub fn emit_update_commit(&mut self, our_sig: Vec<u8>) -> u64 {
        let pending: Vec<(Side, u64, HtlcState)> = self
            .htlcs
            .iter()
            .filter(|h| matches!(h.state, HtlcState::SentAddHtlc | HtlcState::SentRemoveHtlc))
            .map(|h| {
                let next = match h.state {
                    HtlcState::SentAddHtlc => HtlcState::SentAddCommit,
                    HtlcState::SentRemoveHtlc => HtlcState::SentRemoveAckRevocation,
                    _ => unreachable!(),
                };
                (h.owner, h.id, next)
            })
            .collect();
        for (owner, id, next) in pending {
            self.htlcs.transition(owner, id, next).expect("illegal commit-driven transition");
        }

        let order = self.next_order();
        let commit_num = self.remote.commit.as_ref().map(|c| c.commit_num + 1).unwrap_or(0);
        // The witness for the *next* incoming revocation is the hash of the
        // commit we are about to overwrite, not the one we are about to mint.
        self.their_prev_revocation_hash = self.remote.commit.as_ref().map(|c| c.revocation_hash);
        self.remote.commit = Some(CommitInfo {
            commit_num,
            revocation_hash: self.remote.next_revocation_hash,
            order,
            sig: Some(our_sig),
            cstate: self.remote.staging_cstate,
        });
        order
    }

    /// Step 3: their `UPDATE_REVOCATION(preimage, next_hash)` arrives. Only
    /// call after [`crate::packets::accept_revocation`] has already checked
    /// the preimage against `their_prev_revocation_hash`.
    pub fn apply_revocation(
        &mut self,
        shachain: &mut crate::shachain::Shachain,
        preimage: [u8; 32],
        next_revocation_hash: [u8; 32],
    ) -> Result<(), ChannelError> {
        let expected = self.their_prev_revocation_hash.ok_or(ChannelError::NoPendingRevocation)?;
        if sha256::Hash::hash(&preimage).into_inner() != expected {
            return Err(ChannelError::RevocationMismatch);
        }
        let commit_num = self.remote.commit.as_ref().expect("revocation with no remote commit").commit_num;
        let index = 0xFFFF_FFFF_FFFF_FFFFu64 - (commit_num.saturating_sub(1));
        shachain.add_hash(index, preimage).expect("shachain insertion must be in descending order");
        self.their_prev_revocation_hash = None;
        self.remote.next_revocation_hash = next_revocation_hash;

        let pending: Vec<(Side, u64, HtlcState)> = self
            .htlcs
            .iter()
            .filter_map(|h| {
                let next = match h.state {
                    HtlcState::RcvdAddAckCommit => Some(HtlcState::RcvdAddAckRevocation),
                    HtlcState::RcvdRemoveHtlc => Some(HtlcState::RcvdRemoveAckRevocation),
                    _ => None,
                };
                next.map(|n| (h.owner, h.id, n))
            })
            .collect();
        for (owner, id, next) in pending {
            self.htlcs.transition(owner, id, next).expect("illegal revocation-driven transition");
        }
        Ok(())
    }

    /// Step 4: their `UPDATE_COMMIT(sig)` arrives; mint a new `local.commit`
    /// from `local.staging_cstate` and produce the revocation preimage for
    /// the previous one, derived deterministically from `revocation_seed`
    /// and the commit number being revoked.
    pub fn apply_remote_commit(
        &mut self,
        revocation_seed: &[u8; 32],
        their_sig: Vec<u8>,
    ) -> (u64, Option<[u8; 32]>) {
        let pending: Vec<(Side, u64, HtlcState)> = self
            .htlcs
            .iter()
            .filter_map(|h| {
                let next = match h.state {
                    HtlcState::RcvdAddHtlc => Some(HtlcState::RcvdAddCommit),
                    HtlcState::RcvdRemoveHtlc => Some(HtlcState::RcvdRemoveHtlc),
                    _ => None,
                };
                next.map(|n| (h.owner, h.id, n))
            })
            .collect();
        for (owner, id, next) in pending {
            self.htlcs.transition(owner, id, next).expect("illegal remote-commit-driven transition");
        }

        let order = self.next_order();
        let prev_commit_num = self.local.commit.as_ref().map(|c| c.commit_num);
        let commit_num = prev_commit_num.map(|n| n + 1).unwrap_or(0);
        self.local.commit = Some(CommitInfo {
            commit_num,
            revocation_hash: self.local.next_revocation_hash,
            order,
            sig: Some(their_sig),
            cstate: self.local.staging_cstate,
        });

        let preimage = prev_commit_num.map(|n| derive_revocation_preimage(revocation_seed, n));
        (order, preimage)
    }
}

/// Deterministically derives the revocation preimage for commitment number
/// `commit_num` from the per-channel revocation seed.
///
/// Uses the same bit-flip construction as [`crate::shachain::generate_from_seed`]
/// rather than an unrelated hash of `(seed, commit_num)`: the counterparty
/// feeds every preimage we hand them into their own [`crate::shachain::Shachain`],
/// whose consistency check only passes if consecutive preimages really are
/// mutually derivable under that construction.
pub fn derive_revocation_preimage(seed: &[u8; 32], commit_num: u64) -> [u8; 32] {
    let index = 0xFFFF_FFFF_FFFF_FFFFu64 - commit_num;
    crate::shachain::generate_from_seed(seed, index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shachain::Shachain;

    fn peer() -> PeerSide {
        PeerSide {
            commit_key: vec![],
            final_key: vec![],
            delay_blocks: 144,
            min_depth: 1,
            fee_rate: 50_000,
            next_revocation_hash: [0u8; 32],
            commit: None,
            staging_cstate: ChannelState::initial(1_000_000, 50_000, Side::Ours).unwrap(),
        }
    }

    #[test]
    fn local_add_then_commit_advances_htlc() {
        let mut channel = Channel::new(1_000_000, 50_000, Side::Ours, peer(), peer()).unwrap();
        assert!(channel.apply_local_add(0, 1_000_000, [1u8; 32], 100, vec![], false));
        assert_eq!(channel.htlcs.get(Side::Ours, 0).unwrap().state, HtlcState::SentAddHtlc);

        channel.emit_update_commit(vec![0xAA]);
        assert_eq!(channel.htlcs.get(Side::Ours, 0).unwrap().state, HtlcState::SentAddCommit);
        assert_eq!(channel.remote.commit.as_ref().unwrap().commit_num, 0);
        // This is the very first commit; there is no earlier one to revoke.
        assert!(channel.their_prev_revocation_hash.is_none());
    }

    #[test]
    fn revocation_requires_matching_preimage() {
        let mut channel = Channel::new(1_000_000, 50_000, Side::Ours, peer(), peer()).unwrap();
        channel.apply_local_add(0, 1_000_000, [1u8; 32], 100, vec![], false);
        channel.emit_update_commit(vec![0xAA]);
        // A second commit is needed before any revocation witness is owed.
        channel.emit_update_commit(vec![0xBB]);
        assert!(channel.their_prev_revocation_hash.is_some());

        let mut shachain = Shachain::new();
        let err = channel.apply_revocation(&mut shachain, [0u8; 32], [2u8; 32]).unwrap_err();
        assert!(matches!(err, ChannelError::RevocationMismatch));
    }

    #[test]
    fn full_round_trip_commits_and_revokes_both_ways() {
        let preimage_0 = [9u8; 32];
        let hash_0 = sha256::Hash::hash(&preimage_0).into_inner();
        let mut remote = peer();
        remote.next_revocation_hash = hash_0;
        let mut channel = Channel::new(1_000_000, 50_000, Side::Ours, peer(), remote).unwrap();
        channel.apply_local_add(0, 1_000_000, [1u8; 32], 100, vec![], false);

        // Round 1 mints remote.commit #0 with revocation_hash = hash_0.
        // Nothing has been committed before it, so there is no witness yet.
        channel.emit_update_commit(vec![0xAA]);
        assert!(channel.their_prev_revocation_hash.is_none());
        let commit_0_revocation_hash = channel.remote.commit.as_ref().unwrap().revocation_hash;
        assert_eq!(commit_0_revocation_hash, hash_0);

        channel.remote.next_revocation_hash = [3u8; 32];
        // Round 2 mints remote.commit #1. The witness for the incoming
        // REVOCATION must be commit #0's own revocation_hash, captured
        // above, not commit #1's freshly-assigned one.
        channel.emit_update_commit(vec![0xBB]);
        assert_eq!(channel.their_prev_revocation_hash, Some(commit_0_revocation_hash));
        assert_ne!(
            channel.their_prev_revocation_hash,
            Some(channel.remote.commit.as_ref().unwrap().revocation_hash)
        );

        let mut shachain = Shachain::new();
        channel.apply_revocation(&mut shachain, preimage_0, [7u8; 32]).unwrap();
        assert!(channel.their_prev_revocation_hash.is_none());
        assert_eq!(channel.remote.next_revocation_hash, [7u8; 32]);

        let seed = [5u8; 32];
        let (order, preimage_out) = channel.apply_remote_commit(&seed, vec![0xBB]);
        assert!(order > 0);
        assert!(preimage_out.is_none());
        assert_eq!(channel.local.commit.as_ref().unwrap().commit_num, 0);
    }

    #[test]
    fn revocation_preimages_are_shachain_consistent() {
        let seed = [7u8; 32];
        let mut chain = Shachain::new();
        for commit_num in 0..4u64 {
            let preimage = derive_revocation_preimage(&seed, commit_num);
            let index = 0xFFFF_FFFF_FFFF_FFFFu64 - commit_num;
            chain.add_hash(index, preimage).unwrap();
            assert_eq!(chain.get(index).unwrap(), preimage);
        }
    }
}
