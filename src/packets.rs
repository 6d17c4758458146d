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

//! The logical wire packets exchanged between two channel peers, and the
//! acceptors that validate them against the current channel state.
//!
//! Each acceptor is a pure function `(&Channel, &Packet) -> Result<Delta,
//! ErrorPacket>`: it never mutates anything itself, it only decides whether
//! the caller may apply the delta it returns. This mirrors the teacher's
//! validate-then-apply split without relying on out-parameters.

use crate::channel::Channel;
use crate::cstate::Side;
use crate::htlc::FailReason;

/// Which party is offering to fund the channel.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
#[display(Debug)]
pub enum AnchorOffer {
    WillCreate,
    WontCreate,
}

/// A logical protocol message. Wire framing is out of scope; this is the
/// decoded, typed shape every acceptor and producer works with.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Packet {
    Open {
        anchor_offer: AnchorOffer,
        commit_key: Vec<u8>,
        final_key: Vec<u8>,
        delay_blocks: u32,
        min_depth: u32,
        initial_fee_rate: u32,
        revocation_hash: [u8; 32],
    },
    OpenAnchor {
        txid: [u8; 32],
        output_index: u32,
        amount_satoshis: u64,
    },
    OpenCommitSig {
        sig: Vec<u8>,
    },
    OpenComplete,
    UpdateAddHtlc {
        id: u64,
        amount_msat: u64,
        rhash: [u8; 32],
        expiry: u32,
        routing: Vec<u8>,
    },
    UpdateFulfillHtlc {
        id: u64,
        r: [u8; 32],
    },
    UpdateFailHtlc {
        id: u64,
        reason: FailReason,
    },
    UpdateCommit {
        sig: Vec<u8>,
    },
    UpdateRevocation {
        preimage: [u8; 32],
        next_revocation_hash: [u8; 32],
    },
    CloseShutdown {
        script: Vec<u8>,
    },
    CloseSignature {
        fee: u64,
        sig: Vec<u8>,
    },
    Error {
        problem: String,
    },
    Reconnect {
        ack: u64,
    },
}

/// A typed, loggable rejection returned by an acceptor in place of mutating
/// the channel. Produced as the `ERROR` packet's payload when the violation
/// is fatal to the channel (§7's `ProtocolViolation`), and used standalone
/// for rejections that only fail the one command.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum ErrorPacket {
    /// peer's requested locktime of {0} blocks exceeds our maximum of {1}
    LocktimeTooLarge(u32, u32),

    /// peer's requested min_depth of {0} exceeds our maximum of {1}
    MinDepthTooLarge(u32, u32),

    /// peer's initial fee-rate of {0} is below our minimum of {1}
    FeeRateTooLow(u32, u32),

    /// peer's initial fee-rate of {0} is above our maximum of {1}
    FeeRateTooHigh(u32, u32),

    /// both peers offered to fund the channel
    DuplicateAnchorOffer,

    /// neither peer offered to fund the channel
    NoAnchorOffer,

    /// invalid amount_msat
    InvalidAmount,

    /// more than {0} HTLCs are already offered to this side
    TooManyHtlcs(u16),

    /// HTLC id {0} is already present on the receiving side
    DuplicateHtlcId(u64),

    /// no HTLC with id {0} on our side
    UnknownHtlc(u64),

    /// HTLC {0} is not in a fulfillable/failable state
    HtlcNotSettleable(u64),

    /// preimage does not hash to the HTLC's rhash
    PreimageMismatch,

    /// revocation preimage does not match the outstanding revocation hash
    RevocationMismatch,

    /// channel is closing, no new commitments may be minted
    ChannelClosing,
}

/// What an accepted packet changes about the channel. The caller (the
/// protocol step driver) applies this under an open persistence transaction;
/// acceptors never mutate state themselves.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Delta {
    /// `ADD_HTLC` was accepted: create the HTLC on the given side.
    NewHtlc {
        owner: Side,
        id: u64,
        msatoshis: u64,
        rhash: [u8; 32],
        expiry: u32,
        routing: Vec<u8>,
    },
    /// `FULFILL_HTLC` was accepted: resolve the HTLC with its preimage.
    FulfillHtlc { id: u64, r: [u8; 32] },
    /// `FAIL_HTLC` was accepted: resolve the HTLC with a reason.
    FailHtlc { id: u64, reason: FailReason },
    /// `UPDATE_COMMIT` was accepted: a new commitment should be minted.
    Commit { sig: Vec<u8> },
    /// `UPDATE_REVOCATION` was accepted: store the preimage, roll the hash.
    Revocation { preimage: [u8; 32], next_revocation_hash: [u8; 32] },
    /// The command was a harmless duplicate; nothing changes, but it is not
    /// an error either (duplicate FULFILL/FAIL per §4.5).
    NoOp,
}

/// Validates an inbound `OPEN` packet's terms against our own policy.
pub fn accept_open(
    config: &crate::config::Config,
    our_anchor_offer: AnchorOffer,
    packet: &Packet,
) -> Result<(), ErrorPacket> {
    let (anchor_offer, delay_blocks, min_depth, initial_fee_rate) = match packet {
        Packet::Open { anchor_offer, delay_blocks, min_depth, initial_fee_rate, .. } => {
            (*anchor_offer, *delay_blocks, *min_depth, *initial_fee_rate)
        }
        _ => panic!("accept_open called with a non-OPEN packet"),
    };

    if delay_blocks > config.locktime_max {
        let err = ErrorPacket::LocktimeTooLarge(delay_blocks, config.locktime_max);
        log::warn!("rejecting OPEN: {}", err);
        return Err(err);
    }
    if min_depth > config.anchor_confirms_max {
        let err = ErrorPacket::MinDepthTooLarge(min_depth, config.anchor_confirms_max);
        log::warn!("rejecting OPEN: {}", err);
        return Err(err);
    }
    let (lowest, highest) = config.fee_rate_range();
    if initial_fee_rate < lowest {
        let err = ErrorPacket::FeeRateTooLow(initial_fee_rate, lowest);
        log::warn!("rejecting OPEN: {}", err);
        return Err(err);
    }
    if initial_fee_rate > highest {
        let err = ErrorPacket::FeeRateTooHigh(initial_fee_rate, highest);
        log::warn!("rejecting OPEN: {}", err);
        return Err(err);
    }
    match (our_anchor_offer, anchor_offer) {
        (AnchorOffer::WillCreate, AnchorOffer::WillCreate) => {
            log::warn!("rejecting OPEN: {}", ErrorPacket::DuplicateAnchorOffer);
            return Err(ErrorPacket::DuplicateAnchorOffer);
        }
        (AnchorOffer::WontCreate, AnchorOffer::WontCreate) => {
            log::warn!("rejecting OPEN: {}", ErrorPacket::NoAnchorOffer);
            return Err(ErrorPacket::NoAnchorOffer);
        }
        _ => {}
    }
    log::debug!("OPEN accepted, delay_blocks={} min_depth={}", delay_blocks, min_depth);
    Ok(())
}

/// Validates an inbound `UPDATE_ADD_HTLC` packet.
pub fn accept_add_htlc(
    config: &crate::config::Config,
    channel: &Channel,
    receiving_side: Side,
    packet: &Packet,
) -> Result<Delta, ErrorPacket> {
    let (id, amount_msat, rhash, expiry, routing) = match packet {
        Packet::UpdateAddHtlc { id, amount_msat, rhash, expiry, routing } => {
            (*id, *amount_msat, *rhash, *expiry, routing.clone())
        }
        _ => panic!("accept_add_htlc called with a non-ADD_HTLC packet"),
    };

    if amount_msat == 0 {
        log::warn!("rejecting ADD_HTLC {}: zero amount", id);
        return Err(ErrorPacket::InvalidAmount);
    }
    if channel.htlcs.count_on_side(receiving_side) >= config.max_htlcs_per_side as usize {
        log::warn!("rejecting ADD_HTLC {}: too many HTLCs on {:?}", id, receiving_side);
        return Err(ErrorPacket::TooManyHtlcs(config.max_htlcs_per_side));
    }
    if channel.htlcs.get(receiving_side, id).is_some() {
        log::warn!("rejecting ADD_HTLC {}: duplicate id", id);
        return Err(ErrorPacket::DuplicateHtlcId(id));
    }

    log::trace!("ADD_HTLC {} accepted for {} msat", id, amount_msat);
    Ok(Delta::NewHtlc { owner: receiving_side, id, msatoshis: amount_msat, rhash, expiry, routing })
}

/// Validates an inbound `UPDATE_FULFILL_HTLC` packet against our LOCAL side
/// (the HTLC we offered).
pub fn accept_fulfill_htlc(channel: &Channel, packet: &Packet) -> Result<Delta, ErrorPacket> {
    use bitcoin_hashes::{sha256, Hash};

    let (id, r) = match packet {
        Packet::UpdateFulfillHtlc { id, r } => (*id, *r),
        _ => panic!("accept_fulfill_htlc called with a non-FULFILL_HTLC packet"),
    };

    let htlc = match channel.htlcs.get(Side::Ours, id) {
        Some(htlc) => htlc,
        None => {
            log::warn!("rejecting FULFILL_HTLC: unknown id {}", id);
            return Err(ErrorPacket::UnknownHtlc(id));
        }
    };
    if htlc.state.is_resolved() {
        return Ok(Delta::NoOp);
    }
    if htlc.state != crate::htlc::HtlcState::SentAddAckRevocation {
        log::warn!("rejecting FULFILL_HTLC {}: not settleable in state {:?}", id, htlc.state);
        return Err(ErrorPacket::HtlcNotSettleable(id));
    }
    if sha256::Hash::hash(&r).into_inner() != htlc.rhash {
        log::warn!("rejecting FULFILL_HTLC {}: preimage mismatch", id);
        return Err(ErrorPacket::PreimageMismatch);
    }
    Ok(Delta::FulfillHtlc { id, r })
}

/// Validates an inbound `UPDATE_FAIL_HTLC` packet against our LOCAL side.
pub fn accept_fail_htlc(channel: &Channel, packet: &Packet) -> Result<Delta, ErrorPacket> {
    let (id, reason) = match packet {
        Packet::UpdateFailHtlc { id, reason } => (*id, reason.clone()),
        _ => panic!("accept_fail_htlc called with a non-FAIL_HTLC packet"),
    };

    let htlc = match channel.htlcs.get(Side::Ours, id) {
        Some(htlc) => htlc,
        None => {
            log::warn!("rejecting FAIL_HTLC: unknown id {}", id);
            return Err(ErrorPacket::UnknownHtlc(id));
        }
    };
    if htlc.state.is_resolved() {
        return Ok(Delta::NoOp);
    }
    if htlc.state != crate::htlc::HtlcState::SentAddAckRevocation {
        log::warn!("rejecting FAIL_HTLC {}: not settleable in state {:?}", id, htlc.state);
        return Err(ErrorPacket::HtlcNotSettleable(id));
    }
    Ok(Delta::FailHtlc { id, reason })
}

/// Validates an inbound `UPDATE_COMMIT` packet. Signature verification is
/// out of scope here (no cryptographic validation is performed by this
/// crate); the only thing left to decide is whether the channel is in a
/// state where a new commitment even makes sense, which closing rules out.
pub fn accept_update_commit(channel: &Channel, packet: &Packet) -> Result<Delta, ErrorPacket> {
    let sig = match packet {
        Packet::UpdateCommit { sig } => sig.clone(),
        _ => panic!("accept_update_commit called with a non-UPDATE_COMMIT packet"),
    };

    if channel.closing.is_some() {
        log::warn!("rejecting UPDATE_COMMIT: {}", ErrorPacket::ChannelClosing);
        return Err(ErrorPacket::ChannelClosing);
    }

    log::trace!("UPDATE_COMMIT accepted");
    Ok(Delta::Commit { sig })
}

/// Validates an inbound `UPDATE_REVOCATION` packet against the outstanding
/// `their_prev_revocation_hash` witness.
pub fn accept_revocation(
    their_prev_revocation_hash: Option<[u8; 32]>,
    packet: &Packet,
) -> Result<Delta, ErrorPacket> {
    use bitcoin_hashes::{sha256, Hash};

    let (preimage, next_revocation_hash) = match packet {
        Packet::UpdateRevocation { preimage, next_revocation_hash } => {
            (*preimage, *next_revocation_hash)
        }
        _ => panic!("accept_revocation called with a non-REVOCATION packet"),
    };

    let expected = match their_prev_revocation_hash {
        Some(expected) => expected,
        None => {
            log::warn!("rejecting UPDATE_REVOCATION: no outstanding revocation witness");
            return Err(ErrorPacket::RevocationMismatch);
        }
    };
    if sha256::Hash::hash(&preimage).into_inner() != expected {
        log::warn!("rejecting UPDATE_REVOCATION: preimage does not hash to expected witness");
        return Err(ErrorPacket::RevocationMismatch);
    }
    Ok(Delta::Revocation { preimage, next_revocation_hash })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn open_rejects_locktime_too_large() {
        let config = Config::default();
        let packet = Packet::Open {
            anchor_offer: AnchorOffer::WillCreate,
            commit_key: vec![],
            final_key: vec![],
            delay_blocks: config.locktime_max + 1,
            min_depth: 1,
            initial_fee_rate: config.our_fee_rate,
            revocation_hash: [0u8; 32],
        };
        let err = accept_open(&config, AnchorOffer::WontCreate, &packet).unwrap_err();
        assert!(matches!(err, ErrorPacket::LocktimeTooLarge(_, _)));
    }

    #[test]
    fn open_rejects_fee_rate_too_low_and_too_high_distinctly() {
        let config = Config::default();
        let too_low = Packet::Open {
            anchor_offer: AnchorOffer::WillCreate,
            commit_key: vec![],
            final_key: vec![],
            delay_blocks: 1,
            min_depth: 1,
            initial_fee_rate: 1,
            revocation_hash: [0u8; 32],
        };
        let err = accept_open(&config, AnchorOffer::WontCreate, &too_low).unwrap_err();
        assert!(matches!(err, ErrorPacket::FeeRateTooLow(_, _)));

        let too_high = Packet::Open {
            anchor_offer: AnchorOffer::WillCreate,
            commit_key: vec![],
            final_key: vec![],
            delay_blocks: 1,
            min_depth: 1,
            initial_fee_rate: config.our_fee_rate * 1000,
            revocation_hash: [0u8; 32],
        };
        let err = accept_open(&config, AnchorOffer::WontCreate, &too_high).unwrap_err();
        assert!(matches!(err, ErrorPacket::FeeRateTooHigh(_, _)));
    }

    #[test]
    fn open_rejects_duplicate_anchor_offer() {
        let config = Config::default();
        let packet = Packet::Open {
            anchor_offer: AnchorOffer::WillCreate,
            commit_key: vec![],
            final_key: vec![],
            delay_blocks: 1,
            min_depth: 1,
            initial_fee_rate: config.our_fee_rate,
            revocation_hash: [0u8; 32],
        };
        let err = accept_open(&config, AnchorOffer::WillCreate, &packet).unwrap_err();
        assert!(matches!(err, ErrorPacket::DuplicateAnchorOffer));
    }

    #[test]
    fn add_htlc_rejects_zero_amount() {
        let config = Config::default();
        let channel = Channel::new_for_test();
        let packet = Packet::UpdateAddHtlc {
            id: 0,
            amount_msat: 0,
            rhash: [0u8; 32],
            expiry: 100,
            routing: vec![],
        };
        let err = accept_add_htlc(&config, &channel, Side::Theirs, &packet).unwrap_err();
        assert!(matches!(err, ErrorPacket::InvalidAmount));
    }

    #[test]
    fn add_htlc_rejects_duplicate_id() {
        let config = Config::default();
        let mut channel = Channel::new_for_test();
        channel.htlcs.new_htlc(Side::Theirs, 1000, [0u8; 32], 100, vec![], Some(7));
        let packet = Packet::UpdateAddHtlc {
            id: 7,
            amount_msat: 1000,
            rhash: [0u8; 32],
            expiry: 100,
            routing: vec![],
        };
        let err = accept_add_htlc(&config, &channel, Side::Theirs, &packet).unwrap_err();
        assert!(matches!(err, ErrorPacket::DuplicateHtlcId(7)));
    }

    #[test]
    fn fulfill_requires_matching_preimage() {
        let mut channel = Channel::new_for_test();
        let preimage = [7u8; 32];
        let rhash = {
            use bitcoin_hashes::{sha256, Hash};
            sha256::Hash::hash(&preimage).into_inner()
        };
        channel.htlcs.new_htlc(Side::Ours, 1000, rhash, 100, vec![], None);
        channel.htlcs.transition(Side::Ours, 0, crate::htlc::HtlcState::SentAddCommit).unwrap();
        channel.htlcs.transition(Side::Ours, 0, crate::htlc::HtlcState::RcvdAddRevocation).unwrap();
        channel.htlcs.transition(Side::Ours, 0, crate::htlc::HtlcState::RcvdAddAckCommit).unwrap();
        channel
            .htlcs
            .transition(Side::Ours, 0, crate::htlc::HtlcState::SentAddAckRevocation)
            .unwrap();

        let bad = Packet::UpdateFulfillHtlc { id: 0, r: [0u8; 32] };
        let err = accept_fulfill_htlc(&channel, &bad).unwrap_err();
        assert!(matches!(err, ErrorPacket::PreimageMismatch));

        let good = Packet::UpdateFulfillHtlc { id: 0, r: preimage };
        let delta = accept_fulfill_htlc(&channel, &good).unwrap();
        assert_eq!(delta, Delta::FulfillHtlc { id: 0, r: preimage });
    }

    #[test]
    fn update_commit_accepted_on_open_channel() {
        let channel = Channel::new_for_test();
        let packet = Packet::UpdateCommit { sig: vec![0xAA, 0xBB] };
        let delta = accept_update_commit(&channel, &packet).unwrap();
        assert_eq!(delta, Delta::Commit { sig: vec![0xAA, 0xBB] });
    }

    #[test]
    fn update_commit_rejected_while_closing() {
        let mut channel = Channel::new_for_test();
        channel.closing = Some(crate::channel::Closing::default());
        let packet = Packet::UpdateCommit { sig: vec![] };
        let err = accept_update_commit(&channel, &packet).unwrap_err();
        assert!(matches!(err, ErrorPacket::ChannelClosing));
    }

    #[test]
    fn revocation_requires_outstanding_witness() {
        let preimage = [3u8; 32];
        let hash = {
            use bitcoin_hashes::{sha256, Hash};
            sha256::Hash::hash(&preimage).into_inner()
        };
        let packet =
            Packet::UpdateRevocation { preimage, next_revocation_hash: [9u8; 32] };
        let err = accept_revocation(None, &packet).unwrap_err();
        assert!(matches!(err, ErrorPacket::RevocationMismatch));

        let delta = accept_revocation(Some(hash), &packet).unwrap();
        assert_eq!(delta, Delta::Revocation { preimage, next_revocation_hash: [9u8; 32] });
    }
}
