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

//! The eleven logical tables backing [`super::Store`].

pub const SCHEMA: &str = "
CREATE TABLE wallet (
    privkey BLOB NOT NULL
);

CREATE TABLE peers (
    peer_pubkey BLOB PRIMARY KEY,
    state TEXT NOT NULL,
    offered_anchor INTEGER NOT NULL,
    our_feerate INTEGER NOT NULL
);

CREATE TABLE peer_secrets (
    peer BLOB PRIMARY KEY REFERENCES peers(peer_pubkey),
    commitkey BLOB NOT NULL,
    finalkey BLOB NOT NULL,
    revocation_seed BLOB NOT NULL
);

CREATE TABLE peer_address (
    peer BLOB PRIMARY KEY REFERENCES peers(peer_pubkey),
    addr BLOB NOT NULL
);

CREATE TABLE anchors (
    peer BLOB PRIMARY KEY REFERENCES peers(peer_pubkey),
    txid BLOB NOT NULL,
    idx INTEGER NOT NULL,
    amount INTEGER NOT NULL,
    ok_depth INTEGER NOT NULL,
    min_depth INTEGER NOT NULL,
    ours INTEGER NOT NULL
);

CREATE TABLE their_visible_state (
    peer BLOB PRIMARY KEY REFERENCES peers(peer_pubkey),
    offered_anchor INTEGER NOT NULL,
    commitkey BLOB NOT NULL,
    finalkey BLOB NOT NULL,
    locktime INTEGER NOT NULL,
    mindepth INTEGER NOT NULL,
    commit_fee_rate INTEGER NOT NULL,
    next_revocation_hash BLOB NOT NULL
);

CREATE TABLE commit_info (
    peer BLOB NOT NULL REFERENCES peers(peer_pubkey),
    side TEXT NOT NULL,
    commit_num INTEGER NOT NULL,
    revocation_hash BLOB NOT NULL,
    xmit_order INTEGER NOT NULL,
    sig BLOB,
    prev_revocation_hash BLOB,
    PRIMARY KEY (peer, side, commit_num)
);

CREATE TABLE htlcs (
    peer BLOB NOT NULL REFERENCES peers(peer_pubkey),
    owner TEXT NOT NULL,
    id INTEGER NOT NULL,
    state TEXT NOT NULL,
    msatoshis INTEGER NOT NULL,
    expiry INTEGER NOT NULL,
    rhash BLOB NOT NULL,
    r BLOB,
    routing BLOB NOT NULL,
    src_peer BLOB,
    src_id INTEGER,
    PRIMARY KEY (peer, owner, id)
);

CREATE TABLE shachain (
    peer BLOB PRIMARY KEY REFERENCES peers(peer_pubkey),
    shachain BLOB NOT NULL
);

CREATE TABLE their_commitments (
    peer BLOB NOT NULL REFERENCES peers(peer_pubkey),
    txid BLOB NOT NULL,
    commit_num INTEGER NOT NULL
);

CREATE TABLE closing (
    peer BLOB PRIMARY KEY REFERENCES peers(peer_pubkey),
    our_fee INTEGER NOT NULL,
    their_fee INTEGER NOT NULL,
    their_sig BLOB,
    our_script BLOB,
    their_script BLOB,
    shutdown_order INTEGER NOT NULL,
    closing_order INTEGER NOT NULL,
    sigs_in INTEGER NOT NULL
);
";
