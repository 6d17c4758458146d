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

//! Transactional store over a single SQLite file.
//!
//! Every multi-write protocol step runs inside one transaction
//! (`begin_transaction` → writes → `commit_transaction`, `abort_transaction`
//! on any error). The `in_transaction` flag is a hard invariant, asserted at
//! every write-site, matching the single-writer model of a process-wide
//! `rusqlite::Connection`.

mod schema;

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};

use crate::channel::{Anchor, Channel, Closing, CommitInfo, Funder, PeerSide};
use crate::cstate::{ChannelState, Side};
use crate::htlc::{Htlc, HtlcState, Registry};
use crate::shachain::{Shachain, LINEARIZED_LEN};

#[derive(Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum StoreError {
    /// underlying database error: {0}
    #[from]
    Sqlite(rusqlite::Error),

    /// update-with-guard on {table} for peer {peer} affected {rows} rows, expected 1
    GuardViolation { table: &'static str, peer: String, rows: usize },

    /// attempted a transactional write while no transaction is open
    NoTransaction,

    /// attempted to begin a transaction while one is already open
    TransactionAlreadyOpen,

    /// stored HTLC state {0:?} is not a recognized state name
    UnknownHtlcState(String),

    /// stored side {0:?} is not OURS or THEIRS
    UnknownSide(String),

    /// restart reconstruction for peer {peer} is missing its {table} row
    MissingRow { table: &'static str, peer: String },

    /// restart reconstruction produced an inconsistent channel state: {0}
    #[from]
    Reconstruction(crate::cstate::CStateError),
}

type PeerSecretsRow = (Vec<u8>, Vec<u8>, [u8; 32]);
type TheirVisibleRow = (Vec<u8>, Vec<u8>, u32, u32, u32, Vec<u8>);
type CommitInfoRow = (u64, [u8; 32], u64, Option<Vec<u8>>, Option<[u8; 32]>);
type CommitInfoRawRow = (i64, Vec<u8>, i64, Option<Vec<u8>>, Option<Vec<u8>>);
type ClosingRow = (i64, i64, Option<Vec<u8>>, Option<Vec<u8>>, Option<Vec<u8>>, i64, i64, u32);

fn side_name(side: Side) -> &'static str {
    match side {
        Side::Ours => "OURS",
        Side::Theirs => "THEIRS",
    }
}

fn parse_side(s: &str) -> Result<Side, StoreError> {
    match s {
        "OURS" => Ok(Side::Ours),
        "THEIRS" => Ok(Side::Theirs),
        other => Err(StoreError::UnknownSide(other.to_string())),
    }
}

fn state_name(state: HtlcState) -> &'static str {
    use HtlcState::*;
    match state {
        SentAddHtlc => "SENT_ADD_HTLC",
        SentAddCommit => "SENT_ADD_COMMIT",
        RcvdAddRevocation => "RCVD_ADD_REVOCATION",
        RcvdAddAckCommit => "RCVD_ADD_ACK_COMMIT",
        SentAddAckRevocation => "SENT_ADD_ACK_REVOCATION",
        RcvdAddHtlc => "RCVD_ADD_HTLC",
        RcvdAddCommit => "RCVD_ADD_COMMIT",
        SentAddRevocation => "SENT_ADD_REVOCATION",
        SentAddAckCommit => "SENT_ADD_ACK_COMMIT",
        RcvdAddAckRevocation => "RCVD_ADD_ACK_REVOCATION",
        SentRemoveHtlc => "SENT_REMOVE_HTLC",
        SentRemoveAckRevocation => "SENT_REMOVE_ACK_REVOCATION",
        RcvdRemoveHtlc => "RCVD_REMOVE_HTLC",
        RcvdRemoveAckRevocation => "RCVD_REMOVE_ACK_REVOCATION",
    }
}

fn parse_state(s: &str) -> Result<HtlcState, StoreError> {
    use HtlcState::*;
    Ok(match s {
        "SENT_ADD_HTLC" => SentAddHtlc,
        "SENT_ADD_COMMIT" => SentAddCommit,
        "RCVD_ADD_REVOCATION" => RcvdAddRevocation,
        "RCVD_ADD_ACK_COMMIT" => RcvdAddAckCommit,
        "SENT_ADD_ACK_REVOCATION" => SentAddAckRevocation,
        "RCVD_ADD_HTLC" => RcvdAddHtlc,
        "RCVD_ADD_COMMIT" => RcvdAddCommit,
        "SENT_ADD_REVOCATION" => SentAddRevocation,
        "SENT_ADD_ACK_COMMIT" => SentAddAckCommit,
        "RCVD_ADD_ACK_REVOCATION" => RcvdAddAckRevocation,
        "SENT_REMOVE_HTLC" => SentRemoveHtlc,
        "SENT_REMOVE_ACK_REVOCATION" => SentRemoveAckRevocation,
        "RCVD_REMOVE_HTLC" => RcvdRemoveHtlc,
        "RCVD_REMOVE_ACK_REVOCATION" => RcvdRemoveAckRevocation,
        other => return Err(StoreError::UnknownHtlcState(other.to_string())),
    })
}

/// A transactional SQLite-backed store for one node's peers.
pub struct Store {
    conn: Connection,
    in_transaction: bool,
}

impl Store {
    /// Opens (or creates) the store at `path`. If the file does not yet
    /// exist, it is created and the schema applied inside one transaction;
    /// if schema application fails, the partial file is removed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let is_new = !path.exists();
        let conn = Connection::open(path)?;
        if is_new {
            if let Err(err) = conn.execute_batch(schema::SCHEMA) {
                log::error!("schema application failed on fresh store, removing partial file: {}", err);
                drop(conn);
                let _ = std::fs::remove_file(path);
                return Err(StoreError::Sqlite(err));
            }
        }
        Ok(Store { conn, in_transaction: false })
    }

    /// Opens a purely in-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(schema::SCHEMA)?;
        Ok(Store { conn, in_transaction: false })
    }

    pub fn begin_transaction(&mut self) -> Result<(), StoreError> {
        if self.in_transaction {
            return Err(StoreError::TransactionAlreadyOpen);
        }
        self.conn.execute_batch("BEGIN")?;
        self.in_transaction = true;
        Ok(())
    }

    pub fn commit_transaction(&mut self) -> Result<(), StoreError> {
        if !self.in_transaction {
            return Err(StoreError::NoTransaction);
        }
        self.conn.execute_batch("COMMIT")?;
        self.in_transaction = false;
        Ok(())
    }

    pub fn abort_transaction(&mut self) -> Result<(), StoreError> {
        if !self.in_transaction {
            return Err(StoreError::NoTransaction);
        }
        log::error!("aborting transaction");
        self.conn.execute_batch("ROLLBACK")?;
        self.in_transaction = false;
        Ok(())
    }

    fn assert_in_transaction(&self) -> Result<(), StoreError> {
        if !self.in_transaction {
            return Err(StoreError::NoTransaction);
        }
        Ok(())
    }

    pub fn insert_peer(&self, peer_pubkey: &[u8], state: &str, offered_anchor: bool, our_feerate: u32) -> Result<(), StoreError> {
        self.assert_in_transaction()?;
        self.conn.execute(
            "INSERT INTO peers (peer_pubkey, state, offered_anchor, our_feerate) VALUES (?1, ?2, ?3, ?4)",
            params![peer_pubkey, state, offered_anchor, our_feerate],
        )?;
        Ok(())
    }

    pub fn update_peer_state(&self, peer_pubkey: &[u8], state: &str) -> Result<(), StoreError> {
        self.assert_in_transaction()?;
        self.conn.execute(
            "UPDATE peers SET state = ?2 WHERE peer_pubkey = ?1",
            params![peer_pubkey, state],
        )?;
        Ok(())
    }

    pub fn insert_htlc(&self, peer_pubkey: &[u8], htlc: &Htlc) -> Result<(), StoreError> {
        self.assert_in_transaction()?;
        let (src_peer, src_id): (Option<Vec<u8>>, Option<i64>) = match &htlc.upstream {
            Some((peer, id)) => (Some(peer.clone()), Some(*id as i64)),
            None => (None, None),
        };
        self.conn.execute(
            "INSERT INTO htlcs (peer, owner, id, state, msatoshis, expiry, rhash, r, routing, src_peer, src_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                peer_pubkey,
                side_name(htlc.owner),
                htlc.id as i64,
                state_name(htlc.state),
                htlc.msatoshis as i64,
                htlc.expiry as i64,
                &htlc.rhash[..],
                htlc.r.map(|r| r.to_vec()),
                htlc.routing,
                src_peer,
                src_id,
            ],
        )?;
        Ok(())
    }

    /// Writes an HTLC's new state with an `AND state = old` guard. A
    /// zero-row effect means a concurrent or duplicated update raced us —
    /// a protocol bug, not a recoverable condition.
    pub fn update_htlc_state(
        &self,
        peer_pubkey: &[u8],
        owner: Side,
        id: u64,
        old: HtlcState,
        new: HtlcState,
    ) -> Result<(), StoreError> {
        self.assert_in_transaction()?;
        let rows = self.conn.execute(
            "UPDATE htlcs SET state = ?5 WHERE peer = ?1 AND owner = ?2 AND id = ?3 AND state = ?4",
            params![peer_pubkey, side_name(owner), id as i64, state_name(old), state_name(new)],
        )?;
        if rows != 1 {
            let err =
                StoreError::GuardViolation { table: "htlcs", peer: hex_of(peer_pubkey), rows };
            log::error!("{}", err);
            return Err(err);
        }
        Ok(())
    }

    pub fn resolve_htlc(
        &self,
        peer_pubkey: &[u8],
        owner: Side,
        id: u64,
        old: HtlcState,
        new: HtlcState,
        r: Option<[u8; 32]>,
    ) -> Result<(), StoreError> {
        self.assert_in_transaction()?;
        let rows = self.conn.execute(
            "UPDATE htlcs SET state = ?5, r = ?6 WHERE peer = ?1 AND owner = ?2 AND id = ?3 AND state = ?4",
            params![
                peer_pubkey,
                side_name(owner),
                id as i64,
                state_name(old),
                state_name(new),
                r.map(|r| r.to_vec()),
            ],
        )?;
        if rows != 1 {
            let err =
                StoreError::GuardViolation { table: "htlcs", peer: hex_of(peer_pubkey), rows };
            log::error!("{}", err);
            return Err(err);
        }
        Ok(())
    }

    /// Loads every HTLC for `peer_pubkey`, ascending by id, for restart
    /// replay. `owner`'s id is only unique within a side, so this returns
    /// both sides interleaved in id order within each.
    pub fn load_htlcs_ascending(&self, peer_pubkey: &[u8]) -> Result<Vec<Htlc>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT owner, id, state, msatoshis, expiry, rhash, r, routing, src_peer, src_id
             FROM htlcs WHERE peer = ?1 ORDER BY owner, id ASC",
        )?;
        let rows = stmt.query_map(params![peer_pubkey], |row| {
            let owner: String = row.get(0)?;
            let id: i64 = row.get(1)?;
            let state: String = row.get(2)?;
            let msatoshis: i64 = row.get(3)?;
            let expiry: i64 = row.get(4)?;
            let rhash: Vec<u8> = row.get(5)?;
            let r: Option<Vec<u8>> = row.get(6)?;
            let routing: Vec<u8> = row.get(7)?;
            let src_peer: Option<Vec<u8>> = row.get(8)?;
            let src_id: Option<i64> = row.get(9)?;
            Ok((owner, id, state, msatoshis, expiry, rhash, r, routing, src_peer, src_id))
        })?;

        let mut htlcs = Vec::new();
        for row in rows {
            let (owner, id, state, msatoshis, expiry, rhash, r, routing, src_peer, src_id) = row?;
            let mut rhash_arr = [0u8; 32];
            rhash_arr.copy_from_slice(&rhash);
            let r_arr = r.map(|r| {
                let mut arr = [0u8; 32];
                arr.copy_from_slice(&r);
                arr
            });
            htlcs.push(Htlc {
                id: id as u64,
                owner: parse_side(&owner)?,
                msatoshis: msatoshis as u64,
                rhash: rhash_arr,
                expiry: expiry as u32,
                routing,
                state: parse_state(&state)?,
                r: r_arr,
                fail_reason: None,
                upstream: match (src_peer, src_id) {
                    (Some(peer), Some(id)) => Some((peer, id as u64)),
                    _ => None,
                },
            });
        }
        Ok(htlcs)
    }

    pub fn save_shachain(&self, peer_pubkey: &[u8], shachain: &Shachain) -> Result<(), StoreError> {
        self.assert_in_transaction()?;
        let buf = shachain.linearize();
        self.conn.execute(
            "INSERT INTO shachain (peer, shachain) VALUES (?1, ?2)
             ON CONFLICT(peer) DO UPDATE SET shachain = excluded.shachain",
            params![peer_pubkey, &buf[..]],
        )?;
        Ok(())
    }

    pub fn load_shachain(&self, peer_pubkey: &[u8]) -> Result<Option<Shachain>, StoreError> {
        let buf: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT shachain FROM shachain WHERE peer = ?1",
                params![peer_pubkey],
                |row| row.get(0),
            )
            .optional()?;
        match buf {
            Some(buf) if buf.len() == LINEARIZED_LEN => {
                Shachain::delinearize(&buf).map(Some).map_err(|_| {
                    StoreError::UnknownHtlcState("corrupt shachain blob".to_string())
                })
            }
            Some(_) => Ok(None),
            None => Ok(None),
        }
    }

    /// Persists the node's long-term wallet key. A single-row table: any
    /// previous key is replaced.
    pub fn save_wallet(&self, privkey: &[u8]) -> Result<(), StoreError> {
        self.assert_in_transaction()?;
        self.conn.execute("DELETE FROM wallet", [])?;
        self.conn.execute("INSERT INTO wallet (privkey) VALUES (?1)", params![privkey])?;
        Ok(())
    }

    pub fn load_wallet(&self) -> Result<Option<Vec<u8>>, StoreError> {
        self.conn
            .query_row("SELECT privkey FROM wallet LIMIT 1", [], |row| row.get(0))
            .optional()
            .map_err(StoreError::from)
    }

    /// Lists every known peer's public key, for restart enumeration.
    pub fn load_peers(&self) -> Result<Vec<Vec<u8>>, StoreError> {
        let mut stmt = self.conn.prepare("SELECT peer_pubkey FROM peers")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Loads one peer's row: `(state, offered_anchor, our_feerate)`.
    pub fn load_peer(&self, peer_pubkey: &[u8]) -> Result<Option<(String, bool, u32)>, StoreError> {
        self.conn
            .query_row(
                "SELECT state, offered_anchor, our_feerate FROM peers WHERE peer_pubkey = ?1",
                params![peer_pubkey],
                |row| Ok((row.get(0)?, row.get(1)?, row.get::<_, i64>(2)? as u32)),
            )
            .optional()
            .map_err(StoreError::from)
    }

    pub fn insert_peer_secrets(
        &self,
        peer_pubkey: &[u8],
        commit_key: &[u8],
        final_key: &[u8],
        revocation_seed: &[u8; 32],
    ) -> Result<(), StoreError> {
        self.assert_in_transaction()?;
        self.conn.execute(
            "INSERT INTO peer_secrets (peer, commitkey, finalkey, revocation_seed) VALUES (?1, ?2, ?3, ?4)",
            params![peer_pubkey, commit_key, final_key, &revocation_seed[..]],
        )?;
        Ok(())
    }

    pub fn load_peer_secrets(
        &self,
        peer_pubkey: &[u8],
    ) -> Result<Option<PeerSecretsRow>, StoreError> {
        let row: Option<(Vec<u8>, Vec<u8>, Vec<u8>)> = self
            .conn
            .query_row(
                "SELECT commitkey, finalkey, revocation_seed FROM peer_secrets WHERE peer = ?1",
                params![peer_pubkey],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        Ok(row.map(|(commit_key, final_key, seed)| (commit_key, final_key, to_array(&seed))))
    }

    pub fn insert_peer_address(&self, peer_pubkey: &[u8], addr: &[u8]) -> Result<(), StoreError> {
        self.assert_in_transaction()?;
        self.conn.execute(
            "INSERT INTO peer_address (peer, addr) VALUES (?1, ?2)",
            params![peer_pubkey, addr],
        )?;
        Ok(())
    }

    pub fn load_peer_address(&self, peer_pubkey: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.conn
            .query_row(
                "SELECT addr FROM peer_address WHERE peer = ?1",
                params![peer_pubkey],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::from)
    }

    pub fn insert_anchor(&self, peer_pubkey: &[u8], anchor: &Anchor) -> Result<(), StoreError> {
        self.assert_in_transaction()?;
        self.conn.execute(
            "INSERT INTO anchors (peer, txid, idx, amount, ok_depth, min_depth, ours)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                peer_pubkey,
                &anchor.txid[..],
                anchor.output_index,
                anchor.amount_satoshis as i64,
                anchor.confirmed_depth,
                anchor.min_depth,
                anchor.funder == Funder::Ours,
            ],
        )?;
        Ok(())
    }

    pub fn load_anchor(&self, peer_pubkey: &[u8]) -> Result<Option<Anchor>, StoreError> {
        let row: Option<(Vec<u8>, u32, i64, u32, u32, bool)> = self
            .conn
            .query_row(
                "SELECT txid, idx, amount, ok_depth, min_depth, ours FROM anchors WHERE peer = ?1",
                params![peer_pubkey],
                |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?))
                },
            )
            .optional()?;
        Ok(row.map(|(txid, output_index, amount, confirmed_depth, min_depth, ours)| Anchor {
            amount_satoshis: amount as u64,
            funder: if ours { Funder::Ours } else { Funder::Theirs },
            txid: to_array(&txid),
            output_index,
            min_depth,
            confirmed_depth,
        }))
    }

    pub fn insert_their_visible_state(
        &self,
        peer_pubkey: &[u8],
        offered_anchor: bool,
        state: &TheirVisibleState,
    ) -> Result<(), StoreError> {
        self.assert_in_transaction()?;
        self.conn.execute(
            "INSERT INTO their_visible_state
             (peer, offered_anchor, commitkey, finalkey, locktime, mindepth, commit_fee_rate, next_revocation_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                peer_pubkey,
                offered_anchor,
                state.commit_key,
                state.final_key,
                state.locktime,
                state.min_depth,
                state.commit_fee_rate,
                &state.next_revocation_hash[..],
            ],
        )?;
        Ok(())
    }

    pub fn load_their_visible_state(
        &self,
        peer_pubkey: &[u8],
    ) -> Result<Option<TheirVisibleState>, StoreError> {
        let row: Option<TheirVisibleRow> = self
            .conn
            .query_row(
                "SELECT commitkey, finalkey, locktime, mindepth, commit_fee_rate, next_revocation_hash
                 FROM their_visible_state WHERE peer = ?1",
                params![peer_pubkey],
                |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?))
                },
            )
            .optional()?;
        Ok(row.map(|(commit_key, final_key, locktime, min_depth, commit_fee_rate, next_revocation_hash)| {
            TheirVisibleState {
                commit_key,
                final_key,
                locktime,
                min_depth,
                commit_fee_rate,
                next_revocation_hash: to_array(&next_revocation_hash),
            }
        }))
    }

    pub fn insert_commit_info(
        &self,
        peer_pubkey: &[u8],
        side: Side,
        commit: &CommitInfo,
        prev_revocation_hash: Option<[u8; 32]>,
    ) -> Result<(), StoreError> {
        self.assert_in_transaction()?;
        self.conn.execute(
            "INSERT INTO commit_info (peer, side, commit_num, revocation_hash, xmit_order, sig, prev_revocation_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                peer_pubkey,
                side_name(side),
                commit.commit_num as i64,
                &commit.revocation_hash[..],
                commit.order as i64,
                commit.sig,
                prev_revocation_hash.map(|h| h.to_vec()),
            ],
        )?;
        Ok(())
    }

    /// Loads the highest-`commit_num` row for (`peer_pubkey`, `side`):
    /// `(commit_num, revocation_hash, order, sig, prev_revocation_hash)`.
    pub fn load_latest_commit_info(
        &self,
        peer_pubkey: &[u8],
        side: Side,
    ) -> Result<Option<CommitInfoRow>, StoreError> {
        let row: Option<CommitInfoRawRow> = self
            .conn
            .query_row(
                "SELECT commit_num, revocation_hash, xmit_order, sig, prev_revocation_hash
                 FROM commit_info WHERE peer = ?1 AND side = ?2 ORDER BY commit_num DESC LIMIT 1",
                params![peer_pubkey, side_name(side)],
                |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                },
            )
            .optional()?;
        Ok(row.map(|(commit_num, revocation_hash, order, sig, prev)| {
            (commit_num as u64, to_array(&revocation_hash), order as u64, sig, prev.map(|p| to_array(&p)))
        }))
    }

    pub fn insert_their_commitment(
        &self,
        peer_pubkey: &[u8],
        txid: &[u8; 32],
        commit_num: u64,
    ) -> Result<(), StoreError> {
        self.assert_in_transaction()?;
        self.conn.execute(
            "INSERT INTO their_commitments (peer, txid, commit_num) VALUES (?1, ?2, ?3)",
            params![peer_pubkey, &txid[..], commit_num as i64],
        )?;
        Ok(())
    }

    pub fn load_their_commitments(&self, peer_pubkey: &[u8]) -> Result<Vec<([u8; 32], u64)>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT txid, commit_num FROM their_commitments WHERE peer = ?1")?;
        let rows = stmt.query_map(params![peer_pubkey], |row| {
            let txid: Vec<u8> = row.get(0)?;
            let commit_num: i64 = row.get(1)?;
            Ok((txid, commit_num))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (txid, commit_num) = row?;
            out.push((to_array(&txid), commit_num as u64));
        }
        Ok(out)
    }

    pub fn save_closing(&self, peer_pubkey: &[u8], closing: &Closing) -> Result<(), StoreError> {
        self.assert_in_transaction()?;
        self.conn.execute(
            "INSERT INTO closing
             (peer, our_fee, their_fee, their_sig, our_script, their_script, shutdown_order, closing_order, sigs_in)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(peer) DO UPDATE SET
                our_fee = excluded.our_fee, their_fee = excluded.their_fee,
                their_sig = excluded.their_sig, our_script = excluded.our_script,
                their_script = excluded.their_script, shutdown_order = excluded.shutdown_order,
                closing_order = excluded.closing_order, sigs_in = excluded.sigs_in",
            params![
                peer_pubkey,
                closing.our_fee as i64,
                closing.their_fee as i64,
                closing.their_sig,
                closing.our_script,
                closing.their_script,
                closing.shutdown_order as i64,
                closing.closing_order as i64,
                closing.sigs_in,
            ],
        )?;
        Ok(())
    }

    pub fn load_closing(&self, peer_pubkey: &[u8]) -> Result<Option<Closing>, StoreError> {
        let row: Option<ClosingRow> = self
            .conn
            .query_row(
                "SELECT our_fee, their_fee, their_sig, our_script, their_script, shutdown_order, closing_order, sigs_in
                 FROM closing WHERE peer = ?1",
                params![peer_pubkey],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                    ))
                },
            )
            .optional()?;
        Ok(row.map(
            |(our_fee, their_fee, their_sig, our_script, their_script, shutdown_order, closing_order, sigs_in)| {
                Closing {
                    our_fee: our_fee as u64,
                    their_fee: their_fee as u64,
                    their_sig,
                    our_script,
                    their_script,
                    shutdown_order: shutdown_order as u64,
                    closing_order: closing_order as u64,
                    sigs_in,
                }
            },
        ))
    }

    /// Rebuilds one peer's full in-memory [`Channel`] from storage, per the
    /// restart-reconstruction algorithm: load secrets, visible state,
    /// shachain and the latest commit row per side, then replay every HTLC
    /// ascending by id — folding it into the corresponding commit's cstate
    /// when [`HtlcState::local_was_committed`]/`remote_was_committed`
    /// report it was ever part of that chain, and into the staging cstate
    /// unconditionally while it has not yet fully resolved.
    ///
    /// Returns `Ok(None)` if `peer_pubkey` is not known at all. A known peer
    /// missing its secrets, visible-state or anchor row is a corrupt store,
    /// reported as [`StoreError::MissingRow`].
    pub fn reconstruct_channel(
        &self,
        peer_pubkey: &[u8],
        config: &crate::config::Config,
    ) -> Result<Option<ReconstructedPeer>, StoreError> {
        let peer = hex_of(peer_pubkey);
        let (_state, _offered_anchor, our_feerate) = match self.load_peer(peer_pubkey)? {
            Some(row) => row,
            None => return Ok(None),
        };

        let (commit_key, final_key, revocation_seed) = self
            .load_peer_secrets(peer_pubkey)?
            .ok_or_else(|| StoreError::MissingRow { table: "peer_secrets", peer: peer.clone() })?;
        let address = self.load_peer_address(peer_pubkey)?;
        let anchor = self
            .load_anchor(peer_pubkey)?
            .ok_or_else(|| StoreError::MissingRow { table: "anchors", peer: peer.clone() })?;
        let their_visible = self
            .load_their_visible_state(peer_pubkey)?
            .ok_or_else(|| StoreError::MissingRow { table: "their_visible_state", peer: peer.clone() })?;
        let shachain = self.load_shachain(peer_pubkey)?.unwrap_or_else(Shachain::new);
        let closing = self.load_closing(peer_pubkey)?;

        let funder_side = match anchor.funder {
            Funder::Ours => Side::Ours,
            Funder::Theirs => Side::Theirs,
        };
        let initial = ChannelState::initial(anchor.amount_satoshis, our_feerate, funder_side)?;

        let mut local_commit_cstate = initial;
        let mut remote_commit_cstate = initial;
        let mut local_staging_cstate = initial;
        let mut remote_staging_cstate = initial;
        let mut registry = Registry::new();

        for htlc in self.load_htlcs_ascending(peer_pubkey)? {
            let dust = htlc.is_dust(config.dust_limit_satoshis);

            if htlc.state.local_was_committed() {
                local_commit_cstate.add_htlc(htlc.owner, htlc.msatoshis, dust);
                if !htlc.state.local_committed() {
                    resolve(&mut local_commit_cstate, htlc.owner, htlc.msatoshis, dust, htlc.r);
                }
            }
            if htlc.state.remote_was_committed() {
                remote_commit_cstate.add_htlc(htlc.owner, htlc.msatoshis, dust);
                if !htlc.state.remote_committed() {
                    resolve(&mut remote_commit_cstate, htlc.owner, htlc.msatoshis, dust, htlc.r);
                }
            }
            if !htlc.state.is_resolved() {
                local_staging_cstate.add_htlc(htlc.owner, htlc.msatoshis, dust);
                remote_staging_cstate.add_htlc(htlc.owner, htlc.msatoshis, dust);
                registry.restore_htlc(htlc);
            }
        }

        let local_latest = self.load_latest_commit_info(peer_pubkey, Side::Ours)?;
        let remote_latest = self.load_latest_commit_info(peer_pubkey, Side::Theirs)?;

        let local_commit = local_latest.as_ref().map(|(commit_num, revocation_hash, order, sig, _)| {
            CommitInfo {
                commit_num: *commit_num,
                revocation_hash: *revocation_hash,
                order: *order,
                sig: sig.clone(),
                cstate: local_commit_cstate,
            }
        });
        let remote_commit = remote_latest.as_ref().map(|(commit_num, revocation_hash, order, sig, _)| {
            CommitInfo {
                commit_num: *commit_num,
                revocation_hash: *revocation_hash,
                order: *order,
                sig: sig.clone(),
                cstate: remote_commit_cstate,
            }
        });
        let their_prev_revocation_hash = remote_latest.and_then(|(_, _, _, _, prev)| prev);

        let next_local_commit_num = local_commit.as_ref().map(|c| c.commit_num + 1).unwrap_or(0);
        let local_next_revocation_hash = {
            use bitcoin_hashes::{sha256, Hash};
            let preimage = crate::channel::derive_revocation_preimage(&revocation_seed, next_local_commit_num);
            sha256::Hash::hash(&preimage).into_inner()
        };

        let local = PeerSide {
            commit_key,
            final_key,
            delay_blocks: config.locktime_max,
            min_depth: config.anchor_confirms_max,
            fee_rate: our_feerate,
            next_revocation_hash: local_next_revocation_hash,
            commit: local_commit,
            staging_cstate: local_staging_cstate,
        };
        let remote = PeerSide {
            commit_key: their_visible.commit_key,
            final_key: their_visible.final_key,
            delay_blocks: their_visible.locktime,
            min_depth: their_visible.min_depth,
            fee_rate: their_visible.commit_fee_rate,
            next_revocation_hash: their_visible.next_revocation_hash,
            commit: remote_commit,
            staging_cstate: remote_staging_cstate,
        };

        let channel = Channel {
            anchor: Some(anchor),
            local,
            remote,
            htlcs: registry,
            their_prev_revocation_hash,
            closing,
        };

        Ok(Some(ReconstructedPeer { address, revocation_seed, shachain, channel }))
    }
}

/// Applies the removal side of an HTLC resolution to a cstate being
/// replayed, inferring fulfilled-vs-failed from whether a preimage was
/// recorded (only the fulfill path ever writes one).
fn resolve(cstate: &mut ChannelState, owner: Side, msatoshis: u64, dust: bool, r: Option<[u8; 32]>) {
    if r.is_some() {
        cstate.fulfill_htlc(owner, msatoshis, dust);
    } else {
        cstate.fail_htlc(owner, msatoshis, dust);
    }
}

fn to_array(bytes: &[u8]) -> [u8; 32] {
    let mut arr = [0u8; 32];
    arr.copy_from_slice(bytes);
    arr
}

/// The remote peer's negotiated commitment parameters, as declared in their
/// `OPEN` packet.
pub struct TheirVisibleState {
    pub commit_key: Vec<u8>,
    pub final_key: Vec<u8>,
    pub locktime: u32,
    pub min_depth: u32,
    pub commit_fee_rate: u32,
    pub next_revocation_hash: [u8; 32],
}

/// Everything [`Store::reconstruct_channel`] rebuilds for one peer:
/// transport address and the secrets `Channel` itself does not carry.
pub struct ReconstructedPeer {
    pub address: Option<Vec<u8>>,
    pub revocation_seed: [u8; 32],
    pub shachain: Shachain,
    pub channel: Channel,
}

fn hex_of(bytes: &[u8]) -> String {
    use amplify::hex::ToHex;
    bytes.to_hex()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::htlc::Registry;

    fn sample_htlc() -> Htlc {
        let mut reg = Registry::new();
        reg.new_htlc(Side::Ours, 1000, [1u8; 32], 100, vec![1, 2, 3], None).clone()
    }

    #[test]
    fn reconstruct_channel_replays_committed_htlc_into_both_chains() {
        use crate::config::Config;

        let mut store = Store::open_in_memory().unwrap();
        let peer = b"peer-pubkey";
        let config = Config::default();

        store.begin_transaction().unwrap();
        store.insert_peer(peer, "NORMAL", true, 50_000).unwrap();
        store.insert_peer_secrets(peer, b"our-commit-key", b"our-final-key", &[1u8; 32]).unwrap();
        store
            .insert_anchor(
                peer,
                &Anchor {
                    amount_satoshis: 1_000_000,
                    funder: Funder::Ours,
                    txid: [2u8; 32],
                    output_index: 0,
                    min_depth: 1,
                    confirmed_depth: 1,
                },
            )
            .unwrap();
        store
            .insert_their_visible_state(
                peer,
                false,
                &TheirVisibleState {
                    commit_key: b"their-commit-key".to_vec(),
                    final_key: b"their-final-key".to_vec(),
                    locktime: 144,
                    min_depth: 1,
                    commit_fee_rate: 50_000,
                    next_revocation_hash: [3u8; 32],
                },
            )
            .unwrap();

        let mut htlc = sample_htlc();
        htlc.state = HtlcState::SentAddAckRevocation;
        store.insert_htlc(peer, &htlc).unwrap();

        let placeholder_commit = CommitInfo {
            commit_num: 0,
            revocation_hash: [4u8; 32],
            order: 1,
            sig: Some(vec![0xAA]),
            cstate: ChannelState::initial(1_000_000, 50_000, Side::Ours).unwrap(),
        };
        store.insert_commit_info(peer, Side::Ours, &placeholder_commit, None).unwrap();
        store.insert_commit_info(peer, Side::Theirs, &placeholder_commit, None).unwrap();
        store.commit_transaction().unwrap();

        let reconstructed = store.reconstruct_channel(peer, &config).unwrap().unwrap();
        let channel = reconstructed.channel;

        let mut expected = ChannelState::initial(1_000_000, 50_000, Side::Ours).unwrap();
        expected.add_htlc(Side::Ours, 1000, true);

        assert_eq!(channel.local.commit.as_ref().unwrap().cstate, expected);
        assert_eq!(channel.remote.commit.as_ref().unwrap().cstate, expected);
        assert_eq!(channel.local.staging_cstate, expected);
        assert_eq!(channel.remote.staging_cstate, expected);
        assert_eq!(channel.htlcs.next_local_id(), 1);
        assert!(channel.htlcs.get(Side::Ours, 0).is_some());
    }

    #[test]
    fn schema_applies_on_fresh_store() {
        let store = Store::open_in_memory().unwrap();
        let count: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM htlcs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn transaction_guard_rejects_nested_begin() {
        let mut store = Store::open_in_memory().unwrap();
        store.begin_transaction().unwrap();
        assert!(matches!(store.begin_transaction().unwrap_err(), StoreError::TransactionAlreadyOpen));
        store.commit_transaction().unwrap();
    }

    #[test]
    fn write_outside_transaction_rejected() {
        let store = Store::open_in_memory().unwrap();
        let err = store.insert_peer(b"peer", "OPEN", true, 50_000).unwrap_err();
        assert!(matches!(err, StoreError::NoTransaction));
    }

    #[test]
    fn htlc_round_trips_through_insert_and_load() {
        let mut store = Store::open_in_memory().unwrap();
        let peer = b"peer-pubkey";
        store.begin_transaction().unwrap();
        store.insert_peer(peer, "NORMAL", true, 50_000).unwrap();
        store.insert_htlc(peer, &sample_htlc()).unwrap();
        store.commit_transaction().unwrap();

        let loaded = store.load_htlcs_ascending(peer).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].msatoshis, 1000);
        assert_eq!(loaded[0].state, HtlcState::SentAddHtlc);
    }

    #[test]
    fn update_with_guard_fails_loudly_on_stale_state() {
        let mut store = Store::open_in_memory().unwrap();
        let peer = b"peer-pubkey";
        store.begin_transaction().unwrap();
        store.insert_peer(peer, "NORMAL", true, 50_000).unwrap();
        store.insert_htlc(peer, &sample_htlc()).unwrap();
        store.commit_transaction().unwrap();

        store.begin_transaction().unwrap();
        let err = store
            .update_htlc_state(peer, Side::Ours, 0, HtlcState::RcvdAddHtlc, HtlcState::SentAddCommit)
            .unwrap_err();
        assert!(matches!(err, StoreError::GuardViolation { .. }));
        store.abort_transaction().unwrap();
    }

    #[test]
    fn shachain_round_trips_through_store() {
        use bitcoin_hashes::{sha256, Hash};
        let mut store = Store::open_in_memory().unwrap();
        let peer = b"peer-pubkey";
        let mut chain = Shachain::new();
        let top = 0xFFFF_FFFF_FFFF_FFFFu64;
        chain.add_hash(top, sha256::Hash::hash(b"seed").into_inner()).unwrap();

        store.begin_transaction().unwrap();
        store.insert_peer(peer, "NORMAL", true, 50_000).unwrap();
        store.save_shachain(peer, &chain).unwrap();
        store.commit_transaction().unwrap();

        let loaded = store.load_shachain(peer).unwrap().unwrap();
        assert_eq!(loaded.get(top).unwrap(), chain.get(top).unwrap());
    }
}
