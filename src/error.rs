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

//! Crate-wide error taxonomy.
//!
//! Five kinds of failure are possible in this daemon core, matching the
//! error handling design: a bad packet from the peer
//! ([`Error::ProtocolViolation`]) terminates the channel; an arithmetic
//! rejection ([`Error::CapacityRejection`]) only fails the one command; a
//! failed database write ([`Error::StorageFailure`]) is fatal for the peer;
//! an exhausted address list ([`Error::BootstrapFailure`]) is reported to
//! the caller once; and a violated invariant ([`Error::Internal`]) is a
//! programming error that is never surfaced to a peer.

use crate::htlc;
use crate::packets::ErrorPacket;
use crate::persist;

#[derive(Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum Error {
    /// protocol violation, channel must be terminated: {0}
    #[from]
    ProtocolViolation(ErrorPacket),

    /// local or remote side cannot afford this operation: {0}
    CapacityRejection(String),

    /// persistence failure: {0}
    #[from]
    StorageFailure(persist::StoreError),

    /// no reachable address for peer
    BootstrapFailure,

    /// internal invariant violated: {0}
    #[from]
    Internal(htlc::TransitionError),
}
