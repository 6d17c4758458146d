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

#![deny(
    non_upper_case_globals,
    non_camel_case_types,
    non_snake_case,
    unused_mut,
    dead_code
)]

#[macro_use]
extern crate amplify_derive;

pub mod bootstrap;
pub mod channel;
pub mod config;
pub mod cstate;
pub mod error;
pub mod htlc;
pub mod packets;
pub mod persist;
pub mod shachain;

pub use channel::{Channel, CommitInfo, Side};
pub use config::Config;
pub use cstate::ChannelState;
pub use error::Error;
pub use htlc::{FailReason, Htlc, HtlcState};
pub use shachain::Shachain;
