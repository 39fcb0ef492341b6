//! Core vocabulary for the tenderbft state machine.
//!
//! This crate defines what flows in and out of consensus:
//!
//! - [`Event`]: all possible inputs (messages, miner payloads, timeouts)
//! - [`Action`]: all possible outputs (timeouts to arm, messages to send,
//!   blocks to commit, notifications to publish)
//! - [`Step`]: the ordered round steps used in transition guards
//! - Collaborator traits: [`Backend`], [`CrossChainHelper`],
//!   [`PrivValidator`]
//!
//! # Architecture
//!
//! The state machine is event-driven and performs no I/O:
//!
//! ```text
//! Events → ConsensusState::handle() → Actions
//! ```
//!
//! The driver serializes events from the peer queue, the internal queue,
//! and the timeout ticker, and executes the returned actions. Same state
//! plus same event sequence always yields the same actions, which is what
//! makes the scenario tests deterministic.

mod action;
mod event;
mod message;
mod signer;
mod step;
mod traits;

pub use action::Action;
pub use event::{ConsensusEvent, Event, PeerId, TimeoutInfo};
pub use message::Message;
pub use signer::LocalSigner;
pub use step::{compare_hrs, Step};
pub use traits::{
    Backend, BackendError, Broadcaster, ChainReader, CrossChainError, CrossChainHelper,
    PrivValidator, SignerError,
};
