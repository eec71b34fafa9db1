//! Wire protocol for the MixOS testing backdoor.
//!
//! Every message, in both directions, is a compact UTF-8 JSON document
//! followed by a single NUL (`0x00`) byte. The protocol carries exactly one
//! operation, running a command, and has gone through two envelope
//! revisions which are selected with [`Dialect`].

mod codec;
mod message;

pub use codec::{FrameReader, MAX_FRAME, SENTINEL, encode, send};
pub use message::{
    Completion, Dialect, FlatEnvelope, FlatResult, Outcome, Request, RunCommand,
    RunCommandOutput, TaggedEnvelope, TerminationCause, WireBytes,
};
