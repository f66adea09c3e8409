//! Flow Reporting
//!
//! Datagram accounting (loss, reordering, jitter) and the summary returned to
//! the sender when a flow ends.

pub mod flow;
pub mod types;

pub use flow::{prepare_final_reply, read_summary, FlowReport};
pub use types::{PacketSample, TransferStats};
