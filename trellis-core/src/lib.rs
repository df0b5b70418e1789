//! Trellis overlay protocol reference implementation.
//! Host-driven: no I/O; the daemon passes events and receives plans.

pub mod node;
pub mod protocol;
pub mod split;
pub mod wire;

pub use node::{ConnId, JobPlan, LeaveError, LeavePlan, NodeCore, StartArgs, WorkPlan};
pub use protocol::{AddressFrame, Frame, WorkFrame, CHUNK_SIZE, MAX_STRING_LEN};
pub use split::Share;
pub use wire::{encode_address, encode_work, EncodeError, FrameReader, ReadStatus};
