//! # RF Instrument Bus Processor
//!
//! An embedded-style command/response protocol core for a four-channel
//! programmable RF instrument: opcode framing, busy-state dispatch, bus
//! arbitration, pattern sequencing, and fixed-size status responses.
//!
//! ## Features
//!
//! - **Opcode framing**: length-prefixed frames carried in 512-byte
//!   transport sectors, with padding resynchronization
//! - **Busy-state dispatch**: per-subsystem busy flags gate reentrant
//!   commands; status queries are always served
//! - **Bus arbitration**: fixed-priority, non-preemptive grants over the
//!   one shared serial device bus
//! - **Pattern sequencing**: a 4096-word timed opcode pattern engine with
//!   branching, single-step, and immediate abort
//! - **Status aggregation**: fixed-size responses carrying the state
//!   register and the alarm enable/read/latch vector
//! - **Embedded-friendly**: bounded queues, no allocation on the hot path
//!
//! ## Quick Start
//!
//! ```rust
//! use rfbus::processor::{OpcodeProcessor, ProcessorConfig};
//! use rfbus::framing::encode_frame;
//! use rfbus::opcodes::Opcode;
//!
//! let mut processor = OpcodeProcessor::new(ProcessorConfig::default());
//!
//! // Power-up self-check runs for a few ticks
//! for _ in 0..8 {
//!     processor.tick();
//! }
//!
//! processor.feed(&encode_frame(Opcode::Status, &[]));
//! let response = processor.take_response().expect("status is always served");
//! assert_eq!(response.len(), processor.response_version().size());
//! ```
//!
//! ## Architecture
//!
//! - [`processor`] - Command dispatcher and top-level tick loop
//! - [`framing`] - Sector stream decoding into opcode frames
//! - [`opcodes`] - The opcode set and payload length contracts
//! - [`arbiter`] - Fixed-priority serial bus arbitration
//! - [`pattern`] - The timed pattern sequencer
//! - [`subsystems`] - Per-subsystem command validation and bus handlers
//! - [`status`] - Error taxonomy, alarms, and response serialization

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::missing_errors_doc)]

pub mod arbiter;
pub mod framing;
pub mod opcodes;
pub mod pattern;
pub mod processor;
pub mod state;
pub mod status;
pub mod subsystems;

// Re-export main public types for convenience
pub use framing::{encode_frame, pad_to_sector, CommandFrame, FrameDecoder, FrameError};
pub use opcodes::Opcode;
pub use processor::{OpcodeProcessor, ProcessorConfig};
pub use state::StateFlags;
pub use status::{ErrorCode, ResponseVersion, StatusResponse};
