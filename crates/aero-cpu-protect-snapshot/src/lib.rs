//! Save/restore for [`aero_cpu_protect::ProtectCore`].
//!
//! A [`CpuRecord`] is a fixed-layout, little-endian image of the protection state: the
//! register file, segment caches, descriptor tables, current task, exception escalation
//! counters and the NMI latch. Decoding is strict; any header or field that could not
//! have been produced by [`CpuRecord::encode`] is rejected rather than repaired.

#![forbid(unsafe_code)]

mod decoder;
mod error;
mod io;
mod record;

pub use decoder::DecoderKind;
pub use error::{Result, SnapshotError};
pub use io::{ReadLeExt, WriteLeExt};
pub use record::{CpuRecord, RECORD_MAGIC, RECORD_VERSION};
