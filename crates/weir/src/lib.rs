//! Zero-copy shared-memory dataflow for real-time vision pipelines.
//!
//! A weir pipeline is a set of independent processes wired together by
//! name: one process binds a [`Sink`] per output stream, any number of
//! downstream processes attach [`Source`]s to the same name, and typed
//! values move through a shared-memory arena with a strict
//! publish-and-wait-for-all-consumers handshake. Frames travel without
//! copies via an out-of-band pixel buffer ([`FrameSink`]/[`FrameSource`]);
//! detected positions travel as a fixed-layout [`Position`] record.
//!
//! ```no_run
//! use weir::{FrameSink, FrameSource, FrameSpec, PixelFormat};
//!
//! // camera process
//! let spec = FrameSpec::packed(480, 640, PixelFormat::Bgr8);
//! let mut sink = FrameSink::bind("cam", spec)?;
//! sink.push_frame(|pixels| pixels.fill(0))?;
//!
//! // viewer process
//! let mut source = FrameSource::connect("cam")?;
//! while let Some(_frame) = source.recv_frame()? {
//!     // render _frame.data
//! }
//! # Ok::<(), weir::NodeError>(())
//! ```
//!
//! The substrate itself lives in `weir-core` (endpoints and the
//! synchronization node) and `weir-shm` (arenas, handles and futex
//! primitives); this crate just re-exports the public surface.

pub use weir_core::{
    Frame, FrameHeader, FrameSink, FrameSource, FrameSpec, Heading2, InterruptFlag,
    MAX_ENDPOINT_NAME, NodeError, NodeState, PixelFormat, Point2, Position, REGION_LABEL_CAP,
    ShmSafe, Sink, Source, Velocity2, WaitResult, arena_name, node_object_name,
    payload_object_name,
};
pub use weir_shm::{Arena, ArenaError, Handle};

/// The commonly used subset, for glob import in component binaries.
pub mod prelude {
    pub use crate::{
        Frame, FrameSink, FrameSource, FrameSpec, NodeError, PixelFormat, Position, Sink, Source,
        WaitResult,
    };
}
