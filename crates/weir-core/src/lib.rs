//! Typed single-producer / multi-consumer dataflow over shared memory.
//!
//! One producing process binds a [`Sink<T>`] to a name; any number of
//! consuming processes attach a [`Source<T>`] to the same name. Each
//! published value is observed exactly once by every attached source before
//! the sink may publish the next one, so a pipeline of components stays
//! frame-accurate end to end. Coordination lives in a shared arena (see
//! `weir-shm`); payloads are fixed-layout [`ShmSafe`] values, with a
//! [`FrameSink`]/[`FrameSource`] specialization that keeps pixel buffers
//! out of band for zero-copy streaming.
//!
//! A stream ends when the sink closes (or drops): every source's next wait
//! reports [`WaitResult::EndOfStream`], which is an outcome, not an error.

#![forbid(unsafe_op_in_unsafe_fn)]

mod error;
mod frame;
mod node;
mod payload;
mod position;
mod sink;
mod source;

pub use error::NodeError;
pub use frame::{Frame, FrameHeader, FrameSink, FrameSource, FrameSpec, PixelFormat};
pub use node::{
    InterruptFlag, MAX_ENDPOINT_NAME, Node, NodeState, WaitResult, arena_name, node_object_name,
    payload_object_name,
};
pub use payload::ShmSafe;
pub use position::{Heading2, Point2, Position, REGION_LABEL_CAP, Velocity2};
pub use sink::Sink;
pub use source::Source;
