//! Zero-copy image frames: fixed geometry over an out-of-band pixel buffer.
//!
//! The payload slot holds only a small [`FrameHeader`]; the pixel bytes live
//! in a separate arena allocation referenced by [`Handle`]. The buffer is
//! allocated once at bind and reused for every sample, so steady-state
//! publication moves no memory besides the pixels themselves, and sources
//! reconstruct a view from `(handle -> address, geometry)` without copying.
//!
//! Geometry is immutable after bind. The sink writes pixels only inside the
//! exclusive window; sources either consume in place during their sharable
//! window or copy out (the default everywhere downstream).

use std::ptr::NonNull;

use weir_shm::Handle;

use crate::error::NodeError;
use crate::node::{InterruptFlag, NodeState, WaitResult};
use crate::payload::ShmSafe;
use crate::sink::{Sink, default_capacity};
use crate::source::Source;

/// Pixel layout of a frame. The set the pipeline's camera and filter
/// components produce.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8-bit single channel.
    Mono8 = 0,
    /// 8-bit blue/green/red.
    Bgr8 = 1,
    /// 8-bit blue/green/red/alpha.
    Bgra8 = 2,
    /// 16-bit single channel, native endianness.
    Mono16 = 3,
}

impl PixelFormat {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(PixelFormat::Mono8),
            1 => Some(PixelFormat::Bgr8),
            2 => Some(PixelFormat::Bgra8),
            3 => Some(PixelFormat::Mono16),
            _ => None,
        }
    }

    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Mono8 => 1,
            PixelFormat::Bgr8 => 3,
            PixelFormat::Bgra8 => 4,
            PixelFormat::Mono16 => 2,
        }
    }
}

/// Frame geometry: fixed at bind, carried to every source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSpec {
    pub rows: u32,
    pub cols: u32,
    pub format: PixelFormat,
    /// Bytes per row, at least `cols * bytes_per_pixel`.
    pub step: usize,
}

impl FrameSpec {
    /// A spec with no row padding.
    pub fn packed(rows: u32, cols: u32, format: PixelFormat) -> Self {
        Self {
            rows,
            cols,
            format,
            step: cols as usize * format.bytes_per_pixel(),
        }
    }

    /// Total pixel buffer length in bytes.
    pub fn data_len(&self) -> usize {
        self.rows as usize * self.step
    }

    fn validate(&self) -> Result<(), NodeError> {
        if self.rows == 0 || self.cols == 0 {
            return Err(NodeError::InvalidFrameSpec("zero rows or cols"));
        }
        if self.step < self.cols as usize * self.format.bytes_per_pixel() {
            return Err(NodeError::InvalidFrameSpec("step shorter than a row"));
        }
        Ok(())
    }
}

/// The payload slot contents for frame streams (32 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    rows: u32,
    cols: u32,
    format: u32,
    _pad: u32,
    step: u64,
    /// Arena handle of the pixel buffer.
    data: Handle,
}

const _: () = assert!(core::mem::size_of::<FrameHeader>() == 32);

// SAFETY: repr(C), fixed size, no process-local state; the handle is a
// portable offset by construction.
unsafe impl ShmSafe for FrameHeader {}

impl FrameHeader {
    fn spec(&self) -> Result<FrameSpec, NodeError> {
        let format = PixelFormat::from_u32(self.format)
            .ok_or(NodeError::InvalidFrameSpec("unknown pixel format"))?;
        Ok(FrameSpec {
            rows: self.rows,
            cols: self.cols,
            format,
            step: self.step as usize,
        })
    }
}

/// An owned, copied-out frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub spec: FrameSpec,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn zeroed(spec: FrameSpec) -> Self {
        Self {
            spec,
            data: vec![0; spec.data_len()],
        }
    }

    /// One row of pixels.
    pub fn row(&self, r: u32) -> &[u8] {
        let start = r as usize * self.spec.step;
        &self.data[start..start + self.spec.step]
    }
}

/// Sole writer of a frame stream.
pub struct FrameSink {
    inner: Sink<FrameHeader>,
    pixels: NonNull<u8>,
    spec: FrameSpec,
}

// SAFETY: `pixels` points into the arena owned by `inner`; access is
// confined to the exclusive windows of `inner.push`.
unsafe impl Send for FrameSink {}

impl FrameSink {
    /// Bind `name` and allocate the pixel buffer for `spec`, sizing the
    /// arena to fit header, buffer and node with slack.
    pub fn bind(name: &str, spec: FrameSpec) -> Result<Self, NodeError> {
        spec.validate()?;
        let data_len = spec.data_len();
        let capacity = default_capacity(core::mem::size_of::<FrameHeader>(), data_len);

        let mut data = Handle::NULL;
        let inner = Sink::bind_with(name, capacity, |arena| {
            data = arena.allocate(data_len, 64)?;
            Ok(FrameHeader {
                rows: spec.rows,
                cols: spec.cols,
                format: spec.format as u32,
                _pad: 0,
                step: spec.step as u64,
                data,
            })
        })?;

        let pixels = inner.arena().to_address(data)?;
        let pixels = NonNull::new(pixels).expect("arena returned a null address");
        Ok(Self {
            inner,
            pixels,
            spec,
        })
    }

    /// Publish one frame; `fill` writes the pixel buffer in place while the
    /// exclusive lock is held.
    pub fn push_frame(&mut self, fill: impl FnOnce(&mut [u8])) -> Result<(), NodeError> {
        let pixels = self.pixels.as_ptr();
        let len = self.spec.data_len();
        self.inner.push(|_header| {
            // SAFETY: exclusive lock held by push; the buffer was allocated
            // with `len` bytes at bind and the sink is its only writer.
            fill(unsafe { std::slice::from_raw_parts_mut(pixels, len) })
        })
    }

    /// Publish one frame by copying `data` (must be exactly
    /// `spec.data_len()` bytes) into the shared buffer.
    pub fn push_bytes(&mut self, data: &[u8]) -> Result<(), NodeError> {
        if data.len() != self.spec.data_len() {
            return Err(NodeError::InvalidFrameSpec(
                "pixel buffer length does not match geometry",
            ));
        }
        self.push_frame(|buf| buf.copy_from_slice(data))
    }

    pub fn close(&mut self) {
        self.inner.close();
    }

    pub fn set_interrupt(&mut self, flag: InterruptFlag) {
        self.inner.set_interrupt(flag);
    }

    pub fn spec(&self) -> FrameSpec {
        self.spec
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn state(&self) -> NodeState {
        self.inner.state()
    }

    pub fn source_count(&self) -> u16 {
        self.inner.source_count()
    }

    pub fn write_number(&self) -> u64 {
        self.inner.write_number()
    }
}

/// Reader of a frame stream.
pub struct FrameSource {
    inner: Source<FrameHeader>,
    pixels: NonNull<u8>,
    spec: FrameSpec,
}

// SAFETY: `pixels` points into the arena owned by `inner`; access is
// confined to the sharable windows of `inner.observe`.
unsafe impl Send for FrameSource {}

impl FrameSource {
    /// Create-and-wait attach; see [`Source::connect`].
    pub fn connect(name: &str) -> Result<Self, NodeError> {
        Self::from_source(Source::connect(name)?)
    }

    /// See [`Source::connect_interruptible`].
    pub fn connect_interruptible(name: &str, flag: InterruptFlag) -> Result<Self, NodeError> {
        Self::from_source(Source::connect_interruptible(name, flag)?)
    }

    /// See [`Source::try_connect`].
    pub fn try_connect(name: &str) -> Result<Self, NodeError> {
        Self::from_source(Source::try_connect(name)?)
    }

    fn from_source(inner: Source<FrameHeader>) -> Result<Self, NodeError> {
        // Geometry and buffer handle are written before the node leaves
        // UNDEFINED and never change, so a lock-free snapshot is sound.
        let header = inner.slot_snapshot();
        let spec = header.spec()?;
        let pixels = inner.arena().to_address(header.data)?;
        let pixels = NonNull::new(pixels).expect("arena returned a null address");
        Ok(Self {
            inner,
            pixels,
            spec,
        })
    }

    pub fn wait(&mut self) -> Result<WaitResult, NodeError> {
        self.inner.wait()
    }

    /// Copy the current sample's pixels into `buf` (must be exactly
    /// `spec.data_len()` bytes). Valid only between `wait` and `post`.
    pub fn copy_into(&self, buf: &mut [u8]) -> Result<(), NodeError> {
        if buf.len() != self.spec.data_len() {
            return Err(NodeError::InvalidFrameSpec(
                "destination length does not match geometry",
            ));
        }
        let pixels = self.pixels.as_ptr();
        let out = buf.as_mut_ptr();
        let len = buf.len();
        self.inner.observe(|_header| {
            // SAFETY: sharable lock held, so the sink is not writing; both
            // regions are `len` bytes and cannot overlap (one is arena
            // memory, the other a caller buffer).
            unsafe { std::ptr::copy_nonoverlapping(pixels, out, len) }
        })
    }

    /// Copy the current sample out as an owned [`Frame`].
    pub fn copy_frame(&self) -> Result<Frame, NodeError> {
        let mut frame = Frame::zeroed(self.spec);
        self.copy_into(&mut frame.data)?;
        Ok(frame)
    }

    pub fn post(&mut self) -> Result<(), NodeError> {
        self.inner.post()
    }

    /// One full consumption cycle. `None` means end-of-stream.
    pub fn recv_frame(&mut self) -> Result<Option<Frame>, NodeError> {
        match self.wait()? {
            WaitResult::EndOfStream => Ok(None),
            WaitResult::Ready => {
                let frame = self.copy_frame()?;
                self.post()?;
                Ok(Some(frame))
            }
        }
    }

    pub fn disconnect(&mut self) {
        self.inner.disconnect();
    }

    pub fn set_interrupt(&mut self, flag: InterruptFlag) {
        self.inner.set_interrupt(flag);
    }

    pub fn spec(&self) -> FrameSpec {
        self.spec
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn state(&self) -> NodeState {
        self.inner.state()
    }

    pub fn write_number(&self) -> u64 {
        self.inner.write_number()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_size() {
        assert_eq!(core::mem::size_of::<FrameHeader>(), 32);
    }

    #[test]
    fn packed_spec_math() {
        let spec = FrameSpec::packed(480, 640, PixelFormat::Bgr8);
        assert_eq!(spec.step, 1920);
        assert_eq!(spec.data_len(), 480 * 640 * 3);
    }

    #[test]
    fn spec_validation() {
        assert!(FrameSpec::packed(0, 640, PixelFormat::Mono8).validate().is_err());
        let mut short = FrameSpec::packed(4, 4, PixelFormat::Bgra8);
        short.step = 8;
        assert!(short.validate().is_err());
        assert!(FrameSpec::packed(4, 4, PixelFormat::Mono16).validate().is_ok());
    }

    #[test]
    fn pixel_format_roundtrip() {
        for f in [
            PixelFormat::Mono8,
            PixelFormat::Bgr8,
            PixelFormat::Bgra8,
            PixelFormat::Mono16,
        ] {
            assert_eq!(PixelFormat::from_u32(f as u32), Some(f));
        }
        assert_eq!(PixelFormat::from_u32(99), None);
    }
}
