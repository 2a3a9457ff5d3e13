//! Seam between the pipeline and the concrete video decoder.
//!
//! The pipeline never sees decoder internals: it submits encoded buffers
//! tagged with a presentation timestamp and gets surfaces back through a
//! completion sink. Hardware decoders, software decoders and the dummy all
//! sit behind [`DecoderBackend`].

use std::any::Any;
use std::sync::Arc;

use bytes::Bytes;

use crate::config::DecoderConfig;

/// A decoded image owned by the backend.
///
/// The pipeline only moves references around; the backend reclaims the
/// underlying resources when the last reference drops.
pub trait VideoSurface: Send + Sync {
	fn width(&self) -> u32;
	fn height(&self) -> u32;

	/// Concrete surface access for the graphics upload path.
	fn as_any(&self) -> &dyn Any;
}

/// Completion callback handed to the backend at creation.
///
/// The backend invokes it from its own thread whenever a surface leaves the
/// decoder, passing the presentation timestamp assigned at submit time.
/// Implementations must be short, must not block and must not call back into
/// the decoder. Backends that cannot guarantee a suitable thread must bridge
/// through one of their own.
pub type OutputSink = Arc<dyn Fn(u64, Arc<dyn VideoSurface>) + Send + Sync>;

pub trait DecoderBackend: Send {
	/// Submit one encoded buffer.
	///
	/// Codec configuration buffers are submitted with `is_config` set and a
	/// zero timestamp; they produce no output surface. A failed submit drops
	/// only this frame, the backend must stay usable.
	#[allow(clippy::result_unit_err)]
	fn submit(&mut self, buffer: &Bytes, presentation_time_us: u64, is_config: bool) -> Result<(), ()>;
}

/// Creates a backend for a stream configuration. The host picks the factory
/// at client construction; each (re)configured stream gets a fresh backend.
pub trait DecoderFactory: Send + Sync {
	#[allow(clippy::result_unit_err)]
	fn create(&self, config: &DecoderConfig, output: OutputSink) -> Result<Box<dyn DecoderBackend>, ()>;
}

/// A decoder that does not decode: every submitted frame comes back
/// immediately as a surface wrapping the encoded bytes. Used by tests and
/// headless sessions.
pub struct DummyDecoder {
	output: OutputSink,
	config_buffers: u64,
}

impl DummyDecoder {
	pub fn new(output: OutputSink) -> Self {
		Self { output, config_buffers: 0 }
	}
}

impl DecoderBackend for DummyDecoder {
	fn submit(&mut self, buffer: &Bytes, presentation_time_us: u64, is_config: bool) -> Result<(), ()> {
		if is_config {
			self.config_buffers += 1;
			tracing::debug!(
				"Dummy decoder received codec configuration #{} ({} bytes).",
				self.config_buffers,
				buffer.len(),
			);
			return Ok(());
		}

		// Completion happens inline; the submitting thread doubles as the
		// backend's output thread.
		(self.output)(presentation_time_us, Arc::new(DummySurface { data: buffer.clone() }));
		Ok(())
	}
}

/// The "decoded" output of [`DummyDecoder`]: the encoded bytes, unchanged.
pub struct DummySurface {
	data: Bytes,
}

impl DummySurface {
	pub fn new(data: Bytes) -> Self {
		Self { data }
	}

	pub fn data(&self) -> &Bytes {
		&self.data
	}
}

impl VideoSurface for DummySurface {
	fn width(&self) -> u32 {
		0
	}

	fn height(&self) -> u32 {
		0
	}

	fn as_any(&self) -> &dyn Any {
		self
	}
}

pub struct DummyDecoderFactory;

impl DecoderFactory for DummyDecoderFactory {
	fn create(&self, config: &DecoderConfig, output: OutputSink) -> Result<Box<dyn DecoderBackend>, ()> {
		tracing::info!("Creating dummy decoder for {:?}.", config.codec);
		Ok(Box::new(DummyDecoder::new(output)))
	}
}
