//! Client-side streaming pipeline for a remote VR rendering session.
//!
//! The server renders, encodes and packetizes stereo video; this crate is
//! the receiving half embedded in the XR client. It reassembles
//! forward-error-corrected packets into frames, feeds them through a decoder
//! backend, matches decoded surfaces back to the tracking sample that
//! produced them and keeps the latency statistics the server needs to pace
//! itself.
//!
//! The host owns transport, compositor and decoder hardware; everything it
//! must provide enters through [`ClientCallbacks`] and
//! [`session::stream::video::decoder::backend::DecoderFactory`]. The entry
//! points mirror the host's threads: `on_receive` from the transport,
//! `begin_video_view`/`end_video_view` and the render hooks from the XR
//! loop.

pub mod config;
pub mod packet;
pub mod session;
pub mod stats;
pub mod time;

pub use config::{ClientConfig, Codec, DecoderConfig, StreamConfig};
pub use session::stream::video::decoder::backend::{
	DecoderBackend, DecoderFactory, DummyDecoderFactory, OutputSink, VideoSurface,
};
pub use session::stream::{DecodedFrame, PresentPolicy, SurfaceExchange};
pub use session::{ClientCallbacks, StreamClient};
pub use stats::LatencyCollector;
