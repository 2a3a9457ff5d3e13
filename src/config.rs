use std::path::Path;

use serde::{Deserialize, Serialize};

/// Video codec carried by the stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
	#[default]
	H264,
	Hevc,
}

/// Host-side configuration of the streaming client, loaded once at startup.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ClientConfig {
	/// Never block the render loop waiting for a fresh decoded frame.
	pub no_server_framerate_lock: bool,

	/// Present every decoded frame in order instead of skipping ahead to the
	/// newest one.
	pub no_frame_skip: bool,

	/// Default stream parameters, replaced by the server's negotiated
	/// configuration when the stream starts.
	pub stream: StreamConfig,
}

impl ClientConfig {
	#[allow(clippy::result_unit_err)]
	pub fn read_from_file<P: AsRef<Path>>(file: P) -> Result<ClientConfig, ()> {
		let config = std::fs::read_to_string(file)
			.map_err(|e| tracing::error!("Failed to open configuration file: {e}"))?;
		let config: ClientConfig = toml::from_str(&config)
			.map_err(|e| tracing::error!("Failed to parse configuration file: {e}"))?;

		Ok(config)
	}
}

/// Parameters of one streaming session, delivered by the server when the
/// stream is (re)configured.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StreamConfig {
	/// Configuration for the video stream.
	pub video: VideoConfig,

	/// Configuration for the video decoder.
	pub decoder: DecoderConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VideoConfig {
	/// Per-eye render target width in pixels.
	pub eye_width: u32,

	/// Per-eye render target height in pixels.
	pub eye_height: u32,

	/// Display refresh rate the server paces frames at.
	pub refresh_rate: u32,

	/// Foveated decode parameters, passed through to the renderer.
	pub foveated_decode: Option<FoveatedDecodeParams>,
}

impl Default for VideoConfig {
	fn default() -> Self {
		Self {
			eye_width: 1832,
			eye_height: 1920,
			refresh_rate: 72,
			foveated_decode: None,
		}
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DecoderConfig {
	/// Codec the decoder is configured for.
	pub codec: Codec,

	/// Whether video packets carry forward error correction. When disabled,
	/// each packet payload is a whole frame.
	pub enable_fec: bool,

	/// Ask the backend decoder for realtime thread priority.
	pub realtime_priority: bool,

	/// Thread count hint for software decoding, 0 for automatic.
	pub cpu_thread_count: u32,
}

impl Default for DecoderConfig {
	fn default() -> Self {
		Self {
			codec: Codec::H264,
			enable_fec: true,
			realtime_priority: true,
			cpu_thread_count: 0,
		}
	}
}

/// Shader parameters for foveated decoding. Opaque to the pipeline; the
/// renderer consumes them.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FoveatedDecodeParams {
	pub center_size_x: f32,
	pub center_size_y: f32,
	pub center_shift_x: f32,
	pub center_shift_y: f32,
	pub edge_ratio_x: f32,
	pub edge_ratio_y: f32,
}

#[cfg(test)]
mod tests {
	use std::io::Write;

	use super::*;

	#[test]
	fn default_config_roundtrips_through_toml() {
		let config = ClientConfig::default();
		let serialized = toml::to_string(&config).unwrap();

		let mut file = tempfile::NamedTempFile::new().unwrap();
		file.write_all(serialized.as_bytes()).unwrap();

		let read = ClientConfig::read_from_file(file.path()).unwrap();
		assert_eq!(read.no_frame_skip, config.no_frame_skip);
		assert_eq!(read.stream.video.refresh_rate, config.stream.video.refresh_rate);
		assert_eq!(read.stream.decoder.codec, config.stream.decoder.codec);
	}

	#[test]
	fn codec_names_are_lowercase() {
		let decoder = DecoderConfig { codec: Codec::Hevc, ..Default::default() };
		let serialized = toml::to_string(&decoder).unwrap();
		assert!(serialized.contains("codec = \"hevc\""));
	}

	#[test]
	fn missing_file_is_an_error() {
		assert!(ClientConfig::read_from_file("/nonexistent/farview.toml").is_err());
	}
}
