//! Wire formats exchanged with the streaming server.
//!
//! All packets are little-endian and start with a 32-bit type tag. Parsing is
//! length-checked; a malformed packet is logged and rejected without touching
//! the rest of the pipeline.

/// Tag in the first four bytes of every packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum PacketType {
	VideoFrame = 1,
	TimeSync = 2,
	Haptics = 3,
	Tracking = 4,
	VideoErrorReport = 5,
}

impl TryFrom<u32> for PacketType {
	type Error = ();

	fn try_from(v: u32) -> Result<Self, Self::Error> {
		match v {
			x if x == Self::VideoFrame as u32 => Ok(Self::VideoFrame),
			x if x == Self::TimeSync as u32 => Ok(Self::TimeSync),
			x if x == Self::Haptics as u32 => Ok(Self::Haptics),
			x if x == Self::Tracking as u32 => Ok(Self::Tracking),
			x if x == Self::VideoErrorReport as u32 => Ok(Self::VideoErrorReport),
			_ => Err(()),
		}
	}
}

/// Read the type tag of a packet, if it has one.
pub fn packet_type(buffer: &[u8]) -> Result<PacketType, ()> {
	if buffer.len() < 4 {
		tracing::warn!("Expected packet of at least 4 bytes, got {}.", buffer.len());
		return Err(());
	}

	u32::from_le_bytes(buffer[..4].try_into().unwrap()).try_into()
}

fn read_u16(buffer: &[u8], offset: &mut usize) -> u16 {
	let value = u16::from_le_bytes(buffer[*offset..*offset + 2].try_into().unwrap());
	*offset += 2;
	value
}

fn read_u32(buffer: &[u8], offset: &mut usize) -> u32 {
	let value = u32::from_le_bytes(buffer[*offset..*offset + 4].try_into().unwrap());
	*offset += 4;
	value
}

fn read_u64(buffer: &[u8], offset: &mut usize) -> u64 {
	let value = u64::from_le_bytes(buffer[*offset..*offset + 8].try_into().unwrap());
	*offset += 8;
	value
}

fn read_f32(buffer: &[u8], offset: &mut usize) -> f32 {
	let value = f32::from_le_bytes(buffer[*offset..*offset + 4].try_into().unwrap());
	*offset += 4;
	value
}

/// Fixed-size prefix of every video packet, followed by shard bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VideoFrameHeader {
	/// Monotonic sequence number over all video packets, used for loss accounting.
	pub packet_counter: u32,

	/// Index of the tracking sample this frame was rendered for.
	pub tracking_frame_index: u64,

	/// Server-assigned encoded frame index, used as the FEC fingerprint.
	pub video_frame_index: u64,

	/// Server clock at the time the packet was sent, in microseconds.
	pub sent_time_us: u64,

	/// Size of the whole encoded frame in bytes.
	pub frame_byte_size: u32,

	/// Index of this shard within the frame (data shards first, then parity).
	pub fec_index: u32,

	/// Percentage of parity data the frame was encoded with.
	pub fec_percentage: u16,
}

impl VideoFrameHeader {
	pub const SIZE: usize = 42;

	pub fn from_bytes(buffer: &[u8]) -> Result<Self, ()> {
		if buffer.len() < Self::SIZE {
			tracing::warn!("Expected video packet of at least {} bytes, got {}.", Self::SIZE, buffer.len());
			return Err(());
		}

		let mut offset = 0;
		let packet_type = read_u32(buffer, &mut offset);
		if packet_type != PacketType::VideoFrame as u32 {
			tracing::warn!("Expected video packet type, got type {packet_type}.");
			return Err(());
		}

		Ok(Self {
			packet_counter: read_u32(buffer, &mut offset),
			tracking_frame_index: read_u64(buffer, &mut offset),
			video_frame_index: read_u64(buffer, &mut offset),
			sent_time_us: read_u64(buffer, &mut offset),
			frame_byte_size: read_u32(buffer, &mut offset),
			fec_index: read_u32(buffer, &mut offset),
			fec_percentage: read_u16(buffer, &mut offset),
		})
	}

	pub fn serialize(&self, buffer: &mut Vec<u8>) {
		buffer.extend((PacketType::VideoFrame as u32).to_le_bytes());
		buffer.extend(self.packet_counter.to_le_bytes());
		buffer.extend(self.tracking_frame_index.to_le_bytes());
		buffer.extend(self.video_frame_index.to_le_bytes());
		buffer.extend(self.sent_time_us.to_le_bytes());
		buffer.extend(self.frame_byte_size.to_le_bytes());
		buffer.extend(self.fec_index.to_le_bytes());
		buffer.extend(self.fec_percentage.to_le_bytes());
	}
}

/// Bidirectional time synchronization and statistics packet.
///
/// Mode 1 is a server probe that must be echoed back as mode 2, mode 3 is the
/// server's acknowledgement of a tracking packet and mode 0 is the client's
/// statistics report.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TimeSync {
	pub mode: u32,
	pub sequence: u64,

	/// Client clock at the time of sending, echoed back by the server in mode 1.
	pub client_time_us: u64,

	/// Server clock at the time of sending.
	pub server_time_us: u64,

	/// The server's own total-latency estimate, feeding the client EMA.
	pub server_total_latency_us: u32,

	/// Latest video packet counter observed by the sender.
	pub packet_counter: u32,

	pub packets_lost_total: u64,
	pub packets_lost_in_second: u64,

	pub average_total_latency_us: u32,
	pub average_send_latency_us: u32,
	pub average_transport_latency_us: u32,
	pub average_decode_latency_us: u64,
	pub idle_time_us: u32,

	pub fec_failure: bool,
	pub fec_failure_in_second: u64,
	pub fec_failure_total: u64,

	pub fps: f32,

	/// In mode 3, the tracking frame index the server acknowledges.
	pub tracking_recv_frame_index: u64,
}

impl TimeSync {
	pub const SIZE: usize = 112;

	pub fn from_bytes(buffer: &[u8]) -> Result<Self, ()> {
		if buffer.len() < Self::SIZE {
			tracing::warn!("Expected time sync packet of at least {} bytes, got {}.", Self::SIZE, buffer.len());
			return Err(());
		}

		let mut offset = 0;
		let packet_type = read_u32(buffer, &mut offset);
		if packet_type != PacketType::TimeSync as u32 {
			tracing::warn!("Expected time sync packet type, got type {packet_type}.");
			return Err(());
		}

		Ok(Self {
			mode: read_u32(buffer, &mut offset),
			sequence: read_u64(buffer, &mut offset),
			client_time_us: read_u64(buffer, &mut offset),
			server_time_us: read_u64(buffer, &mut offset),
			server_total_latency_us: read_u32(buffer, &mut offset),
			packet_counter: read_u32(buffer, &mut offset),
			packets_lost_total: read_u64(buffer, &mut offset),
			packets_lost_in_second: read_u64(buffer, &mut offset),
			average_total_latency_us: read_u32(buffer, &mut offset),
			average_send_latency_us: read_u32(buffer, &mut offset),
			average_transport_latency_us: read_u32(buffer, &mut offset),
			average_decode_latency_us: read_u64(buffer, &mut offset),
			idle_time_us: read_u32(buffer, &mut offset),
			fec_failure: read_u32(buffer, &mut offset) != 0,
			fec_failure_in_second: read_u64(buffer, &mut offset),
			fec_failure_total: read_u64(buffer, &mut offset),
			fps: read_f32(buffer, &mut offset),
			tracking_recv_frame_index: read_u64(buffer, &mut offset),
		})
	}

	pub fn serialize(&self, buffer: &mut Vec<u8>) {
		buffer.extend((PacketType::TimeSync as u32).to_le_bytes());
		buffer.extend(self.mode.to_le_bytes());
		buffer.extend(self.sequence.to_le_bytes());
		buffer.extend(self.client_time_us.to_le_bytes());
		buffer.extend(self.server_time_us.to_le_bytes());
		buffer.extend(self.server_total_latency_us.to_le_bytes());
		buffer.extend(self.packet_counter.to_le_bytes());
		buffer.extend(self.packets_lost_total.to_le_bytes());
		buffer.extend(self.packets_lost_in_second.to_le_bytes());
		buffer.extend(self.average_total_latency_us.to_le_bytes());
		buffer.extend(self.average_send_latency_us.to_le_bytes());
		buffer.extend(self.average_transport_latency_us.to_le_bytes());
		buffer.extend(self.average_decode_latency_us.to_le_bytes());
		buffer.extend(self.idle_time_us.to_le_bytes());
		buffer.extend(u32::from(self.fec_failure).to_le_bytes());
		buffer.extend(self.fec_failure_in_second.to_le_bytes());
		buffer.extend(self.fec_failure_total.to_le_bytes());
		buffer.extend(self.fps.to_le_bytes());
		buffer.extend(self.tracking_recv_frame_index.to_le_bytes());
	}
}

/// Haptics command for an output device, addressed by its path hash.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HapticsFeedback {
	pub path: u64,
	pub duration_s: f32,
	pub frequency: f32,
	pub amplitude: f32,
}

impl HapticsFeedback {
	pub const SIZE: usize = 24;

	pub fn from_bytes(buffer: &[u8]) -> Result<Self, ()> {
		if buffer.len() < Self::SIZE {
			tracing::warn!("Expected haptics packet of at least {} bytes, got {}.", Self::SIZE, buffer.len());
			return Err(());
		}

		let mut offset = 0;
		let packet_type = read_u32(buffer, &mut offset);
		if packet_type != PacketType::Haptics as u32 {
			tracing::warn!("Expected haptics packet type, got type {packet_type}.");
			return Err(());
		}

		Ok(Self {
			path: read_u64(buffer, &mut offset),
			duration_s: read_f32(buffer, &mut offset),
			frequency: read_f32(buffer, &mut offset),
			amplitude: read_f32(buffer, &mut offset),
		})
	}

	pub fn serialize(&self, buffer: &mut Vec<u8>) {
		buffer.extend((PacketType::Haptics as u32).to_le_bytes());
		buffer.extend(self.path.to_le_bytes());
		buffer.extend(self.duration_s.to_le_bytes());
		buffer.extend(self.frequency.to_le_bytes());
		buffer.extend(self.amplitude.to_le_bytes());
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn video_frame_header_roundtrip() {
		let header = VideoFrameHeader {
			packet_counter: 17,
			tracking_frame_index: 123456789,
			video_frame_index: 42,
			sent_time_us: 987654321,
			frame_byte_size: 4096,
			fec_index: 3,
			fec_percentage: 33,
		};

		let mut buffer = Vec::new();
		header.serialize(&mut buffer);
		buffer.extend_from_slice(&[0xAA; 16]);

		assert_eq!(buffer.len(), VideoFrameHeader::SIZE + 16);
		assert_eq!(packet_type(&buffer), Ok(PacketType::VideoFrame));
		assert_eq!(VideoFrameHeader::from_bytes(&buffer), Ok(header));
	}

	#[test]
	fn time_sync_roundtrip() {
		let time_sync = TimeSync {
			mode: 1,
			sequence: 9,
			client_time_us: 1000,
			server_time_us: 5000,
			server_total_latency_us: 30_000,
			packet_counter: 77,
			packets_lost_total: 5,
			packets_lost_in_second: 2,
			average_total_latency_us: 40_000,
			average_send_latency_us: 900,
			average_transport_latency_us: 1_350,
			average_decode_latency_us: 2_000,
			idle_time_us: 300,
			fec_failure: true,
			fec_failure_in_second: 1,
			fec_failure_total: 4,
			fps: 72.0,
			tracking_recv_frame_index: 55,
		};

		let mut buffer = Vec::new();
		time_sync.serialize(&mut buffer);

		assert_eq!(buffer.len(), TimeSync::SIZE);
		assert_eq!(TimeSync::from_bytes(&buffer), Ok(time_sync));
	}

	#[test]
	fn haptics_roundtrip() {
		let haptics = HapticsFeedback {
			path: 0xDEADBEEF,
			duration_s: 0.25,
			frequency: 160.0,
			amplitude: 0.8,
		};

		let mut buffer = Vec::new();
		haptics.serialize(&mut buffer);

		assert_eq!(buffer.len(), HapticsFeedback::SIZE);
		assert_eq!(HapticsFeedback::from_bytes(&buffer), Ok(haptics));
	}

	#[test]
	fn truncated_packets_are_rejected() {
		assert!(packet_type(&[1, 0]).is_err());
		assert!(VideoFrameHeader::from_bytes(&[0; 10]).is_err());
		assert!(TimeSync::from_bytes(&[0; TimeSync::SIZE - 1]).is_err());
		assert!(HapticsFeedback::from_bytes(&[0; 4]).is_err());
	}

	#[test]
	fn wrong_tag_is_rejected() {
		let mut buffer = Vec::new();
		TimeSync::default().serialize(&mut buffer);
		assert!(VideoFrameHeader::from_bytes(&buffer).is_err());
	}
}
