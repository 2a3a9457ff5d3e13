use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free association from a decoder presentation timestamp to the
/// tracking frame index that produced it.
///
/// The backend hands decoded surfaces back in whatever order it likes, tagged
/// only with the presentation timestamp the driver assigned at submit time.
/// Slots are a ring indexed by `timestamp % len`; the ring is sized well past
/// the decoder's reorder window, so a colliding overwrite can only hit an
/// entry that was abandoned long ago.
pub struct FrameIndexMap {
	slots: Box<[AtomicU64]>,
}

/// Marks an empty slot. Doubles as the "no frame" result of a lookup.
pub const NULL_INDEX: u64 = u64::MAX;

impl FrameIndexMap {
	pub fn new(size: usize) -> Self {
		assert!(size > 0);
		Self {
			slots: (0..size).map(|_| AtomicU64::new(NULL_INDEX)).collect(),
		}
	}

	fn index(&self, timestamp_us: u64) -> usize {
		(timestamp_us % self.slots.len() as u64) as usize
	}

	pub fn set(&self, timestamp_us: u64, frame_index: u64) {
		self.slots[self.index(timestamp_us)].store(frame_index, Ordering::Release);
	}

	pub fn get(&self, timestamp_us: u64) -> u64 {
		self.slots[self.index(timestamp_us)].load(Ordering::Acquire)
	}

	/// Take the entry out of its slot. A stale timestamp can never be
	/// returned twice because the slot is exchanged with [`NULL_INDEX`].
	pub fn get_clear(&self, timestamp_us: u64) -> u64 {
		self.slots[self.index(timestamp_us)].swap(NULL_INDEX, Ordering::AcqRel)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn set_then_get_clear_roundtrips() {
		let map = FrameIndexMap::new(4096);

		map.set(1234, 77);
		assert_eq!(map.get(1234), 77);
		assert_eq!(map.get_clear(1234), 77);
		assert_eq!(map.get_clear(1234), NULL_INDEX);
	}

	#[test]
	fn out_of_order_lookups_stay_correct() {
		let map = FrameIndexMap::new(4096);

		for timestamp in 0..100u64 {
			map.set(timestamp, timestamp + 1000);
		}
		// Completion happens in reverse order of submission.
		for timestamp in (0..100u64).rev() {
			assert_eq!(map.get_clear(timestamp), timestamp + 1000);
		}
	}

	#[test]
	fn colliding_timestamps_overwrite() {
		let map = FrameIndexMap::new(16);

		map.set(3, 1);
		map.set(3 + 16, 2);
		assert_eq!(map.get_clear(3), 2);
	}

	#[test]
	fn empty_slots_return_the_sentinel() {
		let map = FrameIndexMap::new(16);
		assert_eq!(map.get(5), NULL_INDEX);
		assert_eq!(map.get_clear(5), NULL_INDEX);
	}
}
