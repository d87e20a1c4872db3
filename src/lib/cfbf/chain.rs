/*
cfbf library & toolset
Copyright (C) 2018 Steve Muller <steve.muller@outlook.com>

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU General Public License for more details.

You should have received a copy of the GNU General Public License
along with this program.  If not, see <http://www.gnu.org/licenses/>.
*/

use log::trace;
use super::fat::AllocationTable;
use super::structures::{sector_type, stream_id};
use crate::error::{CfbError, CfbResult};

/// Brent's cycle detection: the tortoise jumps to the hare whenever the hare has travelled
/// `power` steps since the last jump, and `power` doubles each time.
struct CycleDetector {
	tortoise: u32,
	power: u64,
	lambda: u64,
}

impl CycleDetector {
	fn new(start: u32) -> CycleDetector {
		CycleDetector { tortoise: start, power: 1, lambda: 0 }
	}

	/// Returns true if `current` closes a cycle.
	fn update(&mut self, current: u32) -> bool {
		if self.tortoise == current {
			return true;
		}
		self.lambda += 1;
		if self.lambda == self.power {
			self.tortoise = current;
			self.power *= 2;
			self.lambda = 0;
		}
		false
	}
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Position {
	NotStarted,
	At { index: u32, id: u32 },
	/// Past the last entry; remembers the last (index, id) of a non-empty chain.
	Exhausted { tail: Option<(u32, u32)> },
}

/// Walks and resizes one chain of a FAT or mini-FAT.
///
/// The enumerator is forward-biased: moving backwards replays the chain from its start.
pub struct ChainEnumerator {
	start_id: u32,
	position: Position,
	detector: CycleDetector,
}

/// `END_OF_CHAIN` and `NO_STREAM` (which is also `FREE`) both denote a chain without sectors.
pub fn is_empty_chain(start_id: u32) -> bool {
	start_id == sector_type::END_OF_CHAIN || start_id == stream_id::NO_STREAM
}

impl ChainEnumerator {
	pub fn new(start_id: u32) -> ChainEnumerator {
		ChainEnumerator {
			start_id,
			position: Position::NotStarted,
			detector: CycleDetector::new(start_id),
		}
	}

	pub fn start_id(&self) -> u32 {
		self.start_id
	}

	pub fn reset(&mut self) {
		self.position = Position::NotStarted;
	}

	/// Restarts the enumerator on another chain.
	pub fn reset_to(&mut self, start_id: u32) {
		self.start_id = start_id;
		self.reset();
	}

	/// The sector id the enumerator is positioned on.
	pub fn current(&self) -> Option<u32> {
		match self.position {
			Position::At { id, .. } => Some(id),
			_ => None,
		}
	}

	pub fn move_next<T: AllocationTable>(&mut self, table: &mut T) -> CfbResult<bool> {
		match self.position {
			Position::NotStarted => {
				if is_empty_chain(self.start_id) {
					self.position = Position::Exhausted { tail: None };
					return Ok(false);
				}
				if self.start_id > sector_type::MAXIMUM {
					return Err(CfbError::corrupt(format!("chain starts at invalid sector {:#X}", self.start_id)));
				}
				self.detector = CycleDetector::new(self.start_id);
				self.position = Position::At { index: 0, id: self.start_id };
				Ok(true)
			},
			Position::At { index, id } => {
				let value = table.get(id)?;
				if value == sector_type::END_OF_CHAIN || value == sector_type::FREE {
					self.position = Position::Exhausted { tail: Some((index, id)) };
					return Ok(false);
				}
				if value > sector_type::MAXIMUM {
					return Err(CfbError::corrupt(format!("sector {:#X} links to reserved value {:#X}", id, value)));
				}
				let next_index = index + 1;
				if next_index >= table.max_chain_length() {
					return Err(CfbError::corrupt(format!("chain starting at {:#X} is longer than the file allows", self.start_id)));
				}
				if self.detector.update(value) {
					return Err(CfbError::corrupt(format!("chain starting at {:#X} is cyclic", self.start_id)));
				}
				self.position = Position::At { index: next_index, id: value };
				Ok(true)
			},
			Position::Exhausted { .. } => Ok(false),
		}
	}

	/// Positions the enumerator on the `index`-th sector of the chain. Returns false if the chain
	/// is shorter than that.
	pub fn move_to<T: AllocationTable>(&mut self, table: &mut T, index: u32) -> CfbResult<bool> {
		match self.position {
			Position::At { index: current, .. } if current > index => self.reset(),
			Position::Exhausted { tail: None } => return Ok(false),
			Position::Exhausted { tail: Some((last, _)) } => {
				if index > last {
					return Ok(false);
				}
				self.reset();
			},
			_ => (),
		}
		loop {
			if let Position::At { index: current, .. } = self.position {
				if current == index {
					return Ok(true);
				}
			}
			if !self.move_next(table)? {
				return Ok(false);
			}
		}
	}

	/// Counts the sectors of the chain, leaving the enumerator past its end.
	pub fn len<T: AllocationTable>(&mut self, table: &mut T) -> CfbResult<u32> {
		self.reset();
		let mut length = 0;
		while self.move_next(table)? {
			length += 1;
		}
		Ok(length)
	}

	fn tail<T: AllocationTable>(&mut self, table: &mut T) -> CfbResult<Option<(u32, u32)>> {
		while self.move_next(table)? { }
		match self.position {
			Position::Exhausted { tail } => Ok(tail),
			_ => Err(CfbError::corrupt("chain enumeration ended on a sector")),
		}
	}

	/// Grows the chain to `required_length` sectors. A previously empty chain gets a new start id.
	pub fn extend<T: AllocationTable>(&mut self, table: &mut T, required_length: u32) -> CfbResult<()> {
		let mut length = self.len(table)?;
		if length >= required_length {
			return Err(CfbError::InvalidArgument(format!("chain already has {} sectors, {} requested", length, required_length)));
		}
		let mut last = match self.tail(table)? {
			Some((_, id)) => id,
			None => {
				let id = table.add(0)?;
				self.start_id = id;
				length = 1;
				id
			},
		};
		while length < required_length {
			let id = table.add(last)?;
			table.set(last, id)?;
			last = id;
			length += 1;
		}
		trace!("[chain_extend] Chain starting at {:#X} now has {} sectors.", self.start_id, length);
		self.position = Position::Exhausted { tail: Some((length - 1, last)) };
		Ok(())
	}

	/// Truncates the chain to `required_length` sectors and frees the rest. A chain shrunk to
	/// nothing starts at `NO_STREAM`.
	pub fn shrink<T: AllocationTable>(&mut self, table: &mut T, required_length: u32) -> CfbResult<()> {
		let length = self.len(table)?;
		if length <= required_length {
			return Err(CfbError::InvalidArgument(format!("chain has only {} sectors, {} requested", length, required_length)));
		}
		let mut next = if required_length == 0 {
			let start = self.start_id;
			self.start_id = stream_id::NO_STREAM;
			start
		}
		else {
			if !self.move_to(table, required_length - 1)? {
				return Err(CfbError::corrupt("chain shrank while being truncated"));
			}
			let last = self.current().ok_or_else(|| CfbError::corrupt("chain enumerator lost its position"))?;
			let next = table.get(last)?;
			table.set(last, sector_type::END_OF_CHAIN)?;
			next
		};

		let mut freed = 0;
		while next <= sector_type::MAXIMUM {
			if freed >= length {
				return Err(CfbError::corrupt("chain is cyclic"));
			}
			let following = table.get(next)?;
			table.set(next, sector_type::FREE)?;
			next = following;
			freed += 1;
		}
		trace!("[chain_shrink] Freed {} sectors of chain starting at {:#X}.", freed, self.start_id);
		self.reset();
		Ok(())
	}

	/// Appends exactly one sector to the chain and positions the enumerator on it. `hint` is the
	/// preferred location when the chain is still empty.
	pub fn extend_from<T: AllocationTable>(&mut self, table: &mut T, hint: u32) -> CfbResult<u32> {
		let tail = match self.position {
			Position::Exhausted { tail } => tail,
			_ => self.tail(table)?,
		};
		let id = match tail {
			None => {
				let id = table.add(hint)?;
				self.start_id = id;
				self.detector = CycleDetector::new(id);
				self.position = Position::At { index: 0, id };
				id
			},
			Some((index, last)) => {
				let id = table.add(last)?;
				table.set(last, id)?;
				self.position = Position::At { index: index + 1, id };
				id
			},
		};
		Ok(id)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	/// An in-memory table for exercising chains without a backing file.
	pub struct VecTable {
		pub entries: Vec<u32>,
	}

	impl VecTable {
		pub fn new(size: usize) -> VecTable {
			VecTable { entries: vec![sector_type::FREE; size] }
		}
	}

	impl AllocationTable for VecTable {
		fn max_chain_length(&self) -> u32 {
			self.entries.len() as u32
		}

		fn try_get(&mut self, id: u32) -> CfbResult<Option<u32>> {
			Ok(self.entries.get(id as usize).cloned())
		}

		fn set(&mut self, id: u32, value: u32) -> CfbResult<()> {
			self.entries[id as usize] = value;
			Ok(())
		}

		fn add(&mut self, start_hint: u32) -> CfbResult<u32> {
			let start = (start_hint as usize).min(self.entries.len());
			let found = (start..self.entries.len()).chain(0..start)
				.find(|&i| self.entries[i] == sector_type::FREE);
			let id = match found {
				Some(id) => id,
				None => {
					self.entries.push(sector_type::FREE);
					self.entries.len() - 1
				},
			};
			self.entries[id] = sector_type::END_OF_CHAIN;
			Ok(id as u32)
		}
	}

	fn chain_ids(chain: &mut ChainEnumerator, table: &mut VecTable) -> Vec<u32> {
		chain.reset();
		let mut ids = Vec::new();
		while chain.move_next(table).unwrap() {
			ids.push(chain.current().unwrap());
		}
		ids
	}

	#[test]
	fn test_extend_and_shrink_lengths() {
		let mut table = VecTable::new(16);
		let mut chain = ChainEnumerator::new(stream_id::NO_STREAM);
		assert_eq!(chain.len(&mut table).unwrap(), 0);

		chain.extend(&mut table, 5).unwrap();
		assert_eq!(chain.len(&mut table).unwrap(), 5);
		assert_eq!(chain.start_id(), 0);
		assert_eq!(chain_ids(&mut chain, &mut table), vec![0, 1, 2, 3, 4]);

		chain.shrink(&mut table, 2).unwrap();
		assert_eq!(chain.len(&mut table).unwrap(), 2);
		assert_eq!(table.entries[1], sector_type::END_OF_CHAIN);
		assert!(table.entries[2..5].iter().all(|&e| e == sector_type::FREE));

		chain.shrink(&mut table, 0).unwrap();
		assert_eq!(chain.start_id(), stream_id::NO_STREAM);
		assert_eq!(chain.len(&mut table).unwrap(), 0);
		assert!(table.entries.iter().all(|&e| e == sector_type::FREE));
	}

	#[test]
	fn test_extend_rejects_shorter_length() {
		let mut table = VecTable::new(4);
		let mut chain = ChainEnumerator::new(stream_id::NO_STREAM);
		chain.extend(&mut table, 2).unwrap();
		assert!(matches!(chain.extend(&mut table, 2), Err(CfbError::InvalidArgument(_))));
		assert!(matches!(chain.shrink(&mut table, 3), Err(CfbError::InvalidArgument(_))));
	}

	#[test]
	fn test_move_to_backwards_replays() {
		let mut table = VecTable::new(8);
		table.entries[0] = 5;
		table.entries[5] = 3;
		table.entries[3] = sector_type::END_OF_CHAIN;
		let mut chain = ChainEnumerator::new(0);
		assert!(chain.move_to(&mut table, 2).unwrap());
		assert_eq!(chain.current(), Some(3));
		assert!(chain.move_to(&mut table, 1).unwrap());
		assert_eq!(chain.current(), Some(5));
		assert!(!chain.move_to(&mut table, 3).unwrap());
		assert!(chain.move_to(&mut table, 0).unwrap());
		assert_eq!(chain.current(), Some(0));
	}

	#[test]
	fn test_two_sector_cycle_is_detected() {
		let mut table = VecTable::new(64);
		table.entries[2] = 9;
		table.entries[9] = 2;
		let mut chain = ChainEnumerator::new(2);
		match chain.len(&mut table) {
			Err(CfbError::CorruptFormat(_)) => (),
			other => panic!("cycle not detected: {:?}", other),
		}
	}

	#[test]
	fn test_long_cycle_is_detected_before_length_bound() {
		let mut table = VecTable::new(1000);
		for i in 0..10 {
			table.entries[i] = i as u32 + 1;
		}
		table.entries[10] = 4;
		let mut chain = ChainEnumerator::new(0);
		assert!(matches!(chain.len(&mut table), Err(CfbError::CorruptFormat(_))));
	}

	#[test]
	fn test_chain_longer_than_table_is_corrupt() {
		let mut table = VecTable::new(3);
		table.entries[0] = 1;
		table.entries[1] = 2;
		table.entries[2] = 7;
		let mut chain = ChainEnumerator::new(0);
		assert!(matches!(chain.len(&mut table), Err(CfbError::CorruptFormat(_))));
	}

	#[test]
	fn test_reserved_link_is_corrupt() {
		let mut table = VecTable::new(4);
		table.entries[0] = sector_type::FAT;
		let mut chain = ChainEnumerator::new(0);
		assert!(matches!(chain.len(&mut table), Err(CfbError::CorruptFormat(_))));
	}

	#[test]
	fn test_end_of_chain_start_is_empty() {
		let mut table = VecTable::new(4);
		let mut chain = ChainEnumerator::new(sector_type::END_OF_CHAIN);
		assert_eq!(chain.len(&mut table).unwrap(), 0);
		assert!(!chain.move_to(&mut table, 0).unwrap());
	}

	#[test]
	fn test_extend_from_appends_one_sector() {
		let mut table = VecTable::new(8);
		let mut chain = ChainEnumerator::new(stream_id::NO_STREAM);
		let first = chain.extend_from(&mut table, 3).unwrap();
		assert_eq!(first, 3);
		assert_eq!(chain.start_id(), 3);
		assert_eq!(chain.current(), Some(3));

		assert!(!chain.move_to(&mut table, 1).unwrap());
		let second = chain.extend_from(&mut table, 0).unwrap();
		assert_eq!(second, 4);
		assert_eq!(chain.current(), Some(4));
		assert!(chain.move_to(&mut table, 1).unwrap());
		assert_eq!(chain_ids(&mut chain, &mut table), vec![3, 4]);
	}
}
