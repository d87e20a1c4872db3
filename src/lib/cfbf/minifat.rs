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

use log::{debug, trace};
use super::chain::{is_empty_chain, ChainEnumerator};
use super::fat::{AllocationTable, Fat, SectorCache, SectorStore};
use super::stream::FatStream;
use super::structures::{sector_type, MiniSector, Sector, MINI_SECTOR_SIZE};
use crate::error::{CfbError, CfbResult};
use crate::io::ReadWriteSeek;

pub struct MiniFatState {
	cache: SectorCache,
	/// The chain of regular sectors holding the mini-FAT itself.
	sectors: ChainEnumerator,
	/// The mini-stream, i.e. the data stream of the root entry.
	pub mini_stream: FatStream,
}

impl MiniFatState {
	pub fn new(first_mini_fat_sector_id: u32, mini_stream: FatStream) -> MiniFatState {
		MiniFatState {
			cache: SectorCache::new(),
			sectors: ChainEnumerator::new(first_mini_fat_sector_id),
			mini_stream,
		}
	}
}

/// The mini-FAT: for every 64-byte mini-sector of the mini-stream, the id of the next mini-sector
/// in its chain. Mini-FAT sectors are regular sectors chained in the FAT.
pub struct MiniFat<'a, F> {
	pub fat: Fat<'a, F>,
	state: &'a mut MiniFatState,
}

impl<'a, F> MiniFat<'a, F> where F: ReadWriteSeek {
	pub fn new(fat: Fat<'a, F>, state: &'a mut MiniFatState) -> MiniFat<'a, F> {
		MiniFat { fat, state }
	}

	pub fn capacity(&self) -> u32 {
		let capacity = self.fat.header.number_of_mini_fat_sectors as u64 * self.fat.header.fat_entries_per_sector() as u64;
		capacity.min(sector_type::MAXIMUM as u64 + 1) as u32
	}

	pub fn flush(&mut self) -> CfbResult<()> {
		self.state.cache.flush(self.fat.io)
	}

	fn sync_chain(&mut self) {
		let first = self.fat.header.first_mini_fat_sector_id;
		if self.state.sectors.start_id() != first {
			self.state.sectors.reset_to(first);
		}
	}

	fn load(&mut self, id: u32) -> CfbResult<Option<u32>> {
		if id > sector_type::MAXIMUM {
			return Err(CfbError::corrupt(format!("mini-sector id {:#X} is out of range", id)));
		}
		let per_sector = self.fat.header.fat_entries_per_sector();
		let index = id / per_sector;
		if !self.state.cache.is_cached(index) {
			if index >= self.fat.header.number_of_mini_fat_sectors {
				return Ok(None);
			}
			self.sync_chain();
			if !self.state.sectors.move_to(&mut self.fat, index)? {
				return Err(CfbError::corrupt(format!("mini-FAT chain has no sector #{}", index)));
			}
			let id = self.state.sectors.current()
				.ok_or_else(|| CfbError::corrupt("mini-FAT enumerator lost its position"))?;
			trace!("[minifat_load] Mini-FAT sector #{} is at {:#X}.", index, id);
			let sector = Sector::new(id, self.fat.sector_size());
			self.state.cache.load(self.fat.io, index, sector)?;
		}
		Ok(Some(id % per_sector))
	}

	fn find_free(&mut self, start_hint: u32) -> CfbResult<Option<u32>> {
		let capacity = self.capacity();
		let start = start_hint.min(capacity);
		for id in (start..capacity).chain(0..start) {
			if self.try_get(id)? == Some(sector_type::FREE) {
				return Ok(Some(id));
			}
		}
		Ok(None)
	}

	/// Appends one regular sector to the mini-FAT chain, all of its entries free.
	fn add_mini_fat_sector(&mut self) -> CfbResult<u32> {
		self.sync_chain();
		let id = self.state.sectors.extend_from(&mut self.fat, 0)?;
		if is_empty_chain(self.fat.header.first_mini_fat_sector_id) {
			self.fat.header.first_mini_fat_sector_id = self.state.sectors.start_id();
		}
		self.fat.header.number_of_mini_fat_sectors += 1;
		let sector = Sector::new(id, self.fat.sector_size());
		self.fat.io.fill_u32_at(sector.position()?, sector.length, sector_type::FREE)?;
		debug!("[minifat_add] Mini-FAT sector #{} placed at sector {:#X}.", self.fat.header.number_of_mini_fat_sectors - 1, id);
		Ok(id)
	}
}

impl<'a, F> AllocationTable for MiniFat<'a, F> where F: ReadWriteSeek {
	fn max_chain_length(&self) -> u32 {
		self.capacity()
	}

	fn try_get(&mut self, id: u32) -> CfbResult<Option<u32>> {
		match self.load(id)? {
			Some(slot) => Ok(Some(self.state.cache.entry(slot))),
			None => Ok(None),
		}
	}

	fn set(&mut self, id: u32, value: u32) -> CfbResult<()> {
		match self.load(id)? {
			Some(slot) => {
				self.state.cache.set_entry(slot, value);
				Ok(())
			},
			None => Err(CfbError::corrupt(format!("mini-sector #{:#X} is not covered by the mini-FAT", id))),
		}
	}

	fn add(&mut self, start_hint: u32) -> CfbResult<u32> {
		let id = match self.find_free(start_hint)? {
			Some(id) => id,
			None => {
				let capacity = self.capacity();
				self.add_mini_fat_sector()?;
				self.find_free(capacity)?
					.ok_or_else(|| CfbError::corrupt("no free mini-FAT entry after growing the mini-FAT"))?
			},
		};
		self.set(id, sector_type::END_OF_CHAIN)?;

		// The mini-stream must cover every allocated mini-sector.
		let end = MiniSector::new(id).end_position()?;
		if self.state.mini_stream.len() < end {
			self.state.mini_stream.set_len(&mut self.fat, end)?;
		}
		trace!("[minifat_add] Allocated mini-sector {:#X}.", id);
		Ok(id)
	}
}

impl<'a, F> SectorStore for MiniFat<'a, F> where F: ReadWriteSeek {
	fn block_size(&self) -> u32 {
		MINI_SECTOR_SIZE
	}

	fn read_block(&mut self, id: u32, offset: u32, buffer: &mut [u8]) -> CfbResult<()> {
		let position = MiniSector::new(id).position()? + offset as u64;
		self.state.mini_stream.read_exact_at(&mut self.fat, position, buffer)
	}

	fn write_block(&mut self, id: u32, offset: u32, buffer: &[u8]) -> CfbResult<()> {
		let position = MiniSector::new(id).position()? + offset as u64;
		self.state.mini_stream.write_all_at(&mut self.fat, position, buffer)
	}
}
