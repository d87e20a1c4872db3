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

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, trace};
use super::structures::{sector_type, Header, Sector, HEADER_DIFAT_ENTRIES};
use crate::error::{CfbError, CfbResult};
use crate::io::{ReadWriteSeek, SectorIo};

/// A table of 32-bit next-pointers, i.e. the FAT or the mini-FAT.
pub trait AllocationTable {
	/// Upper bound for the length of any chain in this table. Walking further implies a cycle.
	fn max_chain_length(&self) -> u32;

	/// Returns `None` if `id` lies beyond the end of the table.
	fn try_get(&mut self, id: u32) -> CfbResult<Option<u32>>;

	fn set(&mut self, id: u32, value: u32) -> CfbResult<()>;

	/// Allocates one entry (preferably at or after `start_hint`), marks it `END_OF_CHAIN` and
	/// returns its id. Grows the table when it has no free entry left.
	fn add(&mut self, start_hint: u32) -> CfbResult<u32>;

	fn get(&mut self, id: u32) -> CfbResult<u32> {
		self.try_get(id)?
			.ok_or_else(|| CfbError::corrupt(format!("sector #{:#X} is not covered by the allocation table", id)))
	}
}

/// An allocation table whose entries stand for fixed-size blocks of data.
pub trait SectorStore: AllocationTable {
	/// Size of the blocks described by the table (sector or mini-sector size).
	fn block_size(&self) -> u32;

	fn read_block(&mut self, id: u32, offset: u32, buffer: &mut [u8]) -> CfbResult<()>;

	fn write_block(&mut self, id: u32, offset: u32, buffer: &[u8]) -> CfbResult<()>;
}

/// One sector of a table, read once and written back when another sector is needed or on flush.
pub struct SectorCache {
	index: Option<u32>,
	sector: Sector,
	buffer: Vec<u8>,
	dirty: bool,
}

impl SectorCache {
	pub fn new() -> SectorCache {
		SectorCache {
			index: None,
			sector: Sector::new(sector_type::END_OF_CHAIN, 0),
			buffer: Vec::new(),
			dirty: false,
		}
	}

	pub fn is_cached(&self, index: u32) -> bool {
		self.index == Some(index)
	}

	pub fn load<F: ReadWriteSeek>(&mut self, io: &mut SectorIo<F>, index: u32, sector: Sector) -> CfbResult<()> {
		if self.is_cached(index) {
			return Ok(());
		}
		self.flush(io)?;
		self.buffer.resize(sector.length as usize, 0);
		io.read_exact_at(sector.position()?, &mut self.buffer)?;
		self.index = Some(index);
		self.sector = sector;
		Ok(())
	}

	pub fn flush<F: ReadWriteSeek>(&mut self, io: &mut SectorIo<F>) -> CfbResult<()> {
		if self.dirty {
			io.write_all_at(self.sector.position()?, &self.buffer)?;
			self.dirty = false;
		}
		Ok(())
	}

	pub fn entry(&self, slot: u32) -> u32 {
		let offset = slot as usize * 4;
		LittleEndian::read_u32(&self.buffer[offset..offset + 4])
	}

	pub fn set_entry(&mut self, slot: u32, value: u32) {
		let offset = slot as usize * 4;
		LittleEndian::write_u32(&mut self.buffer[offset..offset + 4], value);
		self.dirty = true;
	}
}

/// Walks the chain of DIFAT sectors starting at the header's first DIFAT sector id.
pub struct DifatSectorEnumerator {
	index: Option<u32>,
	current: u32,
}

impl DifatSectorEnumerator {
	pub fn new() -> DifatSectorEnumerator {
		DifatSectorEnumerator { index: None, current: sector_type::END_OF_CHAIN }
	}

	pub fn reset(&mut self) {
		self.index = None;
		self.current = sector_type::END_OF_CHAIN;
	}

	/// Returns the sector id of the DIFAT sector number `index`, or `None` past the last one.
	pub fn move_to<F: ReadWriteSeek>(&mut self, io: &mut SectorIo<F>, header: &Header, index: u32) -> CfbResult<Option<u32>> {
		if index >= header.number_of_difat_sectors {
			return Ok(None);
		}
		let mut position = match self.index {
			Some(position) if position <= index => position,
			_ => {
				self.current = header.first_difat_sector_id;
				0
			},
		};
		while position < index {
			let sector = Sector::new(self.current, header.sector_size());
			trace!("[difat_move_to] Following DIFAT sector #{} at {:#X} ...", position, self.current);
			self.current = io.read_u32_at(sector.end_position()? - 4)?;
			position += 1;
		}
		self.index = Some(position);
		if self.current > sector_type::MAXIMUM {
			return Err(CfbError::corrupt(format!("DIFAT sector #{} has invalid location {:#X}", index, self.current)));
		}
		Ok(Some(self.current))
	}

	/// Appends a DIFAT sector at `id`, filled with free entries and terminated by `END_OF_CHAIN`.
	/// The caller is responsible for tagging the sector in the FAT.
	pub fn add<F: ReadWriteSeek>(&mut self, io: &mut SectorIo<F>, header: &mut Header, id: u32) -> CfbResult<()> {
		let sector = Sector::new(id, header.sector_size());
		io.extend_length(sector.position()?)?;
		io.fill_u32_at(sector.position()?, sector.length, sector_type::FREE)?;
		io.write_u32_at(sector.end_position()? - 4, sector_type::END_OF_CHAIN)?;

		if header.number_of_difat_sectors == 0 {
			header.first_difat_sector_id = id;
		}
		else {
			let last_index = header.number_of_difat_sectors - 1;
			let last = self.move_to(io, header, last_index)?
				.ok_or_else(|| CfbError::corrupt("DIFAT chain is shorter than declared"))?;
			io.write_u32_at(Sector::new(last, header.sector_size()).end_position()? - 4, id)?;
		}
		header.number_of_difat_sectors += 1;
		self.reset();
		debug!("[difat_add] DIFAT sector #{} placed at sector {:#X}.", header.number_of_difat_sectors - 1, id);
		Ok(())
	}
}

/// Resolves the physical location of the n-th FAT sector through the header and the DIFAT.
pub struct FatSectorEnumerator {
	difat: DifatSectorEnumerator,
}

impl FatSectorEnumerator {
	pub fn new() -> FatSectorEnumerator {
		FatSectorEnumerator { difat: DifatSectorEnumerator::new() }
	}

	pub fn move_to<F: ReadWriteSeek>(&mut self, io: &mut SectorIo<F>, header: &Header, index: u32) -> CfbResult<Option<Sector>> {
		if index >= header.number_of_fat_sectors {
			return Ok(None);
		}
		let id = if (index as usize) < HEADER_DIFAT_ENTRIES {
			header.difat[index as usize]
		}
		else {
			let slot = index - HEADER_DIFAT_ENTRIES as u32;
			let per_sector = header.difat_entries_per_sector();
			let difat_id = match self.difat.move_to(io, header, slot / per_sector)? {
				Some(difat_id) => difat_id,
				None => return Ok(None),
			};
			let difat_sector = Sector::new(difat_id, header.sector_size());
			io.read_u32_at(difat_sector.position()? + (slot % per_sector) as u64 * 4)?
		};
		if id > sector_type::MAXIMUM {
			return Err(CfbError::corrupt(format!("FAT sector #{} has invalid location {:#X}", index, id)));
		}
		Ok(Some(Sector::new(id, header.sector_size())))
	}

	/// Appends a FAT sector (all entries free) and records it in the DIFAT, growing the DIFAT
	/// chain when the header and the existing DIFAT sectors are full.
	///
	/// Returns the id of the new FAT sector and, if one had to be added, of the new DIFAT sector.
	/// Both still need to be tagged in the FAT by the caller.
	pub fn add<F: ReadWriteSeek>(&mut self, io: &mut SectorIo<F>, header: &mut Header) -> CfbResult<(u32, Option<u32>)> {
		let index = header.number_of_fat_sectors;
		// The new sector is the first one described by itself.
		let id = index.checked_mul(header.fat_entries_per_sector())
			.filter(|&id| id < sector_type::MAXIMUM)
			.ok_or_else(|| CfbError::NotSupported("the compound file cannot grow any further".to_owned()))?;
		let sector = Sector::new(id, header.sector_size());
		io.extend_length(sector.position()?)?;
		io.fill_u32_at(sector.position()?, sector.length, sector_type::FREE)?;
		header.number_of_fat_sectors += 1;

		let mut new_difat = None;
		if (index as usize) < HEADER_DIFAT_ENTRIES {
			header.difat[index as usize] = id;
		}
		else {
			let slot = index - HEADER_DIFAT_ENTRIES as u32;
			let per_sector = header.difat_entries_per_sector();
			let difat_index = slot / per_sector;
			if difat_index >= header.number_of_difat_sectors {
				self.difat.add(io, header, id + 1)?;
				new_difat = Some(id + 1);
			}
			let difat_id = self.difat.move_to(io, header, difat_index)?
				.ok_or_else(|| CfbError::corrupt("DIFAT chain is shorter than declared"))?;
			let difat_sector = Sector::new(difat_id, header.sector_size());
			io.write_u32_at(difat_sector.position()? + (slot % per_sector) as u64 * 4, id)?;
		}
		debug!("[fat_add] FAT sector #{} placed at sector {:#X}.", index, id);
		Ok((id, new_difat))
	}
}

pub struct FatState {
	cache: SectorCache,
	sectors: FatSectorEnumerator,
}

impl FatState {
	pub fn new() -> FatState {
		FatState { cache: SectorCache::new(), sectors: FatSectorEnumerator::new() }
	}
}

/// The file allocation table: for every regular sector, the id of the next sector in its chain.
pub struct Fat<'a, F> {
	pub io: &'a mut SectorIo<F>,
	pub header: &'a mut Header,
	state: &'a mut FatState,
}

impl<'a, F> Fat<'a, F> where F: ReadWriteSeek {
	pub fn new(io: &'a mut SectorIo<F>, header: &'a mut Header, state: &'a mut FatState) -> Fat<'a, F> {
		Fat { io, header, state }
	}

	pub fn sector_size(&self) -> u32 {
		self.header.sector_size()
	}

	/// Number of entries described by the FAT sectors currently allocated.
	pub fn capacity(&self) -> u32 {
		let capacity = self.header.number_of_fat_sectors as u64 * self.header.fat_entries_per_sector() as u64;
		capacity.min(sector_type::MAXIMUM as u64 + 1) as u32
	}

	pub fn flush(&mut self) -> CfbResult<()> {
		self.state.cache.flush(self.io)
	}

	/// Brings the FAT sector holding `id` into the cache and returns the slot of `id` inside it.
	fn load(&mut self, id: u32) -> CfbResult<Option<u32>> {
		if id > sector_type::MAXIMUM {
			return Err(CfbError::corrupt(format!("sector id {:#X} is out of range", id)));
		}
		let per_sector = self.header.fat_entries_per_sector();
		let index = id / per_sector;
		if !self.state.cache.is_cached(index) {
			let sector = match self.state.sectors.move_to(self.io, self.header, index)? {
				Some(sector) => sector,
				None => return Ok(None),
			};
			trace!("[fat_load] FAT sector #{} is at {:#X}.", index, sector.id);
			self.state.cache.load(self.io, index, sector)?;
		}
		Ok(Some(id % per_sector))
	}

	/// Looks for a free entry, first from `start_hint` to the end of the table, then from the start.
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
}

impl<'a, F> AllocationTable for Fat<'a, F> where F: ReadWriteSeek {
	fn max_chain_length(&self) -> u32 {
		self.io.sector_count().max(self.capacity())
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
			None => Err(CfbError::corrupt(format!("sector #{:#X} is not covered by the FAT", id))),
		}
	}

	fn add(&mut self, start_hint: u32) -> CfbResult<u32> {
		let id = match self.find_free(start_hint)? {
			Some(id) => id,
			None => {
				let (fat_id, difat_id) = self.state.sectors.add(self.io, self.header)?;
				self.set(fat_id, sector_type::FAT)?;
				if let Some(difat_id) = difat_id {
					self.set(difat_id, sector_type::DIFAT)?;
				}
				self.find_free(fat_id)?
					.ok_or_else(|| CfbError::corrupt("no free FAT entry after growing the FAT"))?
			},
		};
		self.set(id, sector_type::END_OF_CHAIN)?;
		let sector = Sector::new(id, self.sector_size());
		self.io.extend_length(sector.end_position()?)?;
		trace!("[fat_add] Allocated sector {:#X}.", id);
		Ok(id)
	}
}

impl<'a, F> SectorStore for Fat<'a, F> where F: ReadWriteSeek {
	fn block_size(&self) -> u32 {
		self.sector_size()
	}

	fn read_block(&mut self, id: u32, offset: u32, buffer: &mut [u8]) -> CfbResult<()> {
		let sector = Sector::new(id, self.sector_size());
		self.io.read_exact_at(sector.position()? + offset as u64, buffer)
	}

	fn write_block(&mut self, id: u32, offset: u32, buffer: &[u8]) -> CfbResult<()> {
		let sector = Sector::new(id, self.sector_size());
		self.io.write_all_at(sector.position()? + offset as u64, buffer)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cfbf::structures::Version;
	use std::io::Cursor;

	fn empty_file(version: Version) -> (SectorIo<Cursor<Vec<u8>>>, Header, FatState) {
		let mut io = SectorIo::new(Cursor::new(Vec::new()), version.sector_size(), true).unwrap();
		io.extend_length(version.sector_size() as u64).unwrap();
		(io, Header::new(version), FatState::new())
	}

	#[test]
	fn test_first_allocation_creates_fat_sector() {
		let (mut io, mut header, mut state) = empty_file(Version::V3);
		let mut fat = Fat::new(&mut io, &mut header, &mut state);
		let id = fat.add(0).unwrap();
		assert_eq!(id, 1);
		assert_eq!(fat.get(0).unwrap(), sector_type::FAT);
		assert_eq!(fat.get(1).unwrap(), sector_type::END_OF_CHAIN);
		assert_eq!(fat.get(2).unwrap(), sector_type::FREE);
		fat.flush().unwrap();
		assert_eq!(header.number_of_fat_sectors, 1);
		assert_eq!(header.difat[0], 0);
		assert_eq!(io.len(), 3 * 512);
	}

	#[test]
	fn test_freed_entries_are_reused() {
		let (mut io, mut header, mut state) = empty_file(Version::V3);
		let mut fat = Fat::new(&mut io, &mut header, &mut state);
		let a = fat.add(0).unwrap();
		let b = fat.add(a).unwrap();
		let c = fat.add(b).unwrap();
		assert_eq!((a, b, c), (1, 2, 3));
		fat.set(b, sector_type::FREE).unwrap();
		assert_eq!(fat.add(0).unwrap(), b);
		assert_eq!(fat.add(c).unwrap(), 4);
	}

	#[test]
	fn test_out_of_range_sector_id_is_corrupt() {
		let (mut io, mut header, mut state) = empty_file(Version::V3);
		let mut fat = Fat::new(&mut io, &mut header, &mut state);
		assert!(matches!(fat.get(sector_type::END_OF_CHAIN), Err(CfbError::CorruptFormat(_))));
		assert!(matches!(fat.get(5), Err(CfbError::CorruptFormat(_))));
		assert_eq!(fat.try_get(5).unwrap(), None);
	}

	#[test]
	fn test_fat_growth_spills_into_difat() {
		let (mut io, mut header, mut state) = empty_file(Version::V3);
		// Pretend the 109 header slots are already taken by FAT sectors full of used entries.
		{
			let mut fat = Fat::new(&mut io, &mut header, &mut state);
			for _ in 0..HEADER_DIFAT_ENTRIES {
				let (id, difat) = fat.state.sectors.add(fat.io, fat.header).unwrap();
				assert!(difat.is_none());
				fat.io.fill_u32_at(Sector::new(id, 512).position().unwrap(), 512, sector_type::END_OF_CHAIN).unwrap();
				fat.set(id, sector_type::FAT).unwrap();
			}
			assert_eq!(fat.header.number_of_fat_sectors, 109);
			assert_eq!(fat.find_free(0).unwrap(), None);

			let id = fat.add(0).unwrap();
			let fat_id = 109 * 128;
			assert_eq!(fat.get(fat_id).unwrap(), sector_type::FAT);
			assert_eq!(fat.get(fat_id + 1).unwrap(), sector_type::DIFAT);
			assert_eq!(id, fat_id + 2);
			fat.flush().unwrap();
		}
		assert_eq!(header.number_of_fat_sectors, 110);
		assert_eq!(header.number_of_difat_sectors, 1);
		assert_eq!(header.first_difat_sector_id, 109 * 128 + 1);

		let mut sectors = FatSectorEnumerator::new();
		let sector = sectors.move_to(&mut io, &header, 109).unwrap().unwrap();
		assert_eq!(sector.id, 109 * 128);
		let difat = Sector::new(header.first_difat_sector_id, 512);
		assert_eq!(io.read_u32_at(difat.end_position().unwrap() - 4).unwrap(), sector_type::END_OF_CHAIN);
	}
}
