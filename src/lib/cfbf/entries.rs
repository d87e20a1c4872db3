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
use super::directory::{DirectoryEntry, EntryType};
use super::fat::Fat;
use super::structures::{stream_id, Sector, Version, DIRECTORY_ENTRY_SIZE};
use crate::error::{CfbError, CfbResult};
use crate::io::ReadWriteSeek;

pub struct DirectoryState {
	sectors: ChainEnumerator,
}

impl DirectoryState {
	pub fn new(first_directory_sector_id: u32) -> DirectoryState {
		DirectoryState { sectors: ChainEnumerator::new(first_directory_sector_id) }
	}
}

/// The flat array of directory entries, stored in a FAT chain starting at the header's first
/// directory sector.
pub struct DirectoryEntries<'a, F> {
	pub fat: Fat<'a, F>,
	state: &'a mut DirectoryState,
}

impl<'a, F> DirectoryEntries<'a, F> where F: ReadWriteSeek {
	pub fn new(fat: Fat<'a, F>, state: &'a mut DirectoryState) -> DirectoryEntries<'a, F> {
		DirectoryEntries { fat, state }
	}

	pub fn version(&self) -> Version {
		self.fat.header.version
	}

	fn sync_chain(&mut self) {
		let first = self.fat.header.first_directory_sector_id;
		if self.state.sectors.start_id() != first {
			self.state.sectors.reset_to(first);
		}
	}

	/// File offset of entry `id`, or `None` if the directory chain is too short to hold it.
	fn position(&mut self, id: u32) -> CfbResult<Option<u64>> {
		let per_sector = self.fat.header.directory_entries_per_sector();
		self.sync_chain();
		if !self.state.sectors.move_to(&mut self.fat, id / per_sector)? {
			return Ok(None);
		}
		let sector_id = self.state.sectors.current()
			.ok_or_else(|| CfbError::corrupt("directory enumerator lost its position"))?;
		let sector = Sector::new(sector_id, self.fat.sector_size());
		Ok(Some(sector.position()? + (id % per_sector) as u64 * DIRECTORY_ENTRY_SIZE as u64))
	}

	pub fn try_get(&mut self, id: u32) -> CfbResult<Option<DirectoryEntry>> {
		if id > stream_id::MAXIMUM {
			return Err(CfbError::corrupt(format!("directory entry id {:#X} is out of range", id)));
		}
		let position = match self.position(id)? {
			Some(position) => position,
			None => return Ok(None),
		};
		let mut buffer = [0u8; DIRECTORY_ENTRY_SIZE as usize];
		self.fat.io.read_exact_at(position, &mut buffer)?;
		let version = self.version();
		Ok(Some(DirectoryEntry::parse(id, &buffer, version)?))
	}

	pub fn get(&mut self, id: u32) -> CfbResult<DirectoryEntry> {
		self.try_get(id)?
			.ok_or_else(|| CfbError::corrupt(format!("directory entry #{} does not exist", id)))
	}

	pub fn write(&mut self, entry: &DirectoryEntry) -> CfbResult<()> {
		let position = self.position(entry.id)?
			.ok_or_else(|| CfbError::corrupt(format!("directory entry #{} does not exist", entry.id)))?;
		let bytes = entry.to_bytes(self.version())?;
		self.fat.io.write_all_at(position, &bytes)?;
		trace!("[entries_write] Wrote directory entry #{} '{}'.", entry.id, entry.name);
		Ok(())
	}

	/// Takes the first unallocated entry, or appends a new directory sector if there is none.
	/// The returned entry has already been written.
	pub fn create_or_recycle(&mut self, name: &str, entry_type: EntryType) -> CfbResult<DirectoryEntry> {
		let mut enumerator = DirectoryEntryEnumerator::new();
		while let Some(mut entry) = enumerator.next(self)? {
			if entry.entry_type == EntryType::Unallocated {
				entry.recycle(name, entry_type);
				self.write(&entry)?;
				debug!("[entries_create] Recycled directory entry #{} for '{}'.", entry.id, name);
				return Ok(entry);
			}
		}

		let first_id = enumerator.next_id();
		let sector_id = self.add_directory_sector()?;
		let per_sector = self.fat.header.directory_entries_per_sector();
		for id in first_id..first_id + per_sector {
			self.write(&DirectoryEntry::unallocated(id))?;
		}
		debug!("[entries_create] Directory sector {:#X} holds entries #{} to #{}.", sector_id, first_id, first_id + per_sector - 1);

		let mut entry = DirectoryEntry::unallocated(first_id);
		entry.recycle(name, entry_type);
		self.write(&entry)?;
		Ok(entry)
	}

	fn add_directory_sector(&mut self) -> CfbResult<u32> {
		self.sync_chain();
		let id = self.state.sectors.extend_from(&mut self.fat, 0)?;
		if is_empty_chain(self.fat.header.first_directory_sector_id) {
			self.fat.header.first_directory_sector_id = self.state.sectors.start_id();
		}
		if self.version() == Version::V4 {
			self.fat.header.number_of_directory_sectors += 1;
		}
		Ok(id)
	}
}

/// Visits every slot of the directory in id order, allocated or not.
pub struct DirectoryEntryEnumerator {
	next_id: u32,
}

impl DirectoryEntryEnumerator {
	pub fn new() -> DirectoryEntryEnumerator {
		DirectoryEntryEnumerator { next_id: 0 }
	}

	pub fn next_id(&self) -> u32 {
		self.next_id
	}

	pub fn next<F: ReadWriteSeek>(&mut self, entries: &mut DirectoryEntries<'_, F>) -> CfbResult<Option<DirectoryEntry>> {
		if self.next_id > stream_id::MAXIMUM {
			return Ok(None);
		}
		let entry = entries.try_get(self.next_id)?;
		if entry.is_some() {
			self.next_id += 1;
		}
		Ok(entry)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cfbf::fat::FatState;
	use crate::cfbf::structures::{sector_type, Header, HEADER_SIZE};
	use crate::io::SectorIo;
	use std::io::Cursor;

	fn empty_file(version: Version) -> (SectorIo<Cursor<Vec<u8>>>, Header, FatState, DirectoryState) {
		let mut io = SectorIo::new(Cursor::new(Vec::new()), version.sector_size(), true).unwrap();
		io.extend_length(version.sector_size().max(HEADER_SIZE as u32) as u64).unwrap();
		(io, Header::new(version), FatState::new(), DirectoryState::new(sector_type::END_OF_CHAIN))
	}

	#[test]
	fn test_first_entry_allocates_directory_sector() {
		let (mut io, mut header, mut fat, mut state) = empty_file(Version::V3);
		let mut entries = DirectoryEntries::new(Fat::new(&mut io, &mut header, &mut fat), &mut state);
		let root = entries.create_or_recycle("Root Entry", EntryType::Root).unwrap();
		assert_eq!(root.id, 0);
		assert_eq!(entries.fat.header.first_directory_sector_id, 1);
		assert_eq!(entries.fat.header.number_of_directory_sectors, 0);

		for id in 1..4 {
			assert_eq!(entries.get(id).unwrap().entry_type, EntryType::Unallocated);
		}
		assert!(entries.try_get(4).unwrap().is_none());
		assert_eq!(entries.get(0).unwrap().name, "Root Entry");
	}

	#[test]
	fn test_unallocated_slots_are_recycled_before_growing() {
		let (mut io, mut header, mut fat, mut state) = empty_file(Version::V3);
		let mut entries = DirectoryEntries::new(Fat::new(&mut io, &mut header, &mut fat), &mut state);
		for i in 0..4 {
			assert_eq!(entries.create_or_recycle(&format!("e{}", i), EntryType::Stream).unwrap().id, i);
		}
		let fifth = entries.create_or_recycle("e4", EntryType::Stream).unwrap();
		assert_eq!(fifth.id, 4);

		entries.write(&DirectoryEntry::unallocated(2)).unwrap();
		assert_eq!(entries.create_or_recycle("again", EntryType::Storage).unwrap().id, 2);
	}

	#[test]
	fn test_v4_counts_directory_sectors() {
		let (mut io, mut header, mut fat, mut state) = empty_file(Version::V4);
		let mut entries = DirectoryEntries::new(Fat::new(&mut io, &mut header, &mut fat), &mut state);
		entries.create_or_recycle("Root Entry", EntryType::Root).unwrap();
		assert_eq!(entries.fat.header.number_of_directory_sectors, 1);
		assert!(entries.try_get(31).unwrap().is_some());
		assert!(entries.try_get(32).unwrap().is_none());
	}
}
