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

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::char::{decode_utf16, REPLACEMENT_CHARACTER};
use std::cmp::Ordering;
use std::io::{Cursor, Write};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use super::structures::{stream_id, Version, DIRECTORY_ENTRY_SIZE};
use crate::error::{CfbError, CfbResult};

/// Longest name, in UTF-16 code units, excluding the terminating NUL.
pub const MAX_NAME_LENGTH: usize = 31;
const INVALID_NAME_CHARACTERS: [char; 4] = ['\\', '/', ':', '!'];
/// Seconds between 1601-01-01 (FILETIME epoch) and 1970-01-01.
const FILETIME_UNIX_OFFSET: u64 = 11_644_473_600;

/// Whether a directory entry is a folder or a file.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EntryType {
	/// A free slot in the directory.
	Unallocated = 0,
	/// A folder.
	Storage = 1,
	/// A file.
	Stream = 2,
	/// The root folder.
	Root = 5,
}

impl EntryType {
	fn from_byte(value: u8) -> Option<EntryType> {
		match value {
			0 => Some(EntryType::Unallocated),
			1 => Some(EntryType::Storage),
			2 => Some(EntryType::Stream),
			5 => Some(EntryType::Root),
			_ => None,
		}
	}
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Color {
	Red = 0,
	Black = 1,
}

/// One 128-byte record of the directory.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectoryEntry {
	pub id: u32,
	pub name: String,
	pub entry_type: EntryType,
	pub color: Color,
	/// The ID of the left sibling in the binary tree (in this folder).
	pub left_sibling_id: u32,
	/// The ID of the right sibling in the binary tree (in this folder).
	pub right_sibling_id: u32,
	/// If this entry is a folder: the ID of the root of its children's tree.
	pub child_id: u32,
	pub clsid: [u8; 16],
	pub state_bits: u32,
	pub creation_time: u64,
	pub modified_time: u64,
	/// If this entry is a file: the first sector (or mini-sector) of its content.
	/// For the root: the first sector of the mini-stream.
	pub start_sector_id: u32,
	pub stream_length: u64,
}

impl DirectoryEntry {
	pub fn unallocated(id: u32) -> DirectoryEntry {
		DirectoryEntry {
			id,
			name: String::new(),
			entry_type: EntryType::Unallocated,
			color: Color::Red,
			left_sibling_id: stream_id::NO_STREAM,
			right_sibling_id: stream_id::NO_STREAM,
			child_id: stream_id::NO_STREAM,
			clsid: [0; 16],
			state_bits: 0,
			creation_time: 0,
			modified_time: 0,
			start_sector_id: 0,
			stream_length: 0,
		}
	}

	/// Turns a free slot into a fresh storage, stream or root entry named `name`.
	pub fn recycle(&mut self, name: &str, entry_type: EntryType) {
		let id = self.id;
		*self = DirectoryEntry::unallocated(id);
		self.name = name.to_owned();
		self.entry_type = entry_type;
		self.color = Color::Black;
		match entry_type {
			EntryType::Stream | EntryType::Root => self.start_sector_id = stream_id::NO_STREAM,
			_ => (),
		}
		match entry_type {
			EntryType::Storage => {
				let now = filetime_now();
				self.creation_time = now;
				self.modified_time = now;
			},
			EntryType::Root => self.modified_time = filetime_now(),
			_ => (),
		}
	}

	pub fn parse(id: u32, buffer: &[u8], version: Version) -> CfbResult<DirectoryEntry> {
		if buffer.len() < DIRECTORY_ENTRY_SIZE as usize {
			return Err(CfbError::corrupt(format!("directory entry #{} is truncated", id)));
		}
		let mut cursor = Cursor::new(buffer);
		let mut raw_name = [0u16; 32];
		for unit in raw_name.iter_mut() {
			*unit = cursor.read_u16::<LittleEndian>()?;
		}
		let name_length = cursor.read_u16::<LittleEndian>()? as usize;
		if name_length > 64 || name_length % 2 != 0 {
			return Err(CfbError::corrupt(format!("directory entry #{} has invalid name length {}", id, name_length)));
		}
		let type_byte = cursor.read_u8()?;
		let entry_type = EntryType::from_byte(type_byte)
			.ok_or_else(|| CfbError::corrupt(format!("directory entry #{} has invalid type {}", id, type_byte)))?;
		let color = match cursor.read_u8()? {
			0 => Color::Red,
			1 => Color::Black,
			other => return Err(CfbError::corrupt(format!("directory entry #{} has invalid color {}", id, other))),
		};
		let left_sibling_id = cursor.read_u32::<LittleEndian>()?;
		let right_sibling_id = cursor.read_u32::<LittleEndian>()?;
		let child_id = cursor.read_u32::<LittleEndian>()?;
		let mut clsid = [0u8; 16];
		std::io::Read::read_exact(&mut cursor, &mut clsid)?;
		let state_bits = cursor.read_u32::<LittleEndian>()?;
		let creation_time = cursor.read_u64::<LittleEndian>()?;
		let modified_time = cursor.read_u64::<LittleEndian>()?;
		let start_sector_id = cursor.read_u32::<LittleEndian>()?;
		let stream_length = match version {
			// The upper half is reserved in version 3 and may contain garbage.
			Version::V3 => cursor.read_u32::<LittleEndian>()? as u64,
			Version::V4 => cursor.read_u64::<LittleEndian>()?,
		};

		// The length is expressed in bytes and includes the trailing NUL.
		let units = if name_length >= 2 { name_length / 2 - 1 } else { 0 };
		let name = decode_utf16(raw_name.iter().take(units).cloned())
			.map(|r| r.unwrap_or(REPLACEMENT_CHARACTER))
			.collect::<String>();

		Ok(DirectoryEntry {
			id,
			name,
			entry_type,
			color,
			left_sibling_id,
			right_sibling_id,
			child_id,
			clsid,
			state_bits,
			creation_time,
			modified_time,
			start_sector_id,
			stream_length,
		})
	}

	pub fn to_bytes(&self, version: Version) -> CfbResult<Vec<u8>> {
		let units: Vec<u16> = self.name.encode_utf16().collect();
		if units.len() > MAX_NAME_LENGTH {
			return Err(CfbError::InvalidArgument(format!("name '{}' is too long", self.name)));
		}
		let mut buffer = Vec::with_capacity(DIRECTORY_ENTRY_SIZE as usize);
		for i in 0..32 {
			buffer.write_u16::<LittleEndian>(units.get(i).cloned().unwrap_or(0))?;
		}
		let name_length = if units.is_empty() { 0 } else { (units.len() as u16 + 1) * 2 };
		buffer.write_u16::<LittleEndian>(name_length)?;
		buffer.write_u8(self.entry_type as u8)?;
		buffer.write_u8(self.color as u8)?;
		buffer.write_u32::<LittleEndian>(self.left_sibling_id)?;
		buffer.write_u32::<LittleEndian>(self.right_sibling_id)?;
		buffer.write_u32::<LittleEndian>(self.child_id)?;
		buffer.write_all(&self.clsid)?;
		buffer.write_u32::<LittleEndian>(self.state_bits)?;
		buffer.write_u64::<LittleEndian>(self.creation_time)?;
		buffer.write_u64::<LittleEndian>(self.modified_time)?;
		buffer.write_u32::<LittleEndian>(self.start_sector_id)?;
		match version {
			Version::V3 => {
				buffer.write_u32::<LittleEndian>(self.stream_length as u32)?;
				buffer.write_u32::<LittleEndian>(0)?;
			},
			Version::V4 => buffer.write_u64::<LittleEndian>(self.stream_length)?,
		}
		Ok(buffer)
	}
}

/// Checks that `name` can be stored in a directory entry.
pub fn validate_name(name: &str) -> CfbResult<()> {
	if name.is_empty() {
		return Err(CfbError::InvalidArgument("name must not be empty".to_owned()));
	}
	if let Some(c) = name.chars().find(|c| INVALID_NAME_CHARACTERS.contains(c)) {
		return Err(CfbError::InvalidArgument(format!("name '{}' contains invalid character '{}'", name, c)));
	}
	if name.encode_utf16().count() > MAX_NAME_LENGTH {
		return Err(CfbError::InvalidArgument(format!("name '{}' is longer than {} UTF-16 code units", name, MAX_NAME_LENGTH)));
	}
	Ok(())
}

fn to_upper(unit: u16) -> u16 {
	match std::char::from_u32(unit as u32) {
		Some(c) => {
			let mut upper = c.to_uppercase();
			match (upper.next(), upper.next()) {
				(Some(u), None) if (u as u32) <= 0xFFFF => u as u32 as u16,
				_ => unit,
			}
		},
		None => unit,
	}
}

/// Sibling order inside a storage: shorter names first, then case-insensitive by code unit.
pub fn compare_names(a: &str, b: &str) -> Ordering {
	let a: Vec<u16> = a.encode_utf16().collect();
	let b: Vec<u16> = b.encode_utf16().collect();
	a.len().cmp(&b.len()).then_with(|| {
		a.iter().map(|&u| to_upper(u)).cmp(b.iter().map(|&u| to_upper(u)))
	})
}

pub fn filetime_now() -> u64 {
	let since_epoch = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
	(since_epoch.as_secs() + FILETIME_UNIX_OFFSET) * 10_000_000 + since_epoch.subsec_nanos() as u64 / 100
}

/// Converts a FILETIME (100ns ticks since 1601) to a `SystemTime`; zero means "not set".
pub fn filetime_to_system_time(filetime: u64) -> Option<SystemTime> {
	if filetime == 0 {
		return None;
	}
	let since_1601 = Duration::new(filetime / 10_000_000, (filetime % 10_000_000) as u32 * 100);
	let offset = Duration::from_secs(FILETIME_UNIX_OFFSET);
	if since_1601 >= offset {
		UNIX_EPOCH.checked_add(since_1601 - offset)
	}
	else {
		UNIX_EPOCH.checked_sub(offset - since_1601)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_entry_round_trip_v3() {
		let mut entry = DirectoryEntry::unallocated(7);
		entry.recycle("Data", EntryType::Stream);
		entry.left_sibling_id = 3;
		entry.start_sector_id = 12;
		entry.stream_length = 10_000;
		entry.clsid[0] = 0x42;
		let bytes = entry.to_bytes(Version::V3).unwrap();
		assert_eq!(bytes.len(), 128);
		assert_eq!(&bytes[64..66], &[10, 0]);
		assert_eq!(bytes[66], 2);
		assert_eq!(bytes[67], 1);

		let parsed = DirectoryEntry::parse(7, &bytes, Version::V3).unwrap();
		assert_eq!(parsed, entry);
	}

	#[test]
	fn test_v3_ignores_upper_length_bits() {
		let mut entry = DirectoryEntry::unallocated(1);
		entry.recycle("s", EntryType::Stream);
		entry.stream_length = 100;
		let mut bytes = entry.to_bytes(Version::V3).unwrap();
		bytes[124] = 0xFF;
		assert_eq!(DirectoryEntry::parse(1, &bytes, Version::V3).unwrap().stream_length, 100);
		assert_eq!(DirectoryEntry::parse(1, &bytes, Version::V4).unwrap().stream_length, 0xFF_0000_0064);
	}

	#[test]
	fn test_unallocated_entry_layout() {
		let bytes = DirectoryEntry::unallocated(0).to_bytes(Version::V4).unwrap();
		assert!(bytes[..68].iter().all(|&b| b == 0));
		assert_eq!(&bytes[68..80], &[0xFF; 12]);
	}

	#[test]
	fn test_parse_rejects_bad_type_and_name_length() {
		let mut bytes = DirectoryEntry::unallocated(0).to_bytes(Version::V3).unwrap();
		bytes[66] = 3;
		assert!(matches!(DirectoryEntry::parse(0, &bytes, Version::V3), Err(CfbError::CorruptFormat(_))));

		let mut bytes = DirectoryEntry::unallocated(0).to_bytes(Version::V3).unwrap();
		bytes[64] = 66;
		assert!(matches!(DirectoryEntry::parse(0, &bytes, Version::V3), Err(CfbError::CorruptFormat(_))));
	}

	#[test]
	fn test_names_compare_by_length_first() {
		assert_eq!(compare_names("Zz", "aaa"), Ordering::Less);
		assert_eq!(compare_names("WordDocument", "1Table"), Ordering::Greater);
		assert_eq!(compare_names("abc", "ABC"), Ordering::Equal);
		assert_eq!(compare_names("abd", "ABC"), Ordering::Greater);
		assert_eq!(compare_names("\u{e9}t\u{e9}", "\u{c9}T\u{c9}"), Ordering::Equal);
	}

	#[test]
	fn test_validate_name() {
		assert!(validate_name("Data").is_ok());
		assert!(validate_name(&"x".repeat(31)).is_ok());
		assert!(matches!(validate_name(&"x".repeat(32)), Err(CfbError::InvalidArgument(_))));
		assert!(matches!(validate_name(""), Err(CfbError::InvalidArgument(_))));
		for name in &["a/b", "a\\b", "a:b", "a!b"] {
			assert!(matches!(validate_name(name), Err(CfbError::InvalidArgument(_))));
		}
	}

	#[test]
	fn test_filetime_conversion() {
		assert_eq!(filetime_to_system_time(0), None);
		let epoch = filetime_to_system_time(FILETIME_UNIX_OFFSET * 10_000_000).unwrap();
		assert_eq!(epoch, UNIX_EPOCH);
		let now = filetime_to_system_time(filetime_now()).unwrap();
		assert!(now.duration_since(UNIX_EPOCH).unwrap().as_secs() > 1_500_000_000);
	}
}
