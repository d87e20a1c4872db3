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

// Also see: [MS-CFB]: Compound File Binary File Format specifications, https://msdn.microsoft.com/en-us/library/dd942138.aspx

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Write};
use crate::error::{CfbError, CfbResult};

/// Reserved sector ids. Every id above `MAXIMUM` is a sentinel.
pub mod sector_type {
	pub const MAXIMUM: u32 = 0xFFFFFFFA;
	pub const DIFAT: u32 = 0xFFFFFFFC;
	pub const FAT: u32 = 0xFFFFFFFD;
	pub const END_OF_CHAIN: u32 = 0xFFFFFFFE;
	pub const FREE: u32 = 0xFFFFFFFF;
}

/// Reserved directory entry ids.
pub mod stream_id {
	pub const MAXIMUM: u32 = 0xFFFFFFFA;
	pub const NO_STREAM: u32 = 0xFFFFFFFF;
}

pub const HEADER_SIZE: usize = 512;
pub const SIGNATURE: [u8; 8] = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];
pub const BYTE_ORDER_MARK: u16 = 0xFFFE;
pub const MINOR_VERSION: u16 = 0x003E;
pub const MINI_SECTOR_SHIFT: u16 = 6;
pub const MINI_SECTOR_SIZE: u32 = 1 << MINI_SECTOR_SHIFT;
/// Streams shorter than this live in the mini-stream. Independent of the sector size.
pub const MINI_STREAM_CUTOFF: u32 = 4096;
/// Number of FAT sector locations stored in the header itself.
pub const HEADER_DIFAT_ENTRIES: usize = 109;
pub const DIRECTORY_ENTRY_SIZE: u32 = 128;

/// Major version of a compound file; decides the sector size.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Version {
	/// 512-byte sectors.
	V3 = 3,
	/// 4096-byte sectors.
	V4 = 4,
}

impl Version {
	pub fn from_major(major_version: u16) -> Option<Version> {
		match major_version {
			3 => Some(Version::V3),
			4 => Some(Version::V4),
			_ => None,
		}
	}

	pub fn sector_shift(self) -> u16 {
		match self {
			Version::V3 => 9,
			Version::V4 => 12,
		}
	}

	pub fn sector_size(self) -> u32 {
		1 << self.sector_shift()
	}
}

/// A regular sector; sector #0 starts right after the header sector.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Sector {
	pub id: u32,
	pub length: u32,
}

impl Sector {
	pub fn new(id: u32, length: u32) -> Sector {
		Sector { id, length }
	}

	pub fn is_valid(&self) -> bool {
		self.id <= sector_type::MAXIMUM
	}

	pub fn position(&self) -> CfbResult<u64> {
		if !self.is_valid() {
			return Err(CfbError::corrupt(format!("sector id {:#X} is not a valid sector", self.id)));
		}
		Ok((self.id as u64 + 1) * self.length as u64)
	}

	pub fn end_position(&self) -> CfbResult<u64> {
		Ok(self.position()? + self.length as u64)
	}
}

/// A 64-byte sector inside the mini-stream; positions are relative to the mini-stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MiniSector {
	pub id: u32,
}

impl MiniSector {
	pub fn new(id: u32) -> MiniSector {
		MiniSector { id }
	}

	pub fn position(&self) -> CfbResult<u64> {
		if self.id > sector_type::MAXIMUM {
			return Err(CfbError::corrupt(format!("mini-sector id {:#X} is not a valid mini-sector", self.id)));
		}
		Ok(self.id as u64 * MINI_SECTOR_SIZE as u64)
	}

	pub fn end_position(&self) -> CfbResult<u64> {
		Ok(self.position()? + MINI_SECTOR_SIZE as u64)
	}
}

/// The header of a CFBF file, including the 109 DIFAT entries that trail it.
#[derive(Clone)]
pub struct Header {
	pub minor_version: u16,
	pub version: Version,
	pub sector_shift: u16,
	pub mini_sector_shift: u16,
	pub number_of_directory_sectors: u32,
	pub number_of_fat_sectors: u32,
	pub first_directory_sector_id: u32,
	pub transaction_signature: u32,
	pub first_mini_fat_sector_id: u32,
	pub number_of_mini_fat_sectors: u32,
	pub first_difat_sector_id: u32,
	pub number_of_difat_sectors: u32,
	pub difat: [u32; HEADER_DIFAT_ENTRIES],
}

impl Header {
	/// A header for an empty file: no FAT, no directory, all DIFAT slots free.
	pub fn new(version: Version) -> Header {
		Header {
			minor_version: MINOR_VERSION,
			version,
			sector_shift: version.sector_shift(),
			mini_sector_shift: MINI_SECTOR_SHIFT,
			number_of_directory_sectors: 0,
			number_of_fat_sectors: 0,
			first_directory_sector_id: sector_type::END_OF_CHAIN,
			transaction_signature: 0,
			first_mini_fat_sector_id: sector_type::END_OF_CHAIN,
			number_of_mini_fat_sectors: 0,
			first_difat_sector_id: sector_type::END_OF_CHAIN,
			number_of_difat_sectors: 0,
			difat: [sector_type::FREE; HEADER_DIFAT_ENTRIES],
		}
	}

	pub fn sector_size(&self) -> u32 {
		1 << self.sector_shift
	}

	/// FAT entries held by one FAT sector, also the number of u32 slots in any sector.
	pub fn fat_entries_per_sector(&self) -> u32 {
		self.sector_size() / 4
	}

	/// FAT sector locations held by one DIFAT sector (the last slot links the next DIFAT sector).
	pub fn difat_entries_per_sector(&self) -> u32 {
		self.fat_entries_per_sector() - 1
	}

	pub fn directory_entries_per_sector(&self) -> u32 {
		self.sector_size() / DIRECTORY_ENTRY_SIZE
	}

	pub fn parse(buffer: &[u8; HEADER_SIZE]) -> CfbResult<Header> {
		if buffer[0..8] != SIGNATURE {
			return Err(CfbError::MalformedHeader("invalid signature".to_owned()));
		}
		if buffer[8..24].iter().any(|&b| b != 0) {
			return Err(CfbError::MalformedHeader("header CLSID must be zero".to_owned()));
		}

		let mut cursor = Cursor::new(&buffer[24..]);
		let minor_version = cursor.read_u16::<LittleEndian>()?;
		let major_version = cursor.read_u16::<LittleEndian>()?;
		let version = Version::from_major(major_version)
			.ok_or_else(|| CfbError::MalformedHeader(format!("unsupported major version {}", major_version)))?;
		let byte_order = cursor.read_u16::<LittleEndian>()?;
		if byte_order != BYTE_ORDER_MARK {
			return Err(CfbError::MalformedHeader(format!("unsupported byte order {:#06X}", byte_order)));
		}
		let sector_shift = cursor.read_u16::<LittleEndian>()?;
		if sector_shift != version.sector_shift() {
			return Err(CfbError::MalformedHeader(format!("sector shift {} is invalid for version {}", sector_shift, major_version)));
		}
		let mini_sector_shift = cursor.read_u16::<LittleEndian>()?;
		if mini_sector_shift != MINI_SECTOR_SHIFT {
			return Err(CfbError::MalformedHeader(format!("mini-sector shift must be {}, found {}", MINI_SECTOR_SHIFT, mini_sector_shift)));
		}
		// skip reserved (6 bytes)
		cursor.set_position(cursor.position() + 6);
		let number_of_directory_sectors = cursor.read_u32::<LittleEndian>()?;
		let number_of_fat_sectors = cursor.read_u32::<LittleEndian>()?;
		let first_directory_sector_id = cursor.read_u32::<LittleEndian>()?;
		let transaction_signature = cursor.read_u32::<LittleEndian>()?;
		let mini_stream_cutoff = cursor.read_u32::<LittleEndian>()?;
		if mini_stream_cutoff != MINI_STREAM_CUTOFF {
			return Err(CfbError::MalformedHeader(format!("mini-stream cutoff must be {}, found {}", MINI_STREAM_CUTOFF, mini_stream_cutoff)));
		}
		let first_mini_fat_sector_id = cursor.read_u32::<LittleEndian>()?;
		let number_of_mini_fat_sectors = cursor.read_u32::<LittleEndian>()?;
		let first_difat_sector_id = cursor.read_u32::<LittleEndian>()?;
		let number_of_difat_sectors = cursor.read_u32::<LittleEndian>()?;
		let mut difat = [sector_type::FREE; HEADER_DIFAT_ENTRIES];
		for entry in difat.iter_mut() {
			*entry = cursor.read_u32::<LittleEndian>()?;
		}

		Ok(Header {
			minor_version,
			version,
			sector_shift,
			mini_sector_shift,
			number_of_directory_sectors,
			number_of_fat_sectors,
			first_directory_sector_id,
			transaction_signature,
			first_mini_fat_sector_id,
			number_of_mini_fat_sectors,
			first_difat_sector_id,
			number_of_difat_sectors,
			difat,
		})
	}

	pub fn to_bytes(&self) -> CfbResult<Vec<u8>> {
		let mut buffer = Vec::with_capacity(HEADER_SIZE);
		buffer.write_all(&SIGNATURE)?;
		buffer.write_all(&[0u8; 16])?;
		buffer.write_u16::<LittleEndian>(self.minor_version)?;
		buffer.write_u16::<LittleEndian>(self.version as u16)?;
		buffer.write_u16::<LittleEndian>(BYTE_ORDER_MARK)?;
		buffer.write_u16::<LittleEndian>(self.sector_shift)?;
		buffer.write_u16::<LittleEndian>(self.mini_sector_shift)?;
		buffer.write_all(&[0u8; 6])?;
		buffer.write_u32::<LittleEndian>(self.number_of_directory_sectors)?;
		buffer.write_u32::<LittleEndian>(self.number_of_fat_sectors)?;
		buffer.write_u32::<LittleEndian>(self.first_directory_sector_id)?;
		buffer.write_u32::<LittleEndian>(0)?; // transaction signature is unused
		buffer.write_u32::<LittleEndian>(MINI_STREAM_CUTOFF)?;
		buffer.write_u32::<LittleEndian>(self.first_mini_fat_sector_id)?;
		buffer.write_u32::<LittleEndian>(self.number_of_mini_fat_sectors)?;
		buffer.write_u32::<LittleEndian>(self.first_difat_sector_id)?;
		buffer.write_u32::<LittleEndian>(self.number_of_difat_sectors)?;
		for &entry in self.difat.iter() {
			buffer.write_u32::<LittleEndian>(entry)?;
		}
		Ok(buffer)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn header_bytes(header: &Header) -> [u8; HEADER_SIZE] {
		let mut buffer = [0u8; HEADER_SIZE];
		buffer.copy_from_slice(&header.to_bytes().unwrap());
		buffer
	}

	#[test]
	fn test_new_header_round_trips() {
		let mut header = Header::new(Version::V4);
		header.number_of_fat_sectors = 3;
		header.difat[0] = 7;
		let bytes = header_bytes(&header);
		assert_eq!(&bytes[0..8], &SIGNATURE);
		assert_eq!(bytes[26], 4);
		assert_eq!(bytes[30], 12);

		let parsed = Header::parse(&bytes).unwrap();
		assert_eq!(parsed.version, Version::V4);
		assert_eq!(parsed.sector_size(), 4096);
		assert_eq!(parsed.number_of_fat_sectors, 3);
		assert_eq!(parsed.difat[0], 7);
		assert_eq!(parsed.difat[1], sector_type::FREE);
		assert_eq!(parsed.first_directory_sector_id, sector_type::END_OF_CHAIN);
	}

	#[test]
	fn test_header_rejects_bad_signature() {
		let mut bytes = header_bytes(&Header::new(Version::V3));
		bytes[0] = 0;
		match Header::parse(&bytes) {
			Err(CfbError::MalformedHeader(_)) => (),
			_ => panic!("signature not checked"),
		}
	}

	#[test]
	fn test_header_rejects_nonzero_clsid() {
		let mut bytes = header_bytes(&Header::new(Version::V3));
		bytes[12] = 1;
		assert!(matches!(Header::parse(&bytes), Err(CfbError::MalformedHeader(_))));
	}

	#[test]
	fn test_header_rejects_sector_shift_of_other_version() {
		let mut bytes = header_bytes(&Header::new(Version::V3));
		bytes[30] = 12;
		assert!(matches!(Header::parse(&bytes), Err(CfbError::MalformedHeader(_))));
	}

	#[test]
	fn test_header_rejects_bad_version_and_cutoff() {
		let mut bytes = header_bytes(&Header::new(Version::V3));
		bytes[26] = 5;
		assert!(matches!(Header::parse(&bytes), Err(CfbError::MalformedHeader(_))));

		let mut bytes = header_bytes(&Header::new(Version::V3));
		bytes[57] = 0x20;
		assert!(matches!(Header::parse(&bytes), Err(CfbError::MalformedHeader(_))));

		let mut bytes = header_bytes(&Header::new(Version::V3));
		bytes[28] = 0xFF;
		assert!(matches!(Header::parse(&bytes), Err(CfbError::MalformedHeader(_))));
	}

	#[test]
	fn test_sector_positions() {
		assert_eq!(Sector::new(0, 512).position().unwrap(), 512);
		assert_eq!(Sector::new(3, 4096).position().unwrap(), 4 * 4096);
		assert_eq!(Sector::new(3, 512).end_position().unwrap(), 5 * 512);
		assert!(Sector::new(sector_type::END_OF_CHAIN, 512).position().is_err());
		assert_eq!(MiniSector::new(2).position().unwrap(), 128);
	}
}
