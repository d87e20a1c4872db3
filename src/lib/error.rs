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

use std::io::{self, ErrorKind};
use thiserror::Error;

/// Result type used throughout the library.
pub type CfbResult<T> = Result<T, CfbError>;

/// Everything that can go wrong while reading or writing a compound file.
#[derive(Error, Debug)]
pub enum CfbError {
	#[error("I/O error: {0}")]
	Io(#[from] io::Error),

	/// The 512-byte header is not a valid CFBF header.
	#[error("Malformed header: {0}")]
	MalformedHeader(String),

	/// A sector chain, the DIFAT or the directory tree is damaged.
	#[error("Corrupt compound file: {0}")]
	CorruptFormat(String),

	#[error("Invalid argument: {0}")]
	InvalidArgument(String),

	#[error("An entry named '{0}' already exists")]
	DuplicateName(String),

	#[error("Entry not found: {0}")]
	NotFound(String),

	#[error("Operation not supported: {0}")]
	NotSupported(String),

	#[error("Cannot seek before the beginning of the stream")]
	InvalidSeek,

	#[error("The compound file has already been closed")]
	ObjectDisposed,
}

impl CfbError {
	pub(crate) fn corrupt(message: impl Into<String>) -> CfbError {
		CfbError::CorruptFormat(message.into())
	}
}

impl From<CfbError> for io::Error {
	fn from(error: CfbError) -> io::Error {
		let kind = match error {
			CfbError::Io(inner) => return inner,
			CfbError::MalformedHeader(_) | CfbError::CorruptFormat(_) => ErrorKind::InvalidData,
			CfbError::InvalidArgument(_) | CfbError::InvalidSeek => ErrorKind::InvalidInput,
			CfbError::DuplicateName(_) => ErrorKind::AlreadyExists,
			CfbError::NotFound(_) => ErrorKind::NotFound,
			CfbError::NotSupported(_) => ErrorKind::PermissionDenied,
			CfbError::ObjectDisposed => ErrorKind::Other,
		};
		io::Error::new(kind, error)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_error_display() {
		let error = CfbError::DuplicateName("Data".to_owned());
		assert_eq!(error.to_string(), "An entry named 'Data' already exists");

		let error = CfbError::corrupt("chain is cyclic");
		assert_eq!(error.to_string(), "Corrupt compound file: chain is cyclic");
	}

	#[test]
	fn test_io_error_conversion() {
		let error: io::Error = CfbError::InvalidSeek.into();
		assert_eq!(error.kind(), ErrorKind::InvalidInput);

		let error: io::Error = CfbError::corrupt("bad").into();
		assert_eq!(error.kind(), ErrorKind::InvalidData);

		let inner = io::Error::new(ErrorKind::UnexpectedEof, "eof");
		let error: io::Error = CfbError::from(inner).into();
		assert_eq!(error.kind(), ErrorKind::UnexpectedEof);
	}
}
