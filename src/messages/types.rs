// External crate imports
use bytes::{Buf, BytesMut};

// Internal crate imports
use crate::errors::Error;

/// Postgres data type mappings
/// used in RowDescription ('T') message.
pub enum DataType {
    Text,
    Int4,
    Int8,
    Bool,
}

impl From<&DataType> for i32 {
    fn from(data_type: &DataType) -> i32 {
        match data_type {
            DataType::Text => 25,
            DataType::Int4 => 23,
            DataType::Int8 => 20,
            DataType::Bool => 16,
        }
    }
}

/// Trait for reading strings from BytesMut
pub trait BytesMutReader {
    fn read_string(&mut self) -> Result<String, Error>;
}

impl BytesMutReader for BytesMut {
    /// Should only be used when reading strings from the message protocol.
    /// Can be used to read multiple strings from the same message which are separated by the null byte
    fn read_string(&mut self) -> Result<String, Error> {
        let null_index = self.iter().position(|&byte| byte == b'\0');

        match null_index {
            Some(index) => {
                let string_bytes = self.split_to(index + 1);
                Ok(String::from_utf8_lossy(&string_bytes[..string_bytes.len() - 1]).to_string())
            }
            None => Err(Error::ParseBytesError("Could not read string".to_string())),
        }
    }
}

/// Read the columns of a DataRow ('D') body. NULL columns are `None`.
pub fn read_data_row(mut body: BytesMut) -> Result<Vec<Option<String>>, Error> {
    if body.remaining() < 2 {
        return Err(Error::ParseBytesError("DataRow too short".to_string()));
    }
    let columns = body.get_i16();
    let mut row = Vec::with_capacity(columns.max(0) as usize);
    for _ in 0..columns {
        if body.remaining() < 4 {
            return Err(Error::ParseBytesError("DataRow column truncated".to_string()));
        }
        let len = body.get_i32();
        if len < 0 {
            row.push(None);
            continue;
        }
        let len = len as usize;
        if body.remaining() < len {
            return Err(Error::ParseBytesError("DataRow value truncated".to_string()));
        }
        let value = body.split_to(len);
        row.push(Some(String::from_utf8_lossy(&value).to_string()));
    }
    Ok(row)
}

/// Convert a NUL-terminated byte vector (e.g. a password message) to a string.
pub fn vec_to_string(vec: Vec<u8>) -> Result<String, Error> {
    match std::ffi::CStr::from_bytes_until_nul(&vec) {
        Ok(token) => match token.to_str() {
            Ok(token) => Ok(token.to_string()),
            Err(err) => Err(Error::ParseBytesError(err.to_string())),
        },
        Err(err) => Err(Error::ParseBytesError(err.to_string())),
    }
}
