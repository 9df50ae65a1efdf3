use crate::error::NetError;

// ─── Wire classifiers ─────────────────────────────────────────

/// One-byte classifier carried as the first field of every frame payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataMode {
    Binary = 0,
    File = 1,
    Message = 2,
    Connection = 3,
}

impl DataMode {
    pub fn from_byte(byte: u8) -> Option<DataMode> {
        match byte {
            0 => Some(DataMode::Binary),
            1 => Some(DataMode::File),
            2 => Some(DataMode::Message),
            3 => Some(DataMode::Connection),
            _ => None,
        }
    }
}

/// Sub-classifier of `File` payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileMode {
    Start = 0,
    Success = 1,
    Failure = 2,
}

impl FileMode {
    pub fn from_byte(byte: u8) -> Option<FileMode> {
        match byte {
            0 => Some(FileMode::Start),
            1 => Some(FileMode::Success),
            2 => Some(FileMode::Failure),
            _ => None,
        }
    }
}

// ─── Connection lifecycle ─────────────────────────────────────

/// Lifecycle state of one connection. Transitions are monotonic forward only;
/// `Expired` is terminal and permits no further I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectCondition {
    /// Fresh pipeline, no socket yet.
    None,
    /// Socket up, handshake pending.
    Waiting,
    /// Authenticated; data I/O permitted.
    Confirmed,
    /// Terminal.
    Expired,
}

// ─── Length-prefixed fields ───────────────────────────────────

/// Append one TLV field: `u64_le(len) || bytes`. Every field the engine
/// concatenates goes through this, including one-byte tags, so both peers
/// share a single framing scheme for inner payloads.
pub fn append_field(buf: &mut Vec<u8>, field: &[u8]) {
    buf.extend_from_slice(&(field.len() as u64).to_le_bytes());
    buf.extend_from_slice(field);
}

/// Sequential reader over TLV fields.
pub struct FieldReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> FieldReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        FieldReader { data, offset: 0 }
    }

    /// Read the next field, advancing past it.
    pub fn next_field(&mut self) -> Result<&'a [u8], NetError> {
        let header_end = self
            .offset
            .checked_add(8)
            .filter(|end| *end <= self.data.len())
            .ok_or(NetError::Malformed("truncated field length"))?;
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&self.data[self.offset..header_end]);
        let len = u64::from_le_bytes(len_bytes) as usize;

        let field_end = header_end
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(NetError::Malformed("truncated field body"))?;
        let field = &self.data[header_end..field_end];
        self.offset = field_end;
        Ok(field)
    }

    /// Read a field that must be exactly one byte.
    pub fn next_byte(&mut self) -> Result<u8, NetError> {
        let field = self.next_field()?;
        if field.len() != 1 {
            return Err(NetError::Malformed("expected a one-byte field"));
        }
        Ok(field[0])
    }

    /// Read a field that must be a little-endian u64.
    pub fn next_u64(&mut self) -> Result<u64, NetError> {
        let field = self.next_field()?;
        let bytes: [u8; 8] = field
            .try_into()
            .map_err(|_| NetError::Malformed("expected an eight-byte field"))?;
        Ok(u64::from_le_bytes(bytes))
    }

    /// Read a field that must be UTF-8.
    pub fn next_string(&mut self) -> Result<String, NetError> {
        let field = self.next_field()?;
        String::from_utf8(field.to_vec()).map_err(|_| NetError::Malformed("field is not UTF-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_bytes_round_trip() {
        for mode in [
            DataMode::Binary,
            DataMode::File,
            DataMode::Message,
            DataMode::Connection,
        ] {
            assert_eq!(DataMode::from_byte(mode as u8), Some(mode));
        }
        assert_eq!(DataMode::from_byte(4), None);
    }

    #[test]
    fn conditions_are_ordered() {
        assert!(ConnectCondition::None < ConnectCondition::Waiting);
        assert!(ConnectCondition::Waiting < ConnectCondition::Confirmed);
        assert!(ConnectCondition::Confirmed < ConnectCondition::Expired);
    }

    #[test]
    fn fields_round_trip() {
        let mut buf = Vec::new();
        append_field(&mut buf, b"hello");
        append_field(&mut buf, &[7]);
        append_field(&mut buf, &42u64.to_le_bytes());

        let mut reader = FieldReader::new(&buf);
        assert_eq!(reader.next_string().unwrap(), "hello");
        assert_eq!(reader.next_byte().unwrap(), 7);
        assert_eq!(reader.next_u64().unwrap(), 42);
        assert!(reader.next_field().is_err());
    }

    #[test]
    fn truncated_fields_are_rejected() {
        let mut buf = Vec::new();
        append_field(&mut buf, b"payload");
        // Claimed length runs past the end of the buffer.
        let mut reader = FieldReader::new(&buf[..buf.len() - 2]);
        assert!(reader.next_field().is_err());

        // Length header itself cut short.
        let mut reader = FieldReader::new(&buf[..4]);
        assert!(reader.next_field().is_err());
    }
}
