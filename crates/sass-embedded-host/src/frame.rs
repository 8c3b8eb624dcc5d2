//! Length-prefixed frames carried over the compiler's stdio.
//!
//! Each frame is laid out as:
//! ```text
//! varint(len(varint(id)) + len(payload))
//! varint(id)
//! payload
//! ```

use std::io::{Read, Write};

use crate::error::TransportError;
use crate::varint;

/// Wire id for envelope-routed messages whose target is named inside the payload.
pub const ENVELOPE_ID: u32 = 0;

/// Lowest id handed to a session.
pub const FIRST_SESSION_ID: u32 = 1;

/// Highest id handed to a session.
pub const LAST_SESSION_ID: u32 = 0xFFFF_FFFE;

/// Wire id reserved for fatal, connection-wide protocol errors.
pub const FATAL_ID: u32 = 0xFFFF_FFFF;

/// How a frame id is routed by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Payload carries its own correlation id.
    Envelope,
    /// Payload belongs to the session holding this id.
    Session(u32),
    /// Payload is a fatal protocol error for the whole connection.
    Fatal,
}

impl Route {
    /// Classifies a wire id.
    #[must_use]
    pub const fn of(id: u32) -> Self {
        match id {
            ENVELOPE_ID => Self::Envelope,
            FATAL_ID => Self::Fatal,
            other => Self::Session(other),
        }
    }
}

/// One `(id, payload)` unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Correlation id.
    pub id: u32,
    /// Opaque protocol payload.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Creates a frame.
    #[must_use]
    pub const fn new(id: u32, payload: Vec<u8>) -> Self {
        Self { id, payload }
    }
}

/// Encodes a frame header and payload into one contiguous buffer.
///
/// Building the whole frame up front lets the writer emit it with a single
/// `write_all` while holding its lock.
///
/// # Errors
///
/// Returns [`TransportError::PayloadTooLarge`] if the declared length would
/// not fit in 32 bits.
pub fn encode(id: u32, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
    let id_len = varint::encoded_len(id);
    let declared = id_len
        .checked_add(payload.len())
        .and_then(|total| u32::try_from(total).ok())
        .ok_or(TransportError::PayloadTooLarge { len: payload.len() })?;

    let mut buffer =
        Vec::with_capacity(varint::encoded_len(declared) + id_len + payload.len());
    varint::encode(declared, &mut buffer);
    varint::encode(id, &mut buffer);
    buffer.extend_from_slice(payload);
    Ok(buffer)
}

/// Writes one frame and flushes the writer.
///
/// # Errors
///
/// Returns [`TransportError::Io`] if writing fails.
pub fn write<W: Write + ?Sized>(
    writer: &mut W,
    id: u32,
    payload: &[u8],
) -> Result<(), TransportError> {
    let buffer = encode(id, payload)?;
    writer.write_all(&buffer)?;
    writer.flush()?;
    Ok(())
}

/// Reads one frame (blocks until complete).
///
/// # Errors
///
/// Returns [`TransportError::Closed`] on a clean end of stream between
/// frames, [`TransportError::LengthMismatch`] if the header is inconsistent,
/// and [`TransportError::Io`] for any other read failure.
pub fn read<R: Read + ?Sized>(reader: &mut R) -> Result<Frame, TransportError> {
    let (declared, _) = varint::read(reader)?;
    let (id, id_len) = match varint::read(reader) {
        Err(TransportError::Closed) => {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream ended inside a frame header",
            )));
        }
        other => other?,
    };

    let payload_len = usize::try_from(declared)
        .ok()
        .and_then(|total| total.checked_sub(id_len))
        .ok_or(TransportError::LengthMismatch { declared, id_len })?;

    let mut payload = vec![0u8; payload_len];
    reader.read_exact(&mut payload)?;
    Ok(Frame { id, payload })
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use rstest::rstest;

    use super::*;

    fn round_trip(id: u32, payload: &[u8]) -> Frame {
        let mut buffer = Vec::new();
        write(&mut buffer, id, payload).expect("write failed");
        read(&mut Cursor::new(buffer)).expect("read failed")
    }

    #[rstest]
    #[case(ENVELOPE_ID, 0)]
    #[case(FIRST_SESSION_ID, 1)]
    #[case(LAST_SESSION_ID, 0)]
    #[case(FATAL_ID, 1)]
    #[case(FIRST_SESSION_ID, 20_000)]
    #[case(LAST_SESSION_ID, 20_000)]
    fn round_trips_boundary_ids_and_sizes(#[case] id: u32, #[case] len: usize) {
        let payload: Vec<u8> = (0..len).map(|index| (index % 251) as u8).collect();

        let frame = round_trip(id, &payload);

        assert_eq!(frame, Frame::new(id, payload));
    }

    #[rstest]
    fn header_counts_id_and_payload() {
        let buffer = encode(300, b"abc").expect("encode failed");

        // declared = 2 (id varint) + 3 (payload)
        assert_eq!(buffer, vec![0x05, 0xAC, 0x02, b'a', b'b', b'c']);
    }

    #[rstest]
    fn three_byte_length_prefix_round_trips() {
        let payload = vec![b'x'; 0x4000];
        let buffer = encode(7, &payload).expect("encode failed");

        assert_eq!(buffer.get(..3), Some(&[0x81, 0x80, 0x01][..]));
        assert_eq!(read(&mut Cursor::new(buffer)).expect("read failed").payload, payload);
    }

    #[rstest]
    fn reads_consecutive_frames_in_order() {
        let mut buffer = Vec::new();
        write(&mut buffer, 1, b"first").expect("write failed");
        write(&mut buffer, 2, b"second").expect("write failed");
        let mut cursor = Cursor::new(buffer);

        assert_eq!(read(&mut cursor).expect("read failed"), Frame::new(1, b"first".to_vec()));
        assert_eq!(read(&mut cursor).expect("read failed"), Frame::new(2, b"second".to_vec()));
        assert!(matches!(read(&mut cursor), Err(TransportError::Closed)));
    }

    #[rstest]
    fn rejects_length_shorter_than_id() {
        // declared 1 byte, but id 300 needs two.
        let mut cursor = Cursor::new(vec![0x01, 0xAC, 0x02]);

        assert!(matches!(
            read(&mut cursor),
            Err(TransportError::LengthMismatch { declared: 1, id_len: 2 })
        ));
    }

    #[rstest]
    fn truncated_payload_is_io_error() {
        let mut cursor = Cursor::new(vec![0x05, 0x01, b'a']);

        assert!(matches!(read(&mut cursor), Err(TransportError::Io(_))));
    }

    #[rstest]
    fn stream_ending_after_length_is_io_error() {
        let mut cursor = Cursor::new(vec![0x05]);

        assert!(matches!(read(&mut cursor), Err(TransportError::Io(_))));
    }

    #[rstest]
    #[case(0, Route::Envelope)]
    #[case(1, Route::Session(1))]
    #[case(LAST_SESSION_ID, Route::Session(LAST_SESSION_ID))]
    #[case(FATAL_ID, Route::Fatal)]
    fn classifies_routes(#[case] id: u32, #[case] expected: Route) {
        assert_eq!(Route::of(id), expected);
    }
}
