//! Length-prefixed framing of [`LogPayload`]s.
//!
//! A frame is a 4-byte big-endian length followed by exactly that many bytes of a
//! bincode-serialized [`LogPayload`].

use crate::record::LogPayload;
use std::io::{self, Read, Write};

pub const FRAME_HEADER_LEN: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame truncated: expected {expected} bytes, received {received}")]
    Truncated { expected: u32, received: usize },
    #[error("payload of {0} bytes does not fit in a frame")]
    TooLarge(usize),
    #[error("failed to encode payload: {0}")]
    Encode(#[source] bincode::Error),
    #[error("failed to decode payload: {0}")]
    Decode(#[source] bincode::Error),
    #[error("I/O error on frame stream: {0}")]
    Io(#[from] io::Error),
}

pub fn encode_frame(payload: &LogPayload) -> Result<Vec<u8>, FrameError> {
    let encoded = bincode::serialize(payload).map_err(FrameError::Encode)?;
    let len = u32::try_from(encoded.len()).map_err(|_| FrameError::TooLarge(encoded.len()))?;

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + encoded.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&encoded);
    Ok(frame)
}

pub fn write_frame<W: Write>(mut writer: W, payload: &LogPayload) -> Result<(), FrameError> {
    writer.write_all(&encode_frame(payload)?)?;
    Ok(())
}

/// Read the length header of the next frame.
///
/// Returns `None` when the stream ends before 4 bytes could be read, which is how a peer
/// closing its connection looks like.
pub fn read_frame_header<R: Read>(mut reader: R) -> Result<Option<u32>, FrameError> {
    let mut len_buffer = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut len_buffer) {
        Ok(()) => Ok(Some(u32::from_be_bytes(len_buffer))),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Check that a frame body was fully received and deserialize it.
pub fn decode_body(expected: u32, body: &[u8]) -> Result<LogPayload, FrameError> {
    if body.len() < expected as usize {
        return Err(FrameError::Truncated {
            expected,
            received: body.len(),
        });
    }

    bincode::deserialize(body).map_err(FrameError::Decode)
}

/// Decode the next frame from `reader`.
///
/// Short reads are accumulated until the announced length is reached. The body buffer grows
/// with the bytes actually received, so a bogus length cannot trigger a huge allocation.
pub fn decode_frame<R: Read>(mut reader: R) -> Result<Option<LogPayload>, FrameError> {
    let Some(expected) = read_frame_header(&mut reader)? else {
        return Ok(None);
    };

    let mut body = Vec::new();
    reader.take(expected as u64).read_to_end(&mut body)?;

    decode_body(expected, &body).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{LogLevel, LogRecord, ShutdownRequest};
    use rstest::rstest;
    use std::io::Cursor;

    /// Hands out at most one byte per `read` call, like a congested socket would.
    struct TrickleReader<R>(R);

    impl<R: Read> Read for TrickleReader<R> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let len = buf.len().min(1);
            self.0.read(&mut buf[..len])
        }
    }

    fn sample_record() -> LogRecord {
        LogRecord::new("myLogger", LogLevel::Warn, "disk almost full")
    }

    #[test]
    fn test_header_is_big_endian_length() {
        let payload = LogPayload::Record(sample_record());
        let frame = encode_frame(&payload).unwrap();

        let announced = u32::from_be_bytes(frame[..4].try_into().unwrap());
        assert_eq!(announced as usize, frame.len() - FRAME_HEADER_LEN);
    }

    #[test]
    fn test_record_survives_framing() {
        let record = sample_record();
        let frame = encode_frame(&LogPayload::Record(record.clone())).unwrap();

        let decoded = decode_frame(Cursor::new(frame)).unwrap();
        let Some(LogPayload::Record(decoded)) = decoded else {
            panic!("Expected a record, got {decoded:?}");
        };
        assert_eq!(decoded.logger, record.logger);
        assert_eq!(decoded.level, record.level);
        assert_eq!(decoded.message, record.message);
        assert_eq!(decoded.timestamp_ms, record.timestamp_ms);
    }

    #[test]
    fn test_short_reads_are_accumulated() {
        let payload = LogPayload::Record(LogRecord::new("a", LogLevel::Info, "x".repeat(4096)));
        let frame = encode_frame(&payload).unwrap();

        let decoded = decode_frame(TrickleReader(Cursor::new(frame))).unwrap();
        assert_eq!(decoded, Some(payload));
    }

    #[test]
    fn test_sentinel_is_distinct_from_records() {
        let sentinel = LogPayload::Shutdown(ShutdownRequest {
            requester: "myLogger".to_string(),
            pid: 1234,
        });
        // A record whose message looks like a shutdown request stays a record
        let lookalike = LogPayload::Record(LogRecord::new("myLogger", LogLevel::Info, "Shutdown"));

        let mut stream = encode_frame(&sentinel).unwrap();
        stream.extend(encode_frame(&lookalike).unwrap());
        let mut reader = Cursor::new(stream);

        assert!(decode_frame(&mut reader).unwrap().unwrap().is_shutdown());
        assert!(!decode_frame(&mut reader).unwrap().unwrap().is_shutdown());
        assert_eq!(decode_frame(&mut reader).unwrap(), None);
    }

    #[rstest]
    #[case::empty(&[])]
    #[case::one_byte(&[0])]
    #[case::three_bytes(&[0, 0, 1])]
    fn test_incomplete_header_means_closed(#[case] bytes: &[u8]) {
        assert!(decode_frame(Cursor::new(bytes)).unwrap().is_none());
    }

    #[test]
    fn test_truncated_body_is_a_protocol_error() {
        let mut frame = encode_frame(&LogPayload::Record(sample_record())).unwrap();
        let full_len = frame.len() - FRAME_HEADER_LEN;
        frame.truncate(frame.len() - 5);

        match decode_frame(Cursor::new(frame)) {
            Err(FrameError::Truncated { expected, received }) => {
                assert_eq!(expected as usize, full_len);
                assert_eq!(received, full_len - 5);
            }
            other => panic!("Expected a truncated frame error, got {other:?}"),
        }
    }

    #[test]
    fn test_garbage_body_fails_to_decode() {
        let mut frame = 8u32.to_be_bytes().to_vec();
        frame.extend_from_slice(&[0xff; 8]);

        assert!(matches!(
            decode_frame(Cursor::new(frame)),
            Err(FrameError::Decode(_))
        ));
    }
}
