//! Async frame I/O over any byte stream.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;
use crate::{Frame, Header, HEADER_SIZE, MAX_PAYLOAD_SIZE};

/// Read one frame: exact header, then exact payload.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, ProtocolError> {
    let mut head = [0u8; HEADER_SIZE];
    reader.read_exact(&mut head).await?;
    let header = Header::unpack(&head)?;

    let len = header.payload_len as usize;
    if len > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge {
            size: len,
            max: MAX_PAYLOAD_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Frame { header, payload })
}

/// Write one frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), ProtocolError> {
    writer.write_all(&frame.header.pack()?).await?;
    writer.write_all(&frame.payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::JobId;
    use crate::types::{HelloPayload, LogClose};
    use crate::OpCode;

    #[tokio::test]
    async fn frame_roundtrip_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let hello = HelloPayload {
            secret: "s1".to_string(),
            protocol_version: crate::PROTOCOL_VERSION,
        };
        let frame = Frame::json(OpCode::Hello, JobId::nil(), &hello).unwrap();
        write_frame(&mut client, &frame).await.unwrap();

        let got = read_frame(&mut server).await.unwrap();
        assert_eq!(got.header.opcode, OpCode::Hello);
        let parsed: HelloPayload = got.parse().unwrap();
        assert_eq!(parsed.secret, "s1");
    }

    #[tokio::test]
    async fn job_scoped_frame_carries_job_id() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let job_id = JobId::generate();
        let frame = Frame::json(OpCode::LogClose, job_id, &LogClose { job_id }).unwrap();
        write_frame(&mut client, &frame).await.unwrap();

        let got = read_frame(&mut server).await.unwrap();
        assert_eq!(got.header.job_id, job_id);
        assert_eq!(got.header.opcode, OpCode::LogClose);
    }

    #[tokio::test]
    async fn truncated_stream_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let frame = Frame::new(OpCode::Heartbeat, JobId::nil(), vec![1, 2, 3, 4]).unwrap();
        let encoded = frame.encode().unwrap();
        // Drop the last two payload bytes, then close the write side.
        tokio::io::AsyncWriteExt::write_all(&mut client, &encoded[..encoded.len() - 2])
            .await
            .unwrap();
        drop(client);

        assert!(read_frame(&mut server).await.is_err());
    }
}
