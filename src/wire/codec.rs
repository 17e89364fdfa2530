//! Async framing over anything `AsyncRead + AsyncWrite` (a `TcpStream` in
//! production, an in-memory duplex in tests): reads/writes one
//! [`FrameHeader`] followed by a JSON payload per [`Message`].

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::TransportError;
use crate::wire::header::{FrameHeader, HEADER_LEN};
use crate::wire::message::*;

/// Caps a single payload so a malformed length field can't drive an
/// unbounded allocation.
pub const MAX_PAYLOAD_BYTES: u32 = 64 * 1024 * 1024;

pub async fn read_message<R: AsyncRead + Unpin>(r: &mut R) -> Result<Message, TransportError> {
    let mut header_buf = [0u8; HEADER_LEN];
    match r.read_exact(&mut header_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(TransportError::ConnectionClosed)
        }
        Err(e) => return Err(TransportError::Io(e)),
    }
    let header = FrameHeader::decode(&header_buf);

    if header.payload_size > MAX_PAYLOAD_BYTES {
        return Err(TransportError::Framing(format!(
            "payload size {} exceeds cap {}",
            header.payload_size, MAX_PAYLOAD_BYTES
        )));
    }

    let kind = MessageKind::from_u32(header.kind)
        .ok_or(TransportError::UnknownKind(header.kind))?;

    let mut payload = vec![0u8; header.payload_size as usize];
    if !payload.is_empty() {
        r.read_exact(&mut payload).await.map_err(TransportError::Io)?;
    }

    decode_body(kind, &payload)
}

fn decode_body(kind: MessageKind, payload: &[u8]) -> Result<Message, TransportError> {
    macro_rules! decode {
        ($variant:expr) => {
            serde_json::from_slice(payload)
                .map($variant)
                .map_err(|source| TransportError::PayloadDecode {
                    kind: kind_name(kind),
                    source,
                })
        };
    }

    match kind {
        MessageKind::None => Err(TransportError::UnknownKind(0)),
        MessageKind::ClientEnroll => decode!(Message::ClientEnroll),
        MessageKind::StartSampling => Ok(Message::StartSampling),
        MessageKind::StopSampling => Ok(Message::StopSampling),
        MessageKind::SetSamplingPeriod => decode!(Message::SetSamplingPeriod),
        MessageKind::RawSample => decode!(Message::RawSample),
        MessageKind::CallCountData => decode!(Message::CallCountData),
        MessageKind::DyLibInfo => decode!(Message::DyLibInfo),
        MessageKind::LoadDyLib => decode!(Message::LoadDyLib),
        MessageKind::ModifyFunction => decode!(Message::ModifyFunction),
        MessageKind::Shutdown => Ok(Message::Shutdown),
    }
}

fn kind_name(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::None => "None",
        MessageKind::ClientEnroll => "ClientEnroll",
        MessageKind::StartSampling => "StartSampling",
        MessageKind::StopSampling => "StopSampling",
        MessageKind::SetSamplingPeriod => "SetSamplingPeriod",
        MessageKind::RawSample => "RawSample",
        MessageKind::CallCountData => "CallCountData",
        MessageKind::DyLibInfo => "DyLibInfo",
        MessageKind::LoadDyLib => "LoadDyLib",
        MessageKind::ModifyFunction => "ModifyFunction",
        MessageKind::Shutdown => "Shutdown",
    }
}

pub async fn write_message<W: AsyncWrite + Unpin>(w: &mut W, msg: &Message) -> Result<(), TransportError> {
    let payload = match msg {
        Message::ClientEnroll(b) => serde_json::to_vec(b),
        Message::StartSampling | Message::StopSampling | Message::Shutdown => Ok(Vec::new()),
        Message::SetSamplingPeriod(b) => serde_json::to_vec(b),
        Message::RawSample(b) => serde_json::to_vec(b),
        Message::CallCountData(b) => serde_json::to_vec(b),
        Message::DyLibInfo(b) => serde_json::to_vec(b),
        Message::LoadDyLib(b) => serde_json::to_vec(b),
        Message::ModifyFunction(b) => serde_json::to_vec(b),
    }
    .map_err(|source| TransportError::PayloadDecode {
        kind: kind_name(msg.kind()),
        source,
    })?;

    let header = FrameHeader::new(msg.kind() as u32, payload.len() as u32);
    w.write_all(&header.encode()).await.map_err(TransportError::Io)?;
    if !payload.is_empty() {
        w.write_all(&payload).await.map_err(TransportError::Io)?;
    }
    w.flush().await.map_err(TransportError::Io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrips_a_payload_bearing_message() {
        let msg = Message::SetSamplingPeriod(SetSamplingPeriodBody { period: 67_867_967 });
        let mut buf = Vec::new();
        write_message(&mut buf, &msg).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let decoded = read_message(&mut cursor).await.unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn roundtrips_a_payload_free_message() {
        let mut buf = Vec::new();
        write_message(&mut buf, &Message::Shutdown).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        assert_eq!(read_message(&mut cursor).await.unwrap(), Message::Shutdown);
    }

    #[tokio::test]
    async fn unknown_kind_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&FrameHeader::new(250, 0).encode());
        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(
            read_message(&mut cursor).await,
            Err(TransportError::UnknownKind(250))
        ));
    }

    #[tokio::test]
    async fn eof_before_header_is_connection_closed() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        assert!(matches!(
            read_message(&mut cursor).await,
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn oversized_payload_declaration_is_rejected_before_allocating() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&FrameHeader::new(MessageKind::RawSample as u32, u32::MAX).encode());
        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(
            read_message(&mut cursor).await,
            Err(TransportError::Framing(_))
        ));
    }
}
