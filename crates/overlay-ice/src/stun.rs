use std::net::SocketAddr;
use std::time::Duration;

use bytecodec::{DecodeExt, EncodeExt};
use rand::RngCore;
use stun_codec::rfc5389::attributes::XorMappedAddress;
use stun_codec::rfc5389::Attribute;
use stun_codec::{Message, MessageClass, MessageDecoder, MessageEncoder, Method, TransactionId};
use tokio::net::UdpSocket;
use tokio::time::timeout;

const BINDING: Method = Method::new(0x0001).expect("0x0001 is a valid STUN method");

/// Sends a single STUN binding request to `server` and returns the
/// reflexive address the server observed, used to build a
/// server-reflexive ICE candidate.
pub async fn stun_binding_request(
    socket: &UdpSocket,
    server: SocketAddr,
    request_timeout: Duration,
) -> Result<SocketAddr, StunError> {
    let mut transaction_id = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut transaction_id);

    let request = Message::<Attribute>::new(
        MessageClass::Request,
        BINDING,
        TransactionId::new(transaction_id),
    );

    let bytes = MessageEncoder::new()
        .encode_into_bytes(request)
        .map_err(|e| StunError::Codec(e.to_string()))?;

    socket.send_to(&bytes, server).await?;

    let mut buf = [0u8; 512];
    let (n, _from) = timeout(request_timeout, socket.recv_from(&mut buf))
        .await
        .map_err(|_| StunError::TimedOut)??;

    let decoded = MessageDecoder::<Attribute>::new()
        .decode_from_bytes(&buf[..n])
        .map_err(|e| StunError::Codec(e.to_string()))?
        .map_err(|e| StunError::Codec(e.to_string()))?;

    let mapped = decoded
        .get_attribute::<XorMappedAddress>()
        .ok_or(StunError::NoMappedAddress)?;

    Ok(mapped.address())
}

#[derive(Debug, thiserror::Error)]
pub enum StunError {
    #[error("io error talking to stun server: {0}")]
    Io(#[from] std::io::Error),
    #[error("stun codec error: {0}")]
    Codec(String),
    #[error("stun binding request timed out")]
    TimedOut,
    #[error("stun response carried no XOR-MAPPED-ADDRESS attribute")]
    NoMappedAddress,
}
