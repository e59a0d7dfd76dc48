//! Integration test driving a handshake and transport over UDP.

use std::time::Duration;

use anyhow::Result;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use ukey2_crypto::{HandshakeCipher, HandshakeContext};

const VERIFICATION_LEN: usize = 6;

async fn recv(socket: &UdpSocket, buf: &mut [u8]) -> Result<Vec<u8>> {
    let (len, _) = timeout(Duration::from_secs(5), socket.recv_from(buf)).await??;
    Ok(buf[..len].to_vec())
}

/// Full UKEY2 handshake and one message each way between two tasks.
#[tokio::test]
async fn test_handshake_over_udp() -> Result<()> {
    ukey2_common::init_tracing();

    let server_socket = UdpSocket::bind("127.0.0.1:0").await?;
    let server_addr = server_socket.local_addr()?;
    let client_socket = UdpSocket::bind("127.0.0.1:0").await?;
    let client_addr = client_socket.local_addr()?;

    let server = tokio::spawn(async move {
        let mut handshake = HandshakeContext::for_responder(HandshakeCipher::P256Sha512);
        let mut buf = vec![0u8; 4096];

        let client_init = recv(&server_socket, &mut buf).await?;
        handshake.parse_handshake_message(&client_init)?;
        let server_init = handshake.next_handshake_message(None)?;
        server_socket.send_to(&server_init, client_addr).await?;

        let client_finished = recv(&server_socket, &mut buf).await?;
        handshake.parse_handshake_message(&client_finished)?;
        let code = handshake.verification_string(VERIFICATION_LEN)?;
        handshake.verify_handshake()?;
        let mut conn = handshake.into_connection_context()?;

        let request = recv(&server_socket, &mut buf).await?;
        assert_eq!(conn.decode_message_from_peer(&request)?, b"Hello from client!");
        let response = conn.encode_message_to_peer(b"Hello from server!")?;
        server_socket.send_to(&response, client_addr).await?;

        anyhow::Ok(code)
    });

    let mut handshake = HandshakeContext::for_initiator(HandshakeCipher::P256Sha512);
    let mut buf = vec![0u8; 4096];

    let client_init = handshake.next_handshake_message(None)?;
    client_socket.send_to(&client_init, server_addr).await?;
    let server_init = recv(&client_socket, &mut buf).await?;
    handshake.parse_handshake_message(&server_init)?;
    let client_finished = handshake.next_handshake_message(None)?;
    client_socket.send_to(&client_finished, server_addr).await?;

    let code = handshake.verification_string(VERIFICATION_LEN)?;
    handshake.verify_handshake()?;
    let mut conn = handshake.into_connection_context()?;

    let request = conn.encode_message_to_peer(b"Hello from client!")?;
    client_socket.send_to(&request, server_addr).await?;
    let response = recv(&client_socket, &mut buf).await?;
    assert_eq!(conn.decode_message_from_peer(&response)?, b"Hello from server!");

    let server_code = server.await??;
    assert_eq!(code, server_code);
    Ok(())
}
