//! PostgreSQL wire protocol, the slice the brokering proxy speaks.
//!
//! Message layout per <https://www.postgresql.org/docs/current/protocol-message-formats.html>.
//! Only the startup and authentication phases are interpreted; once
//! authentication completes the proxy splices bytes verbatim.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{PwdbError, PwdbResult};

const PROTOCOL_VERSION: i32 = 196_608; // 3.0
const SSL_REQUEST_CODE: i32 = 80_877_103;

/// Hard cap on a single parsed message; anything bigger is hostile.
const MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

/// The first message on a connection carries no type byte.
#[derive(Debug, Clone, PartialEq)]
pub enum InitialMessage {
    SslRequest,
    Startup(StartupMessage),
}

/// Startup parameters as `key, value` pairs, `user` first by convention.
#[derive(Debug, Clone, PartialEq)]
pub struct StartupMessage {
    pub params: Vec<(String, String)>,
}

impl StartupMessage {
    pub fn user(&self) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == "user")
            .map(|(_, v)| v.as_str())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut body = BytesMut::new();
        body.put_i32(PROTOCOL_VERSION);
        for (key, value) in &self.params {
            body.put_slice(key.as_bytes());
            body.put_u8(0);
            body.put_slice(value.as_bytes());
            body.put_u8(0);
        }
        body.put_u8(0);
        let mut out = BytesMut::with_capacity(body.len() + 4);
        out.put_i32(body.len() as i32 + 4);
        out.extend_from_slice(&body);
        out.to_vec()
    }
}

/// Authentication requests the proxy understands ('R' messages).
#[derive(Debug, Clone, PartialEq)]
pub enum AuthenticationRequest {
    Ok,
    CleartextPassword,
    Sasl { mechanisms: Vec<String> },
    SaslContinue { data: Vec<u8> },
    SaslFinal { data: Vec<u8> },
    Unsupported { code: i32 },
}

/// A typed backend message header + body.
#[derive(Debug)]
pub struct BackendMessage {
    pub tag: u8,
    pub body: Bytes,
}

/// Read the untyped first message of a session.
pub async fn read_initial<S: AsyncRead + Unpin + ?Sized>(stream: &mut S) -> PwdbResult<InitialMessage> {
    let len = stream.read_i32().await.map_err(PwdbError::io)? as usize;
    if !(8..=MAX_MESSAGE_LEN).contains(&len) {
        return Err(PwdbError::Protocol(format!("bad startup length {}", len)));
    }
    let mut body = vec![0u8; len - 4];
    stream.read_exact(&mut body).await.map_err(PwdbError::io)?;
    let mut buf = Bytes::from(body);
    let code = buf.get_i32();

    if code == SSL_REQUEST_CODE {
        return Ok(InitialMessage::SslRequest);
    }
    if code != PROTOCOL_VERSION {
        return Err(PwdbError::Protocol(format!("unsupported protocol {:#x}", code)));
    }

    let mut params = Vec::new();
    loop {
        let key = read_cstring(&mut buf)?;
        if key.is_empty() {
            break;
        }
        let value = read_cstring(&mut buf)?;
        params.push((key, value));
    }
    Ok(InitialMessage::Startup(StartupMessage { params }))
}

/// Read one typed backend/frontend message.
pub async fn read_message<S: AsyncRead + Unpin + ?Sized>(stream: &mut S) -> PwdbResult<BackendMessage> {
    let tag = stream.read_u8().await.map_err(PwdbError::io)?;
    let len = stream.read_i32().await.map_err(PwdbError::io)? as usize;
    if !(4..=MAX_MESSAGE_LEN).contains(&len) {
        return Err(PwdbError::Protocol(format!("bad message length {}", len)));
    }
    let mut body = vec![0u8; len - 4];
    stream.read_exact(&mut body).await.map_err(PwdbError::io)?;
    Ok(BackendMessage {
        tag,
        body: Bytes::from(body),
    })
}

/// Interpret an 'R' body.
pub fn parse_authentication(mut body: Bytes) -> PwdbResult<AuthenticationRequest> {
    if body.remaining() < 4 {
        return Err(PwdbError::Protocol("truncated authentication request".into()));
    }
    let code = body.get_i32();
    Ok(match code {
        0 => AuthenticationRequest::Ok,
        3 => AuthenticationRequest::CleartextPassword,
        10 => {
            let mut mechanisms = Vec::new();
            loop {
                let mechanism = read_cstring(&mut body)?;
                if mechanism.is_empty() {
                    break;
                }
                mechanisms.push(mechanism);
            }
            AuthenticationRequest::Sasl { mechanisms }
        }
        11 => AuthenticationRequest::SaslContinue { data: body.to_vec() },
        12 => AuthenticationRequest::SaslFinal { data: body.to_vec() },
        other => AuthenticationRequest::Unsupported { code: other },
    })
}

/// Human-readable text of an 'E' body (severity + message fields).
pub fn parse_error_response(mut body: Bytes) -> String {
    let mut message = String::new();
    while body.remaining() > 0 {
        let field = body.get_u8();
        if field == 0 {
            break;
        }
        match read_cstring(&mut body) {
            Ok(value) if field == b'M' => message = value,
            Ok(_) => {}
            Err(_) => break,
        }
    }
    if message.is_empty() {
        "unknown server error".into()
    } else {
        message
    }
}

pub async fn write_ssl_request<S: AsyncWrite + Unpin + ?Sized>(stream: &mut S) -> PwdbResult<()> {
    let mut out = BytesMut::with_capacity(8);
    out.put_i32(8);
    out.put_i32(SSL_REQUEST_CODE);
    stream.write_all(&out).await.map_err(PwdbError::io)?;
    stream.flush().await.map_err(PwdbError::io)
}

/// 'p' with a null-terminated password (cleartext delegation).
pub async fn write_password<S: AsyncWrite + Unpin + ?Sized>(stream: &mut S, password: &str) -> PwdbResult<()> {
    let mut out = BytesMut::new();
    out.put_u8(b'p');
    out.put_i32(password.len() as i32 + 4 + 1);
    out.put_slice(password.as_bytes());
    out.put_u8(0);
    stream.write_all(&out).await.map_err(PwdbError::io)?;
    stream.flush().await.map_err(PwdbError::io)
}

/// 'p' carrying `SASLInitialResponse { mechanism, initial-response }`.
pub async fn write_sasl_initial_response<S: AsyncWrite + Unpin + ?Sized>(
    stream: &mut S,
    mechanism: &str,
    response: &[u8],
) -> PwdbResult<()> {
    let mut out = BytesMut::new();
    out.put_u8(b'p');
    out.put_i32((4 + mechanism.len() + 1 + 4 + response.len()) as i32);
    out.put_slice(mechanism.as_bytes());
    out.put_u8(0);
    out.put_i32(response.len() as i32);
    out.put_slice(response);
    stream.write_all(&out).await.map_err(PwdbError::io)?;
    stream.flush().await.map_err(PwdbError::io)
}

/// 'p' carrying a bare SASL response.
pub async fn write_sasl_response<S: AsyncWrite + Unpin + ?Sized>(stream: &mut S, response: &[u8]) -> PwdbResult<()> {
    let mut out = BytesMut::new();
    out.put_u8(b'p');
    out.put_i32(response.len() as i32 + 4);
    out.put_slice(response);
    stream.write_all(&out).await.map_err(PwdbError::io)?;
    stream.flush().await.map_err(PwdbError::io)
}

/// Forward a typed message verbatim.
pub async fn write_message<S: AsyncWrite + Unpin + ?Sized>(stream: &mut S, msg: &BackendMessage) -> PwdbResult<()> {
    let mut out = BytesMut::with_capacity(msg.body.len() + 5);
    out.put_u8(msg.tag);
    out.put_i32(msg.body.len() as i32 + 4);
    out.put_slice(&msg.body);
    stream.write_all(&out).await.map_err(PwdbError::io)?;
    stream.flush().await.map_err(PwdbError::io)
}

pub async fn write_terminate<S: AsyncWrite + Unpin + ?Sized>(stream: &mut S) -> PwdbResult<()> {
    stream.write_all(&[b'X', 0, 0, 0, 4]).await.map_err(PwdbError::io)?;
    stream.flush().await.map_err(PwdbError::io)
}

fn read_cstring(buf: &mut Bytes) -> PwdbResult<String> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| PwdbError::Protocol("unterminated string".into()))?;
    let out = String::from_utf8(buf.split_to(end).to_vec())
        .map_err(|_| PwdbError::Protocol("non-utf8 string".into()))?;
    buf.advance(1); // the terminator
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_startup_roundtrip() {
        let startup = StartupMessage {
            params: vec![
                ("user".into(), "dbadmin".into()),
                ("database".into(), "postgres".into()),
            ],
        };
        let encoded = startup.encode();
        let mut cursor = std::io::Cursor::new(encoded);
        match read_initial(&mut cursor).await.unwrap() {
            InitialMessage::Startup(decoded) => {
                assert_eq!(decoded, startup);
                assert_eq!(decoded.user(), Some("dbadmin"));
            }
            other => panic!("unexpected initial message {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ssl_request_detected() {
        let mut encoded = Vec::new();
        write_ssl_request(&mut encoded).await.unwrap();
        let mut cursor = std::io::Cursor::new(encoded);
        assert_eq!(read_initial(&mut cursor).await.unwrap(), InitialMessage::SslRequest);
    }

    #[test]
    fn test_parse_sasl_mechanisms() {
        let mut body = BytesMut::new();
        body.put_i32(10);
        body.put_slice(b"SCRAM-SHA-256\0SCRAM-SHA-256-PLUS\0\0");
        match parse_authentication(body.freeze()).unwrap() {
            AuthenticationRequest::Sasl { mechanisms } => {
                assert_eq!(mechanisms, vec!["SCRAM-SHA-256", "SCRAM-SHA-256-PLUS"]);
            }
            other => panic!("unexpected auth request {:?}", other),
        }
    }

    #[test]
    fn test_parse_auth_ok_and_unsupported() {
        let mut ok = BytesMut::new();
        ok.put_i32(0);
        assert_eq!(parse_authentication(ok.freeze()).unwrap(), AuthenticationRequest::Ok);

        let mut md5 = BytesMut::new();
        md5.put_i32(5);
        md5.put_slice(&[1, 2, 3, 4]);
        assert!(matches!(
            parse_authentication(md5.freeze()).unwrap(),
            AuthenticationRequest::Unsupported { code: 5 }
        ));
    }

    #[test]
    fn test_parse_error_response_message_field() {
        let mut body = BytesMut::new();
        body.put_u8(b'S');
        body.put_slice(b"FATAL\0");
        body.put_u8(b'M');
        body.put_slice(b"password authentication failed\0");
        body.put_u8(0);
        assert_eq!(
            parse_error_response(body.freeze()),
            "password authentication failed"
        );
    }
}
