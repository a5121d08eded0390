//! The in-process PostgreSQL brokering proxy.
//!
//! RDS and Cloud SQL IAM tokens cannot be pushed through the client's own
//! authentication exchange, so the agent terminates the client's wire
//! protocol on an in-memory listener (never a real socket), authenticates
//! to the real server itself with the token, and then splices bytes.

use bzero_datachannel::Tomb;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::protocol::{self, AuthenticationRequest, InitialMessage};
use crate::scram::ScramClient;
use crate::tls;
use crate::{PwdbError, PwdbResult};

const SCRAM_MECHANISM: &str = "SCRAM-SHA-256";

/// The credential delegated into the server's authentication flow.
#[derive(Debug, Clone)]
pub struct DelegatedAuth {
    pub db_user: String,
    pub token: String,
}

/// One proxied session: a client byte stream on the near side, the real
/// database on the far side.
pub struct BrokeringProxy {
    pub upstream_host: String,
    pub upstream_port: u16,
    pub auth: DelegatedAuth,
    /// Re-encrypt the onward hop (RDS). The token is the credential, so the
    /// upstream certificate is not verified.
    pub tls_upstream: bool,
}

impl BrokeringProxy {
    /// Run the session to completion. Returns once either side closes or
    /// the tomb dies; authentication failures surface as errors so the
    /// caller can emit a terminal frame before tearing the channel down.
    pub async fn run<C>(self, mut client: C, tomb: Tomb) -> PwdbResult<()>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
    {
        // The client may probe for SSL; the agent terminates it here and
        // the onward hop is re-encrypted separately.
        let mut startup = match protocol::read_initial(&mut client).await? {
            InitialMessage::SslRequest => {
                client.write_all(b"N").await.map_err(PwdbError::io)?;
                client.flush().await.map_err(PwdbError::io)?;
                match protocol::read_initial(&mut client).await? {
                    InitialMessage::Startup(startup) => startup,
                    InitialMessage::SslRequest => {
                        return Err(PwdbError::Protocol("repeated SSLRequest".into()));
                    }
                }
            }
            InitialMessage::Startup(startup) => startup,
        };

        // The IAM token is bound to the delegated role, not whatever the
        // operator typed locally.
        let mut replaced_user = false;
        for (key, value) in &mut startup.params {
            if key == "user" {
                *value = self.auth.db_user.clone();
                replaced_user = true;
            }
        }
        if !replaced_user {
            startup
                .params
                .insert(0, ("user".into(), self.auth.db_user.clone()));
        }

        let tcp = TcpStream::connect((self.upstream_host.as_str(), self.upstream_port))
            .await
            .map_err(PwdbError::io)?;

        let mut upstream: Box<dyn Stream> = if self.tls_upstream {
            Box::new(self.upgrade_upstream(tcp).await?)
        } else {
            Box::new(tcp)
        };

        upstream
            .write_all(&startup.encode())
            .await
            .map_err(PwdbError::io)?;
        upstream.flush().await.map_err(PwdbError::io)?;

        self.authenticate(&mut client, &mut upstream).await?;

        // Authenticated: transparent byte splicing from here on.
        tokio::select! {
            result = tokio::io::copy_bidirectional(&mut client, &mut upstream) => {
                result.map_err(PwdbError::io)?;
            }
            _ = tomb.dying() => {
                let _ = protocol::write_terminate(&mut upstream).await;
            }
        }
        Ok(())
    }

    async fn upgrade_upstream(
        &self,
        mut tcp: TcpStream,
    ) -> PwdbResult<tokio_rustls::client::TlsStream<TcpStream>> {
        protocol::write_ssl_request(&mut tcp).await?;
        let mut answer = [0u8; 1];
        tcp.read_exact(&mut answer).await.map_err(PwdbError::io)?;
        if answer[0] != b'S' {
            return Err(PwdbError::Protocol("upstream refused TLS".into()));
        }
        let config = tls::insecure_upstream_config();
        let connector = tokio_rustls::TlsConnector::from(std::sync::Arc::new(config));
        let server_name = rustls_pki_types::ServerName::try_from(self.upstream_host.clone())
            .map_err(|_| PwdbError::Tls(format!("bad server name {}", self.upstream_host)))?;
        connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| PwdbError::Tls(e.to_string()))
    }

    /// Drive the server's authentication request with the delegated
    /// credential, forwarding nothing of the exchange to the client except
    /// the final `AuthenticationOk`.
    async fn authenticate<C, U>(&self, client: &mut C, upstream: &mut U) -> PwdbResult<()>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
        U: AsyncRead + AsyncWrite + Unpin + Send + ?Sized,
    {
        let mut scram: Option<ScramClient> = None;
        loop {
            let msg = protocol::read_message(upstream).await?;
            match msg.tag {
                b'R' => match protocol::parse_authentication(msg.body.clone())? {
                    AuthenticationRequest::Ok => {
                        protocol::write_message(client, &msg).await?;
                        return Ok(());
                    }
                    AuthenticationRequest::CleartextPassword => {
                        protocol::write_password(upstream, &self.auth.token).await?;
                    }
                    AuthenticationRequest::Sasl { mechanisms } => {
                        if !mechanisms.iter().any(|m| m == SCRAM_MECHANISM) {
                            return Err(PwdbError::AuthenticationFailed(format!(
                                "server offers no {}",
                                SCRAM_MECHANISM
                            )));
                        }
                        let mut state = ScramClient::new(&self.auth.token);
                        let client_first = state.client_first();
                        protocol::write_sasl_initial_response(
                            upstream,
                            SCRAM_MECHANISM,
                            client_first.as_bytes(),
                        )
                        .await?;
                        scram = Some(state);
                    }
                    AuthenticationRequest::SaslContinue { data } => {
                        let state = scram
                            .as_mut()
                            .ok_or_else(|| PwdbError::Protocol("SASLContinue before SASL".into()))?;
                        let server_first = String::from_utf8(data)
                            .map_err(|_| PwdbError::Scram("non-utf8 server-first".into()))?;
                        let client_final = state.handle_server_first(&server_first)?;
                        protocol::write_sasl_response(upstream, client_final.as_bytes()).await?;
                    }
                    AuthenticationRequest::SaslFinal { data } => {
                        let state = scram
                            .as_ref()
                            .ok_or_else(|| PwdbError::Protocol("SASLFinal before SASL".into()))?;
                        let server_final = String::from_utf8(data)
                            .map_err(|_| PwdbError::Scram("non-utf8 server-final".into()))?;
                        state
                            .verify_server_final(&server_final)
                            .map_err(|e| PwdbError::AuthenticationFailed(e.to_string()))?;
                    }
                    AuthenticationRequest::Unsupported { code } => {
                        return Err(PwdbError::AuthenticationFailed(format!(
                            "unsupported authentication request {}",
                            code
                        )));
                    }
                },
                b'E' => {
                    return Err(PwdbError::AuthenticationFailed(
                        protocol::parse_error_response(msg.body),
                    ));
                }
                // notices and parameter statuses pass straight through
                _ => protocol::write_message(client, &msg).await?,
            }
        }
    }
}

trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::StartupMessage;
    use crate::scram::testutil::ReferenceServer;
    use bytes::{Buf, BufMut, BytesMut};
    use tokio::net::TcpListener;

    const TOKEN: &str = "TOKEN123";

    async fn write_auth(stream: &mut TcpStream, code: i32, data: &[u8]) {
        let mut out = BytesMut::new();
        out.put_u8(b'R');
        out.put_i32(data.len() as i32 + 8);
        out.put_i32(code);
        out.put_slice(data);
        stream.write_all(&out).await.unwrap();
    }

    /// Fake RDS: demands SCRAM-SHA-256, verifies the proof for TOKEN123,
    /// then echoes spliced bytes.
    async fn spawn_fake_rds(expect_user: &'static str) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            let startup = match protocol::read_initial(&mut stream).await.unwrap() {
                InitialMessage::Startup(startup) => startup,
                other => panic!("expected startup, got {:?}", other),
            };
            assert_eq!(startup.user(), Some(expect_user));

            write_auth(&mut stream, 10, b"SCRAM-SHA-256\0\0").await;

            // SASLInitialResponse
            let msg = protocol::read_message(&mut stream).await.unwrap();
            assert_eq!(msg.tag, b'p');
            let mut body = msg.body;
            let nul = body.iter().position(|&b| b == 0).unwrap();
            let mechanism = String::from_utf8(body.split_to(nul).to_vec()).unwrap();
            assert_eq!(mechanism, "SCRAM-SHA-256");
            body.advance(1);
            let len = body.get_i32() as usize;
            let client_first = String::from_utf8(body.split_to(len).to_vec()).unwrap();

            let mut reference = ReferenceServer::new(TOKEN, b"somesalt", 4096);
            let server_first = reference.server_first(&client_first);
            write_auth(&mut stream, 11, server_first.as_bytes()).await;

            // SASLResponse
            let msg = protocol::read_message(&mut stream).await.unwrap();
            assert_eq!(msg.tag, b'p');
            let client_final = String::from_utf8(msg.body.to_vec()).unwrap();
            let server_final = reference
                .handle_client_final(&client_first, &server_first, &client_final)
                .expect("client proof should verify");
            write_auth(&mut stream, 12, server_final.as_bytes()).await;
            write_auth(&mut stream, 0, &[]).await;

            // ReadyForQuery, then echo everything
            stream.write_all(&[b'Z', 0, 0, 0, 5, b'I']).await.unwrap();
            let mut buf = [0u8; 1024];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => {
                        if stream.write_all(&buf[..n]).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });
        addr
    }

    fn startup_bytes(user: &str) -> Vec<u8> {
        StartupMessage {
            params: vec![
                ("user".into(), user.into()),
                ("database".into(), "postgres".into()),
            ],
        }
        .encode()
    }

    #[tokio::test]
    async fn test_scram_delegation_then_splice() {
        let addr = spawn_fake_rds("dbadmin").await;
        let (mut client_io, proxy_io) = tokio::io::duplex(64 * 1024);

        let proxy = BrokeringProxy {
            upstream_host: addr.ip().to_string(),
            upstream_port: addr.port(),
            auth: DelegatedAuth {
                db_user: "dbadmin".into(),
                token: TOKEN.into(),
            },
            tls_upstream: false,
        };
        let tomb = Tomb::new();
        let handle = tokio::spawn(proxy.run(proxy_io, tomb.clone()));

        // client probes for SSL first; the proxy terminates it with 'N'
        protocol::write_ssl_request(&mut client_io).await.unwrap();
        let mut answer = [0u8; 1];
        client_io.read_exact(&mut answer).await.unwrap();
        assert_eq!(answer[0], b'N');

        client_io.write_all(&startup_bytes("dbadmin")).await.unwrap();

        // AuthenticationOk reaches the client without any SASL noise
        let msg = protocol::read_message(&mut client_io).await.unwrap();
        assert_eq!(msg.tag, b'R');
        assert_eq!(
            protocol::parse_authentication(msg.body).unwrap(),
            AuthenticationRequest::Ok
        );
        let ready = protocol::read_message(&mut client_io).await.unwrap();
        assert_eq!(ready.tag, b'Z');

        // spliced: bytes written now are echoed by the fake server
        client_io.write_all(b"SELECT 1;").await.unwrap();
        let mut echo = [0u8; 9];
        client_io.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"SELECT 1;");

        tomb.kill(None);
        let _ = handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_cleartext_delegation() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = protocol::read_initial(&mut stream).await.unwrap();
            write_auth(&mut stream, 3, &[]).await;
            let msg = protocol::read_message(&mut stream).await.unwrap();
            assert_eq!(msg.tag, b'p');
            // password is null-terminated
            assert_eq!(&msg.body[..msg.body.len() - 1], TOKEN.as_bytes());
            write_auth(&mut stream, 0, &[]).await;
        });

        let (mut client_io, proxy_io) = tokio::io::duplex(64 * 1024);
        let proxy = BrokeringProxy {
            upstream_host: addr.ip().to_string(),
            upstream_port: addr.port(),
            auth: DelegatedAuth {
                db_user: "iam-user".into(),
                token: TOKEN.into(),
            },
            tls_upstream: false,
        };
        let handle = tokio::spawn(proxy.run(proxy_io, Tomb::new()));

        client_io.write_all(&startup_bytes("iam-user")).await.unwrap();
        let msg = protocol::read_message(&mut client_io).await.unwrap();
        assert_eq!(msg.tag, b'R');
        drop(client_io);
        let _ = handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_auth_failure_surfaces_as_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = protocol::read_initial(&mut stream).await.unwrap();
            let mut out = BytesMut::new();
            out.put_u8(b'E');
            let body = b"SFATAL\0Mpassword authentication failed\0\0";
            out.put_i32(body.len() as i32 + 4);
            out.put_slice(body);
            stream.write_all(&out).await.unwrap();
        });

        let (mut client_io, proxy_io) = tokio::io::duplex(64 * 1024);
        let proxy = BrokeringProxy {
            upstream_host: addr.ip().to_string(),
            upstream_port: addr.port(),
            auth: DelegatedAuth {
                db_user: "dbadmin".into(),
                token: "WRONG".into(),
            },
            tls_upstream: false,
        };
        let handle = tokio::spawn(proxy.run(proxy_io, Tomb::new()));
        client_io.write_all(&startup_bytes("dbadmin")).await.unwrap();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, PwdbError::AuthenticationFailed(m) if m.contains("password authentication failed")));
    }
}
