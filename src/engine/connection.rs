//! Connection bring-up: SSL negotiation, startup, authentication, through to
//! the first `ReadyForQuery`.
//!
//! Each phase (SSL negotiation, startup, auth, ready) is a plain async
//! function directly against [`Transport`], rather than a sans-IO
//! `step()`/`Action` state machine: this engine only ever drives one
//! connection bring-up per instance and is itself the sole async driver, so
//! there is no second caller to justify that indirection.

use crate::engine::auth::{self, ScramClient};
use crate::engine::transport::Transport;
use crate::error::{Error, Result};
use crate::protocol::backend::auth::{AuthenticationMessage, BackendKeyData, ParameterStatus, ReadyForQuery};
use crate::protocol::backend::RawMessage;
use crate::protocol::frontend;
use crate::protocol::types::TransactionStatus;
use crate::uri::{ConnectionUri, SslMode};
use crate::BufferSet;

/// Everything learned during bring-up that the engine keeps afterward.
pub struct BringUpResult {
    pub backend_pid: u32,
    pub backend_secret: u32,
    pub parameter_statuses: Vec<(String, String)>,
    pub transaction_status: TransactionStatus,
}

/// Run the full bring-up sequence: optional TLS negotiation, startup
/// message, authentication, and the parameter/ready phase, returning once
/// the first `ReadyForQuery` arrives.
///
/// `authenticated`, if given, is resolved the moment `AuthenticationOk`
/// arrives, before the parameter/ready phase even starts.
pub async fn bring_up(
    transport: &mut Transport,
    uri: &ConnectionUri,
    env: &dyn crate::env::Environment,
    mut authenticated: Option<tokio::sync::oneshot::Sender<()>>,
) -> Result<BringUpResult> {
    negotiate_tls(transport, uri).await?;
    send_startup(transport, uri).await?;

    let mut buffers = BufferSet::new();
    loop {
        transport.read_message(&mut buffers).await?;
        let raw = RawMessage::new(buffers.type_byte, &buffers.read_buffer);

        match raw.type_byte {
            crate::protocol::backend::msg_type::AUTHENTICATION => {
                let msg = AuthenticationMessage::parse(raw.payload)?;
                if handle_auth_message(transport, uri, env, msg, &mut authenticated).await? {
                    // AuthenticationOk observed; proceed to parameter/ready phase.
                    break;
                }
            }
            crate::protocol::backend::msg_type::ERROR_RESPONSE => {
                let err = crate::protocol::backend::error::ErrorResponse::parse(raw.payload)?;
                return Err(err.into_error());
            }
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected message 0x{other:02x} during authentication"
                )));
            }
        }
    }

    await_ready(transport).await
}

async fn negotiate_tls(transport: &mut Transport, uri: &ConnectionUri) -> Result<()> {
    if uri.ssl_mode == SslMode::Disable {
        return Ok(());
    }

    let mut buf = Vec::new();
    frontend::write_ssl_request(&mut buf);
    transport.write_all(&buf).await?;
    transport.flush().await?;

    let response = transport.read_u8_checked().await?;

    match response {
        Some(b'S') => {
            #[cfg(feature = "tls")]
            {
                replace_with_tls(transport, &uri.host).await
            }
            #[cfg(not(feature = "tls"))]
            {
                Err(Error::Config(
                    "server accepted TLS but this build has the \"tls\" feature disabled".into(),
                ))
            }
        }
        Some(b'N') => {
            if uri.ssl_mode == SslMode::Require {
                Err(Error::TlsRefused)
            } else {
                Ok(())
            }
        }
        Some(other) => Err(Error::UnexpectedSslResponse(other)),
        None => Err(Error::ServerClosedDuringSsl),
    }
}

#[cfg(feature = "tls")]
async fn replace_with_tls(transport: &mut Transport, host: &str) -> Result<()> {
    // `Transport::upgrade_to_tls` consumes by value; swap a placeholder in
    // so we can move the real transport out through a mutable reference.
    let taken = std::mem::replace(transport, Transport::Tcp(placeholder_reader()));
    *transport = taken.upgrade_to_tls(host).await?;
    Ok(())
}

#[cfg(feature = "tls")]
fn placeholder_reader() -> tokio::io::BufReader<tokio::net::TcpStream> {
    unreachable!("placeholder transport is replaced immediately and never read from")
}

async fn send_startup(transport: &mut Transport, uri: &ConnectionUri) -> Result<()> {
    let mut params: Vec<(String, String)> = vec![
        ("user".to_string(), uri.user.clone()),
        ("database".to_string(), uri.dbname.clone()),
    ];
    params.extend(uri.startup_params());

    let pairs: Vec<(&str, &str)> = params.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();

    let mut buf = Vec::new();
    frontend::write_startup(&mut buf, &pairs);
    transport.write_all(&buf).await?;
    transport.flush().await
}

/// Returns `Ok(true)` once `AuthenticationOk` has been observed.
async fn handle_auth_message(
    transport: &mut Transport,
    uri: &ConnectionUri,
    env: &dyn crate::env::Environment,
    msg: AuthenticationMessage<'_>,
    authenticated: &mut Option<tokio::sync::oneshot::Sender<()>>,
) -> Result<bool> {
    match msg {
        AuthenticationMessage::Ok => {
            if let Some(tx) = authenticated.take() {
                let _ = tx.send(());
            }
            Ok(true)
        }
        AuthenticationMessage::CleartextPassword => {
            let password = auth::resolve_password(env, uri).unwrap_or_default();
            let mut buf = Vec::new();
            frontend::write_password(&mut buf, &password);
            transport.write_all(&buf).await?;
            transport.flush().await?;
            Ok(false)
        }
        AuthenticationMessage::Md5Password { salt } => {
            let password = auth::resolve_password(env, uri).unwrap_or_default();
            let hashed = frontend::md5_password(&uri.user, &password, &salt);
            let mut buf = Vec::new();
            frontend::write_password(&mut buf, &hashed);
            transport.write_all(&buf).await?;
            transport.flush().await?;
            Ok(false)
        }
        AuthenticationMessage::Sasl { mechanisms } => {
            if !mechanisms.contains(&"SCRAM-SHA-256") {
                return Err(Error::AuthMechanismUnsupported(mechanisms.join(",")));
            }
            let password = auth::resolve_password(env, uri).unwrap_or_default();
            let mut scram = ScramClient::new(&password);
            let client_first = scram.client_first_message();

            let mut buf = Vec::new();
            frontend::write_sasl_initial_response(&mut buf, "SCRAM-SHA-256", client_first.as_bytes());
            transport.write_all(&buf).await?;
            transport.flush().await?;

            run_scram_continuation(transport, scram).await?;
            Ok(false)
        }
        AuthenticationMessage::SaslContinue { .. } | AuthenticationMessage::SaslFinal { .. } => {
            Err(Error::Protocol(
                "SASL continuation arrived outside of the SASL exchange".into(),
            ))
        }
        AuthenticationMessage::KerberosV5
        | AuthenticationMessage::Gss
        | AuthenticationMessage::GssContinue { .. }
        | AuthenticationMessage::Sspi => Err(Error::AuthMechanismUnsupported(format!(
            "{msg:?} is not implemented"
        ))),
    }
}

async fn run_scram_continuation(transport: &mut Transport, mut scram: ScramClient) -> Result<()> {
    let mut buffers = BufferSet::new();

    // AuthenticationSASLContinue
    transport.read_message(&mut buffers).await?;
    if buffers.type_byte != crate::protocol::backend::msg_type::AUTHENTICATION {
        return Err(Error::Protocol(
            "expected AuthenticationSASLContinue".into(),
        ));
    }
    let msg = AuthenticationMessage::parse(&buffers.read_buffer)?;
    let AuthenticationMessage::SaslContinue { data } = msg else {
        return Err(Error::Protocol(format!(
            "expected AuthenticationSASLContinue, got {msg:?}"
        )));
    };
    let server_first = simdutf8::compat::from_utf8(data)
        .map_err(|e| Error::Protocol(format!("SCRAM server-first is not valid UTF-8: {e}")))?;
    let client_final = scram.process_server_first(server_first)?;

    let mut buf = Vec::new();
    frontend::write_sasl_response(&mut buf, client_final.as_bytes());
    transport.write_all(&buf).await?;
    transport.flush().await?;

    // AuthenticationSASLFinal
    transport.read_message(&mut buffers).await?;
    if buffers.type_byte != crate::protocol::backend::msg_type::AUTHENTICATION {
        return Err(Error::Protocol("expected AuthenticationSASLFinal".into()));
    }
    let msg = AuthenticationMessage::parse(&buffers.read_buffer)?;
    let AuthenticationMessage::SaslFinal { data } = msg else {
        return Err(Error::Protocol(format!(
            "expected AuthenticationSASLFinal, got {msg:?}"
        )));
    };
    let server_final = simdutf8::compat::from_utf8(data)
        .map_err(|e| Error::Protocol(format!("SCRAM server-final is not valid UTF-8: {e}")))?;
    scram.verify_server_final(server_final)?;

    Ok(())
}

async fn await_ready(transport: &mut Transport) -> Result<BringUpResult> {
    let mut buffers = BufferSet::new();
    let mut parameter_statuses = Vec::new();
    let mut backend_pid = 0;
    let mut backend_secret = 0;

    loop {
        transport.read_message(&mut buffers).await?;
        match buffers.type_byte {
            crate::protocol::backend::msg_type::PARAMETER_STATUS => {
                let status = ParameterStatus::parse(&buffers.read_buffer)?;
                parameter_statuses.push((status.name.to_string(), status.value.to_string()));
            }
            crate::protocol::backend::msg_type::BACKEND_KEY_DATA => {
                let key_data = BackendKeyData::parse(&buffers.read_buffer)?;
                backend_pid = key_data.process_id();
                backend_secret = key_data.secret();
            }
            crate::protocol::backend::msg_type::READY_FOR_QUERY => {
                let ready = ReadyForQuery::parse(&buffers.read_buffer)?;
                let transaction_status = ready
                    .transaction_status()
                    .ok_or_else(|| Error::Protocol("unknown ReadyForQuery status byte".into()))?;
                return Ok(BringUpResult {
                    backend_pid,
                    backend_secret,
                    parameter_statuses,
                    transaction_status,
                });
            }
            crate::protocol::backend::msg_type::NOTICE_RESPONSE => {
                tracing::debug!("notice during connection bring-up");
            }
            crate::protocol::backend::msg_type::NEGOTIATE_PROTOCOL_VERSION => {
                return Err(Error::Protocol(
                    "server requires protocol features this engine does not support".into(),
                ));
            }
            crate::protocol::backend::msg_type::ERROR_RESPONSE => {
                let err = crate::protocol::backend::error::ErrorResponse::parse(&buffers.read_buffer)?;
                return Err(err.into_error());
            }
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected message 0x{other:02x} before ReadyForQuery"
                )));
            }
        }
    }
}

impl Transport {
    /// Read one byte, returning `None` on a clean EOF instead of erroring.
    async fn read_u8_checked(&mut self) -> Result<Option<u8>> {
        match self.read_u8().await {
            Ok(byte) => Ok(Some(byte)),
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::StubEnvironment;
    use std::collections::HashMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn backend_message(type_byte: u8, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![type_byte];
        let len = (payload.len() + 4) as i32;
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    fn authentication(auth_type: i32) -> Vec<u8> {
        backend_message(b'R', &auth_type.to_be_bytes())
    }

    fn parameter_status(name: &str, value: &str) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(name.as_bytes());
        payload.push(0);
        payload.extend_from_slice(value.as_bytes());
        payload.push(0);
        backend_message(b'S', &payload)
    }

    fn backend_key_data(pid: u32, secret: u32) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&pid.to_be_bytes());
        payload.extend_from_slice(&secret.to_be_bytes());
        backend_message(b'K', &payload)
    }

    fn ready_for_query(status: u8) -> Vec<u8> {
        backend_message(b'Z', &[status])
    }

    /// Read and discard one frontend message from `server`, returning its
    /// type byte and payload.
    async fn read_frontend_message(server: &mut DuplexStream) -> (u8, Vec<u8>) {
        let mut type_byte = [0u8; 1];
        server.read_exact(&mut type_byte).await.unwrap();
        let mut len_buf = [0u8; 4];
        server.read_exact(&mut len_buf).await.unwrap();
        let len = i32::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len - 4];
        server.read_exact(&mut payload).await.unwrap();
        (type_byte[0], payload)
    }

    fn stub_env() -> StubEnvironment {
        StubEnvironment {
            vars: HashMap::new(),
            home: None,
        }
    }

    #[tokio::test]
    async fn bring_up_completes_cleartext_auth_handshake() {
        let (mut transport, mut server) = Transport::test_pair();
        let uri = ConnectionUri {
            ssl_mode: SslMode::Disable,
            user: "alice".to_string(),
            password: Some("s3cret".to_string()),
            ..ConnectionUri::default()
        };
        let env = stub_env();

        let server_task = tokio::spawn(async move {
            // Startup packet: consume and ignore.
            read_frontend_message_without_type_byte(&mut server).await;

            server
                .write_all(&authentication(crate::protocol::backend::auth::auth_type::CLEARTEXT_PASSWORD))
                .await
                .unwrap();

            let (type_byte, payload) = read_frontend_message(&mut server).await;
            assert_eq!(type_byte, b'p');
            assert_eq!(&payload[..payload.len() - 1], b"s3cret");

            let mut reply = Vec::new();
            reply.extend_from_slice(&authentication(crate::protocol::backend::auth::auth_type::OK));
            reply.extend_from_slice(&parameter_status("server_version", "16.0"));
            reply.extend_from_slice(&backend_key_data(42, 99));
            reply.extend_from_slice(&ready_for_query(b'I'));
            server.write_all(&reply).await.unwrap();
        });

        let result = bring_up(&mut transport, &uri, &env, None).await.unwrap();
        assert_eq!(result.backend_pid, 42);
        assert_eq!(result.backend_secret, 99);
        assert_eq!(result.transaction_status, TransactionStatus::Idle);
        server_task.await.unwrap();
    }

    /// Like [`read_frontend_message`] but for the startup packet, which has
    /// no leading type byte.
    async fn read_frontend_message_without_type_byte(server: &mut DuplexStream) {
        let mut len_buf = [0u8; 4];
        server.read_exact(&mut len_buf).await.unwrap();
        let len = i32::from_be_bytes(len_buf) as usize;
        let mut rest = vec![0u8; len - 4];
        server.read_exact(&mut rest).await.unwrap();
    }

    #[tokio::test]
    async fn bring_up_resolves_authenticated_future_before_ready_for_query() {
        let (mut transport, mut server) = Transport::test_pair();
        let uri = ConnectionUri {
            ssl_mode: SslMode::Disable,
            ..ConnectionUri::default()
        };
        let env = stub_env();
        let (tx, rx) = tokio::sync::oneshot::channel();

        let server_task = tokio::spawn(async move {
            read_frontend_message_without_type_byte(&mut server).await;
            let mut reply = Vec::new();
            reply.extend_from_slice(&authentication(crate::protocol::backend::auth::auth_type::OK));
            reply.extend_from_slice(&backend_key_data(1, 2));
            reply.extend_from_slice(&ready_for_query(b'I'));
            server.write_all(&reply).await.unwrap();
        });

        bring_up(&mut transport, &uri, &env, Some(tx)).await.unwrap();
        // Bring-up only returns after ReadyForQuery, so by now the
        // authenticated future, resolved earlier on AuthenticationOk, must
        // already be ready.
        assert!(rx.await.is_ok());
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn bring_up_surfaces_a_server_error_during_startup() {
        let (mut transport, mut server) = Transport::test_pair();
        let uri = ConnectionUri {
            ssl_mode: SslMode::Disable,
            ..ConnectionUri::default()
        };
        let env = stub_env();

        let server_task = tokio::spawn(async move {
            read_frontend_message_without_type_byte(&mut server).await;
            let mut payload = Vec::new();
            payload.push(b'S');
            payload.extend_from_slice(b"FATAL");
            payload.push(0);
            payload.push(b'C');
            payload.extend_from_slice(b"28000");
            payload.push(0);
            payload.push(b'M');
            payload.extend_from_slice(b"no password was provided");
            payload.push(0);
            payload.push(0);
            server.write_all(&backend_message(b'E', &payload)).await.unwrap();
        });

        let err = bring_up(&mut transport, &uri, &env, None).await.unwrap_err();
        assert!(err.sqlstate().is_some());
        server_task.await.unwrap();
    }
}
