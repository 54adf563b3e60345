//! 工厂端到端行为：各描述符往返、一次性请求的连接回收、停机排空与强制关闭、构造期校验。

use anyhow::Result;
use spark_socket::{
    CallContext, ClientConfig, ConnectionState, NetworkProtocol, Registry, ServerConfig, Session,
    SocketClient, SocketError, SocketServer, new_client, new_client_in, new_server,
};
use spark_socket_core::FORCE_CLOSE_GRACE;
use spark_socket_tls::testing::SelfSigned;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_test::traced_test;

fn loopback_available(protocol: NetworkProtocol) -> bool {
    match protocol {
        NetworkProtocol::Tcp6 => std::net::TcpListener::bind("[::1]:0").is_ok(),
        NetworkProtocol::Udp6 => std::net::UdpSocket::bind("[::1]:0").is_ok(),
        _ => true,
    }
}

fn bind_address(protocol: NetworkProtocol, name: &str) -> String {
    match protocol {
        NetworkProtocol::Tcp6 | NetworkProtocol::Udp6 => "[::1]:0".to_owned(),
        NetworkProtocol::Unix | NetworkProtocol::Unixgram => std::env::temp_dir()
            .join(format!(
                "spark-socket-factory-{}-{name}-{protocol}.sock",
                std::process::id()
            ))
            .to_string_lossy()
            .into_owned(),
        _ => "127.0.0.1:0".to_owned(),
    }
}

async fn echo(session: Session) {
    if let Ok(request) = session.read_to_end().await {
        let _ = session.write(&request).await;
    }
}

async fn start(config: ServerConfig) -> Result<(SocketServer, String)> {
    let server = new_server(config, echo)?.expect("当前平台支持该协议");
    let listener = server.clone();
    tokio::spawn(async move { listener.listen(&CallContext::background()).await });
    let addr = server.wait_listening().await?;
    Ok((server, addr.to_string()))
}

async fn once(client: &SocketClient, payload: &[u8]) -> Result<Vec<u8>> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .once(
            &CallContext::with_timeout(Duration::from_secs(5)),
            payload,
            move |response| {
                let _ = tx.send(response.to_vec());
            },
        )
        .await?;
    Ok(rx.recv().await.unwrap_or_default())
}

async fn eventually(mut predicate: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread")]
async fn every_available_descriptor_round_trips() -> Result<()> {
    for protocol in NetworkProtocol::ALL {
        if !protocol.is_available() || !loopback_available(protocol) {
            continue;
        }
        let (server, addr) =
            start(ServerConfig::new(protocol, bind_address(protocol, "roundtrip"))).await?;
        let client = new_client(ClientConfig::new(protocol, addr))?.expect("客户端与服务端可用性一致");

        let payload = format!("hello over {protocol}");
        let response = once(&client, payload.as_bytes()).await?;
        assert_eq!(response, payload.as_bytes(), "{protocol} 往返必须逐字节一致");
        assert!(!client.is_connected(), "{protocol} once 结束后连接必须关闭");

        server
            .shutdown(&CallContext::with_timeout(Duration::from_secs(2)))
            .await?;
        assert!(server.is_gone(), "{protocol} 停机后服务端应完全释放");
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn io_before_connect_is_rejected_for_every_descriptor() -> Result<()> {
    for protocol in NetworkProtocol::ALL {
        let Some(client) = new_client(ClientConfig::new(protocol, bind_address(protocol, "idle")))?
        else {
            continue;
        };
        let mut buf = [0u8; 8];
        assert!(matches!(
            client.read(&mut buf).await,
            Err(SocketError::NotConnected)
        ));
        assert!(matches!(
            client.write(b"early").await,
            Err(SocketError::NotConnected)
        ));
        client.close().await?;
        assert!(matches!(
            client.write(b"late").await,
            Err(SocketError::NotConnected)
        ));
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn once_leaves_no_connection_behind_on_failure() -> Result<()> {
    let vacant = std::net::TcpListener::bind("127.0.0.1:0")?.local_addr()?;
    let registry = Arc::new(Registry::new());
    let client = new_client_in(
        ClientConfig::new(NetworkProtocol::Tcp, vacant.to_string()),
        Arc::clone(&registry),
    )?
    .expect("tcp 总是可用");

    let mut invoked = false;
    let err = client
        .once(
            &CallContext::with_timeout(Duration::from_secs(2)),
            &b"lost"[..],
            |_| invoked = true,
        )
        .await
        .unwrap_err();
    assert_eq!(err.io_kind(), Some(std::io::ErrorKind::ConnectionRefused));
    assert!(!invoked, "拨号失败时不得调用响应回调");
    assert!(!client.is_connected());
    assert!(registry.is_empty(), "失败路径不得遗留登记项");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[traced_test]
async fn shutdown_timeout_forces_stuck_connections_closed() -> Result<()> {
    let server = new_server(
        ServerConfig::new(NetworkProtocol::Tcp, "127.0.0.1:0"),
        |session: Session| async move {
            // 持有会话直到被强制关闭。
            let mut buf = [0u8; 1];
            while let Ok(read) = session.read(&mut buf).await {
                if read == 0 {
                    break;
                }
            }
        },
    )?
    .expect("tcp 总是可用");
    let listener = server.clone();
    tokio::spawn(async move { listener.listen(&CallContext::background()).await });
    let addr = server.wait_listening().await?;

    let client = new_client(ClientConfig::new(NetworkProtocol::Tcp, addr.to_string()))?
        .expect("tcp 总是可用");
    client.connect(&CallContext::background()).await?;
    assert!(eventually(|| server.open_connections() == 1).await);

    let err = server
        .shutdown(&CallContext::with_timeout(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert!(
        matches!(err, SocketError::ShutdownTimeout { remaining: 1 }),
        "实际错误：{err:?}"
    );
    assert!(
        eventually(|| server.open_connections() == 0).await,
        "强制关闭后连接必须在宽限期 {FORCE_CLOSE_GRACE:?} 内释放"
    );
    assert!(server.is_gone());
    assert!(logs_contain("forcing remaining connections closed"));
    client.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_connect_and_close_keep_shared_registry_consistent() -> Result<()> {
    let (server, addr) = start(ServerConfig::new(NetworkProtocol::Tcp, "127.0.0.1:0")).await?;
    let registry = Arc::new(Registry::new());

    let mut tasks = Vec::new();
    for round in 0..16 {
        let client = new_client_in(
            ClientConfig::new(NetworkProtocol::Tcp, addr.clone()),
            Arc::clone(&registry),
        )?
        .expect("tcp 总是可用");
        tasks.push(tokio::spawn(async move {
            let closer = client.clone();
            let connecting = tokio::spawn(async move {
                let _ = client.connect(&CallContext::background()).await;
                client
            });
            if round % 2 == 0 {
                tokio::task::yield_now().await;
            }
            let _ = closer.close().await;
            let client = connecting.await.expect("连接任务不应 panic");
            client.close().await
        }));
    }
    for task in tasks {
        task.await??;
    }

    assert!(registry.is_empty(), "全部关闭后共享登记表必须为空");
    server
        .shutdown(&CallContext::with_timeout(Duration::from_secs(2)))
        .await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn client_state_events_arrive_in_order() -> Result<()> {
    let (server, addr) = start(ServerConfig::new(NetworkProtocol::Tcp, "127.0.0.1:0")).await?;
    let client = new_client(ClientConfig::new(NetworkProtocol::Tcp, addr))?.expect("tcp 总是可用");
    let (tx, mut rx) = mpsc::unbounded_channel();
    client.register_func_info(move |_local, _remote, state| {
        let _ = tx.send(state);
    });

    assert_eq!(once(&client, b"ordered").await?, b"ordered");
    let mut states = Vec::new();
    while let Ok(Some(state)) =
        tokio::time::timeout(Duration::from_millis(200), rx.recv()).await
    {
        states.push(state);
    }
    assert_eq!(states.first(), Some(&ConnectionState::Dialing));
    assert_eq!(states.last(), Some(&ConnectionState::Closed));
    let established = states
        .iter()
        .position(|state| *state == ConnectionState::Established)
        .expect("必须出现 Established");
    let closing = states
        .iter()
        .position(|state| *state == ConnectionState::Closing)
        .expect("必须出现 Closing");
    assert!(established < closing, "状态事件顺序错乱：{states:?}");
    server.close()?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn tls_round_trip_through_factory() -> Result<()> {
    let identity = SelfSigned::generate("localhost")?;
    let provider = identity.context()?.into_provider();
    let (server, addr) = start(
        ServerConfig::builder(NetworkProtocol::Tcp, "127.0.0.1:0")
            .tls(Arc::clone(&provider))
            .build()?,
    )
    .await?;
    let client = new_client(
        ClientConfig::builder(NetworkProtocol::Tcp, addr)
            .tls(provider)
            .server_name("localhost")
            .build()?,
    )?
    .expect("tcp 总是可用");

    assert_eq!(once(&client, b"sealed").await?, b"sealed");
    server
        .shutdown(&CallContext::with_timeout(Duration::from_secs(2)))
        .await?;
    Ok(())
}

#[test]
fn construction_errors_are_synchronous() {
    let err = new_client(ClientConfig::new(NetworkProtocol::Tcp, "no-port")).unwrap_err();
    assert!(matches!(err, SocketError::Address { .. }), "实际错误：{err:?}");

    let mut udp = ServerConfig::new(NetworkProtocol::Udp, "127.0.0.1:0");
    udp.tls.enabled = true;
    let err = new_server(udp, echo).unwrap_err();
    assert!(
        matches!(err, SocketError::TlsUnsupported(NetworkProtocol::Udp)),
        "实际错误：{err:?}"
    );

    let err = "sctp".parse::<NetworkProtocol>().unwrap_err();
    assert_eq!(err.code(), "spark.socket.unsupported_protocol");
}

#[test]
fn group_ceiling_applies_to_factory_configs() {
    let path = bind_address(NetworkProtocol::Unix, "group");
    let err = ServerConfig::builder(NetworkProtocol::Unix, path.clone())
        .group(32_768)
        .build()
        .unwrap_err();
    assert!(matches!(err, SocketError::InvalidGroup(32_768)), "实际错误：{err:?}");

    let config = ServerConfig::builder(NetworkProtocol::Unix, path)
        .group(32_767)
        .build()
        .expect("32767 在上限之内");
    let server = new_server(config, echo).expect("合法配置必须构造成功");
    assert_eq!(server.is_some(), cfg!(unix));
}

#[test]
fn configs_load_from_json_descriptors() {
    let config: ClientConfig = serde_json::from_str(
        r#"{"network":"UDP4","address":"127.0.0.1:9","readTimeout":250}"#,
    )
    .expect("合法 JSON 配置");
    assert_eq!(config.read_timeout, Some(Duration::from_millis(250)));
    let client = new_client(config).unwrap().expect("udp4 总是可用");
    assert_eq!(client.protocol(), NetworkProtocol::Udp4);
    assert!(client.as_udp().is_some());

    let err = serde_json::from_str::<ServerConfig>(
        r#"{"network":"unix","address":"/tmp/spark.sock","groupPerm":40000}"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("32767"), "实际错误：{err}");
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread")]
async fn unix_ping_pong_with_restricted_permissions() -> Result<()> {
    use std::os::unix::fs::MetadataExt;

    let path = bind_address(NetworkProtocol::Unix, "ping");
    let server = new_server(
        ServerConfig::builder(NetworkProtocol::Unix, path.clone())
            .permissions(0o600)
            .build()?,
        |session: Session| async move {
            if let Ok(request) = session.read_to_end().await {
                let reply: &[u8] = if request == b"ping" { b"pong" } else { b"?" };
                let _ = session.write(reply).await;
            }
        },
    )?
    .expect("unix 平台支持本地套接字");
    let listener = server.clone();
    tokio::spawn(async move { listener.listen(&CallContext::background()).await });
    server.wait_listening().await?;
    assert_eq!(std::fs::metadata(&path)?.mode() & 0o777, 0o600);

    let client = new_client(ClientConfig::new(NetworkProtocol::Unix, path.clone()))?
        .expect("unix 平台支持本地套接字");
    assert_eq!(once(&client, b"ping").await?, b"pong");
    assert!(
        eventually(|| server.open_connections() == 0).await,
        "客户端关闭后连接计数必须回到 0"
    );

    server.close()?;
    tokio::time::timeout(Duration::from_secs(1), server.done()).await?;
    assert!(eventually(|| !std::path::Path::new(&path).exists()).await);
    Ok(())
}
