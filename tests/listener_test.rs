//! Listener service tests against real loopback sockets

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout, Instant};
use tokio_test::assert_ok;

use tcplink::config::ListenerConfig;
use tcplink::connection::{EchoHandler, ListenerService, LoggingHandler, ServiceState};
use tcplink::ServiceContext;

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn wait_for_state(service: &ListenerService, wanted: ServiceState) {
    let mut state = service.subscribe_state();
    timeout(Duration::from_secs(3), state.wait_for(|s| *s == wanted))
        .await
        .expect("state not reached in time")
        .expect("state channel closed");
}

fn listener(port: u16, context: &ServiceContext) -> ListenerService {
    let mut config = ListenerConfig::new("127.0.0.1", port);
    config.bind_retry_delay = Duration::from_millis(50);
    config.drain_timeout = Duration::from_secs(2);
    ListenerService::new(config, Arc::new(LoggingHandler::new("test")), context.clone())
}

async fn running_listener(context: &ServiceContext) -> (ListenerService, SocketAddr) {
    let service = listener(0, context);
    service.start();
    wait_for_state(&service, ServiceState::Running).await;
    let addr = service.local_addr().expect("bound address");
    (service, addr)
}

#[tokio::test]
async fn test_peer_tracked_while_connected() {
    let context = ServiceContext::standalone().unwrap();
    let (service, addr) = running_listener(&context).await;

    let client = assert_ok!(TcpStream::connect(addr).await);
    let client_addr = client.local_addr().unwrap();

    assert!(wait_until(|| service.is_member(client_addr.ip(), client_addr.port()).is_some()).await);
    assert_eq!(service.peer_count(), 1);
    assert!(service
        .describe_peers()
        .contains(&client_addr.to_string()));

    drop(client);
    assert!(wait_until(|| service.is_member(client_addr.ip(), client_addr.port()).is_none()).await);
    assert_eq!(service.peer_count(), 0);
    assert_eq!(context.metrics().active_sessions(), 0);

    service.stop().await;
    assert_eq!(service.state(), ServiceState::Stopped);
}

#[tokio::test]
async fn test_registry_size_follows_connects_and_disconnects() {
    let context = ServiceContext::standalone().unwrap();
    let (service, addr) = running_listener(&context).await;

    let mut clients = Vec::new();
    for _ in 0..5 {
        clients.push(TcpStream::connect(addr).await.unwrap());
    }
    assert!(wait_until(|| service.peer_count() == 5).await);

    clients.truncate(2);
    assert!(wait_until(|| service.peer_count() == 2).await);

    service.stop().await;
}

#[tokio::test]
async fn test_bind_retries_until_port_is_released() {
    let context = ServiceContext::standalone().unwrap();
    let holder = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = holder.local_addr().unwrap().port();

    let service = listener(port, &context);
    let handle = service.start();
    wait_for_state(&service, ServiceState::Retrying).await;
    assert!(service.local_addr().is_none());

    drop(holder);
    wait_for_state(&service, ServiceState::Running).await;
    assert_eq!(service.local_addr().unwrap().port(), port);

    service.stop().await;
    assert_ok!(timeout(Duration::from_secs(2), handle).await.unwrap().unwrap());
}

#[tokio::test]
async fn test_cancel_while_running_releases_everything() {
    let context = ServiceContext::standalone().unwrap();
    let service = listener(0, &context);
    let handle = service.start();
    wait_for_state(&service, ServiceState::Running).await;
    let addr = service.local_addr().unwrap();

    let mut first = TcpStream::connect(addr).await.unwrap();
    let mut second = TcpStream::connect(addr).await.unwrap();
    assert!(wait_until(|| service.peer_count() == 2).await);

    context.cancel_token().cancel();

    let result = timeout(Duration::from_secs(3), handle)
        .await
        .expect("listener task did not finish")
        .unwrap();
    assert_ok!(result);
    assert_eq!(service.state(), ServiceState::Stopped);
    assert_eq!(service.peer_count(), 0);
    assert_eq!(context.metrics().active_sessions(), 0);

    let mut buf = [0u8; 8];
    assert_eq!(timeout(Duration::from_secs(1), first.read(&mut buf)).await.unwrap().unwrap_or(0), 0);
    assert_eq!(timeout(Duration::from_secs(1), second.read(&mut buf)).await.unwrap().unwrap_or(0), 0);

    assert_ok!(TcpListener::bind(addr).await);
}

#[tokio::test]
async fn test_stop_before_start() {
    let context = ServiceContext::standalone().unwrap();
    let service = listener(0, &context);

    service.stop().await;
    assert_eq!(service.state(), ServiceState::Stopped);
    assert!(service.start().await.unwrap().is_err());
}

#[tokio::test]
async fn test_second_start_is_rejected() {
    let context = ServiceContext::standalone().unwrap();
    let (service, _) = running_listener(&context).await;

    let again = service.start().await.unwrap();
    assert!(again.is_err());
    assert_eq!(service.state(), ServiceState::Running);

    service.stop().await;
}

#[tokio::test]
async fn test_echo_handler_preserves_order() {
    let context = ServiceContext::standalone().unwrap();
    let mut config = ListenerConfig::new("127.0.0.1", 0);
    config.drain_timeout = Duration::from_secs(2);
    let service = ListenerService::new(config, Arc::new(EchoHandler), context.clone());
    service.start();
    wait_for_state(&service, ServiceState::Running).await;

    let mut client = TcpStream::connect(service.local_addr().unwrap())
        .await
        .unwrap();
    client.write_all(b"hello ").await.unwrap();
    client.write_all(b"world").await.unwrap();

    let mut echoed = vec![0u8; 11];
    timeout(Duration::from_secs(2), client.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"hello world");

    let session = service.sessions().pop().unwrap();
    assert!(wait_until(|| session.bytes_received() == 11 && session.bytes_sent() == 11).await);

    service.stop().await;
}

#[tokio::test]
async fn test_disconnect_all_keeps_listening() {
    let context = ServiceContext::standalone().unwrap();
    let (service, addr) = running_listener(&context).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    assert!(wait_until(|| service.peer_count() == 1).await);

    service.disconnect_all();
    let mut buf = [0u8; 4];
    let read = timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(read, 0);
    assert!(wait_until(|| service.peer_count() == 0).await);
    assert_eq!(service.state(), ServiceState::Running);

    let _again = TcpStream::connect(addr).await.unwrap();
    assert!(wait_until(|| service.peer_count() == 1).await);

    service.stop().await;
}

#[tokio::test]
async fn test_bind_retries_are_spaced_by_delay() {
    let context = ServiceContext::standalone().unwrap();
    let holder = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = holder.local_addr().unwrap().port();

    let retry_delay = Duration::from_millis(150);
    let mut config = ListenerConfig::new("127.0.0.1", port);
    config.bind_retry_delay = retry_delay;
    let service = ListenerService::new(config, Arc::new(LoggingHandler::new("test")), context.clone());
    service.start();

    let mut seen = Vec::new();
    let mut last = 0;
    let deadline = Instant::now() + Duration::from_secs(5);
    while seen.len() < 4 && Instant::now() < deadline {
        let retries = context.metrics().bind_retries();
        if retries != last {
            seen.push(Instant::now());
            last = retries;
        }
        sleep(Duration::from_millis(2)).await;
    }
    assert_eq!(seen.len(), 4);

    for pair in seen.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(gap >= retry_delay - Duration::from_millis(20), "gap {:?}", gap);
        assert!(gap < Duration::from_secs(1), "gap {:?}", gap);
    }
    assert_eq!(service.state(), ServiceState::Retrying);

    service.stop().await;
    drop(holder);
}

#[tokio::test]
async fn test_stop_before_loop_is_polled() {
    let context = ServiceContext::standalone().unwrap();
    let service = listener(0, &context);

    let pending = service.serve();
    timeout(Duration::from_secs(1), service.stop())
        .await
        .expect("stop waited for a loop that never ran");
    assert_eq!(service.state(), ServiceState::Stopped);

    assert_ok!(pending.await);
    assert_eq!(service.state(), ServiceState::Stopped);
    assert!(service.local_addr().is_none());
}
