//! Dialer service tests against real loopback sockets

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout, Instant};
use tokio_test::assert_ok;

use tcplink::config::DialerConfig;
use tcplink::connection::{DialerService, DialerState, FailureClass, LoggingHandler};
use tcplink::ServiceContext;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn wait_for_state(service: &DialerService, wanted: DialerState) {
    let mut state = service.subscribe_state();
    timeout(Duration::from_secs(3), state.wait_for(|s| *s == wanted))
        .await
        .expect("state not reached in time")
        .expect("state channel closed");
}

fn dialer(config: DialerConfig, context: &ServiceContext) -> DialerService {
    DialerService::new(config, Arc::new(LoggingHandler::new("test")), context.clone())
}

fn fast_config(port: u16) -> DialerConfig {
    let mut config = DialerConfig::new("127.0.0.1", port);
    config.retry_delay = Duration::from_millis(20);
    config
}

/// A loopback port with nothing listening on it
async fn closed_port() -> u16 {
    let probe = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    probe.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_retries_until_server_appears() {
    let context = ServiceContext::standalone().unwrap();
    let port = closed_port().await;

    let service = dialer(fast_config(port), &context);
    let handle = service.start();

    assert!(wait_until(|| service.attempts() >= 3).await);
    assert_ne!(service.state(), DialerState::Connected);
    assert!(context.metrics().dial_failures(FailureClass::Transient) >= 2);

    let server = TcpListener::bind((LOCALHOST, port)).await.unwrap();
    let (_accepted, _) = timeout(Duration::from_secs(3), server.accept())
        .await
        .unwrap()
        .unwrap();
    wait_for_state(&service, DialerState::Connected).await;
    assert!(service.session().is_some());

    service.stop().await;
    assert_eq!(service.state(), DialerState::Canceled);
    assert_ok!(timeout(Duration::from_secs(2), handle).await.unwrap().unwrap());
}

#[tokio::test]
async fn test_cancel_during_retry_wait() {
    let context = ServiceContext::standalone().unwrap();
    let mut config = DialerConfig::new("127.0.0.1", closed_port().await);
    config.retry_delay = Duration::from_secs(30);

    let service = dialer(config, &context);
    let handle = service.start();
    assert!(wait_until(|| service.attempts() == 1 && service.state() == DialerState::Disconnected).await);

    timeout(Duration::from_secs(1), service.stop())
        .await
        .expect("stop waited for the retry delay");
    assert_eq!(service.state(), DialerState::Canceled);

    let attempts = service.attempts();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(service.attempts(), attempts);
    assert_ok!(timeout(Duration::from_secs(1), handle).await.unwrap().unwrap());
}

#[tokio::test]
async fn test_source_port_rotates_past_occupied_port() {
    let context = ServiceContext::standalone().unwrap();
    let server = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    let remote_port = server.local_addr().unwrap().port();

    let occupied = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    let source_port = occupied.local_addr().unwrap().port();

    let mut config = fast_config(remote_port);
    config.local_address = Some("127.0.0.1".to_string());
    config.local_port = source_port;
    config.max_source_port_retries = 8;

    let service = dialer(config, &context);
    service.start();

    let (_accepted, peer) = timeout(Duration::from_secs(3), server.accept())
        .await
        .unwrap()
        .unwrap();
    wait_for_state(&service, DialerState::Connected).await;

    assert!(peer.port() > source_port);
    assert!(peer.port() <= source_port + 8);
    assert_eq!(service.source_port(), peer.port());
    assert_eq!(service.session().unwrap().local_addr().port(), peer.port());
    assert!(context.metrics().dial_failures(FailureClass::LocalResource) >= 1);

    service.stop().await;
    drop(occupied);
}

#[tokio::test]
async fn test_reconnects_after_server_drops_connection() {
    let context = ServiceContext::standalone().unwrap();
    let server = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    let port = server.local_addr().unwrap().port();

    let service = dialer(fast_config(port), &context);
    service.start();

    let (first, _) = timeout(Duration::from_secs(3), server.accept())
        .await
        .unwrap()
        .unwrap();
    wait_for_state(&service, DialerState::Connected).await;
    drop(first);

    let (mut second, _) = timeout(Duration::from_secs(3), server.accept())
        .await
        .unwrap()
        .unwrap();
    wait_for_state(&service, DialerState::Connected).await;
    assert!(service.attempts() >= 2);

    assert!(service.send("ping"));
    let mut received = [0u8; 4];
    timeout(Duration::from_secs(2), second.read_exact(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&received, b"ping");

    service.stop().await;
    assert!(!service.send("late"));
}

#[tokio::test]
async fn test_invalid_local_address_is_fatal() {
    let context = ServiceContext::standalone().unwrap();
    let mut config = fast_config(closed_port().await);
    config.local_address = Some("not-an-ip".to_string());

    let service = dialer(config, &context);
    let result = timeout(Duration::from_secs(2), service.start())
        .await
        .unwrap()
        .unwrap();

    assert!(result.is_err());
    assert_eq!(service.state(), DialerState::Failed);
    assert_eq!(service.attempts(), 1);
    assert_eq!(context.metrics().dial_failures(FailureClass::Fatal), 1);
}

#[tokio::test]
async fn test_parent_cancel_stops_dialer() {
    let context = ServiceContext::standalone().unwrap();
    let server = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    let port = server.local_addr().unwrap().port();

    let service = dialer(fast_config(port), &context);
    let handle = service.start();
    let (mut accepted, _) = timeout(Duration::from_secs(3), server.accept())
        .await
        .unwrap()
        .unwrap();
    wait_for_state(&service, DialerState::Connected).await;

    context.cancel_token().cancel();
    assert_ok!(timeout(Duration::from_secs(2), handle).await.unwrap().unwrap());
    assert_eq!(service.state(), DialerState::Canceled);
    assert!(service.session().is_none());

    let mut buf = [0u8; 4];
    let read = timeout(Duration::from_secs(1), accepted.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(read, 0);
}

#[tokio::test]
async fn test_retry_attempts_are_spaced_by_retry_delay() {
    let context = ServiceContext::standalone().unwrap();
    let retry_delay = Duration::from_millis(150);
    let mut config = DialerConfig::new("127.0.0.1", closed_port().await);
    config.retry_delay = retry_delay;

    let service = dialer(config, &context);
    service.start();

    let mut seen = Vec::new();
    let mut last = 0;
    let deadline = Instant::now() + Duration::from_secs(5);
    while seen.len() < 4 && Instant::now() < deadline {
        let attempts = service.attempts();
        if attempts != last {
            seen.push(Instant::now());
            last = attempts;
        }
        sleep(Duration::from_millis(2)).await;
    }
    assert_eq!(seen.len(), 4);

    for pair in seen.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(gap >= retry_delay - Duration::from_millis(20), "gap {:?}", gap);
        assert!(gap < Duration::from_secs(1), "gap {:?}", gap);
    }

    service.stop().await;
}

#[tokio::test]
async fn test_stop_while_peer_not_reading() {
    let context = ServiceContext::standalone().unwrap();
    let server = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    let port = server.local_addr().unwrap().port();

    let service = dialer(fast_config(port), &context);
    let handle = service.start();
    let (_stalled, _) = timeout(Duration::from_secs(3), server.accept())
        .await
        .unwrap()
        .unwrap();
    wait_for_state(&service, DialerState::Connected).await;

    for _ in 0..64 {
        assert!(service.send(vec![0u8; 1 << 20]));
    }
    sleep(Duration::from_millis(100)).await;

    timeout(Duration::from_secs(3), service.stop())
        .await
        .expect("stop blocked behind a stalled write");
    assert_eq!(service.state(), DialerState::Canceled);
    assert!(service.session().is_none());
    assert_ok!(timeout(Duration::from_secs(1), handle).await.unwrap().unwrap());
}

#[tokio::test]
async fn test_stop_before_loop_is_polled() {
    let context = ServiceContext::standalone().unwrap();
    let service = dialer(fast_config(closed_port().await), &context);

    let pending = service.run();
    timeout(Duration::from_secs(1), service.stop())
        .await
        .expect("stop waited for a loop that never ran");
    assert_eq!(service.state(), DialerState::Canceled);

    assert_ok!(pending.await);
    assert_eq!(service.state(), DialerState::Canceled);
    assert_eq!(service.attempts(), 0);
}
