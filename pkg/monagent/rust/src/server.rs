// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::aggregator::Aggregator;
use crate::metric::MetricSample;
use crate::statsd::parse_datagram;
use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_STATSD_PORT: u16 = 8125;
pub const DEFAULT_BUFFER_SIZE: usize = 8192;
pub const PARSE_ERRORS_METRIC: &str = "monagent.statsd.parse_errors";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_STATSD_PORT,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub packets: u64,
    pub lines: u64,
    pub parse_errors: u64,
}

/// Statsd UDP listener feeding an [`Aggregator`].
pub struct Server {
    aggregator: Arc<Aggregator>,
    local_addr: SocketAddr,
    buffer_size: usize,
    socket: Mutex<Option<UdpSocket>>,
    shutdown: CancellationToken,
    packets: AtomicU64,
    lines: AtomicU64,
    parse_errors: AtomicU64,
}

impl Server {
    pub async fn bind(config: &ServerConfig, aggregator: Arc<Aggregator>) -> Result<Self> {
        let socket = UdpSocket::bind((config.host.as_str(), config.port))
            .await
            .with_context(|| format!("binding statsd socket on {}:{}", config.host, config.port))?;
        let local_addr = socket.local_addr().context("reading statsd socket address")?;
        Ok(Self {
            aggregator,
            local_addr,
            buffer_size: config.buffer_size.max(1),
            socket: Mutex::new(Some(socket)),
            shutdown: CancellationToken::new(),
            packets: AtomicU64::new(0),
            lines: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            packets: self.packets.load(Ordering::Relaxed),
            lines: self.lines.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
        }
    }

    /// Run the receive loop until [`Server::stop`] is called. The socket is
    /// closed when this returns, so a server can only be started once. A
    /// `stop` issued before the loop is first polled still applies.
    pub async fn start(&self) -> Result<()> {
        let socket = self
            .socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .context("statsd server was already started")?;

        info!("statsd server listening on {}", self.local_addr);
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            let received = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => None,
                res = socket.recv_from(&mut buf) => Some(res),
            };
            let Some(received) = received else {
                break;
            };
            match received {
                Ok((len, _peer)) => {
                    if let Some(payload) = buf.get(..len) {
                        self.handle_datagram(payload);
                    }
                }
                Err(e) => warn!("statsd receive error: {e}"),
            }
        }

        drop(socket);
        info!("statsd server on {} stopped", self.local_addr);
        Ok(())
    }

    /// Ask the receive loop to exit. Safe to call from any task, repeatedly,
    /// and before `start`.
    pub fn stop(&self) {
        if !self.shutdown.is_cancelled() {
            debug!("stopping statsd server on {}", self.local_addr);
            self.shutdown.cancel();
        }
    }

    pub(crate) fn handle_datagram(&self, payload: &[u8]) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        let text = String::from_utf8_lossy(payload);
        for parsed in parse_datagram(&text) {
            self.lines.fetch_add(1, Ordering::Relaxed);
            match parsed {
                Ok(sample) => {
                    // Rejections are counted by the aggregator.
                    let _ = self.aggregator.submit(sample);
                }
                Err(e) => {
                    self.parse_errors.fetch_add(1, Ordering::Relaxed);
                    debug!("dropping statsd line: {e}");
                    let _ = self
                        .aggregator
                        .submit(MetricSample::counter(PARSE_ERRORS_METRIC, 1.0));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    async fn start_server() -> (Arc<Server>, Arc<Aggregator>, tokio::task::JoinHandle<Result<()>>) {
        let aggregator = Arc::new(Aggregator::with_hostname("test_host"));
        let config = ServerConfig {
            port: 0,
            ..ServerConfig::default()
        };
        let server = Arc::new(Server::bind(&config, aggregator.clone()).await.unwrap());
        let s = server.clone();
        let handle = tokio::spawn(async move { s.start().await });
        (server, aggregator, handle)
    }

    async fn wait_for_lines(server: &Server, lines: u64) {
        timeout(Duration::from_secs(5), async {
            while server.stats().lines < lines {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("server did not receive the expected lines");
    }

    async fn send(server: &Server, payload: &str) {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(payload.as_bytes(), server.local_addr())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_receives_and_aggregates() {
        let (server, aggregator, handle) = start_server().await;

        send(&server, "jvm.thread_count:42|g|#instance:solr_instance").await;
        send(&server, "requests:1|c\nrequests:2|c").await;
        wait_for_lines(&server, 3).await;

        let snapshot = aggregator.flush();
        let gauge = snapshot.get("jvm.thread_count").unwrap();
        assert_eq!(gauge.value, 42.0);
        assert_eq!(gauge.dimensions["instance"], "solr_instance");
        assert_eq!(gauge.host, "test_host");
        assert_eq!(snapshot.get("requests").unwrap().value, 3.0);

        server.stop();
        timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_malformed_line_does_not_drop_neighbours() {
        let (server, aggregator, handle) = start_server().await;

        send(&server, "good.a:1|c\ngarbage_no_colon\ngood.b:5|g\nbad:x|c").await;
        wait_for_lines(&server, 4).await;

        let stats = server.stats();
        assert_eq!(stats.packets, 1);
        assert_eq!(stats.parse_errors, 2);

        let snapshot = aggregator.flush();
        assert_eq!(snapshot.get("good.a").unwrap().value, 1.0);
        assert_eq!(snapshot.get("good.b").unwrap().value, 5.0);
        assert_eq!(snapshot.get(PARSE_ERRORS_METRIC).unwrap().value, 2.0);

        server.stop();
        handle.await.unwrap().unwrap();
    }

    async fn wait_until_started(server: &Server) {
        timeout(Duration::from_secs(5), async {
            while server.socket.lock().unwrap().is_some() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (server, _aggregator, handle) = start_server().await;
        wait_until_started(&server).await;

        server.stop();
        server.stop();
        timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        server.stop();
    }

    #[tokio::test]
    async fn test_stop_right_after_spawn_is_not_lost() {
        let (server, _aggregator, handle) = start_server().await;
        server.stop();
        timeout(Duration::from_secs(2), handle)
            .await
            .expect("receive loop should exit after stop")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let aggregator = Arc::new(Aggregator::with_hostname("h"));
        let config = ServerConfig {
            port: 0,
            ..ServerConfig::default()
        };
        let server = Server::bind(&config, aggregator).await.unwrap();
        server.stop();
        assert_eq!(server.stats(), ServerStats::default());
        timeout(Duration::from_secs(2), server.start())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (server, _aggregator, handle) = start_server().await;
        wait_until_started(&server).await;

        assert!(server.start().await.is_err());
        server.stop();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_overflowing_timestamp_does_not_end_the_loop() {
        let (server, aggregator, handle) = start_server().await;

        send(&server, "x:1|g|T18446744073709551615").await;
        wait_for_lines(&server, 1).await;
        send(&server, "after:1|c").await;
        wait_for_lines(&server, 2).await;

        assert!(!handle.is_finished());
        assert_eq!(server.stats().parse_errors, 1);
        let snapshot = aggregator.flush();
        assert_eq!(snapshot.get("after").unwrap().value, 1.0);
        assert!(snapshot.get("x").is_none());

        server.stop();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bind_conflict_is_an_error() {
        let aggregator = Arc::new(Aggregator::with_hostname("h"));
        let first = Server::bind(
            &ServerConfig {
                port: 0,
                ..ServerConfig::default()
            },
            aggregator.clone(),
        )
        .await
        .unwrap();
        let taken = ServerConfig {
            port: first.local_addr().port(),
            ..ServerConfig::default()
        };
        assert!(Server::bind(&taken, aggregator).await.is_err());
    }

    #[test]
    fn test_handle_datagram_invalid_utf8() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let aggregator = Arc::new(Aggregator::with_hostname("h"));
        let server = rt
            .block_on(Server::bind(
                &ServerConfig {
                    port: 0,
                    ..ServerConfig::default()
                },
                aggregator.clone(),
            ))
            .unwrap();

        server.handle_datagram(b"ok:1|c\n\xff\xfe:1|c\n");
        assert_eq!(server.stats().lines, 2);
        assert_eq!(aggregator.flush().get("ok").unwrap().value, 1.0);
    }
}
