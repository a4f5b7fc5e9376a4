//! UDP 포트 프로파일러
//!
//! 터널마다 작은 프로브를 보내고 에코 응답으로 RTT/손실을 측정.
//! 매 라운드: 프로브 전송 → timeout 내 응답 수집 → 무응답 터널은
//! 손실로 기록 → 전체 스냅샷 원자적 발행.
//!
//! 프로브 레이아웃 (14바이트 packed):
//!   [0..4]  magic (0xDEADBEEF)
//!   [4..6]  port (이 프로브가 속한 터널의 원격 포트)
//!   [6..14] timestamp_us (송신 측 단조 마이크로초)

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::stats::{StatsHandle, TunnelStat};
use crate::{Error, Result, PROBE_MAGIC, PROBE_SIZE};

/// 프로브 메시지
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    /// 터널 원격 포트
    pub port: u16,

    /// 송신 시각 (단조 마이크로초)
    pub timestamp_us: u64,
}

impl Probe {
    pub fn encode(&self) -> [u8; PROBE_SIZE] {
        let mut buf = [0u8; PROBE_SIZE];
        buf[0..4].copy_from_slice(&PROBE_MAGIC.to_le_bytes());
        buf[4..6].copy_from_slice(&self.port.to_le_bytes());
        buf[6..14].copy_from_slice(&self.timestamp_us.to_le_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PROBE_SIZE {
            return Err(Error::TruncatedSlice {
                len: bytes.len(),
                header: PROBE_SIZE,
            });
        }
        let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        if magic != PROBE_MAGIC {
            return Err(Error::InvalidMagic {
                expected: PROBE_MAGIC,
                got: magic,
            });
        }
        Ok(Self {
            port: u16::from_le_bytes(bytes[4..6].try_into().unwrap()),
            timestamp_us: u64::from_le_bytes(bytes[6..14].try_into().unwrap()),
        })
    }
}

/// 포트 프로파일러
///
/// 프로브 전용 소켓을 터널마다 하나씩 보유 (미디어 소켓과 분리).
/// 수신 측은 미디어 포트에서 프로브 매직을 에코해줌.
pub struct PortProfiler {
    remote_ip: IpAddr,
    stats: Vec<TunnelStat>,
    sockets: Vec<Arc<UdpSocket>>,
    handle: StatsHandle,
    reply_rx: mpsc::Receiver<Vec<u8>>,
    recv_tasks: Vec<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    epoch: Instant,
}

impl PortProfiler {
    /// 프로브 소켓 바인딩 + 응답 수신 태스크 기동
    pub fn bind(remote_ip: IpAddr, ports: &[u16], handle: StatsHandle) -> Result<Self> {
        if ports.is_empty() {
            return Err(Error::NoTunnels);
        }

        let running = Arc::new(AtomicBool::new(true));
        let (reply_tx, reply_rx) = mpsc::channel::<Vec<u8>>(256);
        let mut sockets = Vec::with_capacity(ports.len());
        let mut recv_tasks = Vec::with_capacity(ports.len());

        for _ in ports {
            let std_socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
            std_socket.set_nonblocking(true)?;
            let socket = Arc::new(UdpSocket::from_std(std_socket)?);
            sockets.push(socket.clone());

            let tx = reply_tx.clone();
            let running = running.clone();
            recv_tasks.push(tokio::spawn(async move {
                let mut buf = [0u8; 64];
                while running.load(Ordering::SeqCst) {
                    match tokio::time::timeout(
                        Duration::from_millis(100),
                        socket.recv_from(&mut buf),
                    )
                    .await
                    {
                        Ok(Ok((len, _))) => {
                            if len == PROBE_SIZE {
                                let _ = tx.try_send(buf[..len].to_vec());
                            }
                        }
                        Ok(Err(e)) => {
                            warn!("프로브 수신 에러: {}", e);
                        }
                        Err(_) => {}
                    }
                }
            }));
        }

        Ok(Self {
            remote_ip,
            stats: ports.iter().map(|&p| TunnelStat::new(p)).collect(),
            sockets,
            handle,
            reply_rx,
            recv_tasks,
            running,
            epoch: Instant::now(),
        })
    }

    fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    /// 프로브 라운드 한 번: 전송 → 응답 수집 → 스냅샷 발행
    pub async fn round(&mut self, timeout: Duration) {
        // 잔여 응답 비우기 (이전 라운드의 지각 응답)
        while self.reply_rx.try_recv().is_ok() {}

        for (i, stat) in self.stats.iter().enumerate() {
            let probe = Probe {
                port: stat.port,
                timestamp_us: self.now_us(),
            };
            let dest = SocketAddr::new(self.remote_ip, stat.port);
            if let Err(e) = self.sockets[i].send_to(&probe.encode(), dest).await {
                debug!("프로브 전송 실패 (port {}): {}", stat.port, e);
            }
        }

        // timeout 내 응답 수집
        let mut answered = vec![false; self.stats.len()];
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.reply_rx.recv()).await {
                Ok(Some(bytes)) => {
                    let reply = match Probe::decode(&bytes) {
                        Ok(r) => r,
                        Err(_) => continue,
                    };
                    let rtt_ms = self.now_us().saturating_sub(reply.timestamp_us) as f64 / 1000.0;
                    if let Some(i) = self.stats.iter().position(|s| s.port == reply.port) {
                        if !answered[i] {
                            self.stats[i].update(true, rtt_ms);
                            answered[i] = true;
                        }
                    }
                    if answered.iter().all(|&a| a) {
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => break,
            }
        }

        // 무응답 터널은 손실로 기록
        for (i, stat) in self.stats.iter_mut().enumerate() {
            if !answered[i] {
                stat.update(false, 0.0);
            }
        }

        self.handle.publish(self.stats.clone());
    }

    /// 프로파일 루프 - 정지 플래그가 내려갈 때까지
    pub async fn run(mut self, running: Arc<AtomicBool>, interval: Duration, timeout: Duration) {
        while running.load(Ordering::SeqCst) {
            self.round(timeout).await;
            tokio::time::sleep(interval).await;
        }
        self.shutdown().await;
    }

    /// 수신 태스크 종료
    pub async fn shutdown(self) {
        self.running.store(false, Ordering::SeqCst);
        for task in self.recv_tasks {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_roundtrip() {
        let probe = Probe {
            port: 4001,
            timestamp_us: 987_654_321,
        };
        let bytes = probe.encode();
        assert_eq!(bytes.len(), PROBE_SIZE);
        assert_eq!(Probe::decode(&bytes).unwrap(), probe);
    }

    #[test]
    fn test_probe_bad_magic() {
        let mut bytes = Probe {
            port: 1,
            timestamp_us: 2,
        }
        .encode();
        bytes[0] ^= 0xFF;
        assert!(matches!(
            Probe::decode(&bytes),
            Err(Error::InvalidMagic { .. })
        ));
    }

    #[tokio::test]
    async fn test_round_against_echo_peer() {
        // 에코 피어: 받은 프로브를 그대로 돌려줌
        let echo = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let echo_port = echo.local_addr().unwrap().port();
        let echo_task = {
            let echo = echo.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 64];
                loop {
                    let Ok((len, addr)) = echo.recv_from(&mut buf).await else {
                        break;
                    };
                    let _ = echo.send_to(&buf[..len], addr).await;
                }
            })
        };

        let handle = StatsHandle::new(&[echo_port]);
        let mut profiler =
            PortProfiler::bind("127.0.0.1".parse().unwrap(), &[echo_port], handle.clone())
                .unwrap();

        for _ in 0..3 {
            profiler.round(Duration::from_millis(200)).await;
        }

        let snap = handle.snapshot();
        assert_eq!(snap[0].sent, 3);
        assert_eq!(snap[0].received, 3);
        assert!(snap[0].packet_loss < 1e-9);
        assert!(snap[0].avg_rtt_ms < 100.0);

        echo_task.abort();
        profiler.shutdown().await;
    }

    #[tokio::test]
    async fn test_round_without_peer_degrades_loss() {
        // 아무도 응답하지 않는 포트 - 손실률이 올라가야 함
        let handle = StatsHandle::new(&[1]);
        let mut profiler =
            PortProfiler::bind("127.0.0.1".parse().unwrap(), &[1], handle.clone()).unwrap();

        profiler.round(Duration::from_millis(50)).await;
        profiler.round(Duration::from_millis(50)).await;

        let snap = handle.snapshot();
        assert_eq!(snap[0].sent, 2);
        assert_eq!(snap[0].received, 0);
        assert!((snap[0].packet_loss - 1.0).abs() < 1e-9);

        profiler.shutdown().await;
    }
}
