//! 멀티패스 수신기
//!
//! - 로컬 포트마다 소켓 하나, 소켓마다 수신 태스크
//! - 길이 검사만 하고 데이터그램을 경계 보존한 채 채널로 전달
//! - 프로브 매직 데이터그램은 즉시 원래 주소로 에코 (RTT 측정용)

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::stats::TransferStats;
use crate::{Result, HEADER_SIZE, PROBE_MAGIC, PROBE_SIZE};

/// 수신 데이터그램 - 송신 endpoint + 원본 바이트
pub type Datagram = (SocketAddr, Bytes);

/// 수신 채널 용량
const DATAGRAM_CHANNEL_CAPACITY: usize = 4096;

fn create_recv_socket(port: u16, recv_buffer: usize) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_recv_buffer_size(recv_buffer)?;
    socket.set_nonblocking(true)?;
    socket.bind(&format!("0.0.0.0:{}", port).parse::<SocketAddr>().unwrap().into())?;
    Ok(socket.into())
}

/// 멀티패스 UDP 수신기
pub struct MultiPathReceiver {
    sockets: Vec<Arc<UdpSocket>>,
    running: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl MultiPathReceiver {
    /// 소켓 바인딩 + 수신 태스크 기동
    ///
    /// 바인딩 실패는 치명적 (시작 시 에러 반환).
    /// 데이터그램은 반환된 채널로 전달됨.
    pub fn start(
        ports: &[u16],
        mtu: usize,
        recv_buffer: usize,
        stats: Arc<TransferStats>,
    ) -> Result<(Self, mpsc::Receiver<Datagram>)> {
        if ports.is_empty() {
            return Err(crate::Error::NoTunnels);
        }

        let (datagram_tx, datagram_rx) = mpsc::channel::<Datagram>(DATAGRAM_CHANNEL_CAPACITY);
        let running = Arc::new(AtomicBool::new(true));
        let mut tasks = Vec::with_capacity(ports.len());
        let mut sockets = Vec::with_capacity(ports.len());

        for &port in ports {
            let socket = Arc::new(UdpSocket::from_std(create_recv_socket(port, recv_buffer)?)?);
            info!("수신 소켓 바인딩: {}", socket.local_addr()?);
            sockets.push(socket.clone());

            let tx = datagram_tx.clone();
            let running = running.clone();
            let stats = stats.clone();

            tasks.push(tokio::spawn(async move {
                let mut buf = vec![0u8; 2048];

                while running.load(Ordering::SeqCst) {
                    // 타임아웃으로 정지 플래그를 주기적으로 확인
                    let received = tokio::time::timeout(
                        Duration::from_millis(100),
                        socket.recv_from(&mut buf),
                    )
                    .await;

                    match received {
                        Ok(Ok((len, addr))) => {
                            // 프로브는 수신 경로에서 즉시 에코
                            if len == PROBE_SIZE
                                && buf[..4] == PROBE_MAGIC.to_le_bytes()
                            {
                                let _ = socket.send_to(&buf[..len], addr).await;
                                stats.add(&stats.probes_echoed, 1);
                                continue;
                            }

                            // 슬라이스 헤더보다 작거나 MTU를 넘으면 조용히 버림
                            if len < HEADER_SIZE || len > mtu {
                                stats.add(&stats.invalid_slices, 1);
                                continue;
                            }

                            stats.add(&stats.datagrams_received, 1);
                            if tx
                                .send((addr, Bytes::copy_from_slice(&buf[..len])))
                                .await
                                .is_err()
                            {
                                break; // 디패킷타이저 종료
                            }
                        }
                        Ok(Err(e)) => {
                            warn!("수신 에러 (port {}): {}", port, e);
                        }
                        Err(_) => {
                            // 타임아웃 - 계속
                        }
                    }
                }
            }));
        }

        Ok((Self { sockets, running, tasks }, datagram_rx))
    }

    /// 실제 바인딩된 로컬 포트 목록 (포트 0 바인딩 시 확인용)
    pub fn local_ports(&self) -> Vec<u16> {
        self.sockets
            .iter()
            .filter_map(|s| s.local_addr().ok())
            .map(|a| a.port())
            .collect()
    }

    /// 정지 요청
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// 정지 + 모든 수신 태스크 종료 대기
    pub async fn shutdown(self) {
        self.running.store(false, Ordering::SeqCst);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}
