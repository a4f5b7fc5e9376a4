//! 멀티패스 터널 풀
//!
//! 원격 포트마다 UDP 소켓 하나. 터널 선택은 손실/RTT 역비례 가중
//! 룰렛 - 라운드로빈 커서에서 스캔을 시작해 동일 가중치가 골고루
//! 분산되도록 함. 패리티 슬라이스는 데이터와 다른 경로로 보냄.

use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::warn;

use crate::stats::TunnelStat;
use crate::{Error, Result};

/// 가중치 상수: w = 1 / (EPSILON + ALPHA*loss + BETA*rtt_ms)
const EPSILON: f64 = 1e-3;
const ALPHA: f64 = 2.0;
const BETA: f64 = 0.01;

/// 송신 재시도 횟수 (EAGAIN/ENOBUFS)
const SEND_ATTEMPTS: usize = 3;

/// 재시도 간 대기 (마이크로초)
const SEND_RETRY_US: u64 = 200;

/// 터널 하나 - 원격 포트 + 로컬 소켓
pub struct Tunnel {
    pub remote_port: u16,
    socket: Arc<UdpSocket>,
}

/// 터널 풀
pub struct TunnelPool {
    remote_ip: IpAddr,
    tunnels: Vec<Tunnel>,

    /// 터널별 통계 (프로파일러 스냅샷 복사본)
    stats: RwLock<Vec<TunnelStat>>,

    /// 룰렛 시작 커서
    rr_cursor: Mutex<usize>,

    /// 슬라이스당 중복 전송 터널 수
    redundancy: AtomicUsize,

    /// 영구 송신 실패 수
    pub send_failures: AtomicU64,
}

fn create_send_socket(send_buffer: usize) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.set_send_buffer_size(send_buffer)?;
    // IPTOS_LOWDELAY - 지원 안 되는 플랫폼에서는 무시
    let _ = socket.set_tos(0x10);
    socket.bind(&"0.0.0.0:0".parse::<SocketAddr>().unwrap().into())?;
    Ok(socket.into())
}

impl TunnelPool {
    /// 터널 풀 생성 - 포트당 소켓 바인딩
    pub fn connect(
        remote_ip: IpAddr,
        ports: &[u16],
        send_buffer: usize,
        redundancy: usize,
    ) -> Result<Self> {
        if ports.is_empty() {
            return Err(Error::NoTunnels);
        }

        let mut tunnels = Vec::with_capacity(ports.len());
        for &port in ports {
            let socket = UdpSocket::from_std(create_send_socket(send_buffer)?)?;
            tunnels.push(Tunnel {
                remote_port: port,
                socket: Arc::new(socket),
            });
        }

        let pool = Self {
            remote_ip,
            stats: RwLock::new(ports.iter().map(|&p| TunnelStat::new(p)).collect()),
            tunnels,
            rr_cursor: Mutex::new(0),
            redundancy: AtomicUsize::new(1),
            send_failures: AtomicU64::new(0),
        };
        pool.set_redundancy(redundancy);
        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    /// 터널 통계 테이블 교체 (프로파일러 틱마다)
    pub fn set_profiles(&self, stats: &[TunnelStat]) {
        if stats.len() != self.tunnels.len() {
            warn!(
                "프로파일 크기 불일치: {} != {}",
                stats.len(),
                self.tunnels.len()
            );
            return;
        }
        *self.stats.write() = stats.to_vec();
    }

    /// 중복 전송 수 설정 - [1, 터널 수]로 클램프
    ///
    /// 터널이 하나면 클론은 같은 경로에 부하만 주므로 1로 강제
    pub fn set_redundancy(&self, count: usize) {
        let n = self.tunnels.len();
        let clamped = if n <= 1 { 1 } else { count.clamp(1, n) };
        self.redundancy.store(clamped, Ordering::Relaxed);
    }

    pub fn redundancy(&self) -> usize {
        self.redundancy.load(Ordering::Relaxed)
    }

    /// 이 프레임에 적용할 클론 수
    ///
    /// 키프레임은 일시적으로 min(3, max(2, N/2))로 올림
    pub fn effective_redundancy(&self, keyframe: bool) -> usize {
        let n = self.tunnels.len();
        if n <= 1 {
            return 1;
        }
        if keyframe {
            (n / 2).max(2).min(3).clamp(1, n)
        } else {
            self.redundancy()
        }
    }

    /// 최적 터널 인덱스 (rtt + 1000*loss 최소)
    pub fn best_index(&self) -> usize {
        let stats = self.stats.read();
        let mut best = 0;
        let mut best_score = f64::MAX;
        for (i, s) in stats.iter().enumerate() {
            if s.score() < best_score {
                best_score = s.score();
                best = i;
            }
        }
        best
    }

    /// 가중 룰렛 선택
    ///
    /// 제외 목록을 피해 손실/RTT 역비례 가중치로 추첨.
    /// 스캔은 라운드로빈 커서부터 시작.
    pub fn select_weighted(&self, exclude: &[usize]) -> usize {
        let n = self.tunnels.len();
        if n == 1 {
            return 0;
        }

        let stats = self.stats.read();
        let mut weights = vec![0.0f64; n];
        let mut sum_w = 0.0;
        for (i, s) in stats.iter().enumerate() {
            if exclude.contains(&i) {
                continue;
            }
            let denom = EPSILON + ALPHA * s.packet_loss + BETA * s.avg_rtt_ms.max(0.0);
            let w = if denom > 0.0 { 1.0 / denom } else { 0.0 };
            weights[i] = w;
            sum_w += w;
        }
        drop(stats);

        let mut cursor = self.rr_cursor.lock();
        let start = *cursor % n;

        if sum_w <= 0.0 {
            // 폴백: 커서부터 라운드로빈
            for of in 0..n {
                let i = (start + of) % n;
                if !exclude.contains(&i) {
                    *cursor = (i + 1) % n;
                    return i;
                }
            }
            return self.best_index();
        }

        let pick = rand::thread_rng().gen::<f64>() * sum_w;
        let mut acc = 0.0;
        for of in 0..n {
            let i = (start + of) % n;
            if exclude.contains(&i) {
                continue;
            }
            acc += weights[i];
            if pick <= acc {
                *cursor = (i + 1) % n;
                return i;
            }
        }
        drop(cursor);
        self.best_index()
    }

    /// 패리티 슬라이스 경로 다변화
    ///
    /// 선택이 최적 터널이거나 같은 프레임의 데이터 경로와 겹치면
    /// 다른 터널로 이동. 패리티는 가능한 한 데이터와 다른 경로로.
    pub fn parity_index(
        &self,
        chosen: usize,
        exclude: &[usize],
        data_tunnels: &HashSet<usize>,
    ) -> usize {
        let n = self.tunnels.len();
        if n <= 1 {
            return chosen;
        }

        let best = self.best_index();
        if chosen != best && !data_tunnels.contains(&chosen) {
            return chosen;
        }

        // 1순위: 데이터 경로와 최적 경로를 모두 피함
        let mut idx = (chosen + 1) % n;
        for _ in 0..n {
            if !exclude.contains(&idx) && idx != best && !data_tunnels.contains(&idx) {
                return idx;
            }
            idx = (idx + 1) % n;
        }
        // 2순위: 데이터 경로만 피함
        let mut idx = (chosen + 1) % n;
        for _ in 0..n {
            if !exclude.contains(&idx) && !data_tunnels.contains(&idx) {
                return idx;
            }
            idx = (idx + 1) % n;
        }
        // 3순위: 최적 경로만 피함
        let mut idx = (chosen + 1) % n;
        for _ in 0..n {
            if !exclude.contains(&idx) && idx != best {
                return idx;
            }
            idx = (idx + 1) % n;
        }
        chosen
    }

    /// 터널 하나로 데이터그램 전송
    ///
    /// EAGAIN/ENOBUFS는 200us 간격으로 최대 3회 재시도.
    /// 영구 실패는 카운트만 하고 버림 (UDP best-effort).
    pub async fn send_to_tunnel(&self, index: usize, datagram: &[u8]) -> bool {
        let tunnel = match self.tunnels.get(index) {
            Some(t) => t,
            None => return false,
        };
        let dest = SocketAddr::new(self.remote_ip, tunnel.remote_port);

        for _ in 0..SEND_ATTEMPTS {
            match tunnel.socket.try_send_to(datagram, dest) {
                Ok(_) => return true,
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.raw_os_error() == Some(105) =>
                {
                    tokio::time::sleep(Duration::from_micros(SEND_RETRY_US)).await;
                }
                Err(_) => break,
            }
        }

        self.send_failures.fetch_add(1, Ordering::Relaxed);
        false
    }
}
