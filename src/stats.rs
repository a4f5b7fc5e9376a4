//! 터널 통계와 전송 집계
//!
//! 터널별 통계는 프로파일러가 단일 작성자, 패킷타이저/송신기/컨트롤러가
//! 다수 독자. 스냅샷은 Arc 교체로 원자적으로 발행됨.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// 터널별 채널 통계
#[derive(Debug, Clone)]
pub struct TunnelStat {
    /// 원격 터널 포트
    pub port: u16,

    /// 평균 RTT (밀리초, EWMA)
    pub avg_rtt_ms: f64,

    /// 패킷 손실률 (0.0 ~ 1.0)
    pub packet_loss: f64,

    /// 보낸 프로브 수
    pub sent: u64,

    /// 응답 받은 프로브 수
    pub received: u64,
}

impl TunnelStat {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            avg_rtt_ms: 10.0,
            packet_loss: 0.0,
            sent: 0,
            received: 0,
        }
    }

    /// 프로브 라운드 결과 반영
    ///
    /// 성공 시 RTT EWMA 갱신 (alpha = 0.2), 실패 시 손실률만 악화
    pub fn update(&mut self, success: bool, rtt_ms: f64) {
        self.sent += 1;
        if success {
            self.received += 1;
            self.avg_rtt_ms = 0.8 * self.avg_rtt_ms + 0.2 * rtt_ms;
        }
        if self.sent > 0 {
            self.packet_loss = 1.0 - (self.received as f64 / self.sent as f64);
        }
    }

    /// 경로 점수 - 낮을수록 좋음
    pub fn score(&self) -> f64 {
        self.avg_rtt_ms + 1000.0 * self.packet_loss
    }
}

/// 통계 스냅샷 핸들
///
/// 독자는 항상 완전한 스냅샷을 봄 - 터널 행이 섞이지 않음
#[derive(Clone)]
pub struct StatsHandle {
    inner: Arc<RwLock<Arc<Vec<TunnelStat>>>>,
}

impl StatsHandle {
    pub fn new(ports: &[u16]) -> Self {
        let stats: Vec<TunnelStat> = ports.iter().map(|&p| TunnelStat::new(p)).collect();
        Self {
            inner: Arc::new(RwLock::new(Arc::new(stats))),
        }
    }

    /// 전체 스냅샷 교체 (프로파일러 전용)
    pub fn publish(&self, stats: Vec<TunnelStat>) {
        *self.inner.write() = Arc::new(stats);
    }

    /// 현재 스냅샷
    pub fn snapshot(&self) -> Arc<Vec<TunnelStat>> {
        self.inner.read().clone()
    }

    /// 활성 터널 평균 손실률 (터널 없으면 0)
    pub fn avg_loss(&self) -> f64 {
        let snap = self.snapshot();
        if snap.is_empty() {
            return 0.0;
        }
        snap.iter().map(|s| s.packet_loss).sum::<f64>() / snap.len() as f64
    }

    /// 평균 RTT (밀리초)
    pub fn avg_rtt_ms(&self) -> f64 {
        let snap = self.snapshot();
        if snap.is_empty() {
            return 0.0;
        }
        snap.iter().map(|s| s.avg_rtt_ms).sum::<f64>() / snap.len() as f64
    }

    /// 최악 RTT (밀리초) - 누적기 TTL 계산용 p95 대용
    pub fn max_rtt_ms(&self) -> f64 {
        self.snapshot()
            .iter()
            .map(|s| s.avg_rtt_ms)
            .fold(0.0, f64::max)
    }
}

/// 세션 전송 집계 (여러 태스크가 동시에 갱신)
#[derive(Debug, Default)]
pub struct TransferStats {
    /// 입력된 프레임 수
    pub frames_in: AtomicU64,

    /// 전송한 슬라이스 수 (클론 포함)
    pub slices_sent: AtomicU64,

    /// 클론 전송 수
    pub clones_sent: AtomicU64,

    /// 영구 송신 실패 수
    pub send_failures: AtomicU64,

    /// 백프레셔로 드롭된 슬라이스 수
    pub slices_dropped: AtomicU64,

    /// 수신한 데이터그램 수
    pub datagrams_received: AtomicU64,

    /// 검증 실패로 버린 슬라이스 수
    pub invalid_slices: AtomicU64,

    /// 중복 수신 슬라이스 수
    pub duplicate_slices: AtomicU64,

    /// 조립 완료된 프레임 수
    pub frames_emitted: AtomicU64,

    /// FEC로 복구된 프레임 수
    pub fec_recoveries: AtomicU64,

    /// FEC 복구 실패 수 (코덱이 올바르면 발생하지 않음)
    pub fec_failures: AtomicU64,

    /// TTL 만료로 버린 프레임 수
    pub frames_timed_out: AtomicU64,

    /// 에코한 프로브 수
    pub probes_echoed: AtomicU64,
}

impl TransferStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, field: &AtomicU64, n: u64) {
        field.fetch_add(n, Ordering::Relaxed);
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "frames in/out: {}/{} | slices sent: {} (+{} clones) | dropped: {} | invalid: {} | dup: {} | fec recovered: {} | timed out: {}",
            self.frames_in.load(Ordering::Relaxed),
            self.frames_emitted.load(Ordering::Relaxed),
            self.slices_sent.load(Ordering::Relaxed),
            self.clones_sent.load(Ordering::Relaxed),
            self.slices_dropped.load(Ordering::Relaxed),
            self.invalid_slices.load(Ordering::Relaxed),
            self.duplicate_slices.load(Ordering::Relaxed),
            self.fec_recoveries.load(Ordering::Relaxed),
            self.frames_timed_out.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ewma_convergence() {
        // RTT 10ms에서 시작, 30ms 샘플을 연속 반영하면
        // 10라운드 안에 정상 상태 1ms 이내로 수렴해야 함
        let mut stat = TunnelStat::new(4000);
        stat.update(true, 10.0);
        stat.update(true, 10.0);
        stat.update(true, 10.0);

        for _ in 0..10 {
            stat.update(true, 30.0);
        }
        assert!((stat.avg_rtt_ms - 30.0).abs() < 3.0);

        // 단일 30ms 샘플 후 기대값: 0.8*10 + 0.2*30 = 14ms
        let mut stat = TunnelStat::new(4000);
        stat.update(true, 10.0);
        stat.update(true, 10.0);
        stat.update(true, 10.0);
        stat.update(true, 30.0);
        assert!((stat.avg_rtt_ms - 14.0).abs() < 1.0);
    }

    #[test]
    fn test_loss_accounting() {
        let mut stat = TunnelStat::new(4001);
        stat.update(true, 5.0);
        stat.update(false, 0.0);
        stat.update(true, 5.0);
        stat.update(false, 0.0);

        assert_eq!(stat.sent, 4);
        assert_eq!(stat.received, 2);
        assert!((stat.packet_loss - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_snapshot_swap() {
        let handle = StatsHandle::new(&[4000, 4001]);
        let before = handle.snapshot();
        assert_eq!(before.len(), 2);
        assert!((handle.avg_loss() - 0.0).abs() < 1e-9);

        let mut updated = before.as_ref().clone();
        updated[0].update(false, 0.0);
        updated[1].update(true, 20.0);
        handle.publish(updated);

        let after = handle.snapshot();
        assert!((after[0].packet_loss - 1.0).abs() < 1e-9);
        assert!((handle.avg_loss() - 0.5).abs() < 1e-9);
        // 이전 스냅샷은 영향 받지 않음
        assert!((before[0].packet_loss - 0.0).abs() < 1e-9);
    }
}
