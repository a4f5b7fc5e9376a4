//! 프로토콜 설정

use crate::{Error, Result, DEFAULT_CODEC_FOURCC, DEFAULT_MTU, HEADER_SIZE, MAX_MTU, MIN_MTU,
    MIN_PAYLOAD_BYTES};

/// VSP 프로토콜 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 슬라이스(데이터그램) 크기 (바이트), 200~2000
    pub mtu: usize,

    /// 프로브 주기 (밀리초)
    pub probe_interval_ms: u64,

    /// 프로브 응답 대기 타임아웃 (밀리초)
    pub probe_timeout_ms: u64,

    /// 슬라이스 큐 백프레셔 대기 상한 (밀리초)
    /// 큐가 가득 차면 최대 1 프레임 시간만큼 대기 후 드롭 정책 적용
    pub frame_interval_ms: u64,

    /// 슬라이스 큐 용량 (프레임 묶음 단위)
    pub queue_capacity: usize,

    /// 동시 조립 가능한 최대 프레임 수
    /// 초과 시 가장 오래된 누적기부터 퇴출
    pub max_accumulators: usize,

    /// 누적기 TTL (밀리초), 300~2000 범위로 클램프됨
    /// 권장값은 2 x RTT_p95
    pub accumulator_ttl_ms: u64,

    /// 누적기 GC 주기 (밀리초)
    pub gc_interval_ms: u64,

    /// 슬라이스당 기본 중복 전송 터널 수
    /// 터널이 1개면 1로 강제됨
    pub redundancy: usize,

    /// 수신 프레임에 찍을 코덱 fourcc
    /// 슬라이스 헤더는 코덱 정보를 싣지 않으므로 세션 단위로 고정
    pub codec_fourcc: u32,

    /// 수신 버퍼 크기
    pub recv_buffer_size: usize,

    /// 송신 버퍼 크기
    pub send_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            probe_interval_ms: 3000,          // 3초마다 프로브
            probe_timeout_ms: 150,
            frame_interval_ms: 33,            // ~30 FPS
            queue_capacity: 64,
            max_accumulators: 64,
            accumulator_ttl_ms: 600,
            gc_interval_ms: 100,
            redundancy: 2,
            codec_fourcc: DEFAULT_CODEC_FOURCC,
            recv_buffer_size: 8 * 1024 * 1024,  // 8MB
            send_buffer_size: 16 * 1024 * 1024, // 16MB
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 슬라이스당 페이로드 크기
    pub fn payload_bytes(&self) -> usize {
        self.mtu.saturating_sub(HEADER_SIZE)
    }

    /// 설정 검증 (시작 시 1회)
    pub fn validate(&self) -> Result<()> {
        if self.mtu < MIN_MTU || self.mtu > MAX_MTU {
            return Err(Error::InvalidMtu {
                mtu: self.mtu,
                min: MIN_MTU,
                max: MAX_MTU,
            });
        }
        if self.payload_bytes() < MIN_PAYLOAD_BYTES {
            return Err(Error::MtuTooSmall {
                payload: self.payload_bytes(),
                min: MIN_PAYLOAD_BYTES,
            });
        }
        Ok(())
    }

    /// 불안정한 네트워크용 설정
    pub fn lossy_network() -> Self {
        Self {
            mtu: 1000,                        // 작은 슬라이스
            probe_interval_ms: 1500,          // 더 자주 측정
            probe_timeout_ms: 300,
            queue_capacity: 32,
            accumulator_ttl_ms: 1200,         // 느린 경로 대비 여유
            redundancy: 3,
            ..Self::default()
        }
    }

    /// 저지연 우선 설정
    pub fn low_latency() -> Self {
        Self {
            probe_interval_ms: 2000,
            probe_timeout_ms: 100,
            frame_interval_ms: 16,            // ~60 FPS
            queue_capacity: 16,
            accumulator_ttl_ms: 300,          // 늦은 프레임은 버림
            redundancy: 1,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.payload_bytes(), DEFAULT_MTU - HEADER_SIZE);
    }

    #[test]
    fn test_mtu_out_of_range() {
        let mut config = Config::default();
        config.mtu = 100;
        assert!(matches!(config.validate(), Err(Error::InvalidMtu { .. })));

        config.mtu = 3000;
        assert!(matches!(config.validate(), Err(Error::InvalidMtu { .. })));
    }

    #[test]
    fn test_payload_floor() {
        // MTU 200은 허용 범위지만 페이로드 165 bytes >= 64 이므로 통과
        let mut config = Config::default();
        config.mtu = 200;
        assert!(config.validate().is_ok());
        assert_eq!(config.payload_bytes(), 200 - HEADER_SIZE);
    }
}
