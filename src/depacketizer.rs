//! 디패킷타이저 - 슬라이스를 프레임으로 재조립
//!
//! - frame_id별 누적기: 비트맵 + k+r 페이로드 슬롯
//! - 유효 슬라이스 k개 도착 즉시 방출 (필요 시 FEC 복구)
//! - TTL 초과 누적기는 GC로 폐기, 부분 프레임은 방출하지 않음

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tracing::{debug, warn};

use crate::fec::FecCodec;
use crate::frame::EncodedFrame;
use crate::slice::{validate_datagram, SliceHeader};
use crate::{Error, Result, HEADER_SIZE};

/// 최근 방출된 프레임 ID 기억 수 (중복 재조립 방지)
const EMITTED_MEMORY: usize = 1024;

/// 누적기 TTL 권장값: 2 x RTT_p95, 300ms ~ 2s 클램프
pub fn ttl_for_rtt(rtt_p95_ms: f64) -> Duration {
    Duration::from_millis(((2.0 * rtt_p95_ms) as u64).clamp(300, 2000))
}

/// 프레임 누적기
struct Accumulator {
    /// 첫 슬라이스에서 채택한 프레임 파라미터
    k: usize,
    r: usize,
    payload_bytes: usize,
    total_frame_bytes: usize,
    timestamp_us: u64,
    keyframe: bool,

    /// k+r 페이로드 슬롯 (payload_bytes 고정 길이)
    shards: Vec<Vec<u8>>,

    /// 슬라이스 인덱스별 수신 비트맵
    present: Vec<bool>,

    /// 유효 수신 슬라이스 수
    received: usize,

    /// GC 기준 시각
    first_seen: Instant,
}

impl Accumulator {
    fn new(header: &SliceHeader, now: Instant) -> Self {
        let k = header.k_data as usize;
        let r = header.r_parity as usize;
        let payload_bytes = header.payload_bytes as usize;

        Self {
            k,
            r,
            payload_bytes,
            total_frame_bytes: header.total_frame_bytes as usize,
            timestamp_us: header.timestamp_us,
            keyframe: header.is_keyframe(),
            shards: (0..k + r).map(|_| vec![0u8; payload_bytes]).collect(),
            present: vec![false; k + r],
            received: 0,
            first_seen: now,
        }
    }

    /// 후속 슬라이스가 채택된 파라미터와 일치하는지 확인
    fn matches(&self, header: &SliceHeader) -> bool {
        self.k == header.k_data as usize
            && self.r == header.r_parity as usize
            && self.payload_bytes == header.payload_bytes as usize
            && self.total_frame_bytes == header.total_frame_bytes as usize
            && self.timestamp_us == header.timestamp_us
    }

    /// 데이터 슬라이스가 전부 있는지
    fn all_data_present(&self) -> bool {
        self.present[..self.k].iter().all(|&p| p)
    }
}

/// 디패킷타이저
pub struct Depacketizer {
    accumulators: HashMap<u32, Accumulator>,
    fec: FecCodec,
    codec_fourcc: u32,
    max_accumulators: usize,

    /// 최근 방출된 frame_id - 방출 후 도착하는 중복은 무시
    emitted: HashSet<u32>,
    emitted_order: VecDeque<u32>,

    /// FEC 복구/실패/타임아웃 카운터
    pub fec_recoveries: u64,
    pub fec_failures: u64,
    pub frames_timed_out: u64,
    pub duplicate_slices: u64,
}

impl Depacketizer {
    pub fn new(codec_fourcc: u32, max_accumulators: usize) -> Self {
        Self {
            accumulators: HashMap::new(),
            fec: FecCodec::new(),
            codec_fourcc,
            max_accumulators: max_accumulators.max(1),
            emitted: HashSet::new(),
            emitted_order: VecDeque::new(),
            fec_recoveries: 0,
            fec_failures: 0,
            frames_timed_out: 0,
            duplicate_slices: 0,
        }
    }

    /// 진행 중인 누적기 수
    pub fn pending(&self) -> usize {
        self.accumulators.len()
    }

    /// 수신 데이터그램 처리
    ///
    /// 프레임이 완성되면 방출. 유효하지 않은 슬라이스는 Err - 호출자는
    /// 카운트만 하고 계속 진행.
    pub fn push(&mut self, datagram: &[u8]) -> Result<Option<EncodedFrame>> {
        let header = validate_datagram(datagram)?;
        let frame_id = header.frame_id;

        // 이미 방출된 프레임의 지각/중복 슬라이스
        if self.emitted.contains(&frame_id) {
            self.duplicate_slices += 1;
            return Ok(None);
        }

        let now = Instant::now();

        if !self.accumulators.contains_key(&frame_id) {
            self.evict_if_full();
            self.accumulators
                .insert(frame_id, Accumulator::new(&header, now));
        }

        let acc = self.accumulators.get_mut(&frame_id).unwrap();

        // 첫 슬라이스와 파라미터가 다르면 드롭
        if !acc.matches(&header) {
            debug!("슬라이스 파라미터 불일치: frame_id={}", frame_id);
            return Err(Error::SliceCountMismatch {
                k: header.k_data,
                r: header.r_parity,
                total: header.total_slices,
            });
        }

        let index = header.slice_index as usize;
        if acc.present[index] {
            self.duplicate_slices += 1;
            return Ok(None);
        }

        acc.shards[index].copy_from_slice(&datagram[HEADER_SIZE..]);
        acc.present[index] = true;
        acc.received += 1;

        if acc.received < acc.k {
            return Ok(None);
        }

        // k개 확보 - 재조립
        let mut acc = self.accumulators.remove(&frame_id).unwrap();

        if !acc.all_data_present() {
            let k = acc.k;
            let r = acc.r;
            let mut shards: Vec<(&mut [u8], bool)> = acc
                .shards
                .iter_mut()
                .zip(acc.present.iter())
                .map(|(s, &p)| (s.as_mut_slice(), p))
                .collect();

            if let Err(e) = self.fec.reconstruct(&mut shards, k, r) {
                // 코덱이 올바르면 도달 불가 - 프레임 포기
                warn!("FEC 복구 실패: frame_id={}, {}", frame_id, e);
                self.fec_failures += 1;
                self.remember_emitted(frame_id);
                return Ok(None);
            }
            self.fec_recoveries += 1;
        }

        let mut payload = BytesMut::with_capacity(acc.k * acc.payload_bytes);
        for shard in acc.shards.iter().take(acc.k) {
            payload.extend_from_slice(shard);
        }
        payload.truncate(acc.total_frame_bytes);

        self.remember_emitted(frame_id);

        // 와이어 frame_id는 송신 측 프레임 ID 그대로 - 변환 없이 방출
        Ok(Some(EncodedFrame {
            frame_id: frame_id as u64,
            timestamp_ns: acc.timestamp_us * 1_000,
            codec_fourcc: self.codec_fourcc,
            is_keyframe: acc.keyframe,
            payload: payload.freeze(),
        }))
    }

    /// TTL 초과 누적기 폐기 (주기적으로 호출)
    pub fn sweep(&mut self, ttl: Duration) -> usize {
        let now = Instant::now();
        let before = self.accumulators.len();
        self.accumulators.retain(|frame_id, acc| {
            let expired = now.duration_since(acc.first_seen) > ttl;
            if expired {
                debug!(
                    "프레임 타임아웃: frame_id={}, {}/{} 슬라이스",
                    frame_id,
                    acc.received,
                    acc.k + acc.r
                );
            }
            !expired
        });
        let dropped = before - self.accumulators.len();
        self.frames_timed_out += dropped as u64;
        dropped
    }

    /// 용량 초과 시 가장 오래된 누적기 퇴출
    fn evict_if_full(&mut self) {
        while self.accumulators.len() >= self.max_accumulators {
            let oldest = self
                .accumulators
                .iter()
                .min_by_key(|(_, acc)| acc.first_seen)
                .map(|(&id, _)| id);
            match oldest {
                Some(id) => {
                    self.accumulators.remove(&id);
                    self.frames_timed_out += 1;
                    warn!("누적기 용량 초과: frame_id={} 퇴출", id);
                }
                None => break,
            }
        }
    }

    fn remember_emitted(&mut self, frame_id: u32) {
        if self.emitted.insert(frame_id) {
            self.emitted_order.push_back(frame_id);
            while self.emitted_order.len() > EMITTED_MEMORY {
                if let Some(old) = self.emitted_order.pop_front() {
                    self.emitted.remove(&old);
                }
            }
        }
    }
}
