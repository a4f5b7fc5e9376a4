//! 패킷타이저 - 프레임을 슬라이스 + FEC 패리티로 분할
//!
//! 패리티 수 r은 현재 터널 손실률 스냅샷에서 프레임마다 다시 계산됨

use bytes::{Bytes, BytesMut};

use crate::fec::FecCodec;
use crate::frame::EncodedFrame;
use crate::slice::{fnv1a, SliceHeader, FLAG_KEYFRAME, FLAG_PARITY};
use crate::stats::StatsHandle;
use crate::{Error, Result, HEADER_SIZE, MAX_FEC_SHARDS, MIN_PAYLOAD_BYTES};

/// 한 프레임의 슬라이스 묶음 (송신 큐 단위)
#[derive(Debug, Clone)]
pub struct FrameSlices {
    /// 와이어 frame_id (호출자 프레임 ID의 하위 32비트)
    pub unit_id: u32,

    /// 키프레임 여부
    pub keyframe: bool,

    /// 데이터 슬라이스 (인덱스 0..k)
    pub data: Vec<Bytes>,

    /// 패리티 슬라이스 (인덱스 k..k+r)
    pub parity: Vec<Bytes>,
}

impl FrameSlices {
    /// 묶음 내 총 슬라이스 수
    pub fn slice_count(&self) -> usize {
        self.data.len() + self.parity.len()
    }
}

/// 손실률 기반 FEC 비율 계산
///
/// 기본 20% + 손실률 비례 가중, 최대 50%
pub fn fec_ratio(avg_loss: f64) -> f64 {
    (0.20 + 1.5 * avg_loss.max(0.01)).clamp(0.20, 0.50)
}

/// 패리티 슬라이스 수 결정
pub fn parity_count(k: usize, avg_loss: f64, keyframe: bool) -> usize {
    if k <= 1 {
        // 단일 슬라이스 프레임은 FEC 생략
        return 0;
    }

    let ratio = fec_ratio(avg_loss);
    let mut r = ((k as f64 * ratio).ceil() as usize).clamp(2, (k / 2).max(4));
    if keyframe {
        r = (r + 2).min(k * 2 / 3);
    }
    // GF(2^8) 한계 내로 유지
    r.min(MAX_FEC_SHARDS - k)
}

/// 패킷타이저
///
/// 상태 없음 - 와이어 frame_id는 호출자가 준 프레임 ID의 하위 32비트.
/// 프레임 ID는 송신자별 단조 증가가 입력 계약이므로 와이어 ID도 단조.
pub struct Packetizer {
    mtu: usize,
    payload_bytes: usize,
    fec: FecCodec,
    stats: StatsHandle,
}

impl Packetizer {
    pub fn new(mtu: usize, stats: StatsHandle) -> Result<Self> {
        let payload_bytes = mtu.saturating_sub(HEADER_SIZE);
        if payload_bytes < MIN_PAYLOAD_BYTES {
            return Err(Error::MtuTooSmall {
                payload: payload_bytes,
                min: MIN_PAYLOAD_BYTES,
            });
        }

        Ok(Self {
            mtu,
            payload_bytes,
            fec: FecCodec::new(),
            stats,
        })
    }

    /// 슬라이스당 페이로드 크기
    pub fn payload_bytes(&self) -> usize {
        self.payload_bytes
    }

    /// 프레임을 데이터 + 패리티 슬라이스로 변환
    pub fn packetize(&self, frame: &EncodedFrame) -> Result<FrameSlices> {
        let k = (frame.payload.len() + self.payload_bytes - 1) / self.payload_bytes;
        let k = k.max(1);
        if k + 2 > MAX_FEC_SHARDS {
            return Err(Error::FrameTooLarge {
                k,
                max: MAX_FEC_SHARDS,
            });
        }

        let r = parity_count(k, self.stats.avg_loss(), frame.is_keyframe);
        let unit_id = frame.frame_id as u32;

        let timestamp_us = frame.timestamp_ns / 1_000;
        let base_flags = if frame.is_keyframe { FLAG_KEYFRAME } else { 0 };

        // 데이터 슬라이스 버퍼 - 0으로 채운 MTU 크기, 마지막은 패딩됨
        let mut data_bufs: Vec<BytesMut> = Vec::with_capacity(k);
        let mut offset = 0usize;
        for _ in 0..k {
            let mut buf = BytesMut::zeroed(self.mtu);
            let remain = frame.payload.len().saturating_sub(offset);
            let copy_len = remain.min(self.payload_bytes);
            if copy_len > 0 {
                buf[HEADER_SIZE..HEADER_SIZE + copy_len]
                    .copy_from_slice(&frame.payload[offset..offset + copy_len]);
                offset += copy_len;
            }
            data_bufs.push(buf);
        }

        // 패리티 페이로드 생성
        let mut parity_bufs: Vec<BytesMut> = (0..r).map(|_| BytesMut::zeroed(self.mtu)).collect();
        {
            let mut shards: Vec<&mut [u8]> = Vec::with_capacity(k + r);
            for buf in data_bufs.iter_mut() {
                shards.push(&mut buf[HEADER_SIZE..]);
            }
            for buf in parity_bufs.iter_mut() {
                shards.push(&mut buf[HEADER_SIZE..]);
            }
            self.fec.encode(&mut shards, k, r)?;
        }

        let header_template = SliceHeader {
            frame_id: unit_id,
            slice_index: 0,
            total_slices: (k + r) as u16,
            k_data: k as u16,
            r_parity: r as u16,
            payload_bytes: self.payload_bytes as u16,
            total_frame_bytes: frame.payload.len() as u32,
            timestamp_us,
            flags: base_flags,
            checksum: 0,
        };

        let data = data_bufs
            .into_iter()
            .enumerate()
            .map(|(i, mut buf)| {
                let mut header = header_template;
                header.slice_index = i as u16;
                header.checksum = fnv1a(&buf[HEADER_SIZE..]);
                header.encode_into(&mut buf);
                buf.freeze()
            })
            .collect();

        let parity = parity_bufs
            .into_iter()
            .enumerate()
            .map(|(i, mut buf)| {
                let mut header = header_template;
                header.slice_index = (k + i) as u16;
                header.flags = base_flags | FLAG_PARITY;
                header.checksum = fnv1a(&buf[HEADER_SIZE..]);
                header.encode_into(&mut buf);
                buf.freeze()
            })
            .collect();

        Ok(FrameSlices {
            unit_id,
            keyframe: frame.is_keyframe,
            data,
            parity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slice::validate_datagram;
    use crate::DEFAULT_CODEC_FOURCC;

    fn test_frame(frame_id: u64, len: usize, keyframe: bool) -> EncodedFrame {
        let payload: Vec<u8> = (0..len).map(|i| (i * 13 % 251) as u8).collect();
        EncodedFrame::new(
            frame_id,
            7_000_000,
            DEFAULT_CODEC_FOURCC,
            keyframe,
            payload.into(),
        )
    }

    #[test]
    fn test_fec_ratio_bounds() {
        assert!((fec_ratio(0.0) - 0.215).abs() < 1e-9);
        assert!((fec_ratio(0.2) - 0.50).abs() < 1e-9);
        assert!((fec_ratio(0.9) - 0.50).abs() < 1e-9);
    }

    #[test]
    fn test_parity_count_policy() {
        // k=1은 FEC 생략
        assert_eq!(parity_count(1, 0.0, false), 0);
        assert_eq!(parity_count(1, 0.5, true), 0);

        // 낮은 손실에서 최소 2개 패리티
        assert_eq!(parity_count(4, 0.0, false), 2);

        // 키프레임 보정은 floor(2k/3) 한도 내
        assert_eq!(parity_count(4, 0.0, true), 2);
        assert_eq!(parity_count(12, 0.0, true), 5);

        // 높은 손실에서 50% 비율까지
        assert_eq!(parity_count(20, 0.5, false), 10);
    }

    #[test]
    fn test_packetize_layout() {
        let stats = StatsHandle::new(&[]);
        let packetizer = Packetizer::new(1200, stats).unwrap();
        let frame = test_frame(7, 4096, true);

        let built = packetizer.packetize(&frame).unwrap();
        // 페이로드 1165바이트 기준 4096 → 4 슬라이스
        assert_eq!(built.unit_id, 7);
        assert_eq!(built.data.len(), 4);
        assert!(built.parity.len() >= 2);
        assert!(built.keyframe);

        // 모든 슬라이스는 정확히 MTU 크기, 검증 통과
        for slice in built.data.iter().chain(built.parity.iter()) {
            assert_eq!(slice.len(), 1200);
            let header = validate_datagram(slice).unwrap();
            assert_eq!(header.frame_id, 7);
            assert_eq!(header.k_data, 4);
            assert_eq!(header.total_frame_bytes, 4096);
            assert_eq!(header.timestamp_us, 7_000);
            assert!(header.is_keyframe());
        }

        // 데이터/패리티 플래그와 인덱스 구간
        for (i, slice) in built.data.iter().enumerate() {
            let header = validate_datagram(slice).unwrap();
            assert_eq!(header.slice_index as usize, i);
            assert!(!header.is_parity());
        }
        for (i, slice) in built.parity.iter().enumerate() {
            let header = validate_datagram(slice).unwrap();
            assert_eq!(header.slice_index as usize, 4 + i);
            assert!(header.is_parity());
        }
    }

    #[test]
    fn test_wire_id_follows_frame_id() {
        // 와이어 frame_id는 호출자 프레임 ID의 하위 32비트
        let stats = StatsHandle::new(&[]);
        let packetizer = Packetizer::new(1200, stats).unwrap();

        let a = packetizer.packetize(&test_frame(5, 100, false)).unwrap();
        let b = packetizer.packetize(&test_frame(6, 100, false)).unwrap();
        assert_eq!(a.unit_id, 5);
        assert_eq!(b.unit_id, 6);

        // 32비트 초과분은 잘림
        let wrapped = packetizer
            .packetize(&test_frame(0x1_0000_0007, 100, false))
            .unwrap();
        assert_eq!(wrapped.unit_id, 7);
    }

    #[test]
    fn test_empty_frame_single_slice() {
        let stats = StatsHandle::new(&[]);
        let packetizer = Packetizer::new(1200, stats).unwrap();
        let frame = EncodedFrame::new(0, 0, DEFAULT_CODEC_FOURCC, false, Bytes::new());

        let built = packetizer.packetize(&frame).unwrap();
        assert_eq!(built.data.len(), 1);
        assert!(built.parity.is_empty());
    }

    #[test]
    fn test_mtu_too_small() {
        let stats = StatsHandle::new(&[]);
        assert!(matches!(
            Packetizer::new(HEADER_SIZE + MIN_PAYLOAD_BYTES - 1, stats),
            Err(Error::MtuTooSmall { .. })
        ));
    }
}
