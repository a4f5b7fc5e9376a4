//! FEC 코덱 - systematic Reed-Solomon over GF(2^8)
//!
//! k개 데이터 블록에서 r개 패리티 블록을 생성하고, k+r 중 아무 k개로
//! 원본 데이터 블록을 복원. (k, r)별 코덱 인스턴스는 행렬 재생성을
//! 피하기 위해 캐시됨 - 핫 패스에서 슬라이스당 할당 없음.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::{Error, Result, MAX_FEC_SHARDS};

/// (k, r)별 Reed-Solomon 인스턴스 캐시
pub struct FecCodec {
    cache: Mutex<HashMap<(usize, usize), Arc<ReedSolomon>>>,
}

impl FecCodec {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn codec(&self, k: usize, r: usize) -> Result<Arc<ReedSolomon>> {
        if let Some(rs) = self.cache.lock().get(&(k, r)) {
            return Ok(rs.clone());
        }

        let rs = Arc::new(
            ReedSolomon::new(k, r).map_err(|e| Error::FecFailure(e.to_string()))?,
        );
        self.cache.lock().insert((k, r), rs.clone());
        Ok(rs)
    }

    /// 패리티 인코딩
    ///
    /// `shards`는 k개 데이터 블록 + r개 0으로 채워진 패리티 블록.
    /// 모든 블록은 같은 길이. r=0이면 패스스루 (k=1 케이스).
    pub fn encode(&self, shards: &mut [&mut [u8]], k: usize, r: usize) -> Result<()> {
        debug_assert_eq!(shards.len(), k + r);
        if r == 0 {
            return Ok(());
        }
        if k + r > MAX_FEC_SHARDS {
            return Err(Error::FrameTooLarge {
                k,
                max: MAX_FEC_SHARDS,
            });
        }

        self.codec(k, r)?
            .encode(shards)
            .map_err(|e| Error::FecFailure(e.to_string()))
    }

    /// 누락 블록 복원
    ///
    /// `shards`는 k+r개 (블록, 수신 여부) 쌍. 유효 블록이 k개 이상이면
    /// 누락된 데이터 블록이 제자리에서 복원됨.
    pub fn reconstruct(
        &self,
        shards: &mut [(&mut [u8], bool)],
        k: usize,
        r: usize,
    ) -> Result<()> {
        debug_assert_eq!(shards.len(), k + r);
        let present = shards.iter().filter(|(_, ok)| *ok).count();
        if present < k {
            return Err(Error::InsufficientSlices {
                have: present,
                need: k,
            });
        }
        if r == 0 {
            // 패리티 없음 - 데이터 블록이 전부 있어야만 여기 도달
            return Ok(());
        }

        self.codec(k, r)?
            .reconstruct(shards)
            .map_err(|e| Error::FecFailure(e.to_string()))
    }
}

impl Default for FecCodec {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_data(k: usize, len: usize) -> Vec<Vec<u8>> {
        (0..k)
            .map(|i| (0..len).map(|j| ((i * 31 + j * 7) & 0xFF) as u8).collect())
            .collect()
    }

    fn encode_all(codec: &FecCodec, data: &[Vec<u8>], r: usize) -> Vec<Vec<u8>> {
        let k = data.len();
        let len = data[0].len();
        let mut blocks: Vec<Vec<u8>> = data.to_vec();
        blocks.extend((0..r).map(|_| vec![0u8; len]));

        let mut refs: Vec<&mut [u8]> = blocks.iter_mut().map(|b| b.as_mut_slice()).collect();
        codec.encode(&mut refs, k, r).unwrap();
        blocks
    }

    #[test]
    fn test_encode_deterministic() {
        let codec = FecCodec::new();
        let data = make_data(4, 64);
        let a = encode_all(&codec, &data, 2);
        let b = encode_all(&codec, &data, 2);
        assert_eq!(a, b);
    }

    #[test]
    fn test_recover_lost_data_blocks() {
        let codec = FecCodec::new();
        let k = 5;
        let r = 3;
        let data = make_data(k, 128);
        let encoded = encode_all(&codec, &data, r);

        // 데이터 블록 3개 손실 (r개까지 복구 가능)
        let mut blocks = encoded.clone();
        let mut present = vec![true; k + r];
        for &lost in &[0usize, 2, 4] {
            blocks[lost].fill(0);
            present[lost] = false;
        }

        let mut shards: Vec<(&mut [u8], bool)> = blocks
            .iter_mut()
            .zip(present.iter())
            .map(|(b, &p)| (b.as_mut_slice(), p))
            .collect();
        codec.reconstruct(&mut shards, k, r).unwrap();

        for i in 0..k {
            assert_eq!(blocks[i], data[i], "데이터 블록 {} 복원 실패", i);
        }
    }

    #[test]
    fn test_recover_mixed_losses() {
        let codec = FecCodec::new();
        let k = 6;
        let r = 3;
        let data = make_data(k, 96);
        let encoded = encode_all(&codec, &data, r);

        // 데이터 2개 + 패리티 1개 손실
        let mut blocks = encoded;
        let mut present = vec![true; k + r];
        for &lost in &[1usize, 3, 7] {
            blocks[lost].fill(0);
            present[lost] = false;
        }

        let mut shards: Vec<(&mut [u8], bool)> = blocks
            .iter_mut()
            .zip(present.iter())
            .map(|(b, &p)| (b.as_mut_slice(), p))
            .collect();
        codec.reconstruct(&mut shards, k, r).unwrap();

        for i in 0..k {
            assert_eq!(blocks[i], data[i]);
        }
    }

    #[test]
    fn test_insufficient_blocks_rejected() {
        let codec = FecCodec::new();
        let k = 4;
        let r = 2;
        let data = make_data(k, 32);
        let encoded = encode_all(&codec, &data, r);

        // r+1개 손실 - 복구 불가
        let mut blocks = encoded;
        let mut present = vec![true; k + r];
        for &lost in &[0usize, 1, 2] {
            present[lost] = false;
        }

        let mut shards: Vec<(&mut [u8], bool)> = blocks
            .iter_mut()
            .zip(present.iter())
            .map(|(b, &p)| (b.as_mut_slice(), p))
            .collect();
        assert!(matches!(
            codec.reconstruct(&mut shards, k, r),
            Err(Error::InsufficientSlices { have: 3, need: 4 })
        ));
    }

    #[test]
    fn test_passthrough_without_parity() {
        let codec = FecCodec::new();
        let mut block = vec![9u8; 40];
        let mut refs: Vec<&mut [u8]> = vec![block.as_mut_slice()];
        // k=1, r=0 - 패리티 생성 생략
        codec.encode(&mut refs, 1, 0).unwrap();
        assert_eq!(block, vec![9u8; 40]);
    }

    #[test]
    fn test_shard_limit() {
        let codec = FecCodec::new();
        let mut blocks: Vec<Vec<u8>> = (0..300).map(|_| vec![0u8; 8]).collect();
        let mut refs: Vec<&mut [u8]> = blocks.iter_mut().map(|b| b.as_mut_slice()).collect();
        assert!(matches!(
            codec.encode(&mut refs, 250, 50),
            Err(Error::FrameTooLarge { .. })
        ));
    }
}
