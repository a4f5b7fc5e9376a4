//! 인코딩된 프레임 정의
//!
//! 코어는 프레임 내용을 해석하지 않음 - 인코더/디코더가 외부 협력자

use bytes::Bytes;

/// 인코딩된 영상 프레임 (전송 단위)
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    /// 송신자별 단조 증가 프레임 ID
    pub frame_id: u64,

    /// 캡처 타임스탬프 (나노초, 송신자 클럭)
    /// 와이어에서는 마이크로초 정밀도로 운반됨
    pub timestamp_ns: u64,

    /// 코덱 식별 fourcc
    pub codec_fourcc: u32,

    /// 키프레임 여부 (독립 디코딩 가능)
    pub is_keyframe: bool,

    /// 압축된 프레임 데이터
    pub payload: Bytes,
}

impl EncodedFrame {
    pub fn new(
        frame_id: u64,
        timestamp_ns: u64,
        codec_fourcc: u32,
        is_keyframe: bool,
        payload: Bytes,
    ) -> Self {
        Self {
            frame_id,
            timestamp_ns,
            codec_fourcc,
            is_keyframe,
            payload,
        }
    }
}
