//! 에러 타입 정의

use thiserror::Error;

/// VSP 프로토콜 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("유효하지 않은 MTU: {mtu} (허용 범위 {min}~{max})")]
    InvalidMtu { mtu: usize, min: usize, max: usize },

    #[error("MTU가 너무 작음: 페이로드 {payload} bytes (최소 {min})")]
    MtuTooSmall { payload: usize, min: usize },

    #[error("터널 포트 목록이 비어 있음")]
    NoTunnels,

    #[error("프레임이 너무 큼: k={k} 슬라이스 (GF(2^8) 한계 {max})")]
    FrameTooLarge { k: usize, max: usize },

    #[error("유효하지 않은 매직 넘버: expected {expected:08X}, got {got:08X}")]
    InvalidMagic { expected: u32, got: u32 },

    #[error("잘린 슬라이스: {len} bytes (헤더 {header} bytes 필요)")]
    TruncatedSlice { len: usize, header: usize },

    #[error("슬라이스 인덱스 범위 초과: index={index}, total={total}")]
    SliceIndexOutOfRange { index: u16, total: u16 },

    #[error("슬라이스 수 불일치: k={k} + r={r} != total={total}")]
    SliceCountMismatch { k: u16, r: u16, total: u16 },

    #[error("데이터그램 길이 불일치: expected {expected}, got {got}")]
    DatagramLengthMismatch { expected: usize, got: usize },

    #[error("체크섬 불일치: expected {expected:08X}, got {got:08X}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("FEC 복구 불가: {have}/{need} 슬라이스 수신")]
    InsufficientSlices { have: usize, need: usize },

    #[error("FEC 코덱 에러: {0}")]
    FecFailure(String),

    #[error("채널 종료")]
    ChannelClosed,
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
