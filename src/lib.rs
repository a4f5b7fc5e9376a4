//! # VSP (Video Slice Protocol)
//!
//! UDP 멀티패스 실시간 영상 전송 프로토콜
//!
//! ## 핵심 특징
//! - **고정 크기 슬라이스**: 프레임을 MTU 크기 데이터그램으로 분할
//! - **Reed-Solomon FEC**: 재전송 없이 손실 복구 (systematic, GF(2^8))
//! - **멀티패스**: 여러 UDP 터널로 동시 전송, 품질 가중 배분
//! - **포트 프로파일러**: 터널별 RTT/손실 상시 측정
//! - **경로 다변화**: 패리티는 데이터와 다른 터널로
//! - **적응 비트레이트**: 손실 기반 인코더 피드백 (히스테리시스)

pub mod config;
pub mod controller;
pub mod depacketizer;
pub mod error;
pub mod fec;
pub mod frame;
pub mod multipath;
pub mod packetizer;
pub mod profiler;
pub mod receiver;
pub mod sender;
pub mod session;
pub mod slice;
pub mod stats;

pub use config::Config;
pub use controller::BitrateController;
pub use depacketizer::Depacketizer;
pub use error::{Error, Result};
pub use fec::FecCodec;
pub use frame::EncodedFrame;
pub use multipath::TunnelPool;
pub use packetizer::{FrameSlices, Packetizer};
pub use profiler::{PortProfiler, Probe};
pub use receiver::MultiPathReceiver;
pub use sender::{SliceQueue, SliceSender};
pub use session::{BitrateCallback, ReceiverSession, SenderSession};
pub use slice::SliceHeader;
pub use stats::{StatsHandle, TransferStats, TunnelStat};

/// 슬라이스 매직 넘버
pub const MAGIC_NUMBER: u32 = 0xABCD1234;

/// 프로브 매직 넘버
pub const PROBE_MAGIC: u32 = 0xDEADBEEF;

/// 슬라이스 헤더 크기 (바이트)
pub const HEADER_SIZE: usize = 35;

/// 프로브 크기 (바이트)
pub const PROBE_SIZE: usize = 14;

/// 기본 MTU (바이트)
pub const DEFAULT_MTU: usize = 1200;

/// 최소 MTU
pub const MIN_MTU: usize = 200;

/// 최대 MTU
pub const MAX_MTU: usize = 2000;

/// 슬라이스당 최소 페이로드
pub const MIN_PAYLOAD_BYTES: usize = 64;

/// 프레임당 최대 슬라이스 수 (와이어 검증 한도)
pub const MAX_TOTAL_SLICES: usize = 1024;

/// FEC 블록 수 한계 (GF(2^8) Reed-Solomon)
pub const MAX_FEC_SHARDS: usize = 256;

/// 기본 코덱 fourcc ("H264")
pub const DEFAULT_CODEC_FOURCC: u32 = 0x48323634;
