//! 세션 배선
//!
//! 송신: push_frame → 패킷타이저 → 슬라이스 큐 → 멀티패스 워커,
//! 옆에서 프로파일러가 터널 품질을 측정하고 컨트롤러가 FEC/비트레이트
//! 피드백을 돌림. 수신: 소켓 → 디패킷타이저 → 프레임 채널.
//!
//! 모든 태스크는 세션 정지 플래그를 매 루프마다 확인하고,
//! shutdown은 전부 join한 뒤에 반환됨.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::controller::BitrateController;
use crate::depacketizer::Depacketizer;
use crate::frame::EncodedFrame;
use crate::multipath::TunnelPool;
use crate::packetizer::Packetizer;
use crate::profiler::PortProfiler;
use crate::receiver::MultiPathReceiver;
use crate::sender::SliceSender;
use crate::stats::{StatsHandle, TransferStats};
use crate::{Error, Result};

/// 컨트롤러 → 인코더 비트레이트 광고 콜백
pub type BitrateCallback = Box<dyn Fn(u32) + Send + Sync>;

/// 송신 세션
pub struct SenderSession {
    frame_tx: mpsc::Sender<EncodedFrame>,
    running: Arc<AtomicBool>,
    pool: Arc<TunnelPool>,
    stats_handle: StatsHandle,
    transfer: Arc<TransferStats>,
    slice_sender: SliceSender,
    tasks: Vec<JoinHandle<()>>,
}

impl SenderSession {
    /// 세션 기동 - 소켓 바인딩 실패와 설정 오류만 에러로 반환
    pub fn start(
        config: Config,
        remote_ip: IpAddr,
        ports: Vec<u16>,
        on_bitrate: Option<BitrateCallback>,
    ) -> Result<Self> {
        config.validate()?;
        if ports.is_empty() {
            return Err(Error::NoTunnels);
        }

        let stats_handle = StatsHandle::new(&ports);
        let pool = Arc::new(TunnelPool::connect(
            remote_ip,
            &ports,
            config.send_buffer_size,
            config.redundancy,
        )?);
        let transfer = Arc::new(TransferStats::new());
        let running = Arc::new(AtomicBool::new(true));

        let slice_sender = SliceSender::start(pool.clone(), transfer.clone(), config.queue_capacity);
        let queue = slice_sender.queue();

        info!(
            "송신 세션 시작: {} 터널 → {}, mtu={}, redundancy={}",
            ports.len(),
            remote_ip,
            config.mtu,
            pool.redundancy()
        );

        let mut tasks = Vec::new();

        // ─────────────────────────────────────────────────────────────
        // 인제스트 태스크: 프레임 → 슬라이스 묶음 → 큐
        // ─────────────────────────────────────────────────────────────
        let (frame_tx, mut frame_rx) = mpsc::channel::<EncodedFrame>(64);
        let packetizer = Packetizer::new(config.mtu, stats_handle.clone())?;
        let backpressure_wait = Duration::from_millis(config.frame_interval_ms);
        {
            let queue = queue.clone();
            let transfer = transfer.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(frame) = frame_rx.recv().await {
                    transfer.add(&transfer.frames_in, 1);
                    match packetizer.packetize(&frame) {
                        Ok(slices) => {
                            let dropped = queue.push(slices, backpressure_wait).await;
                            if dropped > 0 {
                                transfer.add(&transfer.slices_dropped, dropped as u64);
                            }
                        }
                        Err(e) => warn!("패킷화 실패: {}", e),
                    }
                }
                queue.close();
            }));
        }

        // ─────────────────────────────────────────────────────────────
        // 프로파일러 태스크
        // ─────────────────────────────────────────────────────────────
        let profiler = PortProfiler::bind(remote_ip, &ports, stats_handle.clone())?;
        {
            let running = running.clone();
            let interval = Duration::from_millis(config.probe_interval_ms);
            let timeout = Duration::from_millis(config.probe_timeout_ms);
            tasks.push(tokio::spawn(async move {
                profiler.run(running, interval, timeout).await;
            }));
        }

        // ─────────────────────────────────────────────────────────────
        // 컨트롤러 태스크: 스냅샷 → 터널 풀 + 비트레이트 광고
        // ─────────────────────────────────────────────────────────────
        {
            let running = running.clone();
            let pool = pool.clone();
            let stats_handle = stats_handle.clone();
            let interval = Duration::from_millis(config.probe_interval_ms);
            tasks.push(tokio::spawn(async move {
                let mut controller = BitrateController::new();
                while running.load(Ordering::SeqCst) {
                    tokio::time::sleep(interval).await;
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }

                    let snapshot = stats_handle.snapshot();
                    pool.set_profiles(&snapshot);

                    let avg_loss = stats_handle.avg_loss();
                    if let Some(bitrate) = controller.on_tick(avg_loss) {
                        info!(
                            "목표 비트레이트 변경: {:.2} Mbps (loss {:.1}%)",
                            bitrate as f64 / 1e6,
                            avg_loss * 100.0
                        );
                        if let Some(cb) = &on_bitrate {
                            cb(bitrate);
                        }
                    }
                }
            }));
        }

        Ok(Self {
            frame_tx,
            running,
            pool,
            stats_handle,
            transfer,
            slice_sender,
            tasks,
        })
    }

    /// 인코더 → 코어 입력
    pub async fn push_frame(&self, frame: EncodedFrame) -> Result<()> {
        self.frame_tx
            .send(frame)
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    /// 중복 전송 수 변경
    pub fn set_redundancy(&self, count: usize) {
        self.pool.set_redundancy(count);
    }

    pub fn stats_handle(&self) -> StatsHandle {
        self.stats_handle.clone()
    }

    pub fn transfer_stats(&self) -> Arc<TransferStats> {
        self.transfer.clone()
    }

    /// 정지 + 모든 태스크 join
    pub async fn shutdown(self) {
        self.running.store(false, Ordering::SeqCst);
        drop(self.frame_tx); // 인제스트 종료 → 큐 close
        for task in self.tasks {
            let _ = task.await;
        }
        self.slice_sender.shutdown().await;
        debug!("송신 세션 종료");
    }
}

/// 수신 세션
pub struct ReceiverSession {
    receiver: MultiPathReceiver,
    running: Arc<AtomicBool>,
    transfer: Arc<TransferStats>,
    depack_task: JoinHandle<()>,
}

impl ReceiverSession {
    /// 세션 기동 - 조립된 프레임은 반환된 채널로 방출
    pub fn start(config: Config, ports: Vec<u16>) -> Result<(Self, mpsc::Receiver<EncodedFrame>)> {
        config.validate()?;

        let transfer = Arc::new(TransferStats::new());
        let (receiver, mut datagram_rx) =
            MultiPathReceiver::start(&ports, config.mtu, config.recv_buffer_size, transfer.clone())?;

        let (frame_tx, frame_rx) = mpsc::channel::<EncodedFrame>(64);
        let running = Arc::new(AtomicBool::new(true));

        let mut depacketizer = Depacketizer::new(config.codec_fourcc, config.max_accumulators);
        let ttl = Duration::from_millis(config.accumulator_ttl_ms.clamp(300, 2000));
        let gc_interval = Duration::from_millis(config.gc_interval_ms);

        let depack_task = {
            let running = running.clone();
            let transfer = transfer.clone();
            tokio::spawn(async move {
                let mut gc = tokio::time::interval(gc_interval);
                loop {
                    tokio::select! {
                        maybe = datagram_rx.recv() => {
                            let Some((_, bytes)) = maybe else { break };
                            match depacketizer.push(&bytes) {
                                Ok(Some(frame)) => {
                                    transfer.add(&transfer.frames_emitted, 1);
                                    if frame_tx.send(frame).await.is_err() {
                                        break; // 소비자 종료
                                    }
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    debug!("슬라이스 드롭: {}", e);
                                    transfer.add(&transfer.invalid_slices, 1);
                                }
                            }
                        }
                        _ = gc.tick() => {
                            if !running.load(Ordering::SeqCst) {
                                break;
                            }
                            depacketizer.sweep(ttl);
                            transfer.fec_recoveries.store(depacketizer.fec_recoveries, Ordering::Relaxed);
                            transfer.fec_failures.store(depacketizer.fec_failures, Ordering::Relaxed);
                            transfer.frames_timed_out.store(depacketizer.frames_timed_out, Ordering::Relaxed);
                            transfer.duplicate_slices.store(depacketizer.duplicate_slices, Ordering::Relaxed);
                        }
                    }
                }
            })
        };

        Ok((
            Self {
                receiver,
                running,
                transfer,
                depack_task,
            },
            frame_rx,
        ))
    }

    /// 실제 바인딩된 포트 (포트 0 지정 시 확인용)
    pub fn local_ports(&self) -> Vec<u16> {
        self.receiver.local_ports()
    }

    pub fn transfer_stats(&self) -> Arc<TransferStats> {
        self.transfer.clone()
    }

    /// 정지 + 수신/조립 태스크 join
    pub async fn shutdown(self) {
        self.running.store(false, Ordering::SeqCst);
        self.receiver.shutdown().await;
        let _ = self.depack_task.await;
        debug!("수신 세션 종료");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_CODEC_FOURCC;
    use bytes::Bytes;

    fn test_payload(len: usize, seed: u8) -> Bytes {
        (0..len)
            .map(|i| ((i as u64 * 31 + seed as u64) % 251) as u8)
            .collect::<Vec<u8>>()
            .into()
    }

    #[tokio::test]
    async fn test_loopback_end_to_end() {
        // 수신 세션: OS 할당 포트 2개
        let mut recv_config = Config::default();
        recv_config.gc_interval_ms = 50;
        let (recv_session, mut frame_rx) =
            ReceiverSession::start(recv_config, vec![0, 0]).unwrap();
        let ports = recv_session.local_ports();
        assert_eq!(ports.len(), 2);

        // 송신 세션: 같은 포트로
        let mut send_config = Config::default();
        send_config.probe_interval_ms = 200;
        send_config.probe_timeout_ms = 100;
        let send_session = SenderSession::start(
            send_config,
            "127.0.0.1".parse().unwrap(),
            ports,
            None,
        )
        .unwrap();

        // 프레임 10개 전송
        let mut sent = Vec::new();
        for i in 0..10u64 {
            let frame = EncodedFrame::new(
                i,
                i * 33_000_000,
                DEFAULT_CODEC_FOURCC,
                i % 5 == 0,
                test_payload(4096 + i as usize * 100, i as u8),
            );
            sent.push(frame.clone());
            send_session.push_frame(frame).await.unwrap();
        }

        // 모든 프레임이 조립되어 나와야 함 (루프백은 손실 없음)
        let mut received = Vec::new();
        while received.len() < 10 {
            let frame = tokio::time::timeout(Duration::from_secs(5), frame_rx.recv())
                .await
                .expect("프레임 수신 타임아웃")
                .expect("프레임 채널 종료");
            received.push(frame);
        }

        // 방출 순서는 도착 순서 - 원본 frame_id 기준으로 맞춰서 비교
        received.sort_by_key(|f| f.frame_id);
        for (i, frame) in received.iter().enumerate() {
            assert_eq!(frame.frame_id, sent[i].frame_id);
            assert_eq!(frame.payload, sent[i].payload);
            assert_eq!(frame.is_keyframe, sent[i].is_keyframe);
            assert_eq!(frame.codec_fourcc, DEFAULT_CODEC_FOURCC);
        }

        send_session.shutdown().await;
        recv_session.shutdown().await;
    }

    #[tokio::test]
    async fn test_sender_profiler_sees_echo() {
        // 수신 세션이 미디어 포트에서 프로브를 에코 → 송신 프로파일러의
        // 손실률이 0 근처로 수렴해야 함
        let (recv_session, _frame_rx) =
            ReceiverSession::start(Config::default(), vec![0]).unwrap();
        let ports = recv_session.local_ports();

        let mut config = Config::default();
        config.probe_interval_ms = 100;
        config.probe_timeout_ms = 100;
        let send_session =
            SenderSession::start(config, "127.0.0.1".parse().unwrap(), ports, None).unwrap();

        tokio::time::sleep(Duration::from_millis(600)).await;

        let snap = send_session.stats_handle().snapshot();
        assert!(snap[0].sent >= 2, "프로브가 전송되어야 함");
        assert!(
            snap[0].packet_loss < 0.5,
            "에코 응답으로 손실률이 낮아야 함: {}",
            snap[0].packet_loss
        );

        send_session.shutdown().await;
        recv_session.shutdown().await;
    }
}
