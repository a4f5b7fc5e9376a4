//! 슬라이스 송신기
//!
//! - 프레임 묶음 단위의 유계 큐 + 백프레셔 드롭 정책
//! - 최대 min(터널 수, 4)개의 송신 워커
//! - 데이터 슬라이스 먼저, 패리티는 다른 경로로 다변화해서 전송

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::multipath::TunnelPool;
use crate::packetizer::FrameSlices;
use crate::stats::TransferStats;

/// 송신 워커 수 상한
const MAX_SEND_WORKERS: usize = 4;

/// 프레임 묶음 큐
///
/// 가득 찬 상태가 1 프레임 시간 이상 지속되면 가장 오래된
/// 비-키프레임 묶음을 버림. 키프레임은 송신기에서 버리지 않음.
pub struct SliceQueue {
    inner: Mutex<VecDeque<FrameSlices>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
}

impl SliceQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    fn try_push(&self, item: FrameSlices) -> std::result::Result<(), FrameSlices> {
        let mut queue = self.inner.lock();
        if queue.len() < self.capacity {
            queue.push_back(item);
            drop(queue);
            self.notify.notify_one();
            Ok(())
        } else {
            Err(item)
        }
    }

    /// 묶음 적재 - 드롭된 슬라이스 수 반환
    ///
    /// 큐가 가득 차면 최대 `wait`만큼 기다린 뒤 드롭 정책 적용
    pub async fn push(&self, item: FrameSlices, wait: Duration) -> usize {
        let item = match self.try_push(item) {
            Ok(()) => return 0,
            Err(item) => item,
        };

        // 백프레셔: 1 프레임 시간 이내로만 대기
        tokio::time::sleep(wait).await;

        let mut queue = self.inner.lock();
        if queue.len() < self.capacity {
            queue.push_back(item);
            drop(queue);
            self.notify.notify_one();
            return 0;
        }

        // 가장 오래된 비-키프레임 묶음을 버리고 적재
        if let Some(pos) = queue.iter().position(|f| !f.keyframe) {
            let dropped = queue.remove(pos).unwrap();
            queue.push_back(item);
            drop(queue);
            self.notify.notify_one();
            debug!("백프레셔: frame {} 드롭", dropped.unit_id);
            return dropped.slice_count();
        }

        if item.keyframe {
            // 전부 키프레임이면 용량을 초과해서라도 적재
            queue.push_back(item);
            drop(queue);
            self.notify.notify_one();
            0
        } else {
            item.slice_count()
        }
    }

    /// 묶음 꺼내기 - 큐가 닫히고 비면 None
    pub async fn pop(&self) -> Option<FrameSlices> {
        loop {
            if let Some(item) = self.inner.lock().pop_front() {
                return Some(item);
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            // 닫힘 플래그 재확인을 위해 타임아웃 포함 대기
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

/// 슬라이스 송신기 - 큐를 소비하는 워커 집합
pub struct SliceSender {
    queue: Arc<SliceQueue>,
    workers: Vec<JoinHandle<()>>,
}

impl SliceSender {
    /// 워커 기동
    pub fn start(
        pool: Arc<TunnelPool>,
        stats: Arc<TransferStats>,
        queue_capacity: usize,
    ) -> Self {
        let queue = Arc::new(SliceQueue::new(queue_capacity));
        let worker_count = pool.len().min(MAX_SEND_WORKERS).max(1);

        let workers = (0..worker_count)
            .map(|_| {
                let queue = queue.clone();
                let pool = pool.clone();
                let stats = stats.clone();
                tokio::spawn(async move {
                    while let Some(frame) = queue.pop().await {
                        send_frame_slices(&pool, &stats, frame).await;
                    }
                })
            })
            .collect();

        Self { queue, workers }
    }

    pub fn queue(&self) -> Arc<SliceQueue> {
        self.queue.clone()
    }

    /// 큐를 닫고 워커 종료 대기
    pub async fn shutdown(self) {
        self.queue.close();
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

/// 한 프레임의 슬라이스 전체 전송
///
/// 데이터 슬라이스를 먼저 보내 사용한 터널을 기록한 뒤, 패리티는
/// 그 경로들을 피해 전송. 클론마다 제외 목록으로 서로 다른 터널 보장.
pub async fn send_frame_slices(pool: &TunnelPool, stats: &TransferStats, frame: FrameSlices) {
    let clones = pool.effective_redundancy(frame.keyframe);
    let mut data_tunnels: HashSet<usize> = HashSet::new();

    for slice in &frame.data {
        let mut used: Vec<usize> = Vec::with_capacity(clones);
        for c in 0..clones {
            let idx = pool.select_weighted(&used);
            if used.contains(&idx) {
                break; // 남은 터널 없음
            }
            if pool.send_to_tunnel(idx, slice).await {
                stats.add(&stats.slices_sent, 1);
                if c > 0 {
                    stats.add(&stats.clones_sent, 1);
                }
            }
            used.push(idx);
        }
        data_tunnels.extend(used);
    }

    for slice in &frame.parity {
        let mut used: Vec<usize> = Vec::with_capacity(clones);
        for c in 0..clones {
            let chosen = pool.select_weighted(&used);
            let idx = pool.parity_index(chosen, &used, &data_tunnels);
            if used.contains(&idx) {
                break;
            }
            if pool.send_to_tunnel(idx, slice).await {
                stats.add(&stats.slices_sent, 1);
                if c > 0 {
                    stats.add(&stats.clones_sent, 1);
                }
            }
            used.push(idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn dummy_frame(unit_id: u32, keyframe: bool, slices: usize) -> FrameSlices {
        FrameSlices {
            unit_id,
            keyframe,
            data: (0..slices).map(|_| Bytes::from_static(b"x")).collect(),
            parity: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_queue_fifo() {
        let queue = SliceQueue::new(4);
        queue.push(dummy_frame(1, false, 1), Duration::ZERO).await;
        queue.push(dummy_frame(2, false, 1), Duration::ZERO).await;

        assert_eq!(queue.pop().await.unwrap().unit_id, 1);
        assert_eq!(queue.pop().await.unwrap().unit_id, 2);
    }

    #[tokio::test]
    async fn test_backpressure_drops_oldest_non_keyframe() {
        let queue = SliceQueue::new(2);
        queue.push(dummy_frame(1, false, 3), Duration::ZERO).await;
        queue.push(dummy_frame(2, true, 3), Duration::ZERO).await;

        // 가득 참 - 가장 오래된 비-키프레임(1)이 밀려나야 함
        let dropped = queue
            .push(dummy_frame(3, false, 3), Duration::from_millis(1))
            .await;
        assert_eq!(dropped, 3);

        assert_eq!(queue.pop().await.unwrap().unit_id, 2);
        assert_eq!(queue.pop().await.unwrap().unit_id, 3);
    }

    #[tokio::test]
    async fn test_keyframe_never_dropped() {
        let queue = SliceQueue::new(1);
        queue.push(dummy_frame(1, true, 2), Duration::ZERO).await;

        let dropped = queue
            .push(dummy_frame(2, true, 2), Duration::from_millis(1))
            .await;
        assert_eq!(dropped, 0);
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_close_unblocks_pop() {
        let queue = Arc::new(SliceQueue::new(2));
        let queue_clone = queue.clone();
        let handle = tokio::spawn(async move { queue_clone.pop().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();
        assert!(handle.await.unwrap().is_none());
    }
}
