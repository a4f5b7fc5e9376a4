//! VSP 송신자 - 멀티패스 FEC 영상 전송
//!
//! 카메라/인코더는 외부 협력자이므로 여기서는 컨트롤러가 광고하는
//! 비트레이트에 맞춘 합성 프레임 스트림을 전송함.
//!
//! 사용법:
//!   cargo run --release --bin sender -- --ip <addr> --ports <p1,p2,...> [--mtu <bytes>]
//!
//! 예시:
//!   cargo run --release --bin sender -- --ip 192.168.1.5 --ports 4000,4001,4002
//!   cargo run --release --bin sender -- --ip 127.0.0.1 --ports 4000 --mtu 1000

use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::interval;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use vsp::controller::INITIAL_BITRATE;
use vsp::{Config, EncodedFrame, SenderSession, DEFAULT_CODEC_FOURCC, MAX_MTU, MIN_MTU};

/// 송신자 설정
struct SenderArgs {
    remote_ip: Option<IpAddr>,
    ports: Vec<u16>,
    mtu: usize,
    fps: u64,
    gop: u64,
}

impl Default for SenderArgs {
    fn default() -> Self {
        Self {
            remote_ip: None,
            ports: Vec::new(),
            mtu: vsp::DEFAULT_MTU,
            fps: 30,
            gop: 30,
        }
    }
}

fn parse_ports_csv(csv: &str) -> Vec<u16> {
    csv.split(',')
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<u16>().ok())
        .filter(|&p| p > 0)
        .collect()
}

fn print_usage() {
    println!(
        r#"VSP Sender - 멀티패스 FEC 영상 송신자

사용법:
  cargo run --release --bin sender -- --ip <addr> --ports <p1,p2,...> [OPTIONS]

옵션:
  --ip <ADDR>        수신자 IPv4 주소 (필수)
  --ports <CSV>      원격 UDP 포트 목록, 쉼표 구분 (필수, 터널 수 결정)
  --mtu <BYTES>      슬라이스 크기 200~2000 (기본: 1200)
  --fps <N>          합성 프레임 레이트 (기본: 30)
  --gop <N>          키프레임 간격 (기본: 30)
  -h, --help         이 도움말 출력

예시:
  # 터널 3개로 전송
  cargo run --release --bin sender -- --ip 192.168.1.5 --ports 4000,4001,4002

  # 작은 MTU로
  cargo run --release --bin sender -- --ip 127.0.0.1 --ports 4000 --mtu 1000
"#
    );
}

fn parse_args() -> Option<SenderArgs> {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = SenderArgs::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--ip" => {
                if i + 1 < args.len() {
                    parsed.remote_ip = args[i + 1].parse().ok();
                    if parsed.remote_ip.is_none() {
                        eprintln!("유효하지 않은 IP 주소: {}", args[i + 1]);
                        return None;
                    }
                    i += 1;
                }
            }
            "--ports" => {
                if i + 1 < args.len() {
                    parsed.ports = parse_ports_csv(&args[i + 1]);
                    i += 1;
                }
            }
            "--mtu" => {
                if i + 1 < args.len() {
                    match args[i + 1].parse::<usize>() {
                        Ok(v) if (MIN_MTU..=MAX_MTU).contains(&v) => parsed.mtu = v,
                        _ => {
                            eprintln!("유효하지 않은 MTU: {} (허용 {}~{})", args[i + 1], MIN_MTU, MAX_MTU);
                            return None;
                        }
                    }
                    i += 1;
                }
            }
            "--fps" => {
                if i + 1 < args.len() {
                    parsed.fps = args[i + 1].parse().unwrap_or(30).clamp(1, 240);
                    i += 1;
                }
            }
            "--gop" => {
                if i + 1 < args.len() {
                    parsed.gop = args[i + 1].parse().unwrap_or(30).max(1);
                    i += 1;
                }
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    Some(parsed)
}

/// 합성 프레임 페이로드 (결정적 의사난수)
fn synth_payload(frame_id: u64, len: usize) -> Bytes {
    let mut state = frame_id.wrapping_mul(0x9E3779B97F4A7C15).wrapping_add(1);
    let mut data = Vec::with_capacity(len);
    while data.len() < len {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        data.extend_from_slice(&state.to_le_bytes());
    }
    data.truncate(len);
    Bytes::from(data)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = match parse_args() {
        Some(a) => a,
        None => {
            print_usage();
            std::process::exit(1);
        }
    };

    let remote_ip = match args.remote_ip {
        Some(ip) => ip,
        None => {
            eprintln!("--ip 옵션이 필요합니다.");
            print_usage();
            std::process::exit(1);
        }
    };
    if args.ports.is_empty() {
        eprintln!("--ports 옵션이 필요합니다.");
        print_usage();
        std::process::exit(1);
    }

    info!("VSP Sender starting...");
    info!("Remote: {} ports {:?}", remote_ip, args.ports);
    info!("MTU: {} bytes, {} fps, GOP {}", args.mtu, args.fps, args.gop);

    let mut config = Config::default();
    config.mtu = args.mtu;
    config.frame_interval_ms = 1000 / args.fps.max(1);

    // 컨트롤러 광고를 합성 인코더의 목표 비트레이트로 반영
    let target_bitrate = Arc::new(AtomicU32::new(INITIAL_BITRATE));
    let target_clone = target_bitrate.clone();
    let on_bitrate: vsp::BitrateCallback = Box::new(move |bps| {
        target_clone.store(bps, Ordering::Relaxed);
    });

    let session = SenderSession::start(config, remote_ip, args.ports.clone(), Some(on_bitrate))?;

    info!("전송 시작 (Ctrl-C로 종료)");

    let mut ticker = interval(Duration::from_millis(1000 / args.fps));
    let mut frame_id = 0u64;
    let mut last_report = std::time::Instant::now();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let bitrate = target_bitrate.load(Ordering::Relaxed) as u64;
                let frame_len = (bitrate / 8 / args.fps).max(512) as usize;
                let is_keyframe = frame_id % args.gop == 0;
                // 키프레임은 인터프레임보다 큼
                let frame_len = if is_keyframe { frame_len * 3 } else { frame_len };

                let timestamp_ns = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_nanos() as u64;

                let frame = EncodedFrame::new(
                    frame_id,
                    timestamp_ns,
                    DEFAULT_CODEC_FOURCC,
                    is_keyframe,
                    synth_payload(frame_id, frame_len),
                );

                if session.push_frame(frame).await.is_err() {
                    break;
                }
                frame_id += 1;

                if last_report.elapsed() > Duration::from_secs(5) {
                    let stats = session.transfer_stats();
                    info!("{}", stats.summary());
                    let snap = session.stats_handle().snapshot();
                    for s in snap.iter() {
                        info!(
                            "  tunnel {}: rtt {:.1}ms, loss {:.1}%",
                            s.port,
                            s.avg_rtt_ms,
                            s.packet_loss * 100.0
                        );
                    }
                    last_report = std::time::Instant::now();
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("종료 시그널 수신");
                break;
            }
        }
    }

    let stats = session.transfer_stats();
    info!("최종 통계: {}", stats.summary());
    session.shutdown().await;

    Ok(())
}
