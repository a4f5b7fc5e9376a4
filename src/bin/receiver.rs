//! VSP 수신자 - 멀티패스 슬라이스 수신 + 프레임 조립
//!
//! 조립된 프레임은 외부 디코더로 넘기는 대신 요약 로그로 출력.
//! 미디어 포트에 도착하는 프로브는 자동으로 에코되어 송신 측
//! 프로파일러의 RTT/손실 측정에 쓰임.
//!
//! 사용법:
//!   cargo run --release --bin receiver -- --ports <p1,p2,...> [--mtu <bytes>]
//!
//! 예시:
//!   cargo run --release --bin receiver -- --ports 4000,4001,4002

use std::time::Duration;

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use vsp::{Config, ReceiverSession, MAX_MTU, MIN_MTU};

struct ReceiverArgs {
    ports: Vec<u16>,
    mtu: usize,
}

impl Default for ReceiverArgs {
    fn default() -> Self {
        Self {
            ports: Vec::new(),
            mtu: vsp::DEFAULT_MTU,
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
        r#"VSP Receiver - 멀티패스 FEC 영상 수신자

사용법:
  cargo run --release --bin receiver -- --ports <p1,p2,...> [OPTIONS]

옵션:
  --ports <CSV>      로컬 수신 UDP 포트 목록, 쉼표 구분 (필수)
  --mtu <BYTES>      슬라이스 크기 200~2000 (기본: 1200, 송신자와 일치해야 함)
  -h, --help         이 도움말 출력

예시:
  cargo run --release --bin receiver -- --ports 4000,4001,4002
"#
    );
}

fn parse_args() -> Option<ReceiverArgs> {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = ReceiverArgs::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
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
    if args.ports.is_empty() {
        eprintln!("--ports 옵션이 필요합니다.");
        print_usage();
        std::process::exit(1);
    }

    info!("VSP Receiver starting...");
    info!("Ports: {:?}, MTU: {}", args.ports, args.mtu);

    let mut config = Config::default();
    config.mtu = args.mtu;

    let (session, mut frame_rx) = ReceiverSession::start(config, args.ports)?;

    info!("수신 대기 (Ctrl-C로 종료)");

    let mut frames_received = 0u64;
    let mut bytes_received = 0u64;
    let mut last_report = std::time::Instant::now();

    loop {
        tokio::select! {
            maybe = frame_rx.recv() => {
                let Some(frame) = maybe else { break };
                frames_received += 1;
                bytes_received += frame.payload.len() as u64;

                if frame.is_keyframe {
                    info!(
                        "키프레임 수신: id={}, {} bytes",
                        frame.frame_id,
                        frame.payload.len()
                    );
                }

                if last_report.elapsed() > Duration::from_secs(5) {
                    let stats = session.transfer_stats();
                    info!(
                        "프레임 {} 수신 ({:.2} MB) | {}",
                        frames_received,
                        bytes_received as f64 / 1e6,
                        stats.summary()
                    );
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
    info!(
        "총 프레임: {}, 총 바이트: {:.2} MB",
        frames_received,
        bytes_received as f64 / 1e6
    );
    session.shutdown().await;

    Ok(())
}
