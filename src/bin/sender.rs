//! MFTP 송신자
//!
//! 파일/디렉토리 하나를 멀티캐스트 그룹에 배포한다.
//!
//! 사용법:
//!   cargo run --release --bin mftp-sender -- [OPTIONS] <PATH>
//!
//! 예시:
//!   # 기본 전송
//!   cargo run --release --bin mftp-sender -- data/
//!
//!   # 재시도 라운드 40, 10MB/s 제한
//!   cargo run --release --bin mftp-sender -- -r 40 --speed 10485760 big.iso

use std::error::Error as StdError;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use mftp::{Executor, ProgressSink, SenderConfig, SenderServer};

type BoxError = Box<dyn StdError + Send + Sync>;

fn value<T>(args: &[String], i: usize, name: &str) -> Result<T, BoxError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = args
        .get(i + 1)
        .ok_or_else(|| format!("{} 값 필요", name))?;
    raw.parse()
        .map_err(|e| format!("{} 값이 잘못됨 ({}): {}", name, raw, e).into())
}

fn print_help() {
    println!(
        r#"MFTP Sender - 멀티캐스트 파일 배포

사용법:
  cargo run --release --bin mftp-sender -- [OPTIONS] <PATH>

옵션:
  -f, --file <PATH>          전송할 파일/디렉토리 (위치 인자로도 지정 가능)
  -r, --robust <N>           단계별 최대 재시도 라운드 (기본: 20)
  --public-group <ADDR>      Announce 그룹 (기본: 230.4.4.1)
  --private-group <ADDR>     세션 그룹 (기본: 230.5.5.8)
  -p, --port <PORT>          목적지 포트 (기본: 1044)
  --source-port <PORT>       송신 포트 (기본: 임시 포트)
  --grtt <MS>                초기 GRTT 밀리초 (기본: 500)
  --block-size <BYTES>       블록 크기 (기본: 1300)
  --ttl <N>                  멀티캐스트 TTL (기본: 1)
  --speed <BYTES/S>          최대 송신 속도
  --id <ID>                  송신자 ID (기본: 로컬 주소에서 유도)
  -i, --interface <NAME>     송신 인터페이스
  --base-dir <DIR>           원격 이름 기준 디렉토리
  --allow <ID,ID,...>        허용 수신자 목록 (closed group)
  --follow-symlinks          심볼릭 링크 대상 내용 전송
  --quit-on-error            수신자 손실/읽기 실패 시 세션 종료
  --lan                      유선 LAN 설정으로 시작
  --unstable                 불안정한 네트워크 설정으로 시작
  -h, --help                 이 도움말 출력

로그 수준은 RUST_LOG 환경 변수로 조절한다 (기본: info).
"#
    );
}

fn parse_args() -> Result<SenderConfig, BoxError> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = SenderConfig::default();
    let mut path: Option<PathBuf> = None;

    // 프리셋을 먼저 적용해야 개별 옵션이 덮어쓴다
    if args.iter().any(|a| a == "--lan") {
        config = SenderConfig::lan();
    } else if args.iter().any(|a| a == "--unstable") {
        config = SenderConfig::unstable_network();
    }

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--file" | "-f" => {
                path = Some(value(&args, i, "--file")?);
                i += 1;
            }
            "--robust" | "-r" => {
                config.robust_factor = value(&args, i, "--robust")?;
                i += 1;
            }
            "--public-group" => {
                config.public_group = value(&args, i, "--public-group")?;
                i += 1;
            }
            "--private-group" => {
                config.private_group = value(&args, i, "--private-group")?;
                i += 1;
            }
            "--port" | "-p" => {
                config.destination_port = value(&args, i, "--port")?;
                i += 1;
            }
            "--source-port" => {
                config.source_port = Some(value(&args, i, "--source-port")?);
                i += 1;
            }
            "--grtt" => {
                config.grtt = Duration::from_millis(value(&args, i, "--grtt")?);
                i += 1;
            }
            "--block-size" => {
                config.block_size = value(&args, i, "--block-size")?;
                i += 1;
            }
            "--ttl" => {
                config.ttl = value(&args, i, "--ttl")?;
                i += 1;
            }
            "--speed" => {
                config.max_speed = Some(value(&args, i, "--speed")?);
                i += 1;
            }
            "--id" => {
                config.sender_id = Some(value(&args, i, "--id")?);
                i += 1;
            }
            "--interface" | "-i" => {
                config.interface = Some(value(&args, i, "--interface")?);
                i += 1;
            }
            "--base-dir" => {
                config.base_dir = Some(value(&args, i, "--base-dir")?);
                i += 1;
            }
            "--allow" => {
                let raw: String = value(&args, i, "--allow")?;
                let ids = raw
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(|s| s.trim().parse())
                    .collect::<Result<Vec<u32>, _>>()?;
                config.allowed_clients = Some(ids);
                i += 1;
            }
            "--follow-symlinks" => config.follow_symlinks = true,
            "--quit-on-error" => config.quit_on_error = true,
            "--lan" | "--unstable" => {}
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other if !other.starts_with('-') && path.is_none() => {
                path = Some(PathBuf::from(other));
            }
            other => return Err(format!("알 수 없는 옵션: {}", other).into()),
        }
        i += 1;
    }

    let path = path.ok_or("전송할 경로 필요 (--help 참고)")?;
    Ok(SenderConfig {
        files: mftp::FileSource::Path(path),
        ..config
    })
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = parse_args()?;
    info!("MFTP Sender starting...");
    info!("Target: {:?}", config.files);
    info!(
        "Groups: public {}, private {}, port {}",
        config.public_group, config.private_group, config.destination_port
    );
    info!("Robust factor: {}, block size: {}", config.robust_factor, config.block_size);

    let progress = Arc::new(ProgressSink::new());
    progress.add_listener(|event| {
        info!("[{:08x}] {:?} {}", event.session_id, event.status, event.path.display());
    });
    let executor = Arc::new(Executor::with_available_parallelism());
    let server = SenderServer::new(executor, progress, 1);

    let launched = server.sync_files(config)?;
    info!("Sync {:?}: {:?}", launched.token, launched.outcome);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, cancelling...");
                server.cancel_task(launched.token);
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(200)) => {
                if !server.is_syncing(launched.token) {
                    break;
                }
            }
        }
    }

    while server.is_syncing(launched.token) {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    info!("Done");
    Ok(())
}
