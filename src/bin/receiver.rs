//! MFTP 수신자
//!
//! public 그룹의 Announce를 감시하다가 자신을 대상으로 하는 세션마다 파일을 받는다.
//!
//! 사용법:
//!   cargo run --release --bin mftp-receiver -- [OPTIONS] <DIR>
//!
//! 예시:
//!   # 기본 수신
//!   cargo run --release --bin mftp-receiver -- /srv/incoming
//!
//!   # 임시 디렉토리에서 받은 뒤 이동
//!   cargo run --release --bin mftp-receiver -- -d /srv/incoming --temp-dir /srv/tmp

use std::error::Error as StdError;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use mftp::{Executor, MonitorResult, ProgressSink, ReceiverConfig, ReceiverServer};

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
        r#"MFTP Receiver - 멀티캐스트 파일 수신

사용법:
  cargo run --release --bin mftp-receiver -- [OPTIONS] <DIR>

옵션:
  -d, --dir <DIR>            저장 디렉토리 (여러 번 지정 가능, 위치 인자로도 지정 가능)
  --temp-dir <DIR>           수신 중 임시 디렉토리 (여러 번 지정 가능)
  --public-group <ADDR>      감시할 그룹 (기본: 230.4.4.1)
  -p, --port <PORT>          수신 포트 (기본: 1044)
  --id <ID>                  수신자 ID (기본: 로컬 주소에서 유도)
  -i, --interface <NAME>     ID 유도에 쓸 인터페이스
  --buffer <BYTES>           UDP 버퍼 크기 (기본: 262144)
  --quit-on-error            파일 거부 시 세션 종료
  -h, --help                 이 도움말 출력

로그 수준은 RUST_LOG 환경 변수로 조절한다 (기본: info).
"#
    );
}

fn parse_args() -> Result<ReceiverConfig, BoxError> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ReceiverConfig::default();
    let mut temp_dirs: Vec<PathBuf> = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--dir" | "-d" => {
                config.destination_dirs.push(value(&args, i, "--dir")?);
                i += 1;
            }
            "--temp-dir" => {
                temp_dirs.push(value(&args, i, "--temp-dir")?);
                i += 1;
            }
            "--public-group" => {
                config.public_group = value(&args, i, "--public-group")?;
                i += 1;
            }
            "--port" | "-p" => {
                config.listen_port = value(&args, i, "--port")?;
                i += 1;
            }
            "--id" => {
                config.client_id = Some(value(&args, i, "--id")?);
                i += 1;
            }
            "--interface" | "-i" => {
                config.interface = Some(value(&args, i, "--interface")?);
                i += 1;
            }
            "--buffer" => {
                config.udp_buffer_size = value(&args, i, "--buffer")?;
                i += 1;
            }
            "--quit-on-error" => config.quit_on_error = true,
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other if !other.starts_with('-') => config.destination_dirs.push(PathBuf::from(other)),
            other => return Err(format!("알 수 없는 옵션: {}", other).into()),
        }
        i += 1;
    }

    if config.destination_dirs.is_empty() {
        return Err("저장 디렉토리 필요 (--help 참고)".into());
    }
    if !temp_dirs.is_empty() {
        config.temp_dirs = Some(temp_dirs);
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = parse_args()?;
    info!("MFTP Receiver starting...");
    info!("Destinations: {:?}", config.destination_dirs);
    info!("Public group: {}:{}", config.public_group, config.listen_port);

    let progress = Arc::new(ProgressSink::new());
    progress.add_listener(|event| {
        info!("[{:08x}] {:?} {}", event.session_id, event.status, event.path.display());
    });
    let executor = Arc::new(Executor::with_available_parallelism());
    let server = ReceiverServer::new(executor, progress, 1);

    match server.monitor(config)? {
        MonitorResult::JustStarted => info!("Waiting for announcements..."),
        other => return Err(format!("감시 시작 실패: {:?}", other).into()),
    }

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, stopping...");
    server.stop();
    Ok(())
}
