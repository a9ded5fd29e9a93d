//! 전송 통계

use std::time::{Duration, Instant};

/// 세션 단위 전송 통계
#[derive(Debug, Clone)]
pub struct TransferStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 처리한 파일 수
    pub files: u64,

    /// 최초 전송 블록 수
    pub blocks_sent: u64,

    /// 재전송 블록 수
    pub blocks_resent: u64,

    /// 송신/수신한 페이로드 바이트
    pub payload_bytes: u64,

    /// NAK가 담긴 Status 수
    pub nak_reports: u64,

    /// NAK로 보고된 블록 수
    pub nak_blocks: u64,

    /// 중복 수신 블록 수 (수신측)
    pub duplicate_blocks: u64,

    /// 디스크에 기록한 바이트 (수신측)
    pub bytes_written: u64,
}

impl TransferStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            files: 0,
            blocks_sent: 0,
            blocks_resent: 0,
            payload_bytes: 0,
            nak_reports: 0,
            nak_blocks: 0,
            duplicate_blocks: 0,
            bytes_written: 0,
        }
    }

    /// 블록 송신 기록
    pub fn record_block(&mut self, len: usize, resend: bool) {
        if resend {
            self.blocks_resent += 1;
        } else {
            self.blocks_sent += 1;
        }
        self.payload_bytes += len as u64;
    }

    /// NAK 보고 기록
    pub fn record_nak(&mut self, blocks: usize) {
        self.nak_reports += 1;
        self.nak_blocks += blocks as u64;
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 전체 처리율 (bytes/sec)
    pub fn throughput(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.payload_bytes as f64 / elapsed
    }

    /// 재전송 비율
    pub fn resend_ratio(&self) -> f64 {
        let total = self.blocks_sent + self.blocks_resent;
        if total == 0 {
            return 0.0;
        }
        self.blocks_resent as f64 / total as f64
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Files: {} | Blocks: {} (+{} resent) | Bytes: {} | Throughput: {:.2} MB/s | NAKs: {} ({} blocks) | Written: {}",
            self.elapsed().as_secs_f64(),
            self.files,
            self.blocks_sent,
            self.blocks_resent,
            self.payload_bytes,
            self.throughput() / 1_000_000.0,
            self.nak_reports,
            self.nak_blocks,
            self.bytes_written,
        )
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}
