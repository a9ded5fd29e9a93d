//! 블록/섹션 인덱서
//!
//! - 파일을 block_size 단위 블록으로 나누고, 블록들을 섹션으로 묶는다
//! - 앞쪽 `big_section_count`개 섹션은 나머지보다 블록이 하나 더 많다
//! - 섹션 인덱스/섹션 내 블록 인덱스는 모두 16비트

use crate::message::{BlockIndex, SectionIndex};
use crate::{Error, Result};

/// 섹션당 최대 블록 수 상한 (16비트 블록 인덱스)
pub const MAX_BLOCKS_PER_SECTION: u32 = u16::MAX as u32;

/// 최대 섹션 수
pub const MAX_SECTION_COUNT: u64 = u16::MAX as u64;

/// 섹션당 최대 블록 수 = min(block_size * 8, 65535)
///
/// 섹션 하나의 손실 비트맵이 블록 하나에 들어가도록 한다.
pub fn max_blocks_per_section(block_size: u16) -> u32 {
    (block_size as u32 * 8).min(MAX_BLOCKS_PER_SECTION)
}

/// 파일 전송 기하 정보
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileGeometry {
    file_size: u64,
    block_size: u16,
    block_count: u64,
    section_count: u64,
    blocks_per_small_section: u64,
    blocks_per_big_section: u64,
    big_section_count: u64,
}

impl FileGeometry {
    /// 새 기하 정보 계산
    pub fn new(file_size: u64, block_size: u16, max_blocks_per_section: u32) -> Result<Self> {
        let too_large = Error::FileTooLarge {
            size: file_size,
            block_size,
        };
        if block_size == 0 || max_blocks_per_section == 0 {
            return Err(too_large);
        }

        let block_count = file_size.div_ceil(block_size as u64);
        let section_count = block_count.div_ceil(max_blocks_per_section as u64);
        if section_count > MAX_SECTION_COUNT {
            return Err(too_large);
        }

        let (small, big, big_count) = if section_count == 0 {
            (0, 0, 0)
        } else {
            let small = block_count / section_count;
            let big = small + u64::from(block_count % section_count != 0);
            (small, big, block_count - small * section_count)
        };

        Ok(Self {
            file_size,
            block_size,
            block_count,
            section_count,
            blocks_per_small_section: small,
            blocks_per_big_section: big,
            big_section_count: big_count,
        })
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn block_size(&self) -> u16 {
        self.block_size
    }

    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    pub fn section_count(&self) -> u64 {
        self.section_count
    }

    pub fn big_section_count(&self) -> u64 {
        self.big_section_count
    }

    /// 마지막 섹션 인덱스 (빈 파일은 0)
    pub fn last_section(&self) -> SectionIndex {
        self.section_count.saturating_sub(1) as SectionIndex
    }

    /// 섹션의 블록 수
    pub fn section_block_count(&self, section: SectionIndex) -> u64 {
        if (section as u64) < self.big_section_count {
            self.blocks_per_big_section
        } else {
            self.blocks_per_small_section
        }
    }

    /// 절대 블록 인덱스 -> (섹션, 섹션 내 블록)
    pub fn abs_to_sect_blk(&self, index: u64) -> (SectionIndex, BlockIndex) {
        let big_span = self.big_section_count * self.blocks_per_big_section;
        if index < big_span {
            (
                (index / self.blocks_per_big_section) as SectionIndex,
                (index % self.blocks_per_big_section) as BlockIndex,
            )
        } else {
            let rest = index - big_span;
            (
                (self.big_section_count + rest / self.blocks_per_small_section) as SectionIndex,
                (rest % self.blocks_per_small_section) as BlockIndex,
            )
        }
    }

    /// (섹션, 섹션 내 블록) -> 절대 블록 인덱스
    pub fn sect_blk_to_abs(&self, section: SectionIndex, block: BlockIndex) -> u64 {
        let section = section as u64;
        if section < self.big_section_count {
            section * self.blocks_per_big_section + block as u64
        } else {
            self.big_section_count * self.blocks_per_big_section
                + (section - self.big_section_count) * self.blocks_per_small_section
                + block as u64
        }
    }

    /// 블록의 파일 내 바이트 오프셋
    pub fn block_offset(&self, index: u64) -> u64 {
        index * self.block_size as u64
    }

    /// 블록의 실제 길이 (마지막 블록은 짧을 수 있음)
    pub fn block_len(&self, index: u64) -> usize {
        let offset = self.block_offset(index);
        (self.file_size.saturating_sub(offset)).min(self.block_size as u64) as usize
    }
}

/// 섹션 단위 수신 기록
///
/// 누락 비트맵은 처음에 모든 비트가 설정되고, 블록이 도착할 때마다 해제된다.
/// 비트 순서는 NAK 비트맵과 같다 (바이트 j의 비트 k = 블록 j*8+k).
#[derive(Debug, Clone)]
pub struct SectionRecord {
    missing: Vec<u8>,
    expected: u64,
    received: u64,
}

impl SectionRecord {
    pub fn new(expected: u64) -> Self {
        let mut missing = vec![0xFFu8; expected.div_ceil(8) as usize];
        let tail_bits = (expected % 8) as u32;
        if tail_bits != 0 {
            if let Some(last) = missing.last_mut() {
                *last = (1u8 << tail_bits) - 1;
            }
        }
        Self {
            missing,
            expected,
            received: 0,
        }
    }

    /// 블록 수신 기록 (새 블록이면 true)
    pub fn mark_received(&mut self, block: BlockIndex) -> bool {
        let block = block as u64;
        if block >= self.expected {
            return false;
        }
        let byte = &mut self.missing[(block / 8) as usize];
        let bit = 1u8 << (block % 8);
        let fresh = *byte & bit != 0;
        *byte &= !bit;
        self.received += 1;
        fresh
    }

    /// 수신 횟수가 기대치 이상이고 누락 비트가 하나도 없을 때 완료
    pub fn is_complete(&self) -> bool {
        self.received >= self.expected && self.missing.iter().all(|&b| b == 0)
    }

    /// Status 메시지로 보낼 누락 비트맵
    pub fn nak_map(&self) -> &[u8] {
        &self.missing
    }

    pub fn missing_count(&self) -> u64 {
        self.missing.iter().map(|b| b.count_ones() as u64).sum()
    }
}
