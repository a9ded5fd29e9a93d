//! 와이어 메시지 코덱
//!
//! 모든 패킷 = 공통 헤더(16 bytes) + 역할별 고정 헤더 + 가변 영역.
//! - 다중 바이트 필드는 빅엔디언
//! - 역할별 고정 헤더의 첫 바이트는 역할을 한 번 더 기록 (encrypted 제외)
//! - `header_length`는 4바이트 단위, 수신자 ID 목록/데이터는 그 뒤에 위치
//!
//! 파싱은 입력 버퍼를 절대 수정하지 않으며, 고정 필드는 정규화된 값으로,
//! 가변 영역은 입력 버퍼를 가리키는 슬라이스로 돌려준다.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};

/// 매직 바이트
pub const MAGIC: u8 = 0x50;

/// header_length 단위 (바이트)
pub const HEADER_LENGTH_UNIT: usize = 4;

/// 공통 헤더 크기
pub const PROTOCOL_HEADER_LEN: usize = 16;

/// GRTT 하한/상한 (초)
pub const MIN_GRTT: f64 = 1e-6;
pub const MAX_GRTT: f64 = 1e3;

/// Register 난수 크기
pub const RND_SIZE: usize = 32;

/// Abort 메시지 텍스트 최대 길이
pub const MAX_ABORT_TEXT: usize = 300;

/// content hash 확장 코드
pub const EXT_FILE_HASH: u8 = 8;

/// 그룹 멤버 ID (수신자/송신자)
pub type MemberId = u32;
pub type FileId = u16;
pub type SectionIndex = u16;
pub type BlockIndex = u16;

/// 메시지 역할
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Announce = 1,
    Register = 2,
    ClientKey = 3,
    RegConf = 4,
    KeyInfo = 5,
    KeyInfoAck = 6,
    FileInfo = 7,
    FileInfoAck = 8,
    FileSeg = 9,
    Done = 10,
    Status = 11,
    Complete = 12,
    DoneConf = 13,
    HbReq = 14,
    HbResp = 15,
    KeyReq = 16,
    ProxyKey = 17,
    Encrypted = 18,
    Abort = 19,
    CongCtrl = 20,
    CcAck = 21,
    FileUpToDate = 22,
}

/// 첫 번째 무효 역할 값
pub const ROLE_INVALID: u8 = 23;

impl Role {
    pub fn from_u8(value: u8) -> Option<Self> {
        let role = match value {
            1 => Role::Announce,
            2 => Role::Register,
            3 => Role::ClientKey,
            4 => Role::RegConf,
            5 => Role::KeyInfo,
            6 => Role::KeyInfoAck,
            7 => Role::FileInfo,
            8 => Role::FileInfoAck,
            9 => Role::FileSeg,
            10 => Role::Done,
            11 => Role::Status,
            12 => Role::Complete,
            13 => Role::DoneConf,
            14 => Role::HbReq,
            15 => Role::HbResp,
            16 => Role::KeyReq,
            17 => Role::ProxyKey,
            18 => Role::Encrypted,
            19 => Role::Abort,
            20 => Role::CongCtrl,
            21 => Role::CcAck,
            22 => Role::FileUpToDate,
            _ => return None,
        };
        Some(role)
    }
}

fn be_u16(buf: &[u8], offset: usize) -> Option<u16> {
    let bytes = buf.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn be_u32(buf: &[u8], offset: usize) -> Option<u32> {
    let bytes = buf.get(offset..offset + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// 뒤쪽 NUL 패딩 제거
fn trim_padding(raw: &[u8]) -> &[u8] {
    let end = raw.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
    &raw[..end]
}

/// 4바이트 단위로 패딩된 길이
pub fn padded_len(len: usize) -> usize {
    (len + HEADER_LENGTH_UNIT - 1) / HEADER_LENGTH_UNIT * HEADER_LENGTH_UNIT
}

fn put_padded(buf: &mut BytesMut, raw: &[u8]) {
    buf.put_slice(raw);
    buf.put_bytes(0, padded_len(raw.len()) - raw.len());
}

/// 역할별 고정 헤더 검사: header_length*4 ∈ [fixed_len, body.len()]
fn header_bytes(body: &[u8], fixed_len: usize) -> Option<usize> {
    let header_len = *body.get(1)? as usize * HEADER_LENGTH_UNIT;
    if header_len < fixed_len || header_len > body.len() {
        return None;
    }
    Some(header_len)
}

/// 메시지 타임스탬프 (epoch 기준 마이크로초)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        Self(micros)
    }

    pub fn from_halves(high: u32, low: u32) -> Self {
        Self(((high as u64) << 32) | low as u64)
    }

    pub fn high(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn low(&self) -> u32 {
        self.0 as u32
    }

    /// 왕복 시간 = 현재 - 타임스탬프
    pub fn rtt(&self) -> Duration {
        Duration::from_micros(Self::now().0.saturating_sub(self.0))
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u32(self.high());
        buf.put_u32(self.low());
    }

    fn read(buf: &[u8], offset: usize) -> Option<Self> {
        Some(Self::from_halves(be_u32(buf, offset)?, be_u32(buf, offset + 4)?))
    }
}

/// GRTT 양자화 (초 -> 1 byte)
pub fn quantize_grtt(grtt: f64) -> u8 {
    let grtt = if grtt.is_nan() { MIN_GRTT } else { grtt.clamp(MIN_GRTT, MAX_GRTT) };
    if grtt < 33.0 * MIN_GRTT {
        ((grtt / MIN_GRTT).floor() - 1.0).clamp(0.0, 31.0) as u8
    } else {
        (255.0 - 13.0 * (MAX_GRTT / grtt).ln()).round().clamp(0.0, 255.0) as u8
    }
}

/// GRTT 역양자화 (1 byte -> 초)
pub fn dequantize_grtt(qrtt: u8) -> f64 {
    if qrtt <= 31 {
        (qrtt as f64 + 1.0) * MIN_GRTT
    } else {
        MAX_GRTT / ((255.0 - qrtt as f64) / 13.0).exp()
    }
}

/// 그룹 크기 양자화 (가수 5bit + 지수 3bit)
pub fn quantize_group_size(size: u32) -> u8 {
    let mut mantissa = size as f64;
    let mut exponent = 0u32;
    while mantissa >= 10.0 {
        mantissa /= 10.0;
        exponent += 1;
    }
    let mut rval = (((mantissa * 32.0 / 10.0) + 0.5) as u32) << 3;
    if rval > 0xFF {
        mantissa /= 10.0;
        exponent += 1;
        rval = (((mantissa * 32.0 / 10.0) + 0.5) as u32) << 3;
    }
    if exponent > 7 {
        return 0xFF;
    }
    (rval | exponent) as u8
}

/// 그룹 크기 역양자화
pub fn dequantize_group_size(quantized: u8) -> u32 {
    let exponent = (quantized & 0x07) as i32;
    let mantissa = (quantized >> 3) as f64 * 10.0 / 32.0;
    (mantissa * 10f64.powi(exponent) + 0.5) as u32
}

/// 손실 비트맵에서 누락 블록 목록 추출 (오름차순)
///
/// 바이트 j의 비트 k가 설정되어 있으면 블록 j*8+k 누락.
/// 0인 8바이트 워드는 통째로 건너뛴다.
pub fn extract_lost_blocks(nak_map: &[u8]) -> Vec<BlockIndex> {
    fn collect(bytes: &[u8], base: usize, out: &mut Vec<BlockIndex>) {
        for (j, &byte) in bytes.iter().enumerate() {
            if byte == 0 {
                continue;
            }
            for k in 0..8 {
                if byte & (1 << k) != 0 {
                    if let Ok(idx) = BlockIndex::try_from(base + j * 8 + k) {
                        out.push(idx);
                    }
                }
            }
        }
    }

    let mut lost = Vec::new();
    let mut words = nak_map.chunks_exact(8);
    let mut base = 0usize;
    for word in &mut words {
        let value = u64::from_ne_bytes([
            word[0], word[1], word[2], word[3], word[4], word[5], word[6], word[7],
        ]);
        if value != 0 {
            collect(word, base, &mut lost);
        }
        base += 64;
    }
    collect(words.remainder(), base, &mut lost);
    lost
}

/// 공통 프로토콜 헤더
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolHeader {
    pub role: Role,
    pub sequence: u16,
    pub source_id: MemberId,
    pub session_id: u32,
    pub group_instance: u8,
    /// 양자화된 GRTT
    pub grtt: u8,
    /// 양자화된 그룹 크기
    pub group_size: u8,
}

impl ProtocolHeader {
    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u8(MAGIC);
        buf.put_u8(self.role as u8);
        buf.put_u16(self.sequence);
        buf.put_u32(self.source_id);
        buf.put_u32(self.session_id);
        buf.put_u8(self.group_instance);
        buf.put_u8(self.grtt);
        buf.put_u8(self.group_size);
        buf.put_u8(0);
    }

    fn read(packet: &[u8]) -> Option<Self> {
        if packet.len() < PROTOCOL_HEADER_LEN || packet[0] != MAGIC {
            return None;
        }
        Some(Self {
            role: Role::from_u8(packet[1])?,
            sequence: be_u16(packet, 2)?,
            source_id: be_u32(packet, 4)?,
            session_id: be_u32(packet, 8)?,
            group_instance: packet[12],
            grtt: packet[13],
            group_size: packet[14],
        })
    }
}

/// 공통 검증을 통과한 패킷
#[derive(Debug, Clone, Copy)]
pub struct ValidatedPacket<'a> {
    pub header: ProtocolHeader,
    pub body: &'a [u8],
}

/// 공통 검증: 매직, 역할 범위, 역할 중복 바이트
pub fn validate_packet(packet: &[u8]) -> Option<ValidatedPacket<'_>> {
    if packet.len() <= PROTOCOL_HEADER_LEN {
        return None;
    }
    let header = ProtocolHeader::read(packet)?;
    let body = &packet[PROTOCOL_HEADER_LEN..];
    if header.role != Role::Encrypted && body[0] != header.role as u8 {
        return None;
    }
    Some(ValidatedPacket { header, body })
}

/// 수신자 ID 목록 뷰 (빅엔디언 u32 배열)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemberIds<'a> {
    raw: &'a [u8],
}

impl<'a> MemberIds<'a> {
    pub fn new(raw: &'a [u8]) -> Self {
        let whole = raw.len() / 4 * 4;
        Self { raw: &raw[..whole] }
    }

    pub fn len(&self) -> usize {
        self.raw.len() / 4
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = MemberId> + 'a {
        self.raw
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
    }

    pub fn contains(&self, id: MemberId) -> bool {
        self.iter().any(|m| m == id)
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_slice(self.raw);
    }
}

/// ID 목록 인코딩
pub fn encode_member_ids(ids: &[MemberId]) -> Vec<u8> {
    ids.iter().flat_map(|id| id.to_be_bytes()).collect()
}

/// 혼잡 제어 모드
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionMode {
    None = 0,
    Uftp3 = 1,
    Tfmcc = 2,
    Pgmcc = 3,
}

impl CongestionMode {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Uftp3),
            2 => Some(Self::Tfmcc),
            3 => Some(Self::Pgmcc),
            _ => None,
        }
    }
}

/// 세션 공지
#[derive(Debug, Clone, PartialEq)]
pub struct Announce<'a> {
    pub sync_mode: bool,
    pub sync_preview: bool,
    pub robust_factor: u8,
    pub cc_mode: CongestionMode,
    pub block_size: u16,
    pub timestamp: Timestamp,
    pub public_group: IpAddr,
    pub private_group: IpAddr,
    /// 비어 있으면 open group
    pub allowed_clients: MemberIds<'a>,
}

impl<'a> Announce<'a> {
    pub const FIXED_LEN: usize = 16;

    pub fn parse(body: &'a [u8]) -> Option<Self> {
        if body.len() < Self::FIXED_LEN {
            return None;
        }
        let flags = body[2];
        let ipv6 = flags & 0x04 != 0;
        let addr_len = if ipv6 { 32 } else { 8 };
        let header_len = header_bytes(body, Self::FIXED_LEN + addr_len)?;

        let addrs = &body[Self::FIXED_LEN..Self::FIXED_LEN + addr_len];
        let (public_group, private_group) = if ipv6 {
            let mut public = [0u8; 16];
            let mut private = [0u8; 16];
            public.copy_from_slice(&addrs[..16]);
            private.copy_from_slice(&addrs[16..]);
            (
                IpAddr::V6(Ipv6Addr::from(public)),
                IpAddr::V6(Ipv6Addr::from(private)),
            )
        } else {
            (
                IpAddr::V4(Ipv4Addr::new(addrs[0], addrs[1], addrs[2], addrs[3])),
                IpAddr::V4(Ipv4Addr::new(addrs[4], addrs[5], addrs[6], addrs[7])),
            )
        };

        Some(Self {
            sync_mode: flags & 0x01 != 0,
            sync_preview: flags & 0x02 != 0,
            robust_factor: body[3],
            cc_mode: CongestionMode::from_u8(body[4])?,
            block_size: be_u16(body, 6)?,
            timestamp: Timestamp::read(body, 8)?,
            public_group,
            private_group,
            allowed_clients: MemberIds::new(&body[header_len..]),
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        let ipv6 = self.public_group.is_ipv6() || self.private_group.is_ipv6();
        let addr_len = if ipv6 { 32 } else { 8 };
        let mut flags = 0u8;
        if self.sync_mode {
            flags |= 0x01;
        }
        if self.sync_preview {
            flags |= 0x02;
        }
        if ipv6 {
            flags |= 0x04;
        }
        buf.put_u8(Role::Announce as u8);
        buf.put_u8(((Self::FIXED_LEN + addr_len) / HEADER_LENGTH_UNIT) as u8);
        buf.put_u8(flags);
        buf.put_u8(self.robust_factor);
        buf.put_u8(self.cc_mode as u8);
        buf.put_u8(0);
        buf.put_u16(self.block_size);
        self.timestamp.put(buf);
        for addr in [self.public_group, self.private_group] {
            match (ipv6, addr) {
                (false, IpAddr::V4(v4)) => buf.put_slice(&v4.octets()),
                (_, IpAddr::V4(v4)) => buf.put_slice(&v4.to_ipv6_mapped().octets()),
                (_, IpAddr::V6(v6)) => buf.put_slice(&v6.octets()),
            }
        }
        self.allowed_clients.put(buf);
    }
}

/// 수신자 등록 요청
#[derive(Debug, Clone, PartialEq)]
pub struct Register<'a> {
    pub key_length: u16,
    /// Announce 타임스탬프 에코 (RTT 측정용)
    pub timestamp: Timestamp,
    pub nonce: [u8; RND_SIZE],
    /// 비어 있지 않으면 송신원은 proxy
    pub receiver_ids: MemberIds<'a>,
}

impl<'a> Register<'a> {
    pub const FIXED_LEN: usize = 12 + RND_SIZE;

    pub fn parse(body: &'a [u8]) -> Option<Self> {
        let header_len = header_bytes(body, Self::FIXED_LEN)?;
        let mut nonce = [0u8; RND_SIZE];
        nonce.copy_from_slice(&body[12..12 + RND_SIZE]);
        Some(Self {
            key_length: be_u16(body, 2)?,
            timestamp: Timestamp::read(body, 4)?,
            nonce,
            receiver_ids: MemberIds::new(&body[header_len..]),
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(Role::Register as u8);
        buf.put_u8((Self::FIXED_LEN / HEADER_LENGTH_UNIT) as u8);
        buf.put_u16(self.key_length);
        self.timestamp.put(buf);
        buf.put_slice(&self.nonce);
        self.receiver_ids.put(buf);
    }
}

/// ID 목록만 가지는 메시지 (RegConf / DoneConf)
#[derive(Debug, Clone, PartialEq)]
pub struct IdList<'a> {
    pub receiver_ids: MemberIds<'a>,
}

impl<'a> IdList<'a> {
    pub const FIXED_LEN: usize = 4;

    pub fn parse(body: &'a [u8]) -> Option<Self> {
        let header_len = header_bytes(body, Self::FIXED_LEN)?;
        Some(Self {
            receiver_ids: MemberIds::new(&body[header_len..]),
        })
    }

    fn encode(&self, role: Role, buf: &mut BytesMut) {
        buf.put_u8(role as u8);
        buf.put_u8((Self::FIXED_LEN / HEADER_LENGTH_UNIT) as u8);
        buf.put_u16(0);
        self.receiver_ids.put(buf);
    }
}

/// 파일 종류
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular = 0,
    Directory = 1,
    Symlink = 2,
    Delete = 3,
    FreeSpace = 4,
}

impl FileKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Regular),
            1 => Some(Self::Directory),
            2 => Some(Self::Symlink),
            3 => Some(Self::Delete),
            4 => Some(Self::FreeSpace),
            _ => None,
        }
    }
}

/// 파일 정보
#[derive(Debug, Clone, PartialEq)]
pub struct FileInfo<'a> {
    pub file_id: FileId,
    pub kind: FileKind,
    /// 파일 크기 (48bit)
    pub size: u64,
    /// 수정 시각 (epoch 초, 48bit)
    pub mtime: u64,
    pub name: &'a [u8],
    pub link: &'a [u8],
    /// SHA-1 content hash 확장
    pub content_hash: Option<&'a [u8]>,
    pub timestamp: Timestamp,
    pub receiver_ids: MemberIds<'a>,
}

impl<'a> FileInfo<'a> {
    pub const FIXED_LEN: usize = 28;
    /// 헤더 길이 필드(1 byte, 4바이트 단위)로 표현 가능한 최대 헤더
    pub const MAX_HEADER_LEN: usize = u8::MAX as usize * HEADER_LENGTH_UNIT;
    pub const HASH_EXT_LEN: usize = 24;

    /// name/link/확장을 담은 고정 헤더 크기
    pub fn header_len_for(name_len: usize, link_len: usize, with_hash: bool) -> usize {
        let ext_len = if with_hash { Self::HASH_EXT_LEN } else { 0 };
        Self::FIXED_LEN + padded_len(name_len) + padded_len(link_len) + ext_len
    }

    /// 해시 확장 자리까지 남겨도 헤더 길이 필드에 들어가는지
    pub fn fits(name_len: usize, link_len: usize) -> bool {
        name_len > 0 && Self::header_len_for(name_len, link_len, true) <= Self::MAX_HEADER_LEN
    }

    pub fn parse(body: &'a [u8]) -> Option<Self> {
        let header_len = header_bytes(body, Self::FIXED_LEN)?;
        let name_len = body[8] as usize * HEADER_LENGTH_UNIT;
        let link_len = body[9] as usize * HEADER_LENGTH_UNIT;
        if name_len == 0 || Self::FIXED_LEN + name_len + link_len > header_len {
            return None;
        }
        let name_start = Self::FIXED_LEN;
        let link_start = name_start + name_len;
        let ext_start = link_start + link_len;

        let extension = &body[ext_start..header_len];
        let content_hash = (extension.len() >= Self::HASH_EXT_LEN
            && extension[0] == EXT_FILE_HASH)
            .then(|| &extension[4..Self::HASH_EXT_LEN]);

        let size = ((be_u16(body, 10)? as u64) << 32) | be_u32(body, 12)? as u64;
        let mtime = ((be_u16(body, 6)? as u64) << 32) | be_u32(body, 16)? as u64;

        Some(Self {
            file_id: be_u16(body, 2)?,
            kind: FileKind::from_u8(body[4])?,
            size,
            mtime,
            name: trim_padding(&body[name_start..link_start]),
            link: trim_padding(&body[link_start..ext_start]),
            content_hash,
            timestamp: Timestamp::read(body, 20)?,
            receiver_ids: MemberIds::new(&body[header_len..]),
        })
    }

    /// 이름 (UTF-8 손실 허용)
    pub fn name_lossy(&self) -> String {
        String::from_utf8_lossy(self.name).into_owned()
    }

    fn encode(&self, buf: &mut BytesMut) {
        let name_len = padded_len(self.name.len());
        let link_len = padded_len(self.link.len());
        let header_len = Self::header_len_for(self.name.len(), self.link.len(), self.content_hash.is_some());
        debug_assert!(
            header_len <= Self::MAX_HEADER_LEN,
            "FileInfo 헤더 초과: {} bytes",
            header_len
        );

        buf.put_u8(Role::FileInfo as u8);
        buf.put_u8((header_len / HEADER_LENGTH_UNIT) as u8);
        buf.put_u16(self.file_id);
        buf.put_u8(self.kind as u8);
        buf.put_u8(0);
        buf.put_u16((self.mtime >> 32) as u16);
        buf.put_u8((name_len / HEADER_LENGTH_UNIT) as u8);
        buf.put_u8((link_len / HEADER_LENGTH_UNIT) as u8);
        buf.put_u16((self.size >> 32) as u16);
        buf.put_u32(self.size as u32);
        buf.put_u32(self.mtime as u32);
        self.timestamp.put(buf);
        put_padded(buf, self.name);
        put_padded(buf, self.link);
        if let Some(hash) = self.content_hash {
            buf.put_u8(EXT_FILE_HASH);
            buf.put_u8(0);
            buf.put_u16(0);
            let mut digest = [0u8; 20];
            let n = hash.len().min(20);
            digest[..n].copy_from_slice(&hash[..n]);
            buf.put_slice(&digest);
        }
        self.receiver_ids.put(buf);
    }
}

/// 파일 정보 응답
#[derive(Debug, Clone, PartialEq)]
pub struct FileInfoAck<'a> {
    pub file_id: FileId,
    pub partial: bool,
    /// 이미 보유 중 (전송 불필요)
    pub done: bool,
    /// FileInfo 타임스탬프 에코
    pub timestamp: Timestamp,
    pub receiver_ids: MemberIds<'a>,
}

impl<'a> FileInfoAck<'a> {
    pub const FIXED_LEN: usize = 16;

    pub fn parse(body: &'a [u8]) -> Option<Self> {
        let header_len = header_bytes(body, Self::FIXED_LEN)?;
        let flags = body[4];
        Some(Self {
            file_id: be_u16(body, 2)?,
            partial: flags & 0x01 != 0,
            done: flags & 0x02 != 0,
            timestamp: Timestamp::read(body, 8)?,
            receiver_ids: MemberIds::new(&body[header_len..]),
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        let mut flags = 0u8;
        if self.partial {
            flags |= 0x01;
        }
        if self.done {
            flags |= 0x02;
        }
        buf.put_u8(Role::FileInfoAck as u8);
        buf.put_u8((Self::FIXED_LEN / HEADER_LENGTH_UNIT) as u8);
        buf.put_u16(self.file_id);
        buf.put_u8(flags);
        buf.put_u8(0);
        buf.put_u16(0);
        self.timestamp.put(buf);
        self.receiver_ids.put(buf);
    }
}

/// 데이터 블록
#[derive(Debug, Clone, PartialEq)]
pub struct FileSeg<'a> {
    pub file_id: FileId,
    pub section: SectionIndex,
    pub block: BlockIndex,
    pub data: &'a [u8],
}

impl<'a> FileSeg<'a> {
    pub const FIXED_LEN: usize = 8;

    pub fn parse(body: &'a [u8]) -> Option<Self> {
        let header_len = header_bytes(body, Self::FIXED_LEN)?;
        Some(Self {
            file_id: be_u16(body, 2)?,
            section: be_u16(body, 4)?,
            block: be_u16(body, 6)?,
            data: &body[header_len..],
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(Role::FileSeg as u8);
        buf.put_u8((Self::FIXED_LEN / HEADER_LENGTH_UNIT) as u8);
        buf.put_u16(self.file_id);
        buf.put_u16(self.section);
        buf.put_u16(self.block);
        buf.put_slice(self.data);
    }
}

/// 전송 종료 알림 (file_id 0 = 세션 종료)
#[derive(Debug, Clone, PartialEq)]
pub struct Done<'a> {
    pub file_id: FileId,
    pub section: SectionIndex,
    pub receiver_ids: MemberIds<'a>,
}

impl<'a> Done<'a> {
    pub const FIXED_LEN: usize = 8;

    pub fn parse(body: &'a [u8]) -> Option<Self> {
        let header_len = header_bytes(body, Self::FIXED_LEN)?;
        Some(Self {
            file_id: be_u16(body, 2)?,
            section: be_u16(body, 4)?,
            receiver_ids: MemberIds::new(&body[header_len..]),
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(Role::Done as u8);
        buf.put_u8((Self::FIXED_LEN / HEADER_LENGTH_UNIT) as u8);
        buf.put_u16(self.file_id);
        buf.put_u16(self.section);
        buf.put_u16(0);
        self.receiver_ids.put(buf);
    }
}

/// 섹션 상태 보고 (NAK 비트맵)
#[derive(Debug, Clone, PartialEq)]
pub struct Status<'a> {
    pub file_id: FileId,
    pub section: SectionIndex,
    pub nak_map: &'a [u8],
}

impl<'a> Status<'a> {
    pub const FIXED_LEN: usize = 8;

    pub fn parse(body: &'a [u8]) -> Option<Self> {
        let header_len = header_bytes(body, Self::FIXED_LEN)?;
        Some(Self {
            file_id: be_u16(body, 2)?,
            section: be_u16(body, 4)?,
            nak_map: &body[header_len..],
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(Role::Status as u8);
        buf.put_u8((Self::FIXED_LEN / HEADER_LENGTH_UNIT) as u8);
        buf.put_u16(self.file_id);
        buf.put_u16(self.section);
        buf.put_u16(0);
        buf.put_slice(self.nak_map);
    }
}

/// 완료 세부 상태
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteStatus {
    Normal = 0,
    Skipped = 1,
    Overwritten = 2,
    Rejected = 3,
}

impl CompleteStatus {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Normal),
            1 => Some(Self::Skipped),
            2 => Some(Self::Overwritten),
            3 => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// 파일 완료 보고
#[derive(Debug, Clone, PartialEq)]
pub struct Complete<'a> {
    pub file_id: FileId,
    pub status: CompleteStatus,
    pub receiver_ids: MemberIds<'a>,
}

impl<'a> Complete<'a> {
    pub const FIXED_LEN: usize = 8;

    pub fn parse(body: &'a [u8]) -> Option<Self> {
        let header_len = header_bytes(body, Self::FIXED_LEN)?;
        Some(Self {
            file_id: be_u16(body, 2)?,
            status: CompleteStatus::from_u8(body[4])?,
            receiver_ids: MemberIds::new(&body[header_len..]),
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(Role::Complete as u8);
        buf.put_u8((Self::FIXED_LEN / HEADER_LENGTH_UNIT) as u8);
        buf.put_u16(self.file_id);
        buf.put_u8(self.status as u8);
        buf.put_u8(0);
        buf.put_u16(0);
        self.receiver_ids.put(buf);
    }
}

/// 중단 알림
#[derive(Debug, Clone, PartialEq)]
pub struct Abort<'a> {
    pub current_file: bool,
    /// proxy가 대신 보낸 경우 원래 호스트
    pub host: MemberId,
    pub text: &'a [u8],
}

impl<'a> Abort<'a> {
    pub const FIXED_LEN: usize = 8 + MAX_ABORT_TEXT;

    pub fn parse(body: &'a [u8]) -> Option<Self> {
        header_bytes(body, Self::FIXED_LEN)?;
        Some(Self {
            current_file: body[2] & 0x01 != 0,
            host: be_u32(body, 4)?,
            text: trim_padding(&body[8..Self::FIXED_LEN]),
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        let text = &self.text[..self.text.len().min(MAX_ABORT_TEXT)];
        buf.put_u8(Role::Abort as u8);
        buf.put_u8((Self::FIXED_LEN / HEADER_LENGTH_UNIT) as u8);
        buf.put_u8(u8::from(self.current_file));
        buf.put_u8(0);
        buf.put_u32(self.host);
        buf.put_slice(text);
        buf.put_bytes(0, MAX_ABORT_TEXT - text.len());
    }
}

/// 역할별 메시지
#[derive(Debug, Clone, PartialEq)]
pub enum Message<'a> {
    Announce(Announce<'a>),
    Register(Register<'a>),
    RegConf(IdList<'a>),
    FileInfo(FileInfo<'a>),
    FileInfoAck(FileInfoAck<'a>),
    FileSeg(FileSeg<'a>),
    Done(Done<'a>),
    Status(Status<'a>),
    Complete(Complete<'a>),
    Abort(Abort<'a>),
    DoneConf(IdList<'a>),
}

impl<'a> Message<'a> {
    /// 검증된 패킷의 본문 파싱
    pub fn parse(packet: &ValidatedPacket<'a>) -> Option<Self> {
        let body = packet.body;
        let message = match packet.header.role {
            Role::Announce => Message::Announce(Announce::parse(body)?),
            Role::Register => Message::Register(Register::parse(body)?),
            Role::RegConf => Message::RegConf(IdList::parse(body)?),
            Role::FileInfo => Message::FileInfo(FileInfo::parse(body)?),
            Role::FileInfoAck => Message::FileInfoAck(FileInfoAck::parse(body)?),
            Role::FileSeg => Message::FileSeg(FileSeg::parse(body)?),
            Role::Done => Message::Done(Done::parse(body)?),
            Role::Status => Message::Status(Status::parse(body)?),
            Role::Complete => Message::Complete(Complete::parse(body)?),
            Role::Abort => Message::Abort(Abort::parse(body)?),
            Role::DoneConf => Message::DoneConf(IdList::parse(body)?),
            _ => return None,
        };
        Some(message)
    }

    pub fn role(&self) -> Role {
        match self {
            Message::Announce(_) => Role::Announce,
            Message::Register(_) => Role::Register,
            Message::RegConf(_) => Role::RegConf,
            Message::FileInfo(_) => Role::FileInfo,
            Message::FileInfoAck(_) => Role::FileInfoAck,
            Message::FileSeg(_) => Role::FileSeg,
            Message::Done(_) => Role::Done,
            Message::Status(_) => Role::Status,
            Message::Complete(_) => Role::Complete,
            Message::Abort(_) => Role::Abort,
            Message::DoneConf(_) => Role::DoneConf,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Message::Announce(m) => m.encode(buf),
            Message::Register(m) => m.encode(buf),
            Message::RegConf(m) => m.encode(Role::RegConf, buf),
            Message::FileInfo(m) => m.encode(buf),
            Message::FileInfoAck(m) => m.encode(buf),
            Message::FileSeg(m) => m.encode(buf),
            Message::Done(m) => m.encode(buf),
            Message::Status(m) => m.encode(buf),
            Message::Complete(m) => m.encode(buf),
            Message::Abort(m) => m.encode(buf),
            Message::DoneConf(m) => m.encode(Role::DoneConf, buf),
        }
    }
}

/// 헤더 + 본문을 하나의 패킷으로
pub fn encode_packet(header: &ProtocolHeader, message: &Message<'_>) -> Bytes {
    let mut buf = BytesMut::with_capacity(PROTOCOL_HEADER_LEN + 64);
    header.write(&mut buf);
    message.encode(&mut buf);
    buf.freeze()
}
