//! 송신 세션 컨텍스트
//!
//! 세션 식별자, GRTT 추정치, 송신 시퀀스, 수신자 목록을 보관하고
//! 패킷 헤더 작성과 대상 지정 송신을 담당한다.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::message::{
    encode_member_ids, encode_packet, quantize_grtt, quantize_group_size, FileId, MemberId,
    Message, ProtocolHeader,
};
use crate::rate::Paced;
use crate::section::max_blocks_per_section;
use crate::sender::file_task::BlockSource;
use crate::stats::TransferStats;

/// 수신자 상태 (송신자 관점)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberStatus {
    /// closed group에서 아직 등록하지 않음
    Mute,
    /// 응답 없음
    Lost,
    Abort,
    Registered,
    Active,
    /// NAK 보고 후 재전송 대기
    ActiveNak,
    Done,
}

impl MemberStatus {
    /// 세션에 아직 참여 중인 상태
    pub fn is_live(self) -> bool {
        matches!(
            self,
            MemberStatus::Registered
                | MemberStatus::Active
                | MemberStatus::ActiveNak
                | MemberStatus::Done
        )
    }
}

/// 수신자 속성
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverProperties {
    pub status: MemberStatus,
    pub confirm_sent: bool,
    /// 하위 그룹을 대표하는 proxy
    pub is_proxy: bool,
    /// 마지막 측정 RTT
    pub rtt: Option<Duration>,
}

impl ReceiverProperties {
    pub fn new(status: MemberStatus) -> Self {
        Self {
            status,
            confirm_sent: false,
            is_proxy: false,
            rtt: None,
        }
    }
}

/// 송신할 패킷
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub packet: Bytes,
    pub dest: SocketAddr,
}

/// 세션 타이머 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderTimer {
    AnnounceRound,
    EnterTransfer,
    FileInfoRound,
    StartSending,
    WaitStatusEnd,
    SessionDoneRound,
}

/// 세션 종료 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    /// 등록한 수신자가 없음
    NoReceivers,
    Cancelled,
    Failed(String),
}

/// 세션 코어가 워커에 요청하는 동작
#[derive(Debug)]
pub enum SenderAction {
    Send(Outgoing),
    Schedule { after: Duration, timer: SenderTimer },
    CancelTimers,
    /// 디스크 유닛에서 블록 읽기
    ReadBlocks {
        source: Arc<BlockSource>,
        file_id: FileId,
        indices: Vec<u64>,
        resend: bool,
    },
    Finished(SessionOutcome),
}

impl Paced for SenderAction {
    fn packet_len(&self) -> Option<usize> {
        match self {
            SenderAction::Send(out) => Some(out.packet.len()),
            _ => None,
        }
    }
}

/// 송신 세션 컨텍스트
#[derive(Debug)]
pub struct SenderContext {
    pub sender_id: MemberId,
    pub session_id: u32,
    pub group_instance: u8,
    pub grtt: Duration,
    pub min_grtt: Duration,
    pub max_grtt: Duration,
    pub robust_factor: u8,
    pub block_size: u16,
    pub max_blocks_per_section: u32,
    pub open_group: bool,
    pub quit_on_error: bool,
    pub public_dest: SocketAddr,
    pub private_dest: SocketAddr,
    pub receivers: BTreeMap<MemberId, ReceiverProperties>,
    pub stats: TransferStats,
    sequence: u16,
}

impl SenderContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sender_id: MemberId,
        session_id: u32,
        grtt: Duration,
        grtt_range: (Duration, Duration),
        robust_factor: u8,
        block_size: u16,
        public_dest: SocketAddr,
        private_dest: SocketAddr,
    ) -> Self {
        Self {
            sender_id,
            session_id,
            group_instance: 0,
            grtt,
            min_grtt: grtt_range.0,
            max_grtt: grtt_range.1.max(grtt_range.0),
            robust_factor,
            block_size,
            max_blocks_per_section: max_blocks_per_section(block_size),
            open_group: true,
            quit_on_error: false,
            public_dest,
            private_dest,
            receivers: BTreeMap::new(),
            stats: TransferStats::new(),
            sequence: 0,
        }
    }

    /// 라운드 간격 (3 × GRTT)
    pub fn round_interval(&self) -> Duration {
        self.grtt * 3
    }

    fn next_header(&mut self, message: &Message<'_>) -> ProtocolHeader {
        self.sequence = self.sequence.wrapping_add(1);
        let live = self.count(|p| p.status.is_live()) as u32;
        ProtocolHeader {
            role: message.role(),
            sequence: self.sequence,
            source_id: self.sender_id,
            session_id: self.session_id,
            group_instance: self.group_instance,
            grtt: quantize_grtt(self.grtt.as_secs_f64()),
            group_size: if live == 0 { 0 } else { quantize_group_size(live) },
        }
    }

    /// 새 시퀀스 번호로 패킷 작성
    pub fn packet(&mut self, message: &Message<'_>) -> Bytes {
        let header = self.next_header(message);
        encode_packet(&header, message)
    }

    /// private 그룹으로 송신
    pub fn send_to_group(&mut self, message: &Message<'_>, out: &mut Vec<SenderAction>) {
        let packet = self.packet(message);
        out.push(SenderAction::Send(Outgoing {
            packet,
            dest: self.private_dest,
        }));
    }

    /// public 그룹으로 송신
    pub fn send_to_public(&mut self, message: &Message<'_>, out: &mut Vec<SenderAction>) {
        let packet = self.packet(message);
        out.push(SenderAction::Send(Outgoing {
            packet,
            dest: self.public_dest,
        }));
    }

    /// 조건에 맞는 (proxy 제외) 수신자 ID를 패킷당 `block_size / 4`개씩 나눠 인코딩
    pub fn target_batches<F>(&self, filter: F) -> Vec<Vec<u8>>
    where
        F: Fn(&ReceiverProperties) -> bool,
    {
        let ids: Vec<MemberId> = self
            .receivers
            .iter()
            .filter(|(_, p)| !p.is_proxy && filter(p))
            .map(|(id, _)| *id)
            .collect();
        let per_packet = (self.block_size as usize / 4).max(1);
        ids.chunks(per_packet).map(encode_member_ids).collect()
    }

    pub fn count<F>(&self, filter: F) -> usize
    where
        F: Fn(&ReceiverProperties) -> bool,
    {
        self.receivers.values().filter(|p| filter(p)).count()
    }

    pub fn any<F>(&self, filter: F) -> bool
    where
        F: Fn(&ReceiverProperties) -> bool,
    {
        self.receivers.values().any(filter)
    }

    /// 조건에 맞는 수신자 상태 일괄 변경
    pub fn transition<F>(&mut self, filter: F, status: MemberStatus) -> usize
    where
        F: Fn(&ReceiverProperties) -> bool,
    {
        let mut changed = 0;
        for props in self.receivers.values_mut() {
            if filter(props) {
                props.status = status;
                changed += 1;
            }
        }
        changed
    }

    /// 조건에 맞는 수신자의 최대 RTT로 GRTT 갱신
    ///
    /// 커지면 즉시 채택, 작아지면 라운드당 최대 10%씩 줄이되 최대 RTT 아래로는 내려가지 않는다.
    pub fn refine_grtt<F>(&mut self, filter: F)
    where
        F: Fn(&ReceiverProperties) -> bool,
    {
        let Some(max_rtt) = self
            .receivers
            .values()
            .filter(|p| filter(p))
            .filter_map(|p| p.rtt)
            .max()
        else {
            return;
        };

        let refined = if max_rtt > self.grtt {
            max_rtt
        } else {
            self.grtt.mul_f64(0.9).max(max_rtt)
        };
        self.grtt = refined.clamp(self.min_grtt, self.max_grtt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{validate_packet, Done, MemberIds};

    fn ctx() -> SenderContext {
        SenderContext::new(
            1,
            77,
            Duration::from_millis(500),
            (Duration::from_millis(100), Duration::from_secs(15)),
            20,
            8,
            "230.4.4.1:1044".parse().unwrap(),
            "230.5.5.8:1044".parse().unwrap(),
        )
    }

    fn with_rtt(status: MemberStatus, rtt_ms: u64) -> ReceiverProperties {
        ReceiverProperties {
            rtt: Some(Duration::from_millis(rtt_ms)),
            ..ReceiverProperties::new(status)
        }
    }

    #[test]
    fn test_refine_grtt() {
        let mut ctx = ctx();
        ctx.receivers.insert(10, with_rtt(MemberStatus::Registered, 800));
        ctx.receivers.insert(11, with_rtt(MemberStatus::Lost, 5000));

        ctx.refine_grtt(|p| p.status == MemberStatus::Registered);
        assert_eq!(ctx.grtt, Duration::from_millis(800));

        ctx.receivers.insert(10, with_rtt(MemberStatus::Registered, 200));
        ctx.refine_grtt(|p| p.status == MemberStatus::Registered);
        assert_eq!(ctx.grtt, Duration::from_millis(720));

        ctx.receivers.insert(10, with_rtt(MemberStatus::Registered, 700));
        ctx.refine_grtt(|p| p.status == MemberStatus::Registered);
        assert_eq!(ctx.grtt, Duration::from_millis(700));

        ctx.receivers.insert(10, with_rtt(MemberStatus::Registered, 1));
        for _ in 0..100 {
            ctx.refine_grtt(|p| p.status == MemberStatus::Registered);
        }
        assert_eq!(ctx.grtt, Duration::from_millis(100));
    }

    #[test]
    fn test_target_batches_split_and_skip_proxies() {
        let mut ctx = ctx();
        for id in 1..=5 {
            ctx.receivers.insert(id, ReceiverProperties::new(MemberStatus::Active));
        }
        ctx.receivers.insert(
            100,
            ReceiverProperties {
                is_proxy: true,
                ..ReceiverProperties::new(MemberStatus::Active)
            },
        );
        ctx.receivers.insert(6, ReceiverProperties::new(MemberStatus::Lost));

        // block_size 8 -> 패킷당 2개
        let batches = ctx.target_batches(|p| p.status == MemberStatus::Active);
        assert_eq!(batches.len(), 3);
        let ids: Vec<u32> = batches
            .iter()
            .flat_map(|raw| MemberIds::new(raw).iter().collect::<Vec<_>>())
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);

        assert!(ctx.target_batches(|p| p.status == MemberStatus::Done).is_empty());
    }

    #[test]
    fn test_packets_use_fresh_sequence() {
        let mut ctx = ctx();
        let msg = Message::Done(Done {
            file_id: 1,
            section: 0,
            receiver_ids: MemberIds::default(),
        });
        let a = ctx.packet(&msg);
        let b = ctx.packet(&msg);
        let ha = validate_packet(&a).unwrap().header;
        let hb = validate_packet(&b).unwrap().header;
        assert_eq!(ha.session_id, 77);
        assert_eq!(ha.source_id, 1);
        assert_eq!(hb.sequence, ha.sequence + 1);
    }
}
