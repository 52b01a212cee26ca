//! Per-peer outbound queue with priority lanes and flow control.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use bytes::Bytes;

use crate::api::codes;

/// Lane of the send queue, in the order lanes are drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SendPriority {
    High = 0,
    Medium = 1,
    Low = 2,
}

impl SendPriority {
    /// Looks up the lane for a message code, unlisted codes go to [`SendPriority::Low`].
    pub fn of(code: u32) -> Self {
        match code {
            codes::BLOCK_INFO_NOTIFY
            | codes::NEW_BLOCK
            | codes::REQ_BLOCK
            | codes::BLOCK_RESPONSE
            | codes::CAST_VERIFY
            | codes::VERIFIED_CAST => Self::High,
            codes::CAST_REWARD_SIGN_REQ | codes::CAST_REWARD_SIGN_GOT => Self::Medium,
            _ => Self::Low,
        }
    }
}

/// Packets sent per lane in a round.
pub const PRIORITY_QUOTA: [usize; 3] = [5, 3, 2];
/// Unconfirmed sends allowed before waiting for the transport to drain.
pub const MAX_PENDING_SEND: usize = 10;
/// Packets a lane, or the control list, holds before new ones are dropped.
pub const MAX_SEND_LIST_SIZE: usize = 256;
/// The pending count is reset if the transport stays silent for this long.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug)]
struct Lane {
    queue: VecDeque<Bytes>,
    quota: usize,
    cur_quota: usize,
}

/// The outbound queue of a peer.
///
/// Each lane sends at most its quota per round, the quotas reset once the round budget is spent,
/// so a saturated high lane can't starve the others. Protocol packets go ahead of every lane but
/// count against the same pending budget.
#[derive(Debug)]
pub struct SendQueue {
    control: VecDeque<Bytes>,
    lanes: [Lane; 3],
    pending_send: usize,
    total_quota: usize,
    cur_quota: usize,
    last_on_wait: Instant,
}

impl Default for SendQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SendQueue {
    pub fn new() -> Self {
        let lane = |quota| Lane {
            queue: VecDeque::new(),
            quota,
            cur_quota: 0,
        };

        Self {
            control: VecDeque::new(),
            lanes: PRIORITY_QUOTA.map(lane),
            pending_send: 0,
            total_quota: PRIORITY_QUOTA.iter().sum(),
            cur_quota: 0,
            last_on_wait: Instant::now(),
        }
    }

    /// Enqueues a packet in the lane of its code. Returns `false` if the lane is full and the
    /// packet was dropped.
    pub fn push(&mut self, packet: Bytes, code: u32) -> bool {
        self.expire_wait();

        let lane = &mut self.lanes[SendPriority::of(code) as usize];
        if lane.queue.len() >= MAX_SEND_LIST_SIZE {
            return false;
        }

        lane.queue.push_back(packet);
        true
    }

    /// Enqueues a protocol packet. Returns `false` if the control list is full.
    pub fn push_control(&mut self, packet: Bytes) -> bool {
        self.expire_wait();

        if self.control.len() >= MAX_SEND_LIST_SIZE {
            return false;
        }

        self.control.push_back(packet);
        true
    }

    // Forgets the unconfirmed sends if the transport has been silent too long.
    fn expire_wait(&mut self) {
        if self.last_on_wait.elapsed() > WAIT_TIMEOUT {
            self.pending_send = 0;
            self.last_on_wait = Instant::now();
        }
    }

    pub fn is_send_available(&self) -> bool {
        self.pending_send < MAX_PENDING_SEND
    }

    /// Takes the protocol packets that may be sent now.
    pub fn drain_control(&mut self) -> Vec<Bytes> {
        let n = MAX_PENDING_SEND
            .saturating_sub(self.pending_send)
            .min(self.control.len());
        self.pending_send += n;

        self.control.drain(..n).collect()
    }

    /// Takes the data packets that may be sent now, in send order.
    pub fn drain(&mut self) -> Vec<Bytes> {
        let mut out = Vec::new();

        while self.is_send_available() {
            let mut sent = false;

            for i in 0..self.lanes.len() {
                let lane = &mut self.lanes[i];
                while self.pending_send < MAX_PENDING_SEND && lane.cur_quota < lane.quota {
                    let Some(packet) = lane.queue.pop_front() else {
                        break;
                    };

                    out.push(packet);
                    self.pending_send += 1;
                    lane.cur_quota += 1;
                    self.cur_quota += 1;
                    sent = true;
                }

                if self.cur_quota >= self.total_quota {
                    self.reset_quota();
                }
            }

            if !sent {
                if self.is_empty() {
                    break;
                }

                // Every lane still holding packets spent its quota.
                self.reset_quota();
            }
        }

        out
    }

    /// The transport drained its buffers: sends may resume.
    pub fn on_send_waited(&mut self) {
        self.last_on_wait = Instant::now();
        self.pending_send = 0;
    }

    pub fn reset_pending(&mut self) {
        self.pending_send = 0;
    }

    fn reset_quota(&mut self) {
        self.cur_quota = 0;
        for lane in &mut self.lanes {
            lane.cur_quota = 0;
        }
    }

    /// Drops every queued packet.
    pub fn clear(&mut self) {
        self.control.clear();
        for lane in &mut self.lanes {
            lane.queue.clear();
        }
    }

    pub fn control_len(&self) -> usize {
        self.control.len()
    }

    /// Data packets queued in the lanes.
    pub fn len(&self) -> usize {
        self.lanes.iter().map(|lane| lane.queue.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.iter().all(|lane| lane.queue.is_empty())
    }

    pub fn pending_send(&self) -> usize {
        self.pending_send
    }
}
