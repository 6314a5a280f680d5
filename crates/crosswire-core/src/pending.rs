//! Pending-call table: one-shot rendezvous between a synchronous invoke and
//! the response arriving on the read loop.
//!
//! Each in-flight call owns a slot keyed by `cmd_seq`. The slot's channel has
//! capacity 2 so a duplicate response never blocks the read loop; delivery is
//! always non-blocking and surplus responses are dropped. Slots are removed
//! by a drop guard, so every exit path of an invoke — response, timeout,
//! cancellation, write error — cleans up.

use std::sync::Arc;

use crosswire_proto::CmdPacket;
use dashmap::DashMap;
use tokio::sync::mpsc;

/// Per-slot channel capacity: tolerates one late or duplicate response.
const SLOT_CAPACITY: usize = 2;

/// Table of in-flight synchronous calls, keyed by `cmd_seq`.
#[derive(Debug, Default)]
pub struct PendingCalls {
    slots: DashMap<u64, mpsc::Sender<CmdPacket>>,
}

impl PendingCalls {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a slot for `cmd_seq` in `table`.
    ///
    /// Returns the receiver for the response and a guard that removes the
    /// slot when dropped.
    pub fn register(table: &Arc<Self>, cmd_seq: u64) -> (PendingSlot, mpsc::Receiver<CmdPacket>) {
        let (tx, rx) = mpsc::channel(SLOT_CAPACITY);
        table.slots.insert(cmd_seq, tx);
        (PendingSlot { table: Arc::clone(table), cmd_seq }, rx)
    }

    /// Deliver a response to the slot matching its `cmd_seq`.
    ///
    /// Never blocks. Returns the packet back if no slot exists (a late
    /// response after the invoke gave up), so the caller can route it to the
    /// ordinary command path.
    pub fn complete(&self, packet: CmdPacket) -> Result<(), CmdPacket> {
        match self.slots.get(&packet.cmd_seq) {
            Some(slot) => {
                // full slot means a duplicate raced in; drop it
                let _ = slot.try_send(packet);
                Ok(())
            }
            None => Err(packet),
        }
    }

    /// Number of calls currently waiting.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when no call is in flight.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Guard that removes its slot from the table on drop.
#[derive(Debug)]
pub struct PendingSlot {
    table: Arc<PendingCalls>,
    cmd_seq: u64,
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        self.table.slots.remove(&self.cmd_seq);
    }
}

#[cfg(test)]
mod tests {
    use crosswire_proto::MessageType;

    use super::*;

    fn response(cmd_seq: u64) -> CmdPacket {
        let mut cmd = CmdPacket::new(MessageType::CmdBinary);
        cmd.cmd_seq = cmd_seq;
        cmd
    }

    #[tokio::test]
    async fn delivers_matching_response() {
        let table = Arc::new(PendingCalls::new());
        let (_slot, mut rx) = PendingCalls::register(&table, 9);

        table.complete(response(9)).unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got.cmd_seq, 9);
    }

    #[tokio::test]
    async fn late_response_is_returned() {
        let table = Arc::new(PendingCalls::new());
        {
            let (_slot, _rx) = PendingCalls::register(&table, 3);
            assert_eq!(table.len(), 1);
        }
        // slot removed by the guard; response comes back
        assert_eq!(table.len(), 0);
        let err = table.complete(response(3)).unwrap_err();
        assert_eq!(err.cmd_seq, 3);
    }

    #[tokio::test]
    async fn duplicate_responses_never_block() {
        let table = Arc::new(PendingCalls::new());
        let (_slot, mut rx) = PendingCalls::register(&table, 5);

        for _ in 0..4 {
            table.complete(response(5)).unwrap();
        }
        // capacity 2: first two queued, the rest dropped
        assert_eq!(rx.recv().await.unwrap().cmd_seq, 5);
        assert_eq!(rx.recv().await.unwrap().cmd_seq, 5);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn guard_cleans_up_on_every_path() {
        let table = Arc::new(PendingCalls::new());
        let (slot, rx) = PendingCalls::register(&table, 1);
        drop(rx); // receiver gone first, e.g. cancelled future
        drop(slot);
        assert!(table.is_empty());
    }
}
