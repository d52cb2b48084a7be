use crate::{Bitrate, BusInfo, CanBus, CanFrame, Result, TransportError};
use std::collections::VecDeque;

/// Produces the frames a simulated peer sends back in answer to one outgoing frame.
pub type Responder = Box<dyn FnMut(&CanFrame) -> Vec<CanFrame> + Send>;

/// A simple in-process mock bus. Each bus instance is independent.
///
/// Inbound frames are queued with [`MockBus::push_inbound`] or generated by an optional
/// responder; every sent frame is kept for inspection.
pub struct MockBus {
    name: String,
    bitrate: Option<Bitrate>,
    inbound: VecDeque<CanFrame>,
    sent: Vec<CanFrame>,
    failing_sends: u32,
    responder: Option<Responder>,
}

impl MockBus {
    pub fn with_responder(mut self, responder: Responder) -> Self {
        self.responder = Some(responder);
        self
    }

    pub fn push_inbound(&mut self, frame: CanFrame) {
        self.inbound.push_back(frame);
    }

    /// Make the next `count` sends fail with [`TransportError::SendRejected`].
    pub fn fail_next_sends(&mut self, count: u32) {
        self.failing_sends = count;
    }

    pub fn sent(&self) -> &[CanFrame] {
        &self.sent
    }

    pub fn take_sent(&mut self) -> Vec<CanFrame> {
        std::mem::take(&mut self.sent)
    }

    pub fn pending_inbound(&self) -> usize {
        self.inbound.len()
    }

    pub fn bitrate(&self) -> Option<Bitrate> {
        self.bitrate
    }
}

impl CanBus for MockBus {
    fn open(name: &str) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            bitrate: None,
            inbound: VecDeque::new(),
            sent: Vec::new(),
            failing_sends: 0,
            responder: None,
        })
    }

    fn list() -> Result<Vec<BusInfo>> {
        Ok(vec![BusInfo {
            name: "mock0".to_string(),
            driver: "mock".to_string(),
        }])
    }

    fn configure_bitrate(&mut self, bitrate: Bitrate) -> Result<()> {
        tracing::debug!(bus = %self.name, bps = bitrate.bps(), "mock bitrate set");
        self.bitrate = Some(bitrate);
        Ok(())
    }

    fn try_recv(&mut self) -> Result<Option<CanFrame>> {
        Ok(self.inbound.pop_front().map(CanFrame::stamped))
    }

    fn send(&mut self, frame: &CanFrame) -> Result<()> {
        if self.failing_sends > 0 {
            self.failing_sends -= 1;
            return Err(TransportError::SendRejected(format!(
                "{} refused frame {}",
                self.name, frame.id
            )));
        }
        self.sent.push(frame.clone());
        if let Some(responder) = self.responder.as_mut() {
            let replies = responder(frame);
            self.inbound.extend(replies);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CanId;

    #[test]
    fn queued_frames_come_back_one_at_a_time() -> anyhow::Result<()> {
        let mut bus = MockBus::open("mock0")?;
        let id = CanId::standard(0x181).ok_or_else(|| anyhow::anyhow!("id"))?;
        bus.push_inbound(CanFrame::new(id, &[0x40, 0x01, 0x00]).ok_or_else(|| anyhow::anyhow!("len"))?);
        bus.push_inbound(CanFrame::new(id, &[0x30, 0x00, 0x00]).ok_or_else(|| anyhow::anyhow!("len"))?);

        let first = bus.try_recv()?.ok_or_else(|| anyhow::anyhow!("empty"))?;
        assert_eq!(first.data[0], 0x40);
        assert!(first.timestamp.is_some());
        assert!(bus.try_recv()?.is_some());
        assert!(bus.try_recv()?.is_none());
        Ok(())
    }

    #[test]
    fn responder_answers_sent_frames() -> anyhow::Result<()> {
        let reply_id = CanId::standard(0x181).ok_or_else(|| anyhow::anyhow!("id"))?;
        let mut bus = MockBus::open("mock0")?.with_responder(Box::new(move |f| {
            CanFrame::new(reply_id, &[f.data[0], 0xAA, 0x55]).into_iter().collect()
        }));
        let cmd_id = CanId::standard(0x201).ok_or_else(|| anyhow::anyhow!("id"))?;
        bus.send(&CanFrame::new(cmd_id, &[0x3D, 0x40, 0x00]).ok_or_else(|| anyhow::anyhow!("len"))?)?;

        assert_eq!(bus.sent().len(), 1);
        let reply = bus.try_recv()?.ok_or_else(|| anyhow::anyhow!("no reply"))?;
        assert_eq!(reply.id, reply_id);
        assert_eq!(reply.payload(), &[0x3D, 0xAA, 0x55]);
        Ok(())
    }

    #[test]
    fn failed_sends_are_not_recorded() -> anyhow::Result<()> {
        let mut bus = MockBus::open("mock0")?;
        let id = CanId::standard(0x201).ok_or_else(|| anyhow::anyhow!("id"))?;
        let frame = CanFrame::new(id, &[0x8E, 0, 0]).ok_or_else(|| anyhow::anyhow!("len"))?;
        bus.fail_next_sends(1);
        assert!(matches!(bus.send(&frame), Err(TransportError::SendRejected(_))));
        bus.send(&frame)?;
        assert_eq!(bus.sent().len(), 1);
        Ok(())
    }
}
