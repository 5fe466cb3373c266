//! Scripted in-memory channel
//!
//! Stands in for the device in tests and bench setups: canned replies
//! are played back one per transaction, event words one per wait. Every
//! request is recorded so a test can assert on the exact wire traffic.

use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::Bytes;

use fpmcu_core::{ControlChannel, EcResult, Error, Reply, Request, Result};

/// A channel that answers from a prepared script.
#[derive(Debug, Default)]
pub struct ScriptedChannel {
    replies: VecDeque<Result<Reply>>,
    events: VecDeque<u32>,
    seen: Vec<Request>,
}

impl ScriptedChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a completed transaction with the given result and payload.
    pub fn push_reply(&mut self, result: EcResult, payload: impl Into<Bytes>) {
        self.replies.push_back(Ok(Reply {
            result,
            payload: payload.into(),
        }));
    }

    /// Queue a successful transaction with the given payload.
    pub fn push_ok(&mut self, payload: impl Into<Bytes>) {
        self.push_reply(EcResult::Success, payload);
    }

    /// Queue a transport-level failure.
    pub fn push_transport_err(&mut self, err: Error) {
        self.replies.push_back(Err(err));
    }

    /// Queue a hardware event word.
    pub fn push_event(&mut self, word: u32) {
        self.events.push_back(word);
    }

    /// Requests observed so far, in order.
    pub fn seen(&self) -> &[Request] {
        &self.seen
    }

    /// Whether the whole script was consumed.
    pub fn exhausted(&self) -> bool {
        self.replies.is_empty() && self.events.is_empty()
    }
}

#[async_trait]
impl ControlChannel for ScriptedChannel {
    async fn transact(&mut self, request: &Request) -> Result<Reply> {
        self.seen.push(request.clone());
        // Running off the end of the script reads as a dead channel, not
        // a panic, so a miscounted test fails with a real error path.
        self.replies.pop_front().unwrap_or(Err(Error::ChannelClosed))
    }

    async fn next_event(&mut self) -> Result<u32> {
        self.events.pop_front().ok_or(Error::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fpmcu_core::Opcode;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_scripted_playback() {
        let mut chan = ScriptedChannel::new();
        chan.push_ok(vec![1, 2, 3]);
        chan.push_reply(EcResult::Busy, Bytes::new());
        chan.push_event(0xAB);

        let req = Request {
            opcode: Opcode::FpInfo,
            version: 1,
            payload: Bytes::new(),
            response_len: 3,
        };

        let reply = chan.transact(&req).await.unwrap();
        assert_eq!(reply.result, EcResult::Success);
        assert_eq!(reply.payload.as_ref(), &[1, 2, 3]);

        let reply = chan.transact(&req).await.unwrap();
        assert_eq!(reply.result, EcResult::Busy);

        assert_eq!(chan.next_event().await.unwrap(), 0xAB);
        assert!(chan.exhausted());
        assert_eq!(chan.seen().len(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_script_is_closed_channel() {
        let mut chan = ScriptedChannel::new();
        let req = Request {
            opcode: Opcode::FpMode,
            version: 0,
            payload: Bytes::new(),
            response_len: 0,
        };
        assert!(matches!(
            chan.transact(&req).await,
            Err(Error::ChannelClosed)
        ));
        assert!(matches!(chan.next_event().await, Err(Error::ChannelClosed)));
    }
}
