use crate::messages::Message;
use crate::types::ServerId;

/// The narrow contract a message transport must provide. The backend is
/// transport-agnostic: it needs at-least-eventually-delivered, per-peer
/// ordered point-to-point messaging plus an all-peers broadcast.
///
/// Inbound delivery is the transport owner's job: pass each received message
/// to [`crate::GossipNode::handle_message`] and forward the returned response
/// (if any) back to the sender.
pub trait Transport: Send + Sync + 'static {
    fn own_id(&self) -> ServerId;

    /// Currently known peers, self excluded. Quorum arithmetic in the
    /// consistent layer counts against this set plus self.
    fn servers(&self) -> Vec<ServerId>;

    /// Fire-and-forget send. `is_request` hints that the receiver's handler
    /// is expected to produce a response message.
    fn send(&self, server: &ServerId, msg: Message, is_request: bool);

    fn broadcast(&self, msg: Message);
}
