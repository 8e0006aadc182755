//! Compression table for pending watch events.

use evq_core::EventType;

/// What the queue does with an incoming event for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// No event pending: append the key to the queue with this type.
    Add(EventType),
    /// An event is pending: keep its queue slot, replace its type.
    Compress(EventType),
    /// The pending event and the incoming one cancel out: remove the key.
    Drop,
}

/// Merge an incoming event into the one pending for the same key.
///
/// # Panics
///
/// Panics when a `Deleted` event is still pending. The producer must not
/// emit events for a key until its deletion has been popped.
///
/// A repeated `Added` keeps whatever type is pending: the consumer either
/// has not seen the object yet (`Added`) or already knows it (`Modified`).
pub fn resolve(pending: Option<EventType>, incoming: EventType) -> Effect {
    use EventType::*;
    match (pending, incoming) {
        (None, t) => Effect::Add(t),
        (Some(Added), Modified) => Effect::Compress(Added),
        (Some(Added), Deleted) => Effect::Drop,
        (Some(Modified), Modified) => Effect::Compress(Modified),
        (Some(Modified), Deleted) => Effect::Compress(Deleted),
        (Some(Added), Added) => Effect::Compress(Added),
        (Some(Modified), Added) => Effect::Compress(Modified),
        (Some(p @ Deleted), t) => panic!("invalid watch event transition: {} pending, {} received", p, t),
    }
}
