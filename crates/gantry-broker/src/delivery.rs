use std::collections::HashMap;

use gantry_proto::RequestId;

use crate::error::BrokerError;
use crate::types::DeliveryTag;

/// Delivery handles awaiting settlement, keyed by request id.
///
/// Taking a handle removes it, so settling the same request twice, or one that
/// was never delivered, fails here instead of reaching the broker.
#[derive(Debug, Default)]
pub struct DeliveryTracker {
    handles: HashMap<RequestId, DeliveryTag>,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, request_id: RequestId, tag: DeliveryTag) -> Result<(), BrokerError> {
        if self.handles.contains_key(&request_id) {
            return Err(BrokerError::DuplicateDelivery(request_id.to_string()));
        }
        self.handles.insert(request_id, tag);
        Ok(())
    }

    pub fn take(&mut self, request_id: &RequestId) -> Result<DeliveryTag, BrokerError> {
        self.handles
            .remove(request_id)
            .ok_or_else(|| BrokerError::UnknownDelivery(request_id.to_string()))
    }

    pub fn is_tracking(&self, request_id: &RequestId) -> bool {
        self.handles.contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Removes and returns every outstanding handle.
    pub fn drain(&mut self) -> impl Iterator<Item = DeliveryTag> + '_ {
        self.handles.drain().map(|(_, tag)| tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(n: u8) -> DeliveryTag {
        DeliveryTag::new("q", vec![n])
    }

    #[test]
    fn take_returns_the_tracked_handle_once() {
        let mut tracker = DeliveryTracker::new();
        let id = RequestId::from("r1");
        tracker.track(id.clone(), tag(1)).unwrap();

        assert!(tracker.is_tracking(&id));
        assert_eq!(tracker.take(&id).unwrap(), tag(1));
        assert!(matches!(
            tracker.take(&id),
            Err(BrokerError::UnknownDelivery(_))
        ));
        assert!(tracker.is_empty());
    }

    #[test]
    fn unknown_id_is_rejected() {
        let mut tracker = DeliveryTracker::new();
        assert!(matches!(
            tracker.take(&RequestId::from("never")),
            Err(BrokerError::UnknownDelivery(id)) if id == "never"
        ));
    }

    #[test]
    fn duplicate_tracking_keeps_the_first_handle() {
        let mut tracker = DeliveryTracker::new();
        let id = RequestId::from("r1");
        tracker.track(id.clone(), tag(1)).unwrap();

        assert!(matches!(
            tracker.track(id.clone(), tag(2)),
            Err(BrokerError::DuplicateDelivery(_))
        ));
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.take(&id).unwrap(), tag(1));
    }

    #[test]
    fn drain_empties_the_tracker() {
        let mut tracker = DeliveryTracker::new();
        tracker.track(RequestId::from("a"), tag(1)).unwrap();
        tracker.track(RequestId::from("b"), tag(2)).unwrap();

        assert_eq!(tracker.drain().count(), 2);
        assert!(tracker.is_empty());
    }
}
