//! Delivery target selection
//!
//! A channel's name decides how a message fans out: work-queue channels hand
//! each message to one subscriber in turn, everything else is broadcast.

use shared::Channel;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPolicy {
    /// Every current subscriber gets the message.
    Broadcast,
    /// One subscriber gets the message, chosen round-robin.
    WorkQueue,
}

impl DeliveryPolicy {
    pub fn for_channel(channel: &Channel, queue_prefix: &[u8]) -> Self {
        if channel.is_work_queue_with(queue_prefix) {
            DeliveryPolicy::WorkQueue
        } else {
            DeliveryPolicy::Broadcast
        }
    }

    /// Picks recipients from `subscribers`.
    ///
    /// For a work queue the front subscriber is chosen and moved to the back,
    /// so each subscriber is visited once per full cycle. A single subscriber
    /// is chosen every time. Broadcast leaves the sequence untouched.
    pub fn select<T: Clone>(self, subscribers: &mut VecDeque<T>) -> Vec<T> {
        match self {
            DeliveryPolicy::Broadcast => subscribers.iter().cloned().collect(),
            DeliveryPolicy::WorkQueue => match subscribers.pop_front() {
                Some(next) => {
                    subscribers.push_back(next.clone());
                    vec![next]
                }
                None => Vec::new(),
            },
        }
    }
}
