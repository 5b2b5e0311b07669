//! Decoded frames and the single-producer/single-consumer frame ring that
//! hands them from the decode worker to the pacing sink.

mod frame;
mod ring;

pub use frame::Frame;
pub use ring::{frame_ring, RingConsumer, RingProducer, RingWatch};
