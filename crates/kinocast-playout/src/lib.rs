//! The playout engine proper: producer slots, channel control, orchestration
//! ticks, the pacing sink with its MPEG-TS encoder, the atomic transport
//! writer and the channel map that ties them together.

pub mod control;
pub mod engine;
pub mod error;
pub mod orchestration;
pub mod sink;
pub mod slot;
pub mod transport;
