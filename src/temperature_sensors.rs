//! Transducer implementations.

pub mod lm75;
