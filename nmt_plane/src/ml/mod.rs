pub mod cell;
pub mod data;
pub mod dropout;
pub mod init;
pub mod linear;
pub mod model;
mod network;
pub mod norm;
pub mod options;
pub mod params;
mod random;
pub mod rnn;
pub mod sequence;

pub use linear::Linear;
pub use network::*;
pub use random::*;
pub use sequence::Sequence;
