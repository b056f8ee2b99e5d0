//! Wire codec: frame layer (4.A) and object layer (4.B).

pub mod frame;
pub mod value;

pub use frame::{read_frame, write_frame, Frame, FrameError};
pub use value::{Value, ValueError};
