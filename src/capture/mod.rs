pub mod frame;
pub mod slot;
pub mod source;
pub mod synthetic;

pub use frame::Frame;
pub use frame::PixelFormat;
pub use slot::{FrameSlot, SlotRead};
pub use source::{FramePublisher, FrameSource, SlotFrameSource};
pub use synthetic::TestPatternCapture;
