pub use self::video::surface::{DecodedFrame, PresentPolicy, SurfaceExchange};
pub use self::video::VideoReceiver;

pub mod video;
