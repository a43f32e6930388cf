pub mod deal;
pub mod dispatch;
pub mod event;
pub mod intent;
pub mod sync;
