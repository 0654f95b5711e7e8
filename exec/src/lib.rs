//! Guest execution driver: the translate/lookup/execute/chain loop.

mod dispatch;

pub use dispatch::{Dispatcher, GuestDecoder, TRAP_TAG};
