//! Budget text codec, calendar day keys and clocks
pub mod clock;
pub mod codec;

pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{
    day_key, day_key_in, format_budget, next_midnight, next_midnight_in, parse_budget, DayKey,
    TimeError, TimeResult,
};
