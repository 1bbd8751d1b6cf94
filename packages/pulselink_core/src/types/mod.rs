pub mod heartrate;

pub use heartrate::{HeartRateRecord, HeartRateSample};
