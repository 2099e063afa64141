//! Model module containing data structures

mod calendar_feature;
mod sample_weights;
mod seasonal_time;
mod time;

pub use calendar_feature::CalendarFeature;
pub use sample_weights::SampleWeights;
pub use seasonal_time::{SeasonalTime, WINDOW_ORIGIN};
pub use time::{ceil, floor, intervals_crossed, month_of_year, DAY, HOUR, MONTH, WEEK, YEAR};
