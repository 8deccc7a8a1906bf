mod alert;
mod candle;
mod interval;

pub use alert::{
    Alert, AlertCondition, AlertTrigger, IndicatorSnapshot, IndicatorSpec, TriggerDirection,
    TriggerMode,
};
pub use candle::{finite, Candle};
pub use interval::Interval;
