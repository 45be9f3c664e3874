pub mod calibration;
pub mod volatility;
