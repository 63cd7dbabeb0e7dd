pub mod calibration;
pub mod types;
pub mod weather_edge;
