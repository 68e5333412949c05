pub mod odm;
pub mod telemetry;
