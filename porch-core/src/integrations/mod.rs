pub mod environment_canada;
pub mod hue;
pub mod hue_config_flow;
