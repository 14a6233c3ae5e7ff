pub mod config;
pub mod error;
pub mod model;

pub use config::{
    load_dotenv, ChannelConfig, Config, DetectionConfig, RetryPolicy, Settings,
    BROADCAST_CHANNEL, TARGETED_CHANNEL,
};
pub use error::CoreError;
pub use model::*;
