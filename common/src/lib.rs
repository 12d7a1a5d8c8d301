pub mod config;
pub mod error;
pub mod openai;

pub use config::{
    DeploymentConfig, DeploymentHandle, RegistryCredentials, ScaleSettings, DEFAULT_GPU_UTIL,
    DEFAULT_MODEL, DEFAULT_PORT,
};
pub use error::OpError;
pub use openai::{ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Model, ModelList};
