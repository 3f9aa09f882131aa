//! Inference serving.
//!
//! - [`runtime`]: how a run is turned into a predictor (in-process or remote)
//! - [`service`]: cached active set, routing, response contract
//! - [`http`]: the axum application

pub mod http;
pub mod runtime;
pub mod service;

pub use http::{router, AppState};
pub use runtime::{
    JsonModelLoader, LinearModel, LocalModel, ModelLoader, ModelRuntime, Predictor, RemoteModel,
};
pub use service::{ActiveSet, InferenceService, ModelMetadata, Prediction, ServedModel};
