// src/dispatch/mod.rs
//! Request dispatch and load balancing

pub mod balancer;
pub mod dispatcher;
pub mod request;

pub use dispatcher::Dispatcher;
pub use request::{
    DispatchError, DispatchErrorKind, HandleReply, HttpRequest, HttpResponse, JobRequest, JobResponse,
    MqttMessage,
};
